//! # strata-pipeline
//!
//! The request orchestrator for the strata RAG pipeline: semantic
//! routing, the twelve-stage graph with uniform failure and cancellation
//! semantics, per-route output validation, and feedback recording.
//!
//! A composition root constructs the concrete collaborators
//! ([`Collaborators`]) and hands them to [`Orchestrator::new`]; the
//! orchestrator's one public operation is `handle(Query) -> Response`,
//! which never fails to the caller.

pub mod feedback;
pub mod orchestrator;
pub mod router;
pub mod schema;

pub use feedback::record_feedback;
pub use orchestrator::{Collaborators, Orchestrator};
pub use router::Router;
pub use schema::{JsonKind, OutputSchemaValidator, RouteSchema, SchemaOutcome};
