//! # strata-observe
//!
//! Observation outputs for the strata pipeline: trace persistence with a
//! local fallback writer, the append-only audit sink, and a process-local
//! metric registry with Prometheus text exposition. In-memory variants of
//! every sink support tests and embedded use.

pub mod audit;
pub mod metrics;
pub mod trace_sink;

pub use audit::{FileAuditSink, MemoryAuditSink};
pub use metrics::{names, MetricRegistry};
pub use trace_sink::{FileTraceSink, MemoryTraceSink};
