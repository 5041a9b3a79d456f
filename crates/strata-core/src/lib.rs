//! # strata-core
//!
//! Core types, traits, and configuration for the strata request pipeline.
//!
//! This crate provides the data model, the collaborator interfaces, and
//! the immutable config snapshot that every other strata crate depends on.

pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod logging;
pub mod models;
pub mod tokenizer;
pub mod trace;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{
    CompressionConfig, DedupConfig, ExpansionConfig, FlagConfig, GenerationConfig, GroundingConfig,
    ModelPrice, PipelineConfig, RerankConfig, RetrievalConfig, RoutingConfig, SafetyConfig,
    ShadowConfig, TierModels, VariantWeight,
};
pub use context::{CancellationSignal, RequestContext};
pub use error::{Disposition, Error, Result};
pub use models::*;
pub use tokenizer::{estimate_tokens, HeuristicTokenizer, TiktokenTokenizer, Tokenizer};
pub use trace::{Span, SpanRecorder, SpanStatus, Trace, TraceTotals};
pub use traits::*;
