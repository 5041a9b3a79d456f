//! # strata-inference
//!
//! External model providers for the strata pipeline: an OpenAI-compatible
//! chat client, an HTTP embedding backend, reranking (remote and
//! passthrough), grounding scorers, LLM query expansion, and the pure
//! model-tier policy. Deterministic mock backends for testing live in
//! [`mock`].

pub mod embedding;
pub mod expander;
pub mod grounding;
pub mod mock;
pub mod openai;
pub mod rerank;
pub mod tiers;

pub use embedding::HttpEmbeddingService;
pub use expander::LlmQueryExpander;
pub use grounding::{HttpGroundingScorer, LexicalGroundingScorer};
pub use openai::OpenAiLlmClient;
pub use rerank::{HttpReranker, PassthroughReranker};
pub use tiers::ModelTierPolicy;
