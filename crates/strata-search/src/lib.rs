//! # strata-search
//!
//! Pure context-shaping stages: Reciprocal Rank Fusion across per-query
//! result lists, near-duplicate removal, BM25 sentence compression, and
//! token budgeting. Everything here is CPU-bound and deterministic for a
//! given input and config.

pub mod bm25;
pub mod budget;
pub mod compress;
pub mod dedup;
pub mod rrf;
pub mod sentence;

pub use bm25::{tokenize, Bm25};
pub use budget::TokenBudgeter;
pub use compress::{CompressedChunk, Compressor, ScoredSentence};
pub use dedup::dedup;
pub use rrf::{rrf_fuse, FusedHit, RRF_K};
pub use sentence::split_sentences;
