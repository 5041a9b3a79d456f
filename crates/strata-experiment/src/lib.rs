//! # strata-experiment
//!
//! Experimentation layer: deterministic hash-based feature flag
//! resolution, variant assignment auditing, and fire-and-forget shadow
//! execution with budget and circuit-breaker gates.

pub mod flags;
pub mod shadow;

pub use flags::{FeatureFlagResolver, VariantRecorder};
pub use shadow::{ShadowInput, ShadowRunner};
