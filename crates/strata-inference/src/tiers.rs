//! Model tier policy: cheap heuristics, no I/O, sub-millisecond.
//!
//! Selects FAST/STANDARD/COMPLEX from query and context signals; the
//! tier-to-model map lives in config.

use once_cell::sync::Lazy;
use regex::Regex;

use strata_core::{ModelTier, RouteKind, TierModels};

/// Keywords that suggest analysis-heavy queries needing the complex model.
static COMPLEX_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(compare|analyze|summarize all|across|evaluate|assess|contrast|comprehensive|detailed analysis|multi-part|in-depth)\b",
    )
    .expect("complex keyword pattern compiles")
});

/// Below this word count a query reads as simple.
const SHORT_QUERY_WORDS: usize = 10;

/// Context sizes steering the tier when other signals are absent.
const SMALL_CONTEXT_TOKENS: usize = 500;
const LARGE_CONTEXT_TOKENS: usize = 2000;

/// Pure tier policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelTierPolicy;

impl ModelTierPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Rules, evaluated in order:
    /// 1. DIRECT route with a short query → FAST
    /// 2. Complexity keywords → COMPLEX
    /// 3. Two or more question marks → COMPLEX
    /// 4. Large context → COMPLEX; small context + short query → FAST
    /// 5. Default → STANDARD
    pub fn resolve(&self, route: RouteKind, query: &str, context_tokens: usize) -> ModelTier {
        let word_count = query.split_whitespace().count();

        if route == RouteKind::Direct && word_count < SHORT_QUERY_WORDS {
            return ModelTier::Fast;
        }
        if COMPLEX_KEYWORDS.is_match(query) {
            return ModelTier::Complex;
        }
        if query.matches('?').count() >= 2 {
            return ModelTier::Complex;
        }
        if context_tokens > LARGE_CONTEXT_TOKENS {
            return ModelTier::Complex;
        }
        if context_tokens > 0 && context_tokens < SMALL_CONTEXT_TOKENS && word_count < SHORT_QUERY_WORDS
        {
            return ModelTier::Fast;
        }
        ModelTier::Standard
    }

    /// Concrete model id for a tier.
    pub fn model_for(&self, tier: ModelTier, tiers: &TierModels) -> String {
        match tier {
            ModelTier::Fast => tiers.fast.clone(),
            ModelTier::Standard => tiers.standard.clone(),
            ModelTier::Complex => tiers.complex.clone(),
        }
    }
}
