//! Token counting for context budgeting and usage accounting.
//!
//! Provides a tiktoken-backed tokenizer for accurate counts plus a fast
//! character-ratio estimator for budget checks that must be cheap and
//! deterministic without model files.

use crate::error::{Error, Result};

/// Trait for tokenization operations. Implementations must be thread-safe.
pub trait Tokenizer: Send + Sync {
    /// Count the number of tokens in the given text.
    fn count_tokens(&self, text: &str) -> usize;

    /// Get the name/identifier of this tokenizer.
    fn name(&self) -> &str;
}

/// Tiktoken-based tokenizer, compatible with OpenAI tokenization schemes.
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
    name: String,
}

impl TiktokenTokenizer {
    /// Create a tokenizer for the specified model.
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| Error::Internal(format!("Failed to initialize tokenizer: {}", e)))?;
        Ok(Self {
            bpe,
            name: model.to_string(),
        })
    }

    /// cl100k_base tokenizer, the common default for chat and embedding
    /// models when the exact model scheme is unknown.
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| Error::Internal(format!("Failed to initialize cl100k_base: {}", e)))?;
        Ok(Self {
            bpe,
            name: "cl100k_base".to_string(),
        })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Heuristic tokenizer using the ~3.7 characters-per-token ratio for
/// English text. Deterministic and dependency-free; the default for
/// compression budgeting where reproducibility matters more than
/// per-model accuracy.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// Quickly estimate token count without full tokenization.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f32 / 3.7).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_tokens_simple() {
        // 44 chars / 3.7 ≈ 11.89 -> 12
        assert_eq!(
            estimate_tokens("The quick brown fox jumps over the lazy dog."),
            12
        );
    }

    #[test]
    fn test_heuristic_tokenizer_is_deterministic() {
        let t = HeuristicTokenizer;
        let text = "retention policy for customer records";
        assert_eq!(t.count_tokens(text), t.count_tokens(text));
        assert_eq!(t.name(), "heuristic");
    }

    #[test]
    fn test_tiktoken_counts_plausibly() {
        let t = TiktokenTokenizer::cl100k().unwrap();
        let count = t.count_tokens("The quick brown fox jumps over the lazy dog.");
        assert!((8..=12).contains(&count), "got {}", count);
        assert_eq!(t.count_tokens(""), 0);
    }

    #[test]
    fn test_tokenizer_object_safety() {
        let tokenizers: Vec<Box<dyn Tokenizer>> = vec![Box::new(HeuristicTokenizer)];
        for t in &tokenizers {
            assert!(t.count_tokens("hello world") > 0);
        }
    }
}
