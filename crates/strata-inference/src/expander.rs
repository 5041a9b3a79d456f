//! LLM-backed multi-query expansion.
//!
//! Rephrases the user's question into alternative formulations to widen
//! retrieval recall. The original query is always first in the result and
//! any provider failure degrades to `[original]` alone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use strata_core::{
    Error, GenerationRequest, LlmClient, QueryExpander, RequestContext, Result,
};

const EXPANSION_SYSTEM_PROMPT: &str = "You are a search query expansion assistant. Your job is to rephrase a user's \
question into alternative formulations that capture different angles, synonyms, \
and perspectives. This helps retrieve a broader set of relevant documents.\n\n\
Rules:\n\
- Each rephrased query must preserve the original intent.\n\
- Use different vocabulary, phrasing structure, or emphasis.\n\
- Do NOT answer the question, only rephrase it.\n\
- Return one rephrased query per line.\n\
- Do NOT number the lines or add any prefix.";

/// Timeout for the expansion call; expansion is a recall optimization and
/// must never stall the request.
const EXPANSION_TIMEOUT: Duration = Duration::from_secs(10);

const EXPANSION_TEMPERATURE: f32 = 0.7;
const EXPANSION_MAX_TOKENS: u32 = 300;

/// Query expander driven by an LLM paraphrase prompt.
pub struct LlmQueryExpander {
    llm: Arc<dyn LlmClient>,
    model_id: String,
}

impl LlmQueryExpander {
    pub fn new(llm: Arc<dyn LlmClient>, model_id: impl Into<String>) -> Self {
        Self {
            llm,
            model_id: model_id.into(),
        }
    }

    async fn generate_paraphrases(&self, text: &str, n: usize) -> Result<Vec<String>> {
        // The expansion call runs under its own short deadline, detached
        // from the request context, so a slow paraphrase model degrades
        // instead of consuming the request budget.
        let ctx = RequestContext::new("query-expansion", "").with_timeout(EXPANSION_TIMEOUT);
        let generation = self
            .llm
            .generate(
                GenerationRequest {
                    system: EXPANSION_SYSTEM_PROMPT.to_string(),
                    context: String::new(),
                    question: text.to_string(),
                    model_id: self.model_id.clone(),
                    max_tokens: EXPANSION_MAX_TOKENS,
                    temperature: EXPANSION_TEMPERATURE,
                },
                &ctx,
            )
            .await
            .map_err(|e| Error::Expansion(e.to_string()))?;

        Ok(generation
            .answer_text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .take(n)
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl QueryExpander for LlmQueryExpander {
    async fn expand(&self, text: &str, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(vec![text.to_string()]);
        }

        let paraphrases = match self.generate_paraphrases(text, n).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "query expansion failed; continuing with original only");
                return Ok(vec![text.to_string()]);
            }
        };

        // Case-insensitive dedup with the original always first.
        let mut expanded = vec![text.to_string()];
        let mut seen = vec![text.to_lowercase()];
        for paraphrase in paraphrases {
            let key = paraphrase.to_lowercase();
            if !seen.contains(&key) {
                seen.push(key);
                expanded.push(paraphrase);
            }
            if expanded.len() == n + 1 {
                break;
            }
        }

        info!(num_expanded = expanded.len(), "query expansion complete");
        Ok(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLlmClient;

    #[tokio::test]
    async fn test_original_always_first() {
        let llm = Arc::new(MockLlmClient::new().with_answer("alt one\nalt two\nalt three"));
        let expander = LlmQueryExpander::new(llm, "gpt-4o-mini");
        let out = expander.expand("original question", 3).await.unwrap();
        assert_eq!(out[0], "original question");
        assert_eq!(out.len(), 4);
    }

    #[tokio::test]
    async fn test_result_bounded_by_one_plus_n() {
        let llm = Arc::new(MockLlmClient::new().with_answer("a\nb\nc\nd\ne\nf"));
        let expander = LlmQueryExpander::new(llm, "gpt-4o-mini");
        let out = expander.expand("q", 2).await.unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn test_case_insensitive_dedup() {
        let llm = Arc::new(MockLlmClient::new().with_answer("Original Question\nnew phrasing"));
        let expander = LlmQueryExpander::new(llm, "gpt-4o-mini");
        let out = expander.expand("original question", 3).await.unwrap();
        assert_eq!(out, vec!["original question", "new phrasing"]);
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_to_original() {
        let llm = Arc::new(MockLlmClient::new().with_failure("provider exploded"));
        let expander = LlmQueryExpander::new(llm, "gpt-4o-mini");
        let out = expander.expand("the question", 3).await.unwrap();
        assert_eq!(out, vec!["the question"]);
    }

    #[tokio::test]
    async fn test_zero_n_short_circuits() {
        let llm = Arc::new(MockLlmClient::new().with_answer("should not be called"));
        let expander = LlmQueryExpander::new(llm.clone(), "gpt-4o-mini");
        let out = expander.expand("q", 0).await.unwrap();
        assert_eq!(out, vec!["q"]);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_lines_ignored() {
        let llm = Arc::new(MockLlmClient::new().with_answer("\nalt one\n\n  \nalt two\n"));
        let expander = LlmQueryExpander::new(llm, "gpt-4o-mini");
        let out = expander.expand("q", 3).await.unwrap();
        assert_eq!(out, vec!["q", "alt one", "alt two"]);
    }
}
