//! Grounding scorers: how well is an answer supported by each chunk?
//!
//! Pair order is contractual: (context, answer). Two implementations: a
//! remote HHEM-style HTTP scorer and a local lexical-overlap scorer used
//! as the zero-dependency default and in tests.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use strata_core::{Chunk, Error, GroundingScorer, Result};

/// Common English function words ignored by the lexical scorer.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "in",
    "is", "it", "its", "of", "on", "or", "that", "the", "their", "there", "these", "they", "this",
    "to", "was", "were", "will", "with",
];

fn content_tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Local scorer: per chunk, the fraction of the answer's content tokens
/// present in the chunk text. Coarse but deterministic and monotone in
/// actual support, which is what the threshold decision needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalGroundingScorer;

#[async_trait]
impl GroundingScorer for LexicalGroundingScorer {
    async fn score(&self, chunks: &[Chunk], answer: &str) -> Result<Vec<f32>> {
        let answer_tokens = content_tokens(answer);
        if answer_tokens.is_empty() {
            return Ok(vec![0.0; chunks.len()]);
        }
        let denom = answer_tokens.len() as f32;
        Ok(chunks
            .iter()
            .map(|chunk| {
                let chunk_tokens = content_tokens(&chunk.text);
                let supported = answer_tokens.intersection(&chunk_tokens).count() as f32;
                (supported / denom).clamp(0.0, 1.0)
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    scores: Vec<f32>,
}

/// Remote grounding scorer posting (context, answer) pairs to an
/// HHEM-style scoring endpoint.
pub struct HttpGroundingScorer {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpGroundingScorer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Request(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl GroundingScorer for HttpGroundingScorer {
    async fn score(&self, chunks: &[Chunk], answer: &str) -> Result<Vec<f32>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        // Pair order (context, answer); reversing it inverts the model's
        // premise/hypothesis direction and is a contract violation.
        let pairs: Vec<[&str; 2]> = chunks.iter().map(|c| [c.text.as_str(), answer]).collect();

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "pairs": pairs }))
            .send()
            .await
            .map_err(|e| Error::Grounding(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Grounding(e.to_string()))?;

        let parsed: ScoreResponse = response
            .json()
            .await
            .map_err(|e| Error::Grounding(e.to_string()))?;

        if parsed.scores.len() != chunks.len() {
            return Err(Error::Grounding(format!(
                "scorer returned {} scores for {} chunks",
                parsed.scores.len(),
                chunks.len()
            )));
        }
        Ok(parsed
            .scores
            .into_iter()
            .map(|s| s.clamp(0.0, 1.0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            vector_id: "v1".to_string(),
            doc_id: "d1".to_string(),
            chunk_id: "c1".to_string(),
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            text: text.to_string(),
            score: 0.9,
            embedding: None,
            source_url: None,
        }
    }

    #[tokio::test]
    async fn test_supported_answer_scores_high() {
        let scorer = LexicalGroundingScorer;
        let chunks = vec![chunk(
            "Customer records are retained for seven years from contract end.",
        )];
        let scores = scorer
            .score(&chunks, "Records are retained seven years from contract end.")
            .await
            .unwrap();
        assert!(scores[0] > 0.8, "got {}", scores[0]);
    }

    #[tokio::test]
    async fn test_unsupported_answer_scores_low() {
        let scorer = LexicalGroundingScorer;
        let chunks = vec![chunk("The cafeteria serves lunch from eleven to two.")];
        let scores = scorer
            .score(&chunks, "Quarterly revenue grew fourteen percent in Europe.")
            .await
            .unwrap();
        assert!(scores[0] < 0.2, "got {}", scores[0]);
    }

    #[tokio::test]
    async fn test_one_score_per_chunk_in_order() {
        let scorer = LexicalGroundingScorer;
        let chunks = vec![
            chunk("Retention period is seven years."),
            chunk("Unrelated cafeteria schedule."),
        ];
        let scores = scorer
            .score(&chunks, "The retention period is seven years.")
            .await
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn test_empty_answer_scores_zero() {
        let scorer = LexicalGroundingScorer;
        let scores = scorer.score(&[chunk("some context")], "").await.unwrap();
        assert_eq!(scores, vec![0.0]);
    }

    #[tokio::test]
    async fn test_empty_chunks() {
        let scorer = LexicalGroundingScorer;
        let scores = scorer.score(&[], "an answer").await.unwrap();
        assert!(scores.is_empty());
    }

    #[test]
    fn test_content_tokens_filter_stopwords() {
        let tokens = content_tokens("The records are in the archive");
        assert!(tokens.contains("records"));
        assert!(tokens.contains("archive"));
        assert!(!tokens.contains("the"));
        assert!(!tokens.contains("in"));
    }
}
