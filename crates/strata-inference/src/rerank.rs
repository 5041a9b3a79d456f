//! Rerankers: a remote provider client and the passthrough fallback.
//!
//! Rerankers reorder; they never introduce chunks. The orchestrator falls
//! back to passthrough when the provider errors, so both implementations
//! share the truncation semantics.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use strata_core::{Chunk, Error, Reranker, Result};

/// No-provider reranker: returns the first `top_n` chunks unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    async fn rerank(&self, _query: &str, mut chunks: Vec<Chunk>, top_n: usize) -> Result<Vec<Chunk>> {
        chunks.truncate(top_n);
        Ok(chunks)
    }
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

/// Remote reranker speaking the Cohere-style `/rerank` wire format.
pub struct HttpReranker {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpReranker {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
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
            model: model.into(),
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, chunks: Vec<Chunk>, top_n: usize) -> Result<Vec<Chunk>> {
        if chunks.is_empty() {
            return Ok(chunks);
        }
        let documents: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let top_n = top_n.min(documents.len());

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "query": query,
                "documents": documents,
                "top_n": top_n,
            }))
            .send()
            .await
            .map_err(|e| Error::Rerank(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Rerank(e.to_string()))?;

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| Error::Rerank(e.to_string()))?;

        let mut reranked = Vec::with_capacity(top_n);
        for item in parsed.results.into_iter().take(top_n) {
            let original = chunks
                .get(item.index)
                .ok_or_else(|| Error::Rerank(format!("result index {} out of range", item.index)))?;
            let mut chunk = original.clone();
            chunk.score = item.relevance_score;
            reranked.push(chunk);
        }

        info!(
            input_count = chunks.len(),
            output_count = reranked.len(),
            model = %self.model,
            "rerank complete"
        );
        Ok(reranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, score: f32) -> Chunk {
        Chunk {
            vector_id: format!("v-{}", id),
            doc_id: "d1".to_string(),
            chunk_id: id.to_string(),
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            text: format!("text {}", id),
            score,
            embedding: None,
            source_url: None,
        }
    }

    #[tokio::test]
    async fn test_passthrough_truncates_without_reordering() {
        let chunks = vec![chunk("a", 0.9), chunk("b", 0.8), chunk("c", 0.7)];
        let out = PassthroughReranker.rerank("q", chunks, 2).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_id, "a");
        assert_eq!(out[1].chunk_id, "b");
    }

    #[tokio::test]
    async fn test_passthrough_with_top_n_larger_than_input() {
        let out = PassthroughReranker
            .rerank("q", vec![chunk("a", 0.9)], 10)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_rerank_response_parsing() {
        let parsed: RerankResponse = serde_json::from_value(serde_json::json!({
            "results": [
                {"index": 2, "relevance_score": 0.98},
                {"index": 0, "relevance_score": 0.41}
            ]
        }))
        .unwrap();
        assert_eq!(parsed.results[0].index, 2);
        assert!((parsed.results[0].relevance_score - 0.98).abs() < 1e-6);
    }
}
