//! HTTP embedding backend (OpenAI-compatible `/embeddings` endpoint).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use strata_core::{EmbeddingService, Error, Result, Vector};

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Embedding client for OpenAI-compatible providers. Deterministic for a
/// given model version; fixed dimensionality declared at construction.
pub struct HttpEmbeddingService {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingService {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vector>> {
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": inputs }))
            .send()
            .await
            .map_err(|e| Error::Embedding(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Embedding(e.to_string()))?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(e.to_string()))?;

        if parsed.data.len() != inputs.len() {
            return Err(Error::Embedding(format!(
                "provider returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }

        // Providers may return out of order; index realigns them.
        let mut vectors: Vec<Vector> = vec![Vec::new(); inputs.len()];
        for datum in parsed.data {
            if datum.embedding.len() != self.dimension {
                return Err(Error::Embedding(format!(
                    "expected dimension {}, got {}",
                    self.dimension,
                    datum.embedding.len()
                )));
            }
            if datum.index >= vectors.len() {
                return Err(Error::Embedding(format!(
                    "embedding index {} out of range",
                    datum.index
                )));
            }
            vectors[datum.index] = datum.embedding;
        }

        debug!(count = inputs.len(), model = %self.model, "embeddings generated");
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vector> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing_realigns_by_index() {
        let parsed: EmbeddingResponse = serde_json::from_value(serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.3, 0.4]},
                {"index": 0, "embedding": [0.1, 0.2]},
            ]
        }))
        .unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].index, 1);
    }

    #[test]
    fn test_construction() {
        let service = HttpEmbeddingService::new(
            "http://localhost:11434/v1/",
            "key",
            "text-embedding-3-small",
            1536,
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(service.dimension(), 1536);
        assert_eq!(service.base_url, "http://localhost:11434/v1");
    }
}
