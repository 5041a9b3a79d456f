//! Collaborator interfaces the pipeline consumes.
//!
//! One trait per external collaborator; a composition root constructs the
//! concrete implementations and hands them to the orchestrator. Stages
//! never construct collaborators themselves.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::Result;
use crate::models::{AuditEvent, Chunk, Generation, Vector};
use crate::trace::Trace;

// =============================================================================
// RETRIEVAL COLLABORATORS
// =============================================================================

/// Text embedding backend. Deterministic for a given model version and
/// fixed dimensionality.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vector>;

    /// Batch form; implementations may parallelize internally.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize;
}

/// Vector storage view the pipeline consumes. Tenant filtering is
/// mandatory; every returned chunk carries full ingest metadata.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(&self, embedding: &Vector, tenant_id: &str, top_k: usize)
        -> Result<Vec<Chunk>>;

    /// Used by ingestion; out of pipeline scope beyond the metadata invariant.
    async fn upsert(&self, chunks: Vec<Chunk>) -> Result<()>;

    /// Used by compliance deletion; returns the number of vectors removed.
    async fn delete_by_user(&self, tenant_id: &str, user_id: &str) -> Result<u64>;
}

/// Reordering-only reranker; never introduces new chunks. Implementations
/// may be passthrough.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, chunks: Vec<Chunk>, top_n: usize) -> Result<Vec<Chunk>>;
}

// =============================================================================
// GENERATION COLLABORATORS
// =============================================================================

/// One LLM call's inputs.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub context: String,
    pub question: String,
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// LLM provider. Must honor the request deadline and abort on the
/// cancellation signal, and must report token and cost usage.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, req: GenerationRequest, ctx: &RequestContext) -> Result<Generation>;
}

/// Produces query paraphrases for multi-query retrieval.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    /// Returns `[original, paraphrases...]`, deduplicated case-insensitively,
    /// at most `1 + n` entries. Degrades to `[original]` on provider failure.
    async fn expand(&self, text: &str, n: usize) -> Result<Vec<String>>;
}

// =============================================================================
// QUALITY COLLABORATORS
// =============================================================================

/// Scores how well an answer is supported by each context chunk.
///
/// Pair order is contractual: (context, answer). Returns one score in
/// [0, 1] per chunk, in chunk order.
#[async_trait]
pub trait GroundingScorer: Send + Sync {
    async fn score(&self, chunks: &[Chunk], answer: &str) -> Result<Vec<f32>>;
}

/// Outcome of the optional ML guard.
#[derive(Debug, Clone, Default)]
pub struct GuardVerdict {
    pub flagged: bool,
    pub category: Option<String>,
    pub confidence: Option<f32>,
}

/// Layer-2 ML-based input guard. A flag is terminal for the request.
#[async_trait]
pub trait MlGuard: Send + Sync {
    async fn check(&self, text: &str) -> Result<GuardVerdict>;
}

// =============================================================================
// OBSERVATION SINKS
// =============================================================================

/// Best-effort durable trace storage; invoked exactly once per request at
/// finalize. Sink failure never fails the request.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn save(&self, trace: &Trace) -> Result<()>;
}

/// Append-only audit storage. The interface deliberately exposes no update
/// or delete operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<()>;
}

/// Metric recording points. Implementations must be safe for concurrent
/// use from many request tasks; updates are atomic.
pub trait MetricSink: Send + Sync {
    fn inc(&self, metric: &str, labels: &[(&str, &str)], value: u64);
    fn observe(&self, metric: &str, labels: &[(&str, &str)], value: f64);
    fn set(&self, metric: &str, labels: &[(&str, &str)], value: f64);
}

/// No-op metric sink for contexts where recording is disabled.
pub struct NoOpMetricSink;

impl MetricSink for NoOpMetricSink {
    fn inc(&self, _metric: &str, _labels: &[(&str, &str)], _value: u64) {}
    fn observe(&self, _metric: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn set(&self, _metric: &str, _labels: &[(&str, &str)], _value: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingService for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vector> {
            Ok(vec![1.0, 0.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn test_embed_batch_default_preserves_order_and_len() {
        let embedder = FixedEmbedder;
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 2));
    }

    #[test]
    fn test_noop_metric_sink_is_object_safe() {
        let sink: Box<dyn MetricSink> = Box::new(NoOpMetricSink);
        sink.inc("requests_total", &[("route", "RAG")], 1);
        sink.observe("llm_cost_usd", &[], 0.01);
        sink.set("shadow_budget_remaining_usd", &[], 9.99);
    }
}
