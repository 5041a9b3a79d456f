//! Deterministic mock backends for testing.
//!
//! Mirrors the provider traits with no network, reproducible embeddings,
//! scripted answers, and call logging for assertions. Used by the pipeline
//! integration tests and available to downstream consumers behind
//! `cfg(test)`-free imports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use strata_core::{
    cosine_similarity, Chunk, EmbeddingService, Error, Generation, GenerationRequest, LlmClient,
    GroundingScorer, RequestContext, Result, Vector, VectorStore,
};

/// Generate a deterministic embedding from text.
///
/// Character-based hashing: the same text always produces the same unit
/// vector, and lexically similar texts land near each other.
pub fn deterministic_embedding(text: &str, dimension: usize) -> Vector {
    let mut vec = vec![0.0f32; dimension.max(1)];
    for (i, word) in text.to_lowercase().split_whitespace().enumerate() {
        let mut h: u64 = 1469598103934665603;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(1099511628211);
        }
        let idx = (h as usize) % vec.len();
        vec[idx] += 1.0 + (i as f32 * 0.01);
    }
    let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        vec.iter_mut().for_each(|x| *x /= magnitude);
    }
    vec
}

// =============================================================================
// EMBEDDING
// =============================================================================

/// Deterministic embedding backend.
#[derive(Clone)]
pub struct MockEmbeddingService {
    dimension: usize,
    calls: Arc<AtomicUsize>,
    failing: bool,
}

impl MockEmbeddingService {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: Arc::new(AtomicUsize::new(0)),
            failing: false,
        }
    }

    /// Every call fails with an embedding error.
    pub fn with_failure(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingService for MockEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vector> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(Error::Embedding("simulated embedding failure".into()));
        }
        Ok(deterministic_embedding(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// =============================================================================
// VECTOR STORE
// =============================================================================

/// In-memory vector store searching by cosine similarity with mandatory
/// tenant filtering.
#[derive(Clone, Default)]
pub struct MockVectorStore {
    chunks: Arc<Mutex<Vec<Chunk>>>,
    failing: bool,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with chunks; embeddings are computed from chunk text when absent.
    pub fn with_chunks(self, dimension: usize, mut chunks: Vec<Chunk>) -> Self {
        for chunk in &mut chunks {
            if chunk.embedding.is_none() {
                chunk.embedding = Some(deterministic_embedding(&chunk.text, dimension));
            }
        }
        *self.chunks.lock().unwrap() = chunks;
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn search(
        &self,
        embedding: &Vector,
        tenant_id: &str,
        top_k: usize,
    ) -> Result<Vec<Chunk>> {
        if self.failing {
            return Err(Error::Search("simulated search failure".into()));
        }
        let mut scored: Vec<Chunk> = self
            .chunks
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .map(|mut c| {
                let sim = c
                    .embedding
                    .as_ref()
                    .map(|e| cosine_similarity(embedding, e))
                    .unwrap_or(0.0);
                c.score = sim.clamp(0.0, 1.0);
                c
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn upsert(&self, chunks: Vec<Chunk>) -> Result<()> {
        if self.failing {
            return Err(Error::Search("simulated upsert failure".into()));
        }
        self.chunks.lock().unwrap().extend(chunks);
        Ok(())
    }

    async fn delete_by_user(&self, tenant_id: &str, user_id: &str) -> Result<u64> {
        let mut guard = self.chunks.lock().unwrap();
        let before = guard.len();
        guard.retain(|c| !(c.tenant_id == tenant_id && c.user_id == user_id));
        Ok((before - guard.len()) as u64)
    }
}

// =============================================================================
// LLM
// =============================================================================

/// Scripted LLM client with a call log.
#[derive(Clone)]
pub struct MockLlmClient {
    default_answer: String,
    answers_by_question: HashMap<String, String>,
    failure: Option<String>,
    latency_ms: u64,
    tokens_in: u64,
    tokens_out: u64,
    cost_usd: f64,
    calls: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            default_answer: "Mock answer.".to_string(),
            answers_by_question: HashMap::new(),
            failure: None,
            latency_ms: 0,
            tokens_in: 100,
            tokens_out: 20,
            cost_usd: 0.0006,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.default_answer = answer.into();
        self
    }

    /// Map a specific question to a specific answer.
    pub fn with_answer_for(mut self, question: impl Into<String>, answer: impl Into<String>) -> Self {
        self.answers_by_question.insert(question.into(), answer.into());
        self
    }

    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64, cost_usd: f64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self.cost_usd = cost_usd;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, req: GenerationRequest, ctx: &RequestContext) -> Result<Generation> {
        ctx.check_cancelled()?;
        self.calls.lock().unwrap().push(req.clone());

        if self.latency_ms > 0 {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)) => {}
            }
        }
        ctx.check_cancelled()?;

        if let Some(message) = &self.failure {
            return Err(Error::GenerationFailed(message.clone()));
        }

        let answer_text = self
            .answers_by_question
            .get(&req.question)
            .cloned()
            .unwrap_or_else(|| self.default_answer.clone());

        Ok(Generation {
            answer_text,
            model_id: req.model_id,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            cost_usd: self.cost_usd,
            latency_ms: self.latency_ms,
            finish_reason: "stop".to_string(),
        })
    }
}

// =============================================================================
// GROUNDING
// =============================================================================

/// Grounding scorer returning a fixed per-chunk score.
#[derive(Clone)]
pub struct MockGroundingScorer {
    score: f32,
    failing: bool,
}

impl MockGroundingScorer {
    pub fn new(score: f32) -> Self {
        Self {
            score,
            failing: false,
        }
    }

    pub fn with_failure(mut self) -> Self {
        self.failing = true;
        self
    }
}

#[async_trait]
impl GroundingScorer for MockGroundingScorer {
    async fn score(&self, chunks: &[Chunk], _answer: &str) -> Result<Vec<f32>> {
        if self.failing {
            return Err(Error::Grounding("simulated scorer failure".into()));
        }
        Ok(vec![self.score; chunks.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, tenant: &str, text: &str) -> Chunk {
        Chunk {
            vector_id: format!("v-{}", id),
            doc_id: "d1".to_string(),
            chunk_id: id.to_string(),
            tenant_id: tenant.to_string(),
            user_id: "u1".to_string(),
            text: text.to_string(),
            score: 0.0,
            embedding: None,
            source_url: None,
        }
    }

    #[test]
    fn test_deterministic_embedding_reproducible() {
        let a = deterministic_embedding("quantum computing", 64);
        let b = deterministic_embedding("quantum computing", 64);
        assert_eq!(a, b);
        let magnitude: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_identical_text_maximally_similar() {
        let a = deterministic_embedding("retention policy", 64);
        let b = deterministic_embedding("retention policy", 64);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
        let c = deterministic_embedding("unrelated cafeteria menu", 64);
        assert!(cosine_similarity(&a, &c) < 0.9);
    }

    #[tokio::test]
    async fn test_mock_store_tenant_filtering() {
        let store = MockVectorStore::new().with_chunks(
            64,
            vec![
                chunk("a", "t1", "retention policy text"),
                chunk("b", "t2", "retention policy text"),
            ],
        );
        let query = deterministic_embedding("retention policy text", 64);
        let hits = store.search(&query, "t1", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tenant_id, "t1");
    }

    #[tokio::test]
    async fn test_mock_store_ranks_by_similarity() {
        let store = MockVectorStore::new().with_chunks(
            64,
            vec![
                chunk("far", "t1", "completely unrelated lunch menu entry"),
                chunk("near", "t1", "customer records retention period"),
            ],
        );
        let query = deterministic_embedding("customer records retention period", 64);
        let hits = store.search(&query, "t1", 10).await.unwrap();
        assert_eq!(hits[0].chunk_id, "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_mock_store_delete_by_user() {
        let store = MockVectorStore::new().with_chunks(
            8,
            vec![chunk("a", "t1", "one"), chunk("b", "t1", "two")],
        );
        let deleted = store.delete_by_user("t1", "u1").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_mock_llm_scripted_answers() {
        let llm = MockLlmClient::new()
            .with_answer("default")
            .with_answer_for("special?", "special answer");
        let ctx = RequestContext::new("tr", "hash");
        let req = |q: &str| GenerationRequest {
            system: "s".into(),
            context: String::new(),
            question: q.into(),
            model_id: "m".into(),
            max_tokens: 10,
            temperature: 0.0,
        };
        assert_eq!(
            llm.generate(req("anything"), &ctx).await.unwrap().answer_text,
            "default"
        );
        assert_eq!(
            llm.generate(req("special?"), &ctx).await.unwrap().answer_text,
            "special answer"
        );
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_llm_failure() {
        let llm = MockLlmClient::new().with_failure("boom");
        let ctx = RequestContext::new("tr", "hash");
        let result = llm
            .generate(
                GenerationRequest {
                    system: "s".into(),
                    context: String::new(),
                    question: "q".into(),
                    model_id: "m".into(),
                    max_tokens: 10,
                    temperature: 0.0,
                },
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(Error::GenerationFailed(_))));
    }

    #[tokio::test]
    async fn test_mock_grounding_scores() {
        let scorer = MockGroundingScorer::new(0.42);
        let scores = scorer
            .score(&[chunk("a", "t1", "x"), chunk("b", "t1", "y")], "answer")
            .await
            .unwrap();
        assert_eq!(scores, vec![0.42, 0.42]);
    }

    #[tokio::test]
    async fn test_failing_embedder() {
        let embedder = MockEmbeddingService::new(8).with_failure();
        assert!(embedder.embed("text").await.is_err());
        assert_eq!(embedder.call_count(), 1);
    }
}
