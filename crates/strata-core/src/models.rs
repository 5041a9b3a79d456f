//! Data model for the strata request pipeline.
//!
//! Value types flowing between stages. The orchestrator owns the
//! `Trace` and `RequestContext` for the request duration; stages borrow
//! them and never retain references to prior-stage outputs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Embedding vector.
pub type Vector = Vec<f32>;

/// Cosine similarity between two vectors; 0.0 when either is zero-length
/// or zero-magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a > 0.0 && mag_b > 0.0 {
        dot / (mag_a * mag_b)
    } else {
        0.0
    }
}

// =============================================================================
// QUERY
// =============================================================================

/// Maximum query length in Unicode code points.
pub const MAX_QUERY_CODE_POINTS: usize = 10_000;

/// Per-query options supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub include_sources: bool,
    /// Bypass semantic routing entirely when set.
    pub force_route: Option<RouteKind>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            temperature: 0.1,
            include_sources: true,
            force_route: None,
        }
    }
}

/// Immutable pipeline input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub user_id: String,
    pub tenant_id: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl Query {
    pub fn new(
        text: impl Into<String>,
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            session_id: None,
            options: QueryOptions::default(),
        }
    }

    /// Re-check the Query invariants. The HTTP layer validates before the
    /// core is invoked, but the core does not trust it.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(Error::InputRejected("query text is empty".into()));
        }
        if self.text.chars().count() > MAX_QUERY_CODE_POINTS {
            return Err(Error::InputRejected(format!(
                "query text exceeds {} code points",
                MAX_QUERY_CODE_POINTS
            )));
        }
        if self.user_id.is_empty() {
            return Err(Error::InputRejected("user_id is empty".into()));
        }
        if self.tenant_id.is_empty() {
            return Err(Error::InputRejected("tenant_id is empty".into()));
        }
        Ok(())
    }
}

// =============================================================================
// ROUTING
// =============================================================================

/// Classification of a query's intent.
///
/// `SqlStructured` and `ApiLookup` are reserved: routing may select them,
/// but dispatch surfaces a typed not-implemented response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteKind {
    ApiLookup,
    Direct,
    Escalate,
    Rag,
    SqlStructured,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::ApiLookup => "API_LOOKUP",
            RouteKind::Direct => "DIRECT",
            RouteKind::Escalate => "ESCALATE",
            RouteKind::Rag => "RAG",
            RouteKind::SqlStructured => "SQL_STRUCTURED",
        }
    }

    /// All route kinds in alphabetical order of their wire name, which is
    /// also the deterministic tie-break order for routing.
    pub fn all() -> [RouteKind; 5] {
        [
            RouteKind::ApiLookup,
            RouteKind::Direct,
            RouteKind::Escalate,
            RouteKind::Rag,
            RouteKind::SqlStructured,
        ]
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the routing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route_kind: RouteKind,
    /// Best max-sim across the chosen route's utterances, clamped to [0,1].
    pub confidence: f32,
    /// Per-route max similarity, keyed by wire name.
    pub scores: BTreeMap<String, f32>,
    pub matched_utterance: Option<String>,
}

/// Queries to run against the vector store: the original plus paraphrases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub primary_text: String,
    pub variants: Vec<String>,
    pub skip_expansion: bool,
}

impl QueryPlan {
    pub fn single(text: impl Into<String>) -> Self {
        Self {
            primary_text: text.into(),
            variants: Vec::new(),
            skip_expansion: true,
        }
    }

    /// All query texts, primary first.
    pub fn texts(&self) -> Vec<&str> {
        std::iter::once(self.primary_text.as_str())
            .chain(self.variants.iter().map(String::as_str))
            .collect()
    }
}

// =============================================================================
// RETRIEVAL
// =============================================================================

/// A retrieved passage with its identity and tenancy metadata.
///
/// The metadata invariant (nonempty ids) is enforced at ingest; retrieval
/// may assume it but `validate_metadata` lets boundaries re-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub vector_id: String,
    pub doc_id: String,
    pub chunk_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub text: String,
    /// Retrieval score in [0, 1].
    pub score: f32,
    /// Only populated when a later stage needs it (dedup).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl Chunk {
    pub fn validate_metadata(&self) -> Result<()> {
        if self.user_id.is_empty()
            || self.doc_id.is_empty()
            || self.tenant_id.is_empty()
            || self.chunk_id.is_empty()
        {
            return Err(Error::Internal(format!(
                "chunk {} is missing ingest metadata",
                self.vector_id
            )));
        }
        Ok(())
    }
}

/// Fused and deduplicated retrieval output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunks: Vec<Chunk>,
    pub empty: bool,
    /// Raw hit counts per plan query, in plan order.
    pub raw_counts: Vec<usize>,
}

/// Context after sentence compression and token budgeting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressedContext {
    pub ordered_chunks: Vec<Chunk>,
    pub dropped_sentence_count: usize,
    /// Always ≤ the effective budget after budgeting.
    pub total_tokens: usize,
}

impl CompressedContext {
    pub fn is_empty(&self) -> bool {
        self.ordered_chunks.is_empty()
    }

    /// Chunk texts joined with source markers, the shape the LLM prompt uses.
    pub fn as_prompt_context(&self) -> String {
        self.ordered_chunks
            .iter()
            .map(|c| format!("[Source: {}]\n{}", c.doc_id, c.text))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

// =============================================================================
// GENERATION
// =============================================================================

/// One completed LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub answer_text: String,
    pub model_id: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub finish_reason: String,
}

/// Model tier selected by the tier policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Standard,
    Complex,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Fast => write!(f, "fast"),
            ModelTier::Standard => write!(f, "standard"),
            ModelTier::Complex => write!(f, "complex"),
        }
    }
}

// =============================================================================
// GROUNDING
// =============================================================================

/// How per-chunk grounding scores collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    /// Best-chunk semantics; appropriate when retrieval returns mixed relevance.
    #[default]
    Max,
    Mean,
    Min,
}

/// Three-way grounding decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroundingLevel {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for GroundingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroundingLevel::Pass => write!(f, "PASS"),
            GroundingLevel::Warn => write!(f, "WARN"),
            GroundingLevel::Fail => write!(f, "FAIL"),
        }
    }
}

/// Grounding outcome for one answer against its context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingVerdict {
    pub score: f32,
    pub level: GroundingLevel,
    pub per_chunk_scores: Vec<f32>,
    pub aggregation: Aggregation,
}

impl GroundingVerdict {
    /// Aggregate per-chunk scores and map through the pass/warn thresholds.
    ///
    /// Empty score lists aggregate to 0.0, which always maps to FAIL under
    /// sane thresholds.
    pub fn from_scores(
        per_chunk_scores: Vec<f32>,
        aggregation: Aggregation,
        pass_threshold: f32,
        warn_threshold: f32,
    ) -> Self {
        let score = match aggregation {
            _ if per_chunk_scores.is_empty() => 0.0,
            Aggregation::Max => per_chunk_scores.iter().cloned().fold(f32::MIN, f32::max),
            Aggregation::Min => per_chunk_scores.iter().cloned().fold(f32::MAX, f32::min),
            Aggregation::Mean => {
                per_chunk_scores.iter().sum::<f32>() / per_chunk_scores.len() as f32
            }
        };
        let score = score.clamp(0.0, 1.0);
        let level = if score >= pass_threshold {
            GroundingLevel::Pass
        } else if score >= warn_threshold {
            GroundingLevel::Warn
        } else {
            GroundingLevel::Fail
        };
        Self {
            score,
            level,
            per_chunk_scores,
            aggregation,
        }
    }
}

// =============================================================================
// RESPONSE
// =============================================================================

/// One source citation returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub doc_id: String,
    pub chunk_id: String,
    pub text_snippet: String,
    pub relevance_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl SourceInfo {
    /// Snippet length cap for the response payload.
    pub const SNIPPET_LEN: usize = 200;

    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            doc_id: chunk.doc_id.clone(),
            chunk_id: chunk.chunk_id.clone(),
            text_snippet: chunk.text.chars().take(Self::SNIPPET_LEN).collect(),
            relevance_score: chunk.score,
            source_url: chunk.source_url.clone(),
        }
    }
}

/// Response metadata block; shape is bit-stable for clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub route_used: String,
    pub faithfulness_score: Option<f32>,
    pub model: Option<String>,
    pub latency_ms: u64,
    pub tokens_used: Option<u64>,
    pub schema_valid: bool,
}

/// The pipeline's only output. `answer` is absent exactly when the request
/// was blocked or a FAIL grounding suppressed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub answer: Option<String>,
    pub trace_id: String,
    pub sources: Vec<SourceInfo>,
    pub metadata: ResponseMetadata,
    pub fallback: bool,
    pub blocked: bool,
    pub block_reason: Option<String>,
}

// =============================================================================
// AUDIT
// =============================================================================

/// Types of auditable events the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SafetyBlock,
    DeletionRequest,
    VariantAssignment,
    Feedback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActorType {
    User,
    System,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResourceType {
    Trace,
    Vector,
    Document,
    Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditActor {
    #[serde(rename = "type")]
    pub actor_type: AuditActorType,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResource {
    #[serde(rename = "type")]
    pub resource_type: AuditResourceType,
    pub id: String,
}

/// Immutable audit log entry. Append-only; sinks expose no mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub actor: AuditActor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<AuditResource>,
    pub action: String,
    pub tenant_id: String,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        actor: AuditActor,
        action: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            actor,
            resource: None,
            action: action.into(),
            tenant_id: tenant_id.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_resource(mut self, resource: AuditResource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Feedback forwarded from the external feedback service; the core only
/// audits and counts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub trace_id: String,
    pub user_id: String,
    pub tenant_id: String,
    /// "positive" | "negative"
    pub rating: String,
    pub correction: Option<String>,
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_validate_ok() {
        let q = Query::new("What is the retention policy?", "u1", "t1");
        assert!(q.validate().is_ok());
    }

    #[test]
    fn test_query_validate_empty_text() {
        let q = Query::new("   ", "u1", "t1");
        assert!(matches!(q.validate(), Err(Error::InputRejected(_))));
    }

    #[test]
    fn test_query_validate_too_long() {
        let q = Query::new("x".repeat(MAX_QUERY_CODE_POINTS + 1), "u1", "t1");
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_query_validate_code_points_not_bytes() {
        // 10,000 multi-byte code points is exactly at the limit
        let q = Query::new("é".repeat(MAX_QUERY_CODE_POINTS), "u1", "t1");
        assert!(q.validate().is_ok());
    }

    #[test]
    fn test_query_validate_missing_ids() {
        let q = Query::new("hello", "", "t1");
        assert!(q.validate().is_err());
        let q = Query::new("hello", "u1", "");
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_route_kind_wire_names() {
        assert_eq!(RouteKind::Rag.to_string(), "RAG");
        assert_eq!(RouteKind::SqlStructured.to_string(), "SQL_STRUCTURED");
        assert_eq!(
            serde_json::to_string(&RouteKind::ApiLookup).unwrap(),
            "\"API_LOOKUP\""
        );
    }

    #[test]
    fn test_route_kind_all_is_alphabetical() {
        let names: Vec<&str> = RouteKind::all().iter().map(|r| r.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_query_plan_texts_primary_first() {
        let plan = QueryPlan {
            primary_text: "original".into(),
            variants: vec!["alt one".into(), "alt two".into()],
            skip_expansion: false,
        };
        assert_eq!(plan.texts(), vec!["original", "alt one", "alt two"]);
    }

    #[test]
    fn test_cosine_similarity_basics() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_grounding_verdict_max_aggregation() {
        let v = GroundingVerdict::from_scores(vec![0.2, 0.9, 0.5], Aggregation::Max, 0.85, 0.70);
        assert!((v.score - 0.9).abs() < 1e-6);
        assert_eq!(v.level, GroundingLevel::Pass);
    }

    #[test]
    fn test_grounding_verdict_mean_aggregation() {
        let v = GroundingVerdict::from_scores(vec![0.6, 0.8], Aggregation::Mean, 0.85, 0.70);
        assert!((v.score - 0.7).abs() < 1e-6);
        assert_eq!(v.level, GroundingLevel::Warn);
    }

    #[test]
    fn test_grounding_verdict_min_aggregation() {
        let v = GroundingVerdict::from_scores(vec![0.6, 0.9], Aggregation::Min, 0.85, 0.70);
        assert_eq!(v.level, GroundingLevel::Fail);
    }

    #[test]
    fn test_grounding_verdict_empty_scores_fail() {
        let v = GroundingVerdict::from_scores(vec![], Aggregation::Max, 0.85, 0.70);
        assert_eq!(v.score, 0.0);
        assert_eq!(v.level, GroundingLevel::Fail);
    }

    #[test]
    fn test_grounding_threshold_boundaries() {
        // score == pass_threshold is PASS, score == warn_threshold is WARN
        let v = GroundingVerdict::from_scores(vec![0.85], Aggregation::Max, 0.85, 0.70);
        assert_eq!(v.level, GroundingLevel::Pass);
        let v = GroundingVerdict::from_scores(vec![0.70], Aggregation::Max, 0.85, 0.70);
        assert_eq!(v.level, GroundingLevel::Warn);
        let v = GroundingVerdict::from_scores(vec![0.6999], Aggregation::Max, 0.85, 0.70);
        assert_eq!(v.level, GroundingLevel::Fail);
    }

    #[test]
    fn test_source_info_snippet_truncation() {
        let chunk = Chunk {
            vector_id: "v1".into(),
            doc_id: "d1".into(),
            chunk_id: "c1".into(),
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            text: "x".repeat(500),
            score: 0.5,
            embedding: None,
            source_url: Some("https://example.com/doc".into()),
        };
        let src = SourceInfo::from_chunk(&chunk);
        assert_eq!(src.text_snippet.len(), SourceInfo::SNIPPET_LEN);
        assert_eq!(src.source_url.as_deref(), Some("https://example.com/doc"));
    }

    #[test]
    fn test_chunk_metadata_validation() {
        let mut chunk = Chunk {
            vector_id: "v1".into(),
            doc_id: "d1".into(),
            chunk_id: "c1".into(),
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            text: "text".into(),
            score: 0.5,
            embedding: None,
            source_url: None,
        };
        assert!(chunk.validate_metadata().is_ok());
        chunk.doc_id.clear();
        assert!(chunk.validate_metadata().is_err());
    }

    #[test]
    fn test_response_serialization_shape() {
        let response = Response {
            answer: None,
            trace_id: "tr-1".into(),
            sources: vec![],
            metadata: ResponseMetadata {
                route_used: "RAG".into(),
                faithfulness_score: None,
                model: None,
                latency_ms: 12,
                tokens_used: None,
                schema_valid: true,
            },
            fallback: false,
            blocked: true,
            block_reason: Some("injection".into()),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["answer"], serde_json::Value::Null);
        assert_eq!(json["metadata"]["route_used"], "RAG");
        assert_eq!(json["blocked"], true);
        assert_eq!(json["block_reason"], "injection");
    }

    #[test]
    fn test_audit_event_builder() {
        let event = AuditEvent::new(
            AuditEventType::SafetyBlock,
            AuditActor {
                actor_type: AuditActorType::System,
                id: "pipeline".into(),
            },
            "block_input",
            "t1",
        )
        .with_detail("layer", serde_json::json!("L1"));

        assert_eq!(event.event_type, AuditEventType::SafetyBlock);
        assert_eq!(event.tenant_id, "t1");
        assert_eq!(event.details["layer"], "L1");
        assert!(!event.event_id.is_empty());
    }

    #[test]
    fn test_compressed_context_prompt_format() {
        let ctx = CompressedContext {
            ordered_chunks: vec![Chunk {
                vector_id: "v1".into(),
                doc_id: "policy-doc".into(),
                chunk_id: "c1".into(),
                tenant_id: "t1".into(),
                user_id: "u1".into(),
                text: "Records are kept 7 years.".into(),
                score: 0.9,
                embedding: None,
                source_url: None,
            }],
            dropped_sentence_count: 0,
            total_tokens: 7,
        };
        let prompt = ctx.as_prompt_context();
        assert!(prompt.contains("[Source: policy-doc]"));
        assert!(prompt.contains("7 years"));
    }
}
