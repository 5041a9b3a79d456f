//! Error types for the strata pipeline.

use thiserror::Error;

use crate::models::RouteKind;

/// Result type alias using strata's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// How a stage failure propagates through the pipeline.
///
/// Every error variant declares exactly one disposition; the orchestrator
/// dispatches on it instead of inspecting variants at each call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The request cannot continue. A fallback or blocked response is
    /// produced and remaining stages are skipped.
    Terminal,
    /// The stage is skipped with a span reason and the pipeline continues.
    Degrade,
    /// Some sub-tasks failed but the stage produced partial output.
    Partial,
}

/// Core error type for strata pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Query violates its invariants (empty text, missing ids, too long)
    #[error("Invalid input: {0}")]
    InputRejected(String),

    /// Injection or ML-guard positive
    #[error("Safety block ({layer}): {reason}")]
    SafetyBlock { layer: String, reason: String },

    /// Route requires a capability the core does not implement
    #[error("Route not implemented: {0}")]
    NotImplementedRoute(RouteKind),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Vector search failed
    #[error("Search error: {0}")]
    Search(String),

    /// Query expansion failed
    #[error("Expansion error: {0}")]
    Expansion(String),

    /// Reranker provider failed
    #[error("Rerank error: {0}")]
    Rerank(String),

    /// All retrieval sub-queries returned nothing
    #[error("Retrieval returned no results")]
    RetrievalEmpty,

    /// LLM error or timeout during generation
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// Grounding scorer failed
    #[error("Grounding error: {0}")]
    Grounding(String),

    /// Output did not match the route schema
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Deadline exceeded or the cancellation signal fired
    #[error("Request cancelled")]
    Cancelled,

    /// Trace/audit/metric sink failure; never terminal
    #[error("Sink error: {0}")]
    Sink(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The static failure disposition for this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::InputRejected(_)
            | Error::SafetyBlock { .. }
            | Error::NotImplementedRoute(_)
            | Error::GenerationFailed(_)
            | Error::Cancelled => Disposition::Terminal,
            Error::Embedding(_) | Error::Search(_) | Error::RetrievalEmpty => Disposition::Partial,
            _ => Disposition::Degrade,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_safety_block() {
        let err = Error::SafetyBlock {
            layer: "L1".to_string(),
            reason: "instruction_override".to_string(),
        };
        assert_eq!(err.to_string(), "Safety block (L1): instruction_override");
    }

    #[test]
    fn test_display_not_implemented_route() {
        let err = Error::NotImplementedRoute(RouteKind::SqlStructured);
        assert_eq!(err.to_string(), "Route not implemented: SQL_STRUCTURED");
    }

    #[test]
    fn test_terminal_dispositions() {
        assert_eq!(
            Error::GenerationFailed("timeout".into()).disposition(),
            Disposition::Terminal
        );
        assert_eq!(Error::Cancelled.disposition(), Disposition::Terminal);
        assert_eq!(
            Error::SafetyBlock {
                layer: "L2".into(),
                reason: "jailbreak".into()
            }
            .disposition(),
            Disposition::Terminal
        );
    }

    #[test]
    fn test_degrade_dispositions() {
        assert_eq!(
            Error::Rerank("provider down".into()).disposition(),
            Disposition::Degrade
        );
        assert_eq!(
            Error::Expansion("timeout".into()).disposition(),
            Disposition::Degrade
        );
        assert_eq!(
            Error::SchemaViolation("missing answer".into()).disposition(),
            Disposition::Degrade
        );
    }

    #[test]
    fn test_partial_dispositions() {
        assert_eq!(
            Error::Search("shard offline".into()).disposition(),
            Disposition::Partial
        );
        assert_eq!(Error::RetrievalEmpty.disposition(), Disposition::Partial);
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
