//! Structured logging field name constants.
//!
//! All crates use these constants so log aggregation tools can query by
//! standardized field names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, stage completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (chunks, sentences, utterances) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Trace correlation ID propagated across request → stage → shadow fork.
/// Format: UUIDv7 (time-ordered).
pub const TRACE_ID: &str = "trace_id";

/// Tenant scoping every retrieval and audit record.
pub const TENANT_ID: &str = "tenant_id";

pub const USER_ID: &str = "user_id";

/// Pipeline stage emitting the event.
/// Values: "input_safety", "routing", "retrieval", "generation", ...
pub const STAGE: &str = "stage";

/// Experiment arm for the request ("control", "shadow", ...).
pub const VARIANT: &str = "variant";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of chunks flowing out of a stage.
pub const CHUNK_COUNT: &str = "chunk_count";

/// Tokens entering the model.
pub const TOKENS_IN: &str = "tokens_in";

/// Tokens produced by the model.
pub const TOKENS_OUT: &str = "tokens_out";

/// Approximate call cost in USD.
pub const COST_USD: &str = "cost_usd";

// ─── Decision fields ───────────────────────────────────────────────────────

/// Chosen route wire name.
pub const ROUTE: &str = "route";

/// Routing / grounding confidence in [0, 1].
pub const CONFIDENCE: &str = "confidence";

/// Model id used for a generation.
pub const MODEL: &str = "model";

/// Grounding level ("PASS", "WARN", "FAIL").
pub const GROUNDING_LEVEL: &str = "grounding_level";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Why a stage was skipped or degraded.
pub const REASON: &str = "reason";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
