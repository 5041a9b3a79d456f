//! Trace and span records.
//!
//! One `Trace` per request. Spans are appended in stage execution start
//! order and the trace is frozen once handed to the sink; the orchestrator
//! guarantees exactly one delivery per request.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Span outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Skipped,
    Failed,
}

/// One stage's record within a trace. `start_ms`/`end_ms` are offsets from
/// the trace open, measured on the monotonic clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub status: SpanStatus,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Span {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Request totals computed at finalize.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TraceTotals {
    pub latency_ms: u64,
    pub cost_usd: f64,
}

/// One per request; owns the ordered span list and scalar scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub session_id: Option<String>,
    pub pipeline_version: String,
    pub config_hash: String,
    pub variant: String,
    pub spans: Vec<Span>,
    pub scores: BTreeMap<String, f64>,
    pub totals: TraceTotals,
    #[serde(skip)]
    frozen: bool,
}

impl Trace {
    pub fn new(
        trace_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: Option<String>,
        pipeline_version: impl Into<String>,
        config_hash: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            timestamp: Utc::now(),
            user_id: user_id.into(),
            session_id,
            pipeline_version: pipeline_version.into(),
            config_hash: config_hash.into(),
            variant: variant.into(),
            spans: Vec::new(),
            scores: BTreeMap::new(),
            totals: TraceTotals::default(),
            frozen: false,
        }
    }

    /// Append a span. Appends after `freeze` are a programming error and
    /// are dropped with a warning rather than corrupting the record.
    pub fn push_span(&mut self, mut span: Span) {
        if self.frozen {
            tracing::warn!(
                trace_id = %self.trace_id,
                span = %span.name,
                "span appended after freeze; dropped"
            );
            return;
        }
        if span.end_ms < span.start_ms {
            span.end_ms = span.start_ms;
        }
        self.spans.push(span);
    }

    pub fn set_score(&mut self, name: impl Into<String>, value: f64) {
        if !self.frozen {
            self.scores.insert(name.into(), value);
        }
    }

    /// Compute totals and seal the trace for sink delivery.
    pub fn freeze(&mut self, latency_ms: u64, cost_usd: f64) {
        self.totals = TraceTotals {
            latency_ms,
            cost_usd,
        };
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn span(&self, name: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.name == name)
    }
}

/// Builder for one span; collects attributes while the stage runs.
#[derive(Debug)]
pub struct SpanRecorder {
    name: String,
    start_ms: u64,
    attributes: BTreeMap<String, serde_json::Value>,
}

impl SpanRecorder {
    pub fn start(name: impl Into<String>, start_ms: u64) -> Self {
        Self {
            name: name.into(),
            start_ms,
            attributes: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn finish(self, end_ms: u64, status: SpanStatus) -> Span {
        Span {
            name: self.name,
            start_ms: self.start_ms,
            end_ms,
            status,
            attributes: self.attributes,
        }
    }

    /// Skipped spans always carry a reason.
    pub fn finish_skipped(mut self, end_ms: u64, reason: &str) -> Span {
        self.set("reason", reason);
        self.finish(end_ms, SpanStatus::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> Trace {
        Trace::new("tr-1", "u1", None, "1.0.0", "cfg-hash", "control")
    }

    #[test]
    fn test_span_append_order_preserved() {
        let mut t = trace();
        for name in ["input_safety", "routing", "retrieval"] {
            let rec = SpanRecorder::start(name, 0);
            t.push_span(rec.finish(1, SpanStatus::Ok));
        }
        let names: Vec<&str> = t.spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["input_safety", "routing", "retrieval"]);
    }

    #[test]
    fn test_freeze_rejects_further_spans() {
        let mut t = trace();
        t.push_span(SpanRecorder::start("routing", 0).finish(1, SpanStatus::Ok));
        t.freeze(10, 0.001);
        t.push_span(SpanRecorder::start("late", 11).finish(12, SpanStatus::Ok));
        assert_eq!(t.spans.len(), 1);
        assert!(t.is_frozen());
        assert_eq!(t.totals.latency_ms, 10);
    }

    #[test]
    fn test_skipped_span_carries_reason() {
        let rec = SpanRecorder::start("query_expansion", 5);
        let span = rec.finish_skipped(5, "high_confidence");
        assert_eq!(span.status, SpanStatus::Skipped);
        assert_eq!(span.attribute_str("reason"), Some("high_confidence"));
    }

    #[test]
    fn test_span_end_clamped_to_start() {
        let mut t = trace();
        t.push_span(Span {
            name: "bogus".into(),
            start_ms: 10,
            end_ms: 5,
            status: SpanStatus::Ok,
            attributes: BTreeMap::new(),
        });
        assert_eq!(t.spans[0].end_ms, 10);
        assert_eq!(t.spans[0].duration_ms(), 0);
    }

    #[test]
    fn test_scores_map() {
        let mut t = trace();
        t.set_score("faithfulness", 0.92);
        assert_eq!(t.scores["faithfulness"], 0.92);
        t.freeze(1, 0.0);
        t.set_score("late", 1.0);
        assert!(!t.scores.contains_key("late"));
    }

    #[test]
    fn test_trace_round_trips_through_json() {
        let mut t = trace();
        let mut rec = SpanRecorder::start("generation", 3);
        rec.set("model", "gpt-4o");
        rec.set("tokens_in", 120);
        t.push_span(rec.finish(90, SpanStatus::Ok));
        t.freeze(95, 0.0021);

        let json = serde_json::to_string(&t).unwrap();
        let back: Trace = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trace_id, "tr-1");
        assert_eq!(back.spans.len(), 1);
        assert_eq!(back.spans[0].attribute_str("model"), Some("gpt-4o"));
        assert_eq!(back.totals.latency_ms, 95);
    }
}
