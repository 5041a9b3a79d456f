//! Feedback recording.
//!
//! The feedback service itself lives outside the core; what the core owns
//! is the audit trail and the metric. Every forwarded feedback write lands
//! in both.

use tracing::info;

use strata_core::{
    AuditActor, AuditActorType, AuditEvent, AuditEventType, AuditResource, AuditResourceType,
    AuditSink, FeedbackRequest, MetricSink, Result,
};
use strata_observe::names;

/// Record one feedback write: append the audit event, bump the counter.
/// Returns the audit event id.
pub async fn record_feedback(
    request: &FeedbackRequest,
    audits: &dyn AuditSink,
    metrics: &dyn MetricSink,
) -> Result<String> {
    let event = AuditEvent::new(
        AuditEventType::Feedback,
        AuditActor {
            actor_type: AuditActorType::User,
            id: request.user_id.clone(),
        },
        "record_feedback",
        request.tenant_id.clone(),
    )
    .with_resource(AuditResource {
        resource_type: AuditResourceType::Trace,
        id: request.trace_id.clone(),
    })
    .with_detail("rating", serde_json::json!(request.rating))
    .with_detail("has_correction", serde_json::json!(request.correction.is_some()));

    let event_id = event.event_id.clone();
    audits.append(&event).await?;
    metrics.inc(
        names::FEEDBACK_RECEIVED_TOTAL,
        &[("rating", request.rating.as_str())],
        1,
    );
    info!(trace_id = %request.trace_id, rating = %request.rating, "feedback recorded");
    Ok(event_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_observe::{MemoryAuditSink, MetricRegistry};

    #[tokio::test]
    async fn test_feedback_emits_audit_and_metric() {
        let audits = MemoryAuditSink::new();
        let metrics = MetricRegistry::new();
        let request = FeedbackRequest {
            trace_id: "tr-1".into(),
            user_id: "u1".into(),
            tenant_id: "t1".into(),
            rating: "negative".into(),
            correction: Some("the retention period is five years".into()),
            comment: None,
        };

        let event_id = record_feedback(&request, &audits, &metrics).await.unwrap();

        let events = audits.events_of_type(AuditEventType::Feedback);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, event_id);
        assert_eq!(events[0].details["rating"], "negative");
        assert_eq!(events[0].details["has_correction"], true);
        assert_eq!(
            metrics.counter_value(names::FEEDBACK_RECEIVED_TOTAL, &[("rating", "negative")]),
            1
        );
    }
}
