//! Append-only audit sinks.
//!
//! WORM semantics are enforced at the interface: neither sink exposes an
//! update or delete operation, and the file sink only ever opens its log
//! in append mode.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use strata_core::{AuditEvent, AuditEventType, AuditSink, Result};

/// JSONL audit log, one event per line, append-only.
pub struct FileAuditSink {
    path: PathBuf,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(event_id = %event.event_id, event_type = ?event.event_type, "audit event appended");
        Ok(())
    }
}

/// In-memory audit sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{AuditActor, AuditActorType};

    fn event(event_type: AuditEventType) -> AuditEvent {
        AuditEvent::new(
            event_type,
            AuditActor {
                actor_type: AuditActorType::System,
                id: "pipeline".into(),
            },
            "test_action",
            "t1",
        )
    }

    #[tokio::test]
    async fn test_file_sink_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");
        let sink = FileAuditSink::new(&path);

        sink.append(&event(AuditEventType::SafetyBlock)).await.unwrap();
        sink.append(&event(AuditEventType::VariantAssignment)).await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, AuditEventType::SafetyBlock);
    }

    #[tokio::test]
    async fn test_file_sink_never_truncates_prior_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        // Two separate sink instances against the same file: the second
        // must append after the first's records, not replace them.
        FileAuditSink::new(&path)
            .append(&event(AuditEventType::Feedback))
            .await
            .unwrap();
        FileAuditSink::new(&path)
            .append(&event(AuditEventType::Feedback))
            .await
            .unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_memory_sink_filters_by_type() {
        let sink = MemoryAuditSink::new();
        sink.append(&event(AuditEventType::SafetyBlock)).await.unwrap();
        sink.append(&event(AuditEventType::Feedback)).await.unwrap();
        sink.append(&event(AuditEventType::SafetyBlock)).await.unwrap();

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type(AuditEventType::SafetyBlock).len(), 2);
        assert_eq!(sink.events_of_type(AuditEventType::VariantAssignment).len(), 0);
    }
}
