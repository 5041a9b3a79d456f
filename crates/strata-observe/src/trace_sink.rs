//! Trace persistence.
//!
//! The file sink writes one JSON document per trace. When the primary
//! directory is unwritable it falls back to a secondary local directory,
//! so a sink outage never fails a request; the orchestrator additionally
//! swallows sink errors.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use strata_core::{Error, Result, Trace, TraceSink};

/// JSON-per-file trace sink with a local fallback directory.
pub struct FileTraceSink {
    dir: PathBuf,
    fallback_dir: PathBuf,
}

impl FileTraceSink {
    pub fn new(dir: impl Into<PathBuf>, fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fallback_dir: fallback_dir.into(),
        }
    }

    async fn write_to(&self, dir: &PathBuf, trace: &Trace) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.json", trace.trace_id));
        let body = serde_json::to_vec_pretty(trace)?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl TraceSink for FileTraceSink {
    async fn save(&self, trace: &Trace) -> Result<()> {
        match self.write_to(&self.dir, trace).await {
            Ok(()) => Ok(()),
            Err(primary_err) => {
                warn!(
                    trace_id = %trace.trace_id,
                    error = %primary_err,
                    "primary trace sink failed; using fallback writer"
                );
                self.write_to(&self.fallback_dir, trace)
                    .await
                    .map_err(|e| Error::Sink(format!("fallback trace writer failed: {}", e)))
            }
        }
    }
}

/// In-memory trace sink for tests.
#[derive(Default)]
pub struct MemoryTraceSink {
    saved: Mutex<Vec<Trace>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<Trace> {
        self.saved.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.saved.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn save(&self, trace: &Trace) -> Result<()> {
        self.saved.lock().unwrap().push(trace.clone());
        Ok(())
    }
}

/// Trace sink that always fails; exercises orchestrator resilience.
pub struct FailingTraceSink;

#[async_trait]
impl TraceSink for FailingTraceSink {
    async fn save(&self, _trace: &Trace) -> Result<()> {
        Err(Error::Sink("simulated trace sink outage".into()))
    }
}
