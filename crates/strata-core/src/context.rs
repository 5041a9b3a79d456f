//! Per-request context and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Cooperative cancellation signal shared between the request task and
/// anything that can abort it (deadline watchdog, client disconnect).
///
/// Cheap to clone; all clones observe the same state.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    fired: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolve when the signal fires; resolves immediately if it already has.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("fired", &self.is_cancelled())
            .finish()
    }
}

/// Per-request context, mutable only by the orchestrator. Stages borrow it
/// and check cancellation at their boundaries.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub started_at: Instant,
    pub deadline: Option<Instant>,
    pub cancellation: CancellationSignal,
    pub variant: String,
    pub config_hash: String,
}

impl RequestContext {
    pub fn new(trace_id: impl Into<String>, config_hash: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            started_at: Instant::now(),
            deadline: None,
            cancellation: CancellationSignal::new(),
            variant: "control".to_string(),
            config_hash: config_hash.into(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Time left before the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_exceeded(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Boundary check used before every stage and external call.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() || self.deadline_exceeded() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
