//! Inter-item scheduling and cooperative cancellation.
//!
//! The pipeline yields once between items. How the suspension is realized
//! is up to the host; every implementation returns control within a bounded
//! time.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[async_trait]
pub trait Yielder: Send + Sync {
    async fn yield_now(&self);
}

/// Plain task yield: lets other tasks on the runtime make progress.
pub struct CooperativeYield;

#[async_trait]
impl Yielder for CooperativeYield {
    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}

/// Waits for the host's idle signal, but never longer than `max_wait`.
pub struct IdleSignalYield {
    idle: Arc<Notify>,
    max_wait: Duration,
}

impl IdleSignalYield {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            idle: Arc::new(Notify::new()),
            max_wait,
        }
    }

    /// Handle the host uses to signal idleness (`notify_one`).
    pub fn idle_signal(&self) -> Arc<Notify> {
        self.idle.clone()
    }
}

#[async_trait]
impl Yielder for IdleSignalYield {
    async fn yield_now(&self) {
        if tokio::time::timeout(self.max_wait, self.idle.notified()).await.is_err() {
            tracing::trace!(max_wait_ms = self.max_wait.as_millis() as u64, "idle signal timed out; resuming");
        }
    }
}

/// Shared cancellation flag, settable from any thread at any time.
///
/// The pipeline checks it only between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
