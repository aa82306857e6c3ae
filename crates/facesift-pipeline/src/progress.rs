//! Push-style progress delivery. Best effort: a sink never blocks the run
//! and nothing waits for acknowledgment.

use crate::state::RunState;
use tokio::sync::watch;

pub trait ProgressSink: Send + Sync {
    fn publish(&self, state: &RunState);
}

/// Latest-value channel; receivers that fall behind only see the newest snapshot.
impl ProgressSink for watch::Sender<RunState> {
    fn publish(&self, state: &RunState) {
        self.send_replace(state.clone());
    }
}

/// Logs every snapshot at debug level.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn publish(&self, state: &RunState) {
        tracing::debug!(
            status = ?state.status,
            total = state.total,
            processed = state.processed,
            matched = state.matched,
            failed = state.failed_ids.len(),
            current = state.current_id.as_deref().unwrap_or("-"),
            "run progress"
        );
    }
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _state: &RunState) {}
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(&RunState) + Send + Sync,
{
    fn publish(&self, state: &RunState) {
        (self.0)(state)
    }
}
