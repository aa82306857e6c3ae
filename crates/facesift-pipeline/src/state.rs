//! Run state machine.
//!
//! ```text
//! idle ──start──▶ initializing-model ──ready──▶ running ──exhausted──▶ complete
//!   │                  │        │                  │
//!   └──▶ error ◀───────┘        └──empty──▶ complete └──cancel──▶ idle
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    #[default]
    Idle,
    InitializingModel,
    Running,
    Complete,
    Error,
}

impl RunStatus {
    /// Edges allowed within a single run.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Idle, InitializingModel)
                | (Idle, Error)
                | (InitializingModel, Running)
                | (InitializingModel, Complete)
                | (InitializingModel, Error)
                | (Running, Complete)
                | (Running, Idle)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Idle | RunStatus::Complete | RunStatus::Error)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid run transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Progress snapshot of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub total: usize,
    pub processed: usize,
    pub matched: usize,
    pub current_id: Option<String>,
    pub error: Option<String>,
    pub failed_ids: Vec<String>,
}

impl RunState {
    pub fn transition(&mut self, next: RunStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Enter `error` with a displayable message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(RunStatus::Error)?;
        self.current_id = None;
        let message = message.into();
        self.error = Some(if message.trim().is_empty() {
            "unknown error".to_string()
        } else {
            message
        });
        Ok(())
    }

    /// Count one finished item.
    pub fn record_item(&mut self, matched: bool) {
        debug_assert!(self.processed < self.total, "processed would exceed total");
        self.processed += 1;
        if matched {
            self.matched += 1;
        }
    }

    pub fn record_failure(&mut self, id: impl Into<String>) {
        self.failed_ids.push(id.into());
    }

    /// `0 <= matched <= processed <= total`.
    pub fn counters_consistent(&self) -> bool {
        self.matched <= self.processed && self.processed <= self.total
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }
}
