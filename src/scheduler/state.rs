//! Per-subtask execution state.
//!
//! # State Machine
//! ```text
//! Pending -> InProgress -> Completed
//!    |           |
//!    |           \-> Failed { permanent: false } -> InProgress (retry)
//!    |           \-> Failed { permanent: true }
//!    \-> Skipped
//!    \-> Failed { permanent: true }   (no agent, or the budget cannot hold it)
//! ```
//!
//! # Invariants
//! - `Completed`, permanent `Failed` and `Skipped` are terminal
//! - A skipped subtask was never started

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentResult;

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
    /// Backoff applied before the next attempt (0 for the last one).
    pub delay_ms: u64,
}

/// Execution state of one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubtaskExecutionState {
    Pending,
    InProgress {
        started_at: DateTime<Utc>,
        agent_name: String,
        attempt: u32,
    },
    Completed {
        result: AgentResult,
    },
    Failed {
        error: String,
        retry_history: Vec<RetryRecord>,
        /// `false` while another attempt is scheduled.
        permanent: bool,
    },
    Skipped {
        reason: String,
    },
}

impl SubtaskExecutionState {
    pub fn is_terminal(&self) -> bool {
        match self {
            SubtaskExecutionState::Completed { .. } | SubtaskExecutionState::Skipped { .. } => true,
            SubtaskExecutionState::Failed { permanent, .. } => *permanent,
            SubtaskExecutionState::Pending | SubtaskExecutionState::InProgress { .. } => false,
        }
    }

    /// Whether dependents of this subtask must be skipped.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            SubtaskExecutionState::Failed { permanent: true, .. } | SubtaskExecutionState::Skipped { .. }
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SubtaskExecutionState::Completed { .. })
    }

    pub fn result(&self) -> Option<&AgentResult> {
        match self {
            SubtaskExecutionState::Completed { result } => Some(result),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubtaskExecutionState::Pending => "pending",
            SubtaskExecutionState::InProgress { .. } => "in_progress",
            SubtaskExecutionState::Completed { .. } => "completed",
            SubtaskExecutionState::Failed { permanent: true, .. } => "failed",
            SubtaskExecutionState::Failed { .. } => "retrying",
            SubtaskExecutionState::Skipped { .. } => "skipped",
        }
    }

    /// Whether `self -> next` is allowed.
    pub fn can_transition_to(&self, next: &SubtaskExecutionState) -> bool {
        use SubtaskExecutionState::*;
        match (self, next) {
            (Pending, InProgress { .. }) | (Pending, Skipped { .. }) => true,
            (Pending, Failed { permanent, .. }) => *permanent,
            (InProgress { .. }, Completed { .. }) | (InProgress { .. }, Failed { .. }) => true,
            (Failed { permanent: false, .. }, InProgress { .. }) => true,
            _ => false,
        }
    }
}
