//! Terminal orchestration failures.

use std::sync::Arc;

use crate::agents::AgentResult;
use crate::budget::BudgetError;
use crate::scheduler::{GraphError, ScheduleError};
use crate::task::SubtaskId;

use super::state::OrchestrationState;

/// First fatal cause of a failed orchestration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FatalCause {
    #[error("No agents registered")]
    NoAgents,

    #[error("Model gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Subtask {subtask} does not fit the token budget: {source}")]
    TokenBudget {
        subtask: SubtaskId,
        source: BudgetError,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid subtask graph: {0}")]
    InvalidGraph(GraphError),
}

impl From<ScheduleError> for FatalCause {
    fn from(error: ScheduleError) -> Self {
        match error {
            ScheduleError::Cancelled => FatalCause::Cancelled,
            ScheduleError::InvalidGraph(e) => FatalCause::InvalidGraph(e),
            ScheduleError::TokenBudget { subtask, source } => {
                FatalCause::TokenBudget { subtask, source }
            }
            e @ ScheduleError::GatewayUnavailable { .. } => {
                FatalCause::GatewayUnavailable(e.to_string())
            }
        }
    }
}

/// A failed orchestration with everything that was salvaged.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Orchestration failed: {cause}")]
pub struct OrchestrationFailed {
    pub cause: FatalCause,
    /// Results of subtasks that completed before the failure, in declaration order.
    pub partial_results: Vec<(SubtaskId, AgentResult)>,
    pub state: Arc<OrchestrationState>,
}

impl OrchestrationFailed {
    /// Build from the recorder's final snapshot.
    pub fn from_state(cause: FatalCause, state: Arc<OrchestrationState>) -> Self {
        let order: Vec<SubtaskId> = state
            .decomposition
            .as_ref()
            .map(|d| d.ids().cloned().collect())
            .unwrap_or_default();
        let partial_results = order
            .into_iter()
            .filter_map(|id| {
                let result = state.subtask_state(&id)?.result()?.clone();
                Some((id, result))
            })
            .collect();
        Self {
            cause,
            partial_results,
            state,
        }
    }
}
