//! Orchestration state machine, event log and the recorder that guards them.
//!
//! # State Machine
//! ```text
//! Decision -> Analysis -> Decomposition -> Execution -> Synthesis -> Complete
//!    |            |             |               |            \-> Failed
//!    \-> Complete \-------------+---------------+--> Failed
//! ```
//!
//! # Invariants
//! - Phases only move forward
//! - `Complete` and `Failed` are frozen: no further events or mutations
//! - The event log is append-only and totally ordered
//! - After cancellation nothing is recorded

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::metrics::DelegationMetrics;
use crate::scheduler::SubtaskExecutionState;
use crate::task::{SubtaskId, TaskDecomposition};

/// Orchestration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Decision,
    Analysis,
    Decomposition,
    Execution,
    Synthesis,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// # Property
    /// `can_transition_to(next) => next > self`
    pub fn can_transition_to(&self, next: Phase) -> bool {
        if self.is_terminal() || next <= *self {
            return false;
        }
        match next {
            // The only way to skip straight to Complete is the direct short circuit
            Phase::Complete => matches!(self, Phase::Decision | Phase::Synthesis),
            _ => true,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Decision => "decision",
            Phase::Analysis => "analysis",
            Phase::Decomposition => "decomposition",
            Phase::Execution => "execution",
            Phase::Synthesis => "synthesis",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Kind of orchestration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PhaseChanged,
    DelegationDecided,
    AnalysisCompleted,
    DecompositionCompleted,
    DecompositionWarning,
    SubtaskPruned,
    GroupsPlanned,
    GroupStarted,
    GroupCompleted,
    ContextIsolated,
    SubtaskStarted,
    SubtaskCompleted,
    SubtaskRetrying,
    SubtaskFailed,
    SubtaskSkipped,
    ContextMerged,
    SynthesisFallback,
    SynthesisCompleted,
}

/// One immutable entry of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<SubtaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl OrchestrationEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            subtask_id: None,
            agent_name: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn subtask(mut self, id: &SubtaskId) -> Self {
        self.subtask_id = Some(id.clone());
        self
    }

    pub fn agent(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Everything an observer can see about one orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub phase: Phase,
    pub decomposition: Option<TaskDecomposition>,
    pub subtask_states: BTreeMap<SubtaskId, SubtaskExecutionState>,
    pub parallel_groups: Vec<Vec<SubtaskId>>,
    pub events: Vec<OrchestrationEvent>,
    pub metrics: Option<DelegationMetrics>,
    pub error: Option<String>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self {
            phase: Phase::Decision,
            decomposition: None,
            subtask_states: BTreeMap::new(),
            parallel_groups: Vec::new(),
            events: Vec::new(),
            metrics: None,
            error: None,
        }
    }
}

impl OrchestrationState {
    /// Events appended after the first `n`.
    pub fn events_since(&self, n: usize) -> &[OrchestrationEvent] {
        self.events.get(n..).unwrap_or(&[])
    }

    pub fn subtask_state(&self, id: &SubtaskId) -> Option<&SubtaskExecutionState> {
        self.subtask_states.get(id)
    }

    pub fn count_events(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

/// Serialized writer for [`OrchestrationState`].
///
/// Every mutation takes the same lock, appends its event, and publishes a
/// snapshot on the watch channel before releasing it. Cloning yields another
/// handle to the same state.
#[derive(Clone)]
pub struct StateRecorder {
    state: Arc<Mutex<OrchestrationState>>,
    tx: Arc<watch::Sender<Arc<OrchestrationState>>>,
    cancel: CancellationToken,
}

impl StateRecorder {
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(OrchestrationState::default()));
        Self::with_sender(cancel, Arc::new(tx))
    }

    /// Recorder publishing on an existing channel, starting from a fresh state.
    pub fn with_sender(
        cancel: CancellationToken,
        tx: Arc<watch::Sender<Arc<OrchestrationState>>>,
    ) -> Self {
        let state = OrchestrationState::default();
        tx.send_replace(Arc::new(state.clone()));
        Self {
            state: Arc::new(Mutex::new(state)),
            tx,
            cancel,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<OrchestrationState>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<OrchestrationState> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::new(state.clone())
    }

    /// Apply `mutate` and append `event` atomically.
    ///
    /// # Postconditions
    /// - Returns `false` and changes nothing when the state is terminal, the
    ///   run is cancelled, or `mutate` rejects the change
    pub fn record(
        &self,
        event: OrchestrationEvent,
        mutate: impl FnOnce(&mut OrchestrationState) -> bool,
    ) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.phase.is_terminal() || self.cancel.is_cancelled() {
            return false;
        }
        if !mutate(&mut state) {
            return false;
        }
        state.events.push(event);
        self.tx.send_replace(Arc::new(state.clone()));
        true
    }

    /// Append an event without touching anything else.
    pub fn event(&self, event: OrchestrationEvent) -> bool {
        self.record(event, |_| true)
    }

    /// Move to `next`, appending a `PhaseChanged` event.
    pub fn transition(&self, next: Phase) -> bool {
        let event = OrchestrationEvent::new(EventType::PhaseChanged)
            .with("to", serde_json::json!(next.to_string()));
        let mut from = None;
        let accepted = self.record(event, |state| {
            if !state.phase.can_transition_to(next) {
                return false;
            }
            from = Some(state.phase);
            state.phase = next;
            true
        });
        match (accepted, from) {
            (true, Some(from)) => info!("Orchestration phase {} -> {}", from, next),
            _ => warn!("Rejected phase transition to {}", next),
        }
        accepted
    }

    /// Set a subtask's state if the transition is legal.
    pub fn set_subtask_state(
        &self,
        id: &SubtaskId,
        next: SubtaskExecutionState,
        event: OrchestrationEvent,
    ) -> bool {
        self.record(event, |state| {
            let current = state
                .subtask_states
                .get(id)
                .cloned()
                .unwrap_or(SubtaskExecutionState::Pending);
            if !current.can_transition_to(&next) {
                warn!(
                    "Rejected subtask {} transition {} -> {}",
                    id,
                    current.label(),
                    next.label()
                );
                return false;
            }
            state.subtask_states.insert(id.clone(), next);
            true
        })
    }

    /// Install the decomposition and register every subtask as pending.
    pub fn set_decomposition(&self, decomposition: &TaskDecomposition, event: OrchestrationEvent) -> bool {
        self.record(event, |state| {
            state.subtask_states = decomposition
                .ids()
                .map(|id| (id.clone(), SubtaskExecutionState::Pending))
                .collect();
            state.decomposition = Some(decomposition.clone());
            true
        })
    }

    /// Enter a terminal phase, attaching metrics or an error in the same step.
    pub fn finish(
        &self,
        terminal: Phase,
        metrics: Option<DelegationMetrics>,
        error: Option<String>,
    ) -> bool {
        let event = OrchestrationEvent::new(EventType::PhaseChanged)
            .with("to", serde_json::json!(terminal.to_string()));
        let accepted = self.record(event, |state| {
            if !terminal.is_terminal() || !state.phase.can_transition_to(terminal) {
                return false;
            }
            state.phase = terminal;
            state.metrics = metrics;
            state.error = error;
            true
        });
        if accepted {
            info!("Orchestration finished: {}", terminal);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions_are_monotonic() {
        assert!(Phase::Decision.can_transition_to(Phase::Analysis));
        assert!(Phase::Decision.can_transition_to(Phase::Complete));
        assert!(Phase::Execution.can_transition_to(Phase::Failed));
        assert!(Phase::Synthesis.can_transition_to(Phase::Complete));
        assert!(!Phase::Execution.can_transition_to(Phase::Complete));
        assert!(!Phase::Execution.can_transition_to(Phase::Analysis));
        assert!(!Phase::Complete.can_transition_to(Phase::Failed));
        assert!(!Phase::Failed.can_transition_to(Phase::Failed));
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let recorder = StateRecorder::new(CancellationToken::new());
        assert!(recorder.finish(Phase::Complete, None, None));
        let before = recorder.snapshot();

        assert!(!recorder.transition(Phase::Failed));
        assert!(!recorder.event(OrchestrationEvent::new(EventType::SubtaskStarted)));
        assert!(!recorder.record(OrchestrationEvent::new(EventType::GroupsPlanned), |s| {
            s.error = Some("late".into());
            true
        }));
        assert_eq!(*recorder.snapshot(), *before);
    }

    #[test]
    fn test_cancelled_recorder_refuses_writes() {
        let cancel = CancellationToken::new();
        let recorder = StateRecorder::new(cancel.clone());
        assert!(recorder.transition(Phase::Analysis));
        cancel.cancel();

        assert!(!recorder.event(OrchestrationEvent::new(EventType::SubtaskCompleted)));
        assert_eq!(recorder.snapshot().events.len(), 1);
    }

    #[test]
    fn test_subtask_transitions_validated() {
        let recorder = StateRecorder::new(CancellationToken::new());
        let id = SubtaskId::from("s1");
        let skipped = SubtaskExecutionState::Skipped {
            reason: "dependency failed".into(),
        };

        assert!(recorder.set_subtask_state(&id, skipped.clone(), OrchestrationEvent::new(EventType::SubtaskSkipped)));
        // Skipped is terminal
        assert!(!recorder.set_subtask_state(
            &id,
            SubtaskExecutionState::Pending,
            OrchestrationEvent::new(EventType::SubtaskStarted)
        ));
        assert_eq!(recorder.snapshot().subtask_state(&id), Some(&skipped));
    }

    #[tokio::test]
    async fn test_subscribers_see_every_event_and_diff_by_count() {
        let recorder = StateRecorder::new(CancellationToken::new());
        let mut rx = recorder.subscribe();

        recorder.transition(Phase::Analysis);
        rx.changed().await.unwrap();
        let first = rx.borrow_and_update().clone();
        assert_eq!(first.events.len(), 1);

        recorder.transition(Phase::Decomposition);
        recorder.event(OrchestrationEvent::new(EventType::AnalysisCompleted));
        rx.changed().await.unwrap();
        let latest = rx.borrow_and_update().clone();

        let new_events = latest.events_since(first.events.len());
        assert_eq!(new_events.len(), 2);
        assert_eq!(new_events[1].event_type, EventType::AnalysisCompleted);
        assert!(latest.events_since(99).is_empty());
    }
}
