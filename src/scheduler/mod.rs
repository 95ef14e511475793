//! Scheduler module - runs a subtask graph wave by wave.
//!
//! # Execution Model
//! 1. Layer the graph into parallel groups (see [`parallel_groups`])
//! 2. For each group, skip subtasks whose dependencies failed or were skipped
//! 3. Run the parallelizable rest concurrently (semaphore + `JoinSet`),
//!    then the sequential ones one at a time
//! 4. Once every subtask of the group is terminal, merge their context
//!    deltas into the shared context in declaration order
//!
//! # Invariants
//! - Group `k+1` starts only after every subtask of group `k` is terminal
//! - A skipped subtask's agent is never invoked
//! - The merge step is the only writer of the shared context
//! - Subtask failure never aborts the run; only cancellation, an invalid
//!   graph, an unmeetable budget floor or a dead gateway do

mod groups;
mod retry;
mod state;

pub use groups::{parallel_groups, GraphError};
pub use retry::RetryPolicy;
pub use state::{RetryRecord, SubtaskExecutionState};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{name_key, AgentContext, AgentError, AgentRef, AgentRegistry};
use crate::budget::{BudgetError, TokenBudgetGuard};
use crate::llm::{LlmErrorKind, TokenUsage};
use crate::memory::{ArtifactVisibility, ContextIsolationBuilder, ContextReport, IsolationRequest};
use crate::orchestrator::{EventType, OrchestrationEvent, StateRecorder};
use crate::task::{AgentTask, DecomposedSubtask, SubtaskId, TaskDecomposition, TaskId};

/// Why one attempt at a subtask failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubtaskExecutionError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Agent {agent} reported failure: {error}")]
    Unsuccessful { agent: String, error: String },

    #[error("No agent available for '{0}' and no coordinator registered")]
    AgentMissing(String),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("Subtask task aborted: {0}")]
    Panicked(String),
}

impl SubtaskExecutionError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SubtaskExecutionError::Agent(AgentError::Gateway(e)) => {
                !matches!(e.kind, LlmErrorKind::ClientError | LlmErrorKind::ContextExceeded)
            }
            SubtaskExecutionError::Agent(_) | SubtaskExecutionError::Unsuccessful { .. } => true,
            SubtaskExecutionError::AgentMissing(_)
            | SubtaskExecutionError::Budget(_)
            | SubtaskExecutionError::Panicked(_) => false,
        }
    }

    pub fn is_gateway_unavailable(&self) -> bool {
        matches!(self, SubtaskExecutionError::Agent(e) if e.is_gateway_unavailable())
    }

    /// Retry delay requested by the gateway, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SubtaskExecutionError::Agent(AgentError::Gateway(e)) => e.retry_after,
            _ => None,
        }
    }
}

/// Fatal scheduling outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Invalid subtask graph: {0}")]
    InvalidGraph(#[from] GraphError),

    #[error("Subtask {subtask} does not fit the token budget: {source}")]
    TokenBudget {
        subtask: SubtaskId,
        source: BudgetError,
    },

    #[error("Model gateway unavailable: all {attempts} attempts failed, last error: {last_error}")]
    GatewayUnavailable { attempts: u32, last_error: String },
}

/// Scheduler tuning.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    /// `None`: one slot per distinct agent in the group.
    pub max_concurrency: Option<usize>,
    pub budget: TokenBudgetGuard,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrency: None,
            budget: TokenBudgetGuard::unreserved(8_000),
        }
    }
}

/// Everything a single run of the scheduler works on.
pub struct ScheduleRequest<'a> {
    pub decomposition: &'a TaskDecomposition,
    pub context: &'a AgentContext,
    pub parent_task: TaskId,
    pub coordinator: &'a str,
    pub recorder: StateRecorder,
    pub cancel: CancellationToken,
}

/// Terminal states and merged context after a run.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    /// Terminal state of every subtask, in declaration order.
    pub states: Vec<(SubtaskId, SubtaskExecutionState)>,
    /// Shared context after every group's merge.
    pub context: AgentContext,
    pub groups: Vec<Vec<SubtaskId>>,
    pub context_reports: Vec<(SubtaskId, ContextReport)>,
}

impl ScheduleOutcome {
    pub fn count(&self, label: &str) -> usize {
        self.states.iter().filter(|(_, s)| s.label() == label).count()
    }

    /// Summed token usage reported by the agents that completed.
    pub fn usage(&self) -> TokenUsage {
        self.states
            .iter()
            .filter_map(|(_, s)| s.result().and_then(|r| r.usage.as_ref()))
            .fold(TokenUsage::default(), |acc, u| acc.add(u))
    }

    /// Tokens saved by context isolation across all subtasks.
    pub fn tokens_saved(&self) -> (usize, usize) {
        self.context_reports
            .iter()
            .fold((0, 0), |(saved, full), (_, r)| (saved + r.tokens_saved, full + r.tokens_full))
    }
}

/// What one subtask run produced.
#[derive(Debug)]
struct SubtaskRun {
    id: SubtaskId,
    state: SubtaskExecutionState,
    report: Option<ContextReport>,
    budget_error: Option<BudgetError>,
    attempts: u32,
    unavailable_attempts: u32,
    last_error: Option<String>,
}

impl SubtaskRun {
    fn failed(id: SubtaskId, error: &SubtaskExecutionError, history: Vec<RetryRecord>) -> Self {
        Self {
            id,
            state: SubtaskExecutionState::Failed {
                error: error.to_string(),
                retry_history: history,
                permanent: true,
            },
            report: None,
            budget_error: None,
            attempts: 0,
            unavailable_attempts: 0,
            last_error: Some(error.to_string()),
        }
    }
}

/// Shared, immutable pieces every subtask task needs.
struct SubtaskRunner {
    registry: AgentRegistry,
    isolation: Arc<ContextIsolationBuilder>,
    retry: RetryPolicy,
    budget: TokenBudgetGuard,
    coordinator: String,
    parent_task: TaskId,
    recorder: StateRecorder,
    cancel: CancellationToken,
}

impl SubtaskRunner {
    fn resolve_agent(&self, subtask: &DecomposedSubtask) -> Result<AgentRef, SubtaskExecutionError> {
        if let Some(agent) = self.registry.get_by_name(&subtask.agent) {
            return Ok(agent);
        }
        let missing = AgentError::NotFound(subtask.agent.clone());
        match self.registry.get_by_name(&self.coordinator) {
            Some(coordinator) => {
                warn!("{} for subtask {}, using coordinator", missing, subtask.id);
                Ok(coordinator)
            }
            None => Err(SubtaskExecutionError::AgentMissing(subtask.agent.clone())),
        }
    }

    fn agent_task(&self, subtask: &DecomposedSubtask) -> AgentTask {
        AgentTask::new(subtask.description.clone())
            .with_capability_set(subtask.required_capabilities.clone())
            .with_parameter("subtask_id", json!(subtask.id.as_str()))
            .with_parameter("parent_task_id", json!(self.parent_task.to_string()))
    }

    /// Run one subtask to a terminal state.
    ///
    /// Returns `None` when cancelled; nothing about the subtask is recorded
    /// after that point.
    async fn run(
        &self,
        subtask: DecomposedSubtask,
        shared: Arc<AgentContext>,
        visible: ArtifactVisibility,
    ) -> Option<SubtaskRun> {
        let id = subtask.id.clone();

        let agent = match self.resolve_agent(&subtask) {
            Ok(agent) => agent,
            Err(error) => {
                warn!("Subtask {} cannot run: {}", id, error);
                let run = SubtaskRun::failed(id.clone(), &error, Vec::new());
                self.recorder.set_subtask_state(
                    &id,
                    run.state.clone(),
                    OrchestrationEvent::new(EventType::SubtaskFailed)
                        .subtask(&id)
                        .with("error", json!(error.to_string())),
                );
                return Some(run);
            }
        };
        let agent_name = agent.descriptor().name().to_string();

        let request = IsolationRequest {
            task_id: id.to_string(),
            description: &subtask.description,
            agent_name: &agent_name,
            shared: &shared,
            visible: &visible,
            budget: self.budget,
        };
        let isolated = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            built = self.isolation.build(request) => built,
        };
        let isolated = match isolated {
            Ok(isolated) => isolated,
            Err(source) => {
                let error = SubtaskExecutionError::Budget(source.clone());
                warn!("Subtask {} cannot run: {}", id, error);
                let mut run = SubtaskRun::failed(id.clone(), &error, Vec::new());
                run.budget_error = Some(source);
                self.recorder.set_subtask_state(
                    &id,
                    run.state.clone(),
                    OrchestrationEvent::new(EventType::SubtaskFailed)
                        .subtask(&id)
                        .agent(&agent_name)
                        .with("error", json!(error.to_string())),
                );
                return Some(run);
            }
        };
        self.recorder.event(
            OrchestrationEvent::new(EventType::ContextIsolated)
                .subtask(&id)
                .agent(&agent_name)
                .with("tokens_used", json!(isolated.report.tokens_used))
                .with("tokens_full", json!(isolated.report.tokens_full))
                .with("tokens_saved", json!(isolated.report.tokens_saved))
                .with("used_retrieval", json!(isolated.report.used_retrieval)),
        );

        let task = self.agent_task(&subtask);
        let mut history: Vec<RetryRecord> = Vec::new();
        let mut unavailable_attempts = 0;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.recorder.set_subtask_state(
                &id,
                SubtaskExecutionState::InProgress {
                    started_at: Utc::now(),
                    agent_name: agent_name.clone(),
                    attempt,
                },
                OrchestrationEvent::new(EventType::SubtaskStarted)
                    .subtask(&id)
                    .agent(&agent_name)
                    .with("attempt", json!(attempt)),
            );
            debug!("Subtask {} attempt {} on {}", id, attempt, agent_name);

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                outcome = agent.process(&task, &isolated.context) => outcome,
            };

            let error = match outcome {
                Ok(result) if result.success => {
                    info!("Subtask {} completed by {} (attempt {})", id, agent_name, attempt);
                    let state = SubtaskExecutionState::Completed { result };
                    self.recorder.set_subtask_state(
                        &id,
                        state.clone(),
                        OrchestrationEvent::new(EventType::SubtaskCompleted)
                            .subtask(&id)
                            .agent(&agent_name)
                            .with("attempt", json!(attempt)),
                    );
                    return Some(SubtaskRun {
                        id,
                        state,
                        report: Some(isolated.report),
                        budget_error: None,
                        attempts: attempt,
                        unavailable_attempts,
                        last_error: None,
                    });
                }
                Ok(result) => SubtaskExecutionError::Unsuccessful {
                    agent: agent_name.clone(),
                    error: result.error.unwrap_or_else(|| "no error given".to_string()),
                },
                Err(e) => SubtaskExecutionError::Agent(e),
            };

            if error.is_gateway_unavailable() {
                unavailable_attempts += 1;
            }

            if self.retry.should_retry(attempt, &error) {
                let delay = self.retry.backoff(attempt, &error);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    "Subtask {} attempt {} failed: {}. Retrying in {:?}",
                    id, attempt, error, delay
                );
                history.push(RetryRecord {
                    attempt,
                    error: error.to_string(),
                    at: Utc::now(),
                    delay_ms,
                });
                self.recorder.set_subtask_state(
                    &id,
                    SubtaskExecutionState::Failed {
                        error: error.to_string(),
                        retry_history: history.clone(),
                        permanent: false,
                    },
                    OrchestrationEvent::new(EventType::SubtaskRetrying)
                        .subtask(&id)
                        .agent(&agent_name)
                        .with("attempt", json!(attempt))
                        .with("delay_ms", json!(delay_ms))
                        .with("error", json!(error.to_string())),
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            warn!("Subtask {} failed after {} attempt(s): {}", id, attempt, error);
            history.push(RetryRecord {
                attempt,
                error: error.to_string(),
                at: Utc::now(),
                delay_ms: 0,
            });
            let mut run = SubtaskRun::failed(id.clone(), &error, history);
            run.report = Some(isolated.report);
            run.attempts = attempt;
            run.unavailable_attempts = unavailable_attempts;
            self.recorder.set_subtask_state(
                &id,
                run.state.clone(),
                OrchestrationEvent::new(EventType::SubtaskFailed)
                    .subtask(&id)
                    .agent(&agent_name)
                    .with("attempts", json!(attempt))
                    .with("error", json!(error.to_string())),
            );
            return Some(run);
        }
    }
}

/// Drives a decomposition through its parallel groups.
pub struct DependencyScheduler {
    registry: AgentRegistry,
    isolation: Arc<ContextIsolationBuilder>,
    config: SchedulerConfig,
}

impl DependencyScheduler {
    pub fn new(
        registry: AgentRegistry,
        isolation: Arc<ContextIsolationBuilder>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            isolation,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn concurrency_limit(&self, parallel: &[DecomposedSubtask]) -> usize {
        let distinct_agents = parallel
            .iter()
            .map(|s| name_key(&s.agent))
            .collect::<BTreeSet<_>>()
            .len();
        self.config
            .max_concurrency
            .unwrap_or(distinct_agents)
            .min(parallel.len())
            .max(1)
    }

    /// Execute every subtask of `request.decomposition`.
    ///
    /// # Errors
    /// - [`ScheduleError::InvalidGraph`] before anything runs
    /// - [`ScheduleError::Cancelled`] as soon as the token fires
    /// - [`ScheduleError::TokenBudget`] after the group whose subtask could
    ///   not fit its description
    /// - [`ScheduleError::GatewayUnavailable`] when every attempt failed on an
    ///   unreachable model and nothing completed
    pub async fn execute(&self, request: ScheduleRequest<'_>) -> Result<ScheduleOutcome, ScheduleError> {
        let decomposition = request.decomposition;
        let groups = parallel_groups(decomposition)?;
        let by_id: HashMap<&SubtaskId, &DecomposedSubtask> =
            decomposition.subtasks().iter().map(|s| (&s.id, s)).collect();

        let recorder = request.recorder.clone();
        let planned = groups.clone();
        recorder.record(
            OrchestrationEvent::new(EventType::GroupsPlanned)
                .with("groups", json!(groups.len()))
                .with("subtasks", json!(decomposition.len())),
            move |state| {
                state.parallel_groups = planned;
                true
            },
        );

        let runner = Arc::new(SubtaskRunner {
            registry: self.registry.clone(),
            isolation: Arc::clone(&self.isolation),
            retry: self.config.retry,
            budget: self.config.budget,
            coordinator: request.coordinator.to_string(),
            parent_task: request.parent_task,
            recorder: recorder.clone(),
            cancel: request.cancel.clone(),
        });

        let ambient = ArtifactVisibility::of(request.context);
        let mut context = request.context.clone();
        let mut states: HashMap<SubtaskId, SubtaskExecutionState> = HashMap::new();
        let mut produced: HashMap<SubtaskId, ArtifactVisibility> = HashMap::new();
        let mut reports: Vec<(SubtaskId, ContextReport)> = Vec::new();
        let mut attempts = 0;
        let mut unavailable_attempts = 0;
        let mut last_error = None;

        for (index, group) in groups.iter().enumerate() {
            if request.cancel.is_cancelled() {
                return Err(ScheduleError::Cancelled);
            }
            recorder.event(
                OrchestrationEvent::new(EventType::GroupStarted)
                    .with("group", json!(index))
                    .with("size", json!(group.len())),
            );

            let mut parallel = Vec::new();
            let mut sequential = Vec::new();
            for id in group {
                let Some(subtask) = by_id.get(id).copied() else {
                    continue;
                };
                let blocked = subtask
                    .dependencies
                    .iter()
                    .find(|dep| states.get(*dep).is_some_and(SubtaskExecutionState::blocks_dependents));
                if let Some(dep) = blocked {
                    let reason = format!("dependency {} did not complete", dep);
                    info!("Skipping subtask {}: {}", id, reason);
                    let state = SubtaskExecutionState::Skipped { reason: reason.clone() };
                    recorder.set_subtask_state(
                        id,
                        state.clone(),
                        OrchestrationEvent::new(EventType::SubtaskSkipped)
                            .subtask(id)
                            .with("reason", json!(reason)),
                    );
                    states.insert(id.clone(), state);
                    continue;
                }
                if subtask.parallelizable {
                    parallel.push(subtask.clone());
                } else {
                    sequential.push(subtask.clone());
                }
            }

            let visibility_for = |subtask: &DecomposedSubtask| {
                let mut visible = ambient.clone();
                for dep in &subtask.dependencies {
                    if let Some(artifacts) = produced.get(dep) {
                        visible.union(artifacts);
                    }
                }
                visible
            };

            let shared = Arc::new(context.clone());
            let mut runs: Vec<SubtaskRun> = Vec::with_capacity(group.len());

            if !parallel.is_empty() {
                let limit = self.concurrency_limit(&parallel);
                debug!(
                    "Group {}: {} parallel subtasks, concurrency {}",
                    index,
                    parallel.len(),
                    limit
                );
                let semaphore = Arc::new(Semaphore::new(limit));
                let mut set = JoinSet::new();
                for subtask in &parallel {
                    let runner = Arc::clone(&runner);
                    let semaphore = Arc::clone(&semaphore);
                    let shared = Arc::clone(&shared);
                    let visible = visibility_for(subtask);
                    let subtask = subtask.clone();
                    set.spawn(async move {
                        let _permit = semaphore.acquire_owned().await.ok()?;
                        runner.run(subtask, shared, visible).await
                    });
                }

                loop {
                    tokio::select! {
                        _ = request.cancel.cancelled() => {
                            set.abort_all();
                            return Err(ScheduleError::Cancelled);
                        }
                        joined = set.join_next() => match joined {
                            None => break,
                            Some(Ok(Some(run))) => runs.push(run),
                            Some(Ok(None)) => {}
                            Some(Err(join_error)) => {
                                warn!("Subtask task in group {} aborted: {}", index, join_error);
                            }
                        }
                    }
                }

                if request.cancel.is_cancelled() {
                    return Err(ScheduleError::Cancelled);
                }

                for subtask in &parallel {
                    if runs.iter().any(|r| r.id == subtask.id) {
                        continue;
                    }
                    let error = SubtaskExecutionError::Panicked(format!(
                        "subtask {} produced no result",
                        subtask.id
                    ));
                    let run = SubtaskRun::failed(subtask.id.clone(), &error, Vec::new());
                    recorder.set_subtask_state(
                        &subtask.id,
                        run.state.clone(),
                        OrchestrationEvent::new(EventType::SubtaskFailed)
                            .subtask(&subtask.id)
                            .with("error", json!(error.to_string())),
                    );
                    runs.push(run);
                }
            }

            for subtask in sequential {
                let visible = visibility_for(&subtask);
                match runner.run(subtask, Arc::clone(&shared), visible).await {
                    Some(run) => runs.push(run),
                    None => return Err(ScheduleError::Cancelled),
                }
            }

            let mut budget_failure = None;
            for run in runs {
                attempts += run.attempts;
                unavailable_attempts += run.unavailable_attempts;
                if run.last_error.is_some() {
                    last_error = run.last_error.clone();
                }
                if let Some(report) = run.report {
                    reports.push((run.id.clone(), report));
                }
                if budget_failure.is_none() {
                    if let Some(source) = run.budget_error {
                        budget_failure = Some((run.id.clone(), source));
                    }
                }
                states.insert(run.id, run.state);
            }

            // Merge deltas in declaration order
            let mut merged = 0;
            for id in group {
                let delta = states
                    .get(id)
                    .and_then(SubtaskExecutionState::result)
                    .and_then(|r| r.updated_context.as_ref());
                if let Some(delta) = delta {
                    context.merge(delta);
                    produced.insert(id.clone(), ArtifactVisibility::of(delta));
                    merged += 1;
                }
            }
            if merged > 0 {
                recorder.event(
                    OrchestrationEvent::new(EventType::ContextMerged)
                        .with("group", json!(index))
                        .with("deltas", json!(merged)),
                );
            }

            let count = |label: &str| {
                group
                    .iter()
                    .filter(|id| states.get(*id).is_some_and(|s| s.label() == label))
                    .count()
            };
            recorder.event(
                OrchestrationEvent::new(EventType::GroupCompleted)
                    .with("group", json!(index))
                    .with("completed", json!(count("completed")))
                    .with("failed", json!(count("failed")))
                    .with("skipped", json!(count("skipped"))),
            );

            if let Some((subtask, source)) = budget_failure {
                return Err(ScheduleError::TokenBudget { subtask, source });
            }
        }

        let completed = states.values().filter(|s| s.is_completed()).count();
        if completed == 0 && attempts > 0 && unavailable_attempts == attempts {
            return Err(ScheduleError::GatewayUnavailable {
                attempts,
                last_error: last_error.unwrap_or_default(),
            });
        }

        let states = decomposition
            .ids()
            .map(|id| {
                let state = states
                    .remove(id)
                    .unwrap_or(SubtaskExecutionState::Pending);
                (id.clone(), state)
            })
            .collect();

        Ok(ScheduleOutcome {
            states,
            context,
            groups,
            context_reports: reports,
        })
    }
}
