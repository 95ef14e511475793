//! The orchestrator: one request in, one synthesized answer out.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{
    same_name, AgentContext, AgentRef, AgentRegistry, AgentResult, Capability, RegistrySnapshot,
};
use crate::config::OrchestratorConfig;
use crate::llm::{ChatMessage, ModelGateway, TokenUsage};
use crate::memory::{
    ArtifactVisibility, ContextIsolationBuilder, GatewaySummarizer, IsolationRequest, RagRetriever,
    Summarizer,
};
use crate::scheduler::{DependencyScheduler, ScheduleOutcome, ScheduleRequest};
use crate::task::{
    analysis_prompt, prune, AgentTask, DecomposedSubtask, SubtaskId, TaskDecomposer,
    TaskDecomposition,
};

use super::decision::{decide, DelegationDecision, DelegationPattern};
use super::error::{FatalCause, OrchestrationFailed};
use super::metrics::{DelegationMetrics, PhaseClock};
use super::state::{EventType, OrchestrationEvent, OrchestrationState, Phase, StateRecorder};
use super::synthesis::{ResultSynthesizer, SynthesisRequest};

/// Id used for budget failures on the direct path, which has no subtasks.
const DIRECT_RESPONSE_ID: &str = "direct";

/// A completed orchestration.
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub result: AgentResult,
    pub metrics: DelegationMetrics,
    /// Final, frozen state.
    pub state: Arc<OrchestrationState>,
}

/// Drives a request through decision, analysis, decomposition, execution
/// and synthesis.
///
/// # Invariants
/// - Every run starts from a fresh [`OrchestrationState`] published on the
///   channel returned by [`Orchestrator::subscribe`]
/// - A run ends in `Complete` (returned as `Ok`) or `Failed` (returned as
///   `Err`); cancellation returns `Err` without a terminal event
pub struct Orchestrator {
    registry: AgentRegistry,
    gateway: Arc<dyn ModelGateway>,
    summarizer: Arc<dyn Summarizer>,
    retriever: Option<Arc<dyn RagRetriever>>,
    config: OrchestratorConfig,
    observer: Arc<watch::Sender<Arc<OrchestrationState>>>,
}

impl Orchestrator {
    pub fn new(registry: AgentRegistry, gateway: Arc<dyn ModelGateway>, config: OrchestratorConfig) -> Self {
        let summarizer: Arc<dyn Summarizer> = Arc::new(GatewaySummarizer::new(Arc::clone(&gateway)));
        let (tx, _rx) = watch::channel(Arc::new(OrchestrationState::default()));
        Self {
            registry,
            gateway,
            summarizer,
            retriever: None,
            config,
            observer: Arc::new(tx),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Retriever consulted during context isolation when `rag_enabled` is set.
    pub fn with_retriever(mut self, retriever: Arc<dyn RagRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Snapshots of the current (or most recent) run, one per recorded event.
    pub fn subscribe(&self) -> watch::Receiver<Arc<OrchestrationState>> {
        self.observer.subscribe()
    }

    /// Latest published state.
    pub fn state(&self) -> Arc<OrchestrationState> {
        self.observer.borrow().clone()
    }

    pub async fn execute(
        &self,
        task: &AgentTask,
        context: &AgentContext,
    ) -> Result<OrchestrationOutcome, OrchestrationFailed> {
        self.execute_with_cancel(task, context, CancellationToken::new())
            .await
    }

    /// Run one orchestration. Firing `cancel` abandons every in-flight
    /// subtask and returns [`FatalCause::Cancelled`] with no partial results.
    ///
    /// # Errors
    /// Returns [`OrchestrationFailed`] carrying the first fatal cause, the
    /// results salvaged so far and the final state.
    pub async fn execute_with_cancel(
        &self,
        task: &AgentTask,
        context: &AgentContext,
        cancel: CancellationToken,
    ) -> Result<OrchestrationOutcome, OrchestrationFailed> {
        let recorder = StateRecorder::with_sender(cancel.clone(), Arc::clone(&self.observer));
        info!(
            "Orchestrating task {} ({} pattern, {} agents)",
            task.id(),
            self.config.pattern.as_str(),
            self.registry.len()
        );

        let run = Run {
            orchestrator: self,
            task,
            context,
            recorder,
            cancel,
            clock: PhaseClock::start(),
        };
        if run.cancel.is_cancelled() {
            return Err(run.fail(FatalCause::Cancelled));
        }
        let Some(coordinator) = self.coordinator() else {
            return Err(run.fail(FatalCause::NoAgents));
        };
        run.drive(coordinator).await
    }

    /// Configured coordinator, else the first agent with the coordination
    /// capability, else the first registered agent.
    fn coordinator(&self) -> Option<AgentRef> {
        if let Some(agent) = self.registry.get_by_name(&self.config.coordinator_agent) {
            return Some(agent);
        }
        let coordination = BTreeSet::from([Capability::new(Capability::COORDINATION)]);
        let fallback = self
            .registry
            .agents_with_all_capabilities(&coordination)
            .into_iter()
            .next()
            .or_else(|| self.registry.all().into_iter().next());
        if let Some(agent) = &fallback {
            warn!(
                "Coordinator '{}' is not registered; using '{}'",
                self.config.coordinator_agent,
                agent.descriptor().name()
            );
        }
        fallback
    }

    fn isolation(&self) -> Arc<ContextIsolationBuilder> {
        let mut builder =
            ContextIsolationBuilder::new(self.config.isolation_config(), Arc::clone(&self.summarizer));
        if let Some(retriever) = &self.retriever {
            builder = builder.with_retriever(Arc::clone(retriever));
        }
        Arc::new(builder)
    }
}

/// Output of the analysis and decomposition phases.
struct Plan {
    decomposition: TaskDecomposition,
    analysis_usage: TokenUsage,
    created: usize,
    pruned: usize,
}

/// One orchestration in flight.
struct Run<'a> {
    orchestrator: &'a Orchestrator,
    task: &'a AgentTask,
    context: &'a AgentContext,
    recorder: StateRecorder,
    cancel: CancellationToken,
    clock: PhaseClock,
}

impl<'a> Run<'a> {
    fn config(&self) -> &'a OrchestratorConfig {
        &self.orchestrator.config
    }

    /// Record the failure (unless cancelled) and package what was salvaged.
    fn fail(&self, cause: FatalCause) -> OrchestrationFailed {
        let cancelled = matches!(cause, FatalCause::Cancelled);
        if !cancelled {
            self.recorder
                .finish(Phase::Failed, None, Some(cause.to_string()));
        }
        let mut failed = OrchestrationFailed::from_state(cause, self.recorder.snapshot());
        if cancelled {
            failed.partial_results.clear();
        }
        warn!("{}", failed);
        failed
    }

    fn enter(&mut self, phase: Phase) -> Result<(), OrchestrationFailed> {
        self.clock.enter(phase);
        if !self.recorder.transition(phase) && self.cancel.is_cancelled() {
            return Err(self.fail(FatalCause::Cancelled));
        }
        Ok(())
    }

    fn complete(
        mut self,
        result: AgentResult,
        mut metrics: DelegationMetrics,
    ) -> Result<OrchestrationOutcome, OrchestrationFailed> {
        self.clock.enter(Phase::Complete);
        metrics.timings = self.clock.timings();
        if !self
            .recorder
            .finish(Phase::Complete, Some(metrics.clone()), None)
            && self.cancel.is_cancelled()
        {
            return Err(self.fail(FatalCause::Cancelled));
        }
        info!(
            "Task {} complete: {} subtasks, {} completed, {} tokens",
            self.task.id(),
            metrics.subtasks_created,
            metrics.subtasks_completed,
            metrics.total_tokens
        );
        Ok(OrchestrationOutcome {
            result,
            metrics,
            state: self.recorder.snapshot(),
        })
    }

    async fn drive(self, coordinator: AgentRef) -> Result<OrchestrationOutcome, OrchestrationFailed> {
        let decision = if self.config().smart_delegation {
            decide(self.task.description())
        } else {
            DelegationDecision {
                delegate: true,
                reason: "smart delegation disabled".to_string(),
            }
        };
        info!(
            "Delegation decision for task {}: delegate={} ({})",
            self.task.id(),
            decision.delegate,
            decision.reason
        );
        self.recorder.event(
            OrchestrationEvent::new(EventType::DelegationDecided)
                .with("delegate", json!(decision.delegate))
                .with("reason", json!(decision.reason))
                .with("pattern", json!(self.config().pattern.as_str())),
        );

        if decision.delegate {
            self.delegate(coordinator).await
        } else {
            self.respond_directly(coordinator).await
        }
    }

    /// Answer with a single coordinator call: `Decision -> Complete`.
    async fn respond_directly(
        self,
        coordinator: AgentRef,
    ) -> Result<OrchestrationOutcome, OrchestrationFailed> {
        let descriptor = coordinator.descriptor();
        let isolated = self
            .orchestrator
            .isolation()
            .build(IsolationRequest {
                task_id: self.task.id().to_string(),
                description: self.task.description(),
                agent_name: descriptor.name(),
                shared: self.context,
                visible: &ArtifactVisibility::of(self.context),
                budget: self.config().context_budget(),
            })
            .await
            .map_err(|source| {
                self.fail(FatalCause::TokenBudget {
                    subtask: SubtaskId::from(DIRECT_RESPONSE_ID),
                    source,
                })
            })?;

        let processed = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.fail(FatalCause::Cancelled)),
            processed = coordinator.process(self.task, &isolated.context) => processed,
        };
        let result = match processed {
            Ok(result) => result,
            Err(e) if e.is_gateway_unavailable() => {
                return Err(self.fail(FatalCause::GatewayUnavailable(e.to_string())));
            }
            Err(e) => {
                warn!("Direct response from {} failed: {}", descriptor.name(), e);
                AgentResult::failure(descriptor, self.task.id(), e.to_string())
            }
        };

        let report = isolated.report;
        let metrics = DelegationMetrics {
            agents_used: BTreeSet::from([descriptor.name().to_string()]),
            total_tokens: result.usage.map_or(0, |u| u.total_tokens),
            token_savings_percentage: DelegationMetrics::savings_percentage(
                report.tokens_saved,
                report.tokens_full,
            ),
            ..DelegationMetrics::default()
        };
        self.complete(result, metrics)
    }

    async fn delegate(mut self, coordinator: AgentRef) -> Result<OrchestrationOutcome, OrchestrationFailed> {
        let plan = self.plan(coordinator.descriptor().name()).await?;
        let outcome = self.schedule(&plan.decomposition, coordinator.descriptor().name()).await?;
        self.synthesize(plan, outcome, coordinator).await
    }

    async fn plan(&mut self, coordinator: &str) -> Result<Plan, OrchestrationFailed> {
        let pattern = self.config().pattern;
        let snapshot = self.orchestrator.registry.snapshot();

        let mut analysis = String::new();
        let mut analysis_usage = TokenUsage::default();
        if matches!(pattern, DelegationPattern::Orchestrator | DelegationPattern::Hierarchical) {
            self.enter(Phase::Analysis)?;
            let messages = vec![ChatMessage::user(analysis_prompt(self.task, &snapshot))];
            let completion = tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.fail(FatalCause::Cancelled)),
                completion = self.orchestrator.gateway.complete(&messages, None) => completion,
            };
            let event = OrchestrationEvent::new(EventType::AnalysisCompleted).agent(coordinator);
            match completion {
                Ok(completion) => {
                    analysis = completion.content;
                    analysis_usage = completion.usage.unwrap_or_default();
                    self.recorder
                        .event(event.with("chars", json!(analysis.len())));
                }
                Err(e) => {
                    warn!("Analysis call failed: {}. Decomposing without it", e);
                    self.recorder.event(event.with("error", json!(e.to_string())));
                }
            }
        }

        self.enter(Phase::Decomposition)?;
        let decomposition = match pattern {
            DelegationPattern::SingleAgent => self.single_agent(&snapshot, coordinator),
            DelegationPattern::Collaborative => self.collaborative(&snapshot, coordinator),
            DelegationPattern::Orchestrator | DelegationPattern::Hierarchical => {
                TaskDecomposer::new(&snapshot, coordinator).decompose(&analysis, self.task)
            }
        };
        let created = decomposition.len();

        let pruned = prune(&decomposition, &snapshot);
        for (id, reason) in &pruned.removed {
            self.recorder.event(
                OrchestrationEvent::new(EventType::SubtaskPruned)
                    .subtask(id)
                    .with("reason", serde_json::to_value(reason).unwrap_or_default()),
            );
        }
        let mut decomposition = pruned.decomposition;
        if decomposition.is_empty() {
            warn!("Every subtask was pruned; handing the task to {}", coordinator);
            decomposition = decomposition.replace_subtasks(
                vec![DecomposedSubtask::new(
                    SubtaskId::numbered(1),
                    self.task.description(),
                    coordinator,
                )],
                vec!["Every subtask was pruned; the coordinator takes the whole task".to_string()],
            );
        }
        if pattern == DelegationPattern::Hierarchical {
            decomposition = self.with_review(&decomposition, coordinator);
        }

        for warning in decomposition.warnings() {
            self.recorder.event(
                OrchestrationEvent::new(EventType::DecompositionWarning)
                    .with("warning", json!(warning)),
            );
        }
        self.recorder.set_decomposition(
            &decomposition,
            OrchestrationEvent::new(EventType::DecompositionCompleted)
                .with("subtasks", json!(decomposition.len()))
                .with("pruned", json!(pruned.pruned_count))
                .with("source", json!(decomposition.source())),
        );
        debug!(
            "Decomposed task {} into {} subtasks ({} pruned)",
            self.task.id(),
            decomposition.len(),
            pruned.pruned_count
        );

        Ok(Plan {
            decomposition,
            analysis_usage,
            created,
            pruned: pruned.pruned_count,
        })
    }

    /// One subtask for the agent best covering the task's capabilities.
    fn single_agent(&self, snapshot: &RegistrySnapshot, coordinator: &str) -> TaskDecomposition {
        let required = self.task.required_capabilities();
        let agent = snapshot
            .best_capability_match(required)
            .map(|a| a.name())
            .unwrap_or(coordinator);
        let mut subtask = DecomposedSubtask::new(SubtaskId::numbered(1), self.task.description(), agent);
        subtask.required_capabilities = required.clone();
        TaskDecomposition::direct(vec![subtask])
    }

    /// One subtask per non-coordinator agent overlapping the required
    /// capabilities, all independent.
    fn collaborative(&self, snapshot: &RegistrySnapshot, coordinator: &str) -> TaskDecomposition {
        let required = self.task.required_capabilities();
        let subtasks: Vec<DecomposedSubtask> = snapshot
            .descriptors()
            .iter()
            .filter(|a| !same_name(a.name(), coordinator))
            .filter(|a| required.is_empty() || a.overlap(required) > 0)
            .enumerate()
            .map(|(i, agent)| {
                let focus: BTreeSet<Capability> = if required.is_empty() {
                    BTreeSet::new()
                } else {
                    agent.capabilities().intersection(required).cloned().collect()
                };
                let strengths = agent
                    .capabilities()
                    .iter()
                    .map(Capability::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut subtask = DecomposedSubtask::new(
                    SubtaskId::numbered(i + 1),
                    format!(
                        "{}\n\nContribute from your perspective ({}).",
                        self.task.description(),
                        strengths
                    ),
                    agent.name(),
                );
                subtask.required_capabilities = focus;
                subtask
            })
            .collect();

        if subtasks.is_empty() {
            return self.single_agent(snapshot, coordinator);
        }
        TaskDecomposition::direct(subtasks)
    }

    /// Append a coordinator review depending on every sink subtask.
    fn with_review(&self, decomposition: &TaskDecomposition, coordinator: &str) -> TaskDecomposition {
        let subtasks = decomposition.subtasks();
        let sinks: Vec<SubtaskId> = subtasks
            .iter()
            .filter(|s| !subtasks.iter().any(|other| other.depends_on(&s.id)))
            .map(|s| s.id.clone())
            .collect();

        let mut id = SubtaskId::from("review");
        let mut n = subtasks.len() + 1;
        while decomposition.get(&id).is_some() {
            id = SubtaskId::numbered(n);
            n += 1;
        }

        let review = DecomposedSubtask::new(
            id,
            format!(
                "Review the results of {} against the original request, then correct \
                 mistakes and fill gaps.\n\nOriginal request: {}",
                sinks.iter().map(SubtaskId::as_str).collect::<Vec<_>>().join(", "),
                self.task.description()
            ),
            coordinator,
        )
        .with_dependencies(sinks)
        .sequential();

        let mut extended = subtasks.to_vec();
        extended.push(review);
        decomposition.replace_subtasks(extended, Vec::new())
    }

    async fn schedule(
        &mut self,
        decomposition: &TaskDecomposition,
        coordinator: &str,
    ) -> Result<ScheduleOutcome, OrchestrationFailed> {
        self.enter(Phase::Execution)?;
        let orchestrator = self.orchestrator;
        let scheduler = DependencyScheduler::new(
            orchestrator.registry.clone(),
            orchestrator.isolation(),
            orchestrator.config.scheduler_config(),
        );
        scheduler
            .execute(ScheduleRequest {
                decomposition,
                context: self.context,
                parent_task: self.task.id(),
                coordinator,
                recorder: self.recorder.clone(),
                cancel: self.cancel.clone(),
            })
            .await
            .map_err(|e| self.fail(FatalCause::from(e)))
    }

    async fn synthesize(
        mut self,
        plan: Plan,
        outcome: ScheduleOutcome,
        coordinator: AgentRef,
    ) -> Result<OrchestrationOutcome, OrchestrationFailed> {
        self.enter(Phase::Synthesis)?;
        let orchestrator = self.orchestrator;
        let descriptor = coordinator.descriptor();
        let synthesizer = ResultSynthesizer::new(
            Arc::clone(&orchestrator.gateway),
            Arc::clone(&orchestrator.summarizer),
            orchestrator.config.synthesis_config(),
        );
        let synthesis = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.fail(FatalCause::Cancelled)),
            synthesis = synthesizer.synthesize(SynthesisRequest {
                task: self.task,
                decomposition: &plan.decomposition,
                states: &outcome.states,
                coordinator: descriptor,
            }) => synthesis,
        };

        if let Some(reason) = &synthesis.fallback_reason {
            self.recorder.event(
                OrchestrationEvent::new(EventType::SynthesisFallback)
                    .agent(descriptor.name())
                    .with("reason", json!(reason)),
            );
        }
        self.recorder.event(
            OrchestrationEvent::new(EventType::SynthesisCompleted)
                .agent(descriptor.name())
                .with("success", json!(synthesis.result.success))
                .with("summarized", json!(synthesis.summarized))
                .with("model_called", json!(synthesis.model_called)),
        );

        let mut agents_used: BTreeSet<String> = outcome
            .states
            .iter()
            .filter_map(|(_, state)| state.result())
            .map(|r| r.agent_name.clone())
            .collect();
        if synthesis.model_called {
            agents_used.insert(descriptor.name().to_string());
        }
        let execution_usage = synthesis.result.usage.unwrap_or_else(|| outcome.usage());
        let (saved, full) = outcome.tokens_saved();
        let metrics = DelegationMetrics {
            subtasks_created: plan.created,
            subtasks_pruned: plan.pruned,
            subtasks_completed: outcome.count("completed"),
            subtasks_failed: outcome.count("failed"),
            subtasks_skipped: outcome.count("skipped"),
            agents_used,
            total_tokens: plan.analysis_usage.add(&execution_usage).total_tokens,
            token_savings_percentage: DelegationMetrics::savings_percentage(saved, full),
            ..DelegationMetrics::default()
        };
        self.complete(synthesis.result, metrics)
    }
}
