//! Per-subtask context isolation under a token budget.
//!
//! Each subtask sees a private, minimal copy of the shared context: a
//! retrieved or compacted view of the conversation, only the artifacts it is
//! allowed to see, and nothing that pushes it over its budget.
//!
//! # Budget enforcement
//! Content is dropped in this order until the context fits:
//! 1. lowest-scoring retrieved chunks
//! 2. oldest tool results
//! 3. oldest file references
//! 4. the conversation summary
//! 5. oldest messages (never the latest user message)
//! 6. agent state and metadata
//!
//! If the latest user message alone still overflows it is truncated. The
//! subtask description is never dropped; when it alone exceeds the budget the
//! build fails with [`BudgetError::TokenBudgetExceeded`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::compaction::{compact_history, CompactionPolicy};
use super::retriever::RagRetriever;
use super::summarizer::Summarizer;
use super::types::{Chunk, SearchScope};
use crate::agents::{AgentContext, ContextMessage};
use crate::budget::{estimate_tokens, truncate_to_tokens, BudgetError, TokenBudgetGuard};
use crate::llm::Role;

/// Tokens charged for the framing of a summary message.
const SUMMARY_PREFIX: &str = "Summary of earlier conversation:\n";

/// Settings for the isolation builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationConfig {
    pub rag_enabled: bool,
    pub rag_top_k: usize,
    /// Raw messages kept on both the retrieval and compaction paths.
    pub recent_messages: usize,
    /// Fraction of the available budget the running summary may take.
    pub summary_fraction: f64,
    pub rag_sources: Vec<String>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            rag_enabled: false,
            rag_top_k: 5,
            recent_messages: 6,
            summary_fraction: 0.25,
            rag_sources: Vec::new(),
        }
    }
}

/// Which tool results and file references a subtask may see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVisibility {
    tool_keys: BTreeSet<String>,
    files: BTreeSet<String>,
}

impl ArtifactVisibility {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything present in `context`.
    pub fn of(context: &AgentContext) -> Self {
        let mut visibility = Self::new();
        visibility.include(context);
        visibility
    }

    /// Add every artifact present in `context`.
    pub fn include(&mut self, context: &AgentContext) {
        self.tool_keys
            .extend(context.tool_results().iter().map(|r| r.key.clone()));
        self.files.extend(context.file_references.iter().cloned());
    }

    pub fn union(&mut self, other: &ArtifactVisibility) {
        self.tool_keys.extend(other.tool_keys.iter().cloned());
        self.files.extend(other.files.iter().cloned());
    }

    pub fn allows_tool(&self, key: &str) -> bool {
        self.tool_keys.contains(key)
    }

    pub fn allows_file(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.tool_keys.is_empty() && self.files.is_empty()
    }
}

/// Input for one isolation build.
#[derive(Debug, Clone)]
pub struct IsolationRequest<'a> {
    pub task_id: String,
    pub description: &'a str,
    /// Name of the agent that will run the subtask; selects its `agent_state`.
    pub agent_name: &'a str,
    pub shared: &'a AgentContext,
    pub visible: &'a ArtifactVisibility,
    pub budget: TokenBudgetGuard,
}

/// Token accounting for an isolated context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextReport {
    /// Description plus isolated context.
    pub tokens_used: usize,
    /// Description plus the full shared context.
    pub tokens_full: usize,
    pub tokens_saved: usize,
    pub used_retrieval: bool,
    pub chunks_dropped: usize,
    pub messages_dropped: usize,
    pub truncated_latest_message: bool,
}

/// A subtask's private context.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolatedContext {
    pub context: AgentContext,
    pub report: ContextReport,
}

/// Working set assembled before enforcement.
struct Draft {
    chunks: Vec<Chunk>,
    summary: Option<String>,
    messages: Vec<ContextMessage>,
    context: AgentContext,
}

impl Draft {
    fn latest_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    fn summary_tokens(&self) -> usize {
        self.summary
            .as_deref()
            .map(|s| estimate_tokens(SUMMARY_PREFIX) + estimate_tokens(s) + 4)
            .unwrap_or(0)
    }

    fn tokens(&self) -> usize {
        self.context.estimated_tokens()
            + self.chunks.iter().map(Chunk::estimated_tokens).sum::<usize>()
            + self
                .messages
                .iter()
                .map(ContextMessage::estimated_tokens)
                .sum::<usize>()
            + self.summary_tokens()
    }

    fn finish(mut self) -> AgentContext {
        let mut history = Vec::with_capacity(self.messages.len() + 1);
        if let Some(summary) = self.summary {
            history.push(ContextMessage::new(
                Role::System,
                format!("{SUMMARY_PREFIX}{summary}"),
            ));
        }
        history.extend(self.messages);
        self.context.conversation_history = history;
        self.context.rag_chunks = self.chunks;
        self.context
    }
}

/// Builds isolated contexts for subtasks.
pub struct ContextIsolationBuilder {
    config: IsolationConfig,
    retriever: Option<Arc<dyn RagRetriever>>,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextIsolationBuilder {
    pub fn new(config: IsolationConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            retriever: None,
            summarizer,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn RagRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Build the isolated context for one subtask.
    ///
    /// # Errors
    /// [`BudgetError::TokenBudgetExceeded`] if the description alone does not
    /// fit in `request.budget`.
    pub async fn build(&self, request: IsolationRequest<'_>) -> Result<IsolatedContext, BudgetError> {
        let available = request.budget.available();
        let description_tokens = estimate_tokens(request.description);
        request.budget.require(description_tokens)?;

        let tokens_full = description_tokens + request.shared.estimated_tokens();
        let mut report = ContextReport {
            tokens_full,
            ..ContextReport::default()
        };

        let mut draft = self.assemble(&request, &mut report).await;
        let content_budget = available - description_tokens;
        self.enforce(&mut draft, content_budget, &mut report);

        let context = draft.finish();
        report.tokens_used = description_tokens + context.estimated_tokens();
        report.tokens_saved = report.tokens_full.saturating_sub(report.tokens_used);

        debug!(
            "Isolated context for task {}: {} of {} tokens ({} saved, retrieval: {})",
            request.task_id,
            report.tokens_used,
            report.tokens_full,
            report.tokens_saved,
            report.used_retrieval
        );

        Ok(IsolatedContext { context, report })
    }

    async fn assemble(&self, request: &IsolationRequest<'_>, report: &mut ContextReport) -> Draft {
        let shared = request.shared;

        let mut context = AgentContext::new();
        for result in shared.tool_results() {
            if request.visible.allows_tool(&result.key) {
                context.set_tool_result(result.key.clone(), result.value.clone());
            }
        }
        context.file_references = shared
            .file_references
            .iter()
            .filter(|f| request.visible.allows_file(f))
            .cloned()
            .collect();
        if let Some(state) = shared.agent_state.get(request.agent_name) {
            context
                .agent_state
                .insert(request.agent_name.to_string(), state.clone());
        }
        context.metadata = shared.metadata.clone();

        let mut chunks = shared.rag_chunks.clone();

        if let Some(retrieved) = self.retrieve(request).await {
            report.used_retrieval = true;
            chunks.extend(retrieved);
            let history = &shared.conversation_history;
            let window_start = history.len().saturating_sub(self.config.recent_messages);
            let latest_user = history.iter().rposition(|m| m.role == Role::User);
            let messages = history
                .iter()
                .enumerate()
                .filter(|(i, _)| *i >= window_start || Some(*i) == latest_user)
                .map(|(_, m)| m.clone())
                .collect();
            return Draft {
                chunks,
                summary: None,
                messages,
                context,
            };
        }

        let policy = CompactionPolicy {
            recent_messages: self.config.recent_messages,
            summary_token_budget: request.budget.portion(self.config.summary_fraction),
        };
        let compacted =
            compact_history(&shared.conversation_history, policy, self.summarizer.as_ref()).await;

        Draft {
            chunks,
            summary: compacted.summary,
            messages: compacted.recent,
            context,
        }
    }

    async fn retrieve(&self, request: &IsolationRequest<'_>) -> Option<Vec<Chunk>> {
        if !self.config.rag_enabled {
            return None;
        }
        let retriever = self.retriever.as_ref()?;
        let scope = SearchScope::sources(self.config.rag_sources.iter().cloned())
            .for_task(request.task_id.clone());

        match retriever
            .search(request.description, &scope, self.config.rag_top_k)
            .await
        {
            Ok(mut chunks) => {
                chunks.truncate(self.config.rag_top_k);
                Some(chunks)
            }
            Err(e) => {
                warn!("Retrieval failed, falling back to compaction: {}", e);
                None
            }
        }
    }

    fn enforce(&self, draft: &mut Draft, budget: usize, report: &mut ContextReport) {
        while draft.tokens() > budget {
            if let Some(lowest) = lowest_scoring(&draft.chunks) {
                draft.chunks.remove(lowest);
                report.chunks_dropped += 1;
            } else if draft.context.pop_oldest_tool_result().is_some() {
            } else if !draft.context.file_references.is_empty() {
                draft.context.file_references.remove(0);
            } else if draft.summary.take().is_some() {
            } else if let Some(oldest) = oldest_droppable(draft) {
                draft.messages.remove(oldest);
                report.messages_dropped += 1;
            } else if !draft.context.agent_state.is_empty() || !draft.context.metadata.is_empty() {
                draft.context.agent_state.clear();
                draft.context.metadata.clear();
            } else {
                truncate_latest(draft, budget, report);
                break;
            }
        }
    }
}

/// Index of the lowest-scoring chunk; later chunks lose ties.
fn lowest_scoring(chunks: &[Chunk]) -> Option<usize> {
    chunks
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| a.score.total_cmp(&b.score).then(ib.cmp(ia)))
        .map(|(i, _)| i)
}

fn oldest_droppable(draft: &Draft) -> Option<usize> {
    let keep = draft.latest_user_index();
    (0..draft.messages.len()).find(|i| Some(*i) != keep)
}

fn truncate_latest(draft: &mut Draft, budget: usize, report: &mut ContextReport) {
    let Some(index) = draft.latest_user_index() else {
        return;
    };
    let message = &mut draft.messages[index];
    // Per-message framing overhead is 4 tokens
    let allowed = budget.saturating_sub(4);
    message.content = truncate_to_tokens(&message.content, allowed).to_string();
    report.truncated_latest_message = true;
}
