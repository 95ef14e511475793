//! Merges subtask outcomes into one final answer.
//!
//! # Algorithm
//! 1. Completed results over `summary_threshold_tokens` are summarized
//! 2. Each entry is tagged `[subtask id | description | agent]`
//! 3. Failed and skipped subtasks become notes
//! 4. The coordinator combines everything through the gateway
//!
//! # Postconditions
//! - Zero completed subtasks: `success == false`, no gateway call
//! - Gateway failure: best-effort concatenation, `success == true`
//! - `updated_context` merges every completed delta in declaration order

use std::sync::Arc;

use tracing::{debug, warn};

use crate::agents::{AgentContext, AgentDescriptor, AgentResult};
use crate::budget::{estimate_tokens, truncate_to_tokens, TokenBudgetGuard};
use crate::llm::{ChatMessage, LlmError, ModelGateway, TokenUsage};
use crate::memory::{ExtractiveSummarizer, Summarizer};
use crate::scheduler::SubtaskExecutionState;
use crate::task::{AgentTask, SubtaskId, TaskDecomposition};

const SYNTHESIS_PROMPT: &str = "You are the coordinator of a team of specialist agents. \
Several agents worked on parts of the user's request. Combine their partial results into \
one complete, coherent answer to the original request. Resolve contradictions, remove \
repetition and keep concrete details. If some parts failed, answer with what is available \
and say briefly what is missing. Do not mention the agents or subtasks.";

/// Synthesis tuning.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisConfig {
    /// Completed results longer than this are summarized first.
    pub summary_threshold_tokens: usize,
    /// Budget for the partial-results section of the synthesis prompt.
    pub budget: TokenBudgetGuard,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            summary_threshold_tokens: 1_000,
            budget: TokenBudgetGuard::unreserved(6_000),
        }
    }
}

/// Inputs for one synthesis.
pub struct SynthesisRequest<'a> {
    pub task: &'a AgentTask,
    pub decomposition: &'a TaskDecomposition,
    /// Terminal state of every subtask, in declaration order.
    pub states: &'a [(SubtaskId, SubtaskExecutionState)],
    pub coordinator: &'a AgentDescriptor,
}

/// Output of a synthesis.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub result: AgentResult,
    /// Set when the gateway failed and partial results were concatenated.
    pub fallback_reason: Option<String>,
    pub summarized: usize,
    pub model_called: bool,
}

struct Entry {
    tag: String,
    content: String,
}

/// Builds the final answer from subtask outcomes.
pub struct ResultSynthesizer {
    gateway: Arc<dyn ModelGateway>,
    summarizer: Arc<dyn Summarizer>,
    config: SynthesisConfig,
}

impl ResultSynthesizer {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        summarizer: Arc<dyn Summarizer>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            gateway,
            summarizer,
            config,
        }
    }

    fn description<'a>(decomposition: &'a TaskDecomposition, id: &SubtaskId) -> &'a str {
        decomposition
            .get(id)
            .map(|s| s.description.as_str())
            .unwrap_or("")
    }

    fn notes(request: &SynthesisRequest<'_>) -> Vec<String> {
        request
            .states
            .iter()
            .filter_map(|(id, state)| {
                let description = Self::description(request.decomposition, id);
                match state {
                    SubtaskExecutionState::Failed { error, .. } => {
                        Some(format!("- {} ({}): failed: {}", id, description, error))
                    }
                    SubtaskExecutionState::Skipped { reason } => {
                        Some(format!("- {} ({}): skipped: {}", id, description, reason))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    async fn condense(&self, content: &str) -> (String, bool) {
        let threshold = self.config.summary_threshold_tokens;
        if estimate_tokens(content) <= threshold {
            return (content.to_string(), false);
        }
        match self.summarizer.summarize(content, threshold).await {
            Ok(summary) => (summary, true),
            Err(e) => {
                warn!("Summarizing a subtask result failed: {}. Extracting instead", e);
                (ExtractiveSummarizer::extract(content, threshold), true)
            }
        }
    }

    /// Fit all entries into the synthesis budget by giving each an equal share.
    fn fit(&self, entries: &mut [Entry]) {
        let available = self.config.budget.available();
        let total: usize = entries
            .iter()
            .map(|e| estimate_tokens(&e.tag) + estimate_tokens(&e.content))
            .sum();
        if total <= available || entries.is_empty() {
            return;
        }
        let share = (available / entries.len()).max(1);
        for entry in entries.iter_mut() {
            let room = share.saturating_sub(estimate_tokens(&entry.tag)).max(1);
            entry.content = truncate_to_tokens(&entry.content, room).to_string();
        }
        debug!("Trimmed {} synthesis entries to {} tokens each", entries.len(), share);
    }

    fn render(entries: &[Entry]) -> String {
        entries
            .iter()
            .map(|e| format!("{}\n{}", e.tag, e.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub async fn synthesize(&self, request: SynthesisRequest<'_>) -> Synthesis {
        let notes = Self::notes(&request);
        let completed: Vec<(&SubtaskId, &AgentResult)> = request
            .states
            .iter()
            .filter_map(|(id, state)| state.result().map(|r| (id, r)))
            .collect();

        if completed.is_empty() {
            let content = if notes.is_empty() {
                "No subtasks were executed.".to_string()
            } else {
                format!("No subtask completed.\n{}", notes.join("\n"))
            };
            let mut result = AgentResult::failure(
                request.coordinator,
                request.task.id(),
                "no subtask completed",
            );
            result.content = content;
            return Synthesis {
                result,
                fallback_reason: None,
                summarized: 0,
                model_called: false,
            };
        }

        let mut summarized = 0;
        let mut entries = Vec::with_capacity(completed.len());
        let mut merged = AgentContext::new();
        let mut tool_calls = Vec::new();
        let mut usage: Option<TokenUsage> = None;
        for (id, result) in &completed {
            let (content, condensed) = self.condense(&result.content).await;
            if condensed {
                summarized += 1;
            }
            entries.push(Entry {
                tag: format!(
                    "[{} | {} | {}]",
                    id,
                    Self::description(request.decomposition, id),
                    result.agent_name
                ),
                content,
            });
            if let Some(delta) = &result.updated_context {
                merged.merge(delta);
            }
            tool_calls.extend(result.tool_calls.iter().cloned());
            if let Some(u) = &result.usage {
                usage = Some(usage.map_or(*u, |acc| acc.add(u)));
            }
        }
        self.fit(&mut entries);
        let partials = Self::render(&entries);

        let mut prompt = format!(
            "## Original request\n{}\n\n## Partial results\n{}",
            request.task.description(),
            partials
        );
        if !notes.is_empty() {
            prompt.push_str("\n\n## Missing parts\n");
            prompt.push_str(&notes.join("\n"));
        }
        let messages = vec![ChatMessage::system(SYNTHESIS_PROMPT), ChatMessage::user(prompt)];

        let answer = match self.gateway.complete(&messages, None).await {
            Ok(completion) if !completion.content.trim().is_empty() => {
                if let Some(u) = &completion.usage {
                    usage = Some(usage.map_or(*u, |acc| acc.add(u)));
                }
                Ok(completion.content.trim().to_string())
            }
            Ok(_) => Err(LlmError::parse_error("empty synthesis response".to_string())),
            Err(e) => Err(e),
        };

        let (content, fallback_reason) = match answer {
            Ok(content) => (content, None),
            Err(e) => {
                warn!("Synthesis failed: {}. Falling back to concatenated results", e);
                (partials, Some(e.to_string()))
            }
        };

        let result = AgentResult::success(request.coordinator, request.task.id(), content)
            .with_tool_calls(tool_calls)
            .with_context(merged)
            .with_usage(usage);

        Synthesis {
            result,
            fallback_reason,
            summarized,
            model_called: true,
        }
    }
}
