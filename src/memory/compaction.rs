//! Sliding-window compaction of conversation history.
//!
//! The last `recent_messages` entries stay verbatim; everything older is
//! folded into one summary bounded by `summary_token_budget`. The latest user
//! message is always kept verbatim even when it falls outside the window.

use tracing::{debug, warn};

use super::summarizer::{ExtractiveSummarizer, Summarizer};
use crate::agents::ContextMessage;
use crate::budget::{estimate_tokens, truncate_to_tokens};
use crate::llm::Role;

/// Re-summarization passes before the summary is hard-truncated.
pub const MAX_SUMMARY_PASSES: usize = 3;

/// Window and summary limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub recent_messages: usize,
    pub summary_token_budget: usize,
}

/// Result of compacting a history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactedHistory {
    /// Summary of the messages outside the window, if there were any.
    pub summary: Option<String>,
    /// Verbatim messages, oldest first.
    pub recent: Vec<ContextMessage>,
    /// Summarizer calls made.
    pub passes: usize,
    /// Whether the extractive fallback or hard truncation was needed.
    pub degraded: bool,
}

/// Render messages as `role: content` lines for summarization.
pub fn render_transcript(messages: &[ContextMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compact `history` under `policy`.
///
/// # Postconditions
/// - `summary` (if any) fits in `policy.summary_token_budget`
/// - the latest user message of `history` is in `recent`
/// - `recent` preserves the relative order of `history`
pub async fn compact_history(
    history: &[ContextMessage],
    policy: CompactionPolicy,
    summarizer: &dyn Summarizer,
) -> CompactedHistory {
    let window_start = history.len().saturating_sub(policy.recent_messages);
    let latest_user = history.iter().rposition(|m| m.role == Role::User);

    let mut older = Vec::new();
    let mut recent = Vec::new();
    for (i, message) in history.iter().enumerate() {
        if i >= window_start || Some(i) == latest_user {
            recent.push(message.clone());
        } else {
            older.push(message.clone());
        }
    }

    if older.is_empty() {
        return CompactedHistory {
            recent,
            ..CompactedHistory::default()
        };
    }

    let budget = policy.summary_token_budget.max(1);
    let mut summary = render_transcript(&older);
    let mut passes = 0;
    let mut degraded = false;

    while estimate_tokens(&summary) > budget && passes < MAX_SUMMARY_PASSES {
        passes += 1;
        match summarizer.summarize(&summary, budget).await {
            Ok(next) => summary = next,
            Err(e) => {
                warn!("Summarizer failed, using extractive fallback: {}", e);
                summary = ExtractiveSummarizer::extract(&summary, budget);
                degraded = true;
                break;
            }
        }
    }

    if estimate_tokens(&summary) > budget {
        debug!(
            "Summary still over budget after {} passes, truncating to {} tokens",
            passes, budget
        );
        summary = truncate_to_tokens(&summary, budget).to_string();
        degraded = true;
    }

    CompactedHistory {
        summary: Some(summary),
        recent,
        passes,
        degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSummarizer;

    fn history(n: usize) -> Vec<ContextMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ContextMessage::user(format!("question {i} {}", "detail ".repeat(20)))
                } else {
                    ContextMessage::assistant(format!("answer {i} {}", "detail ".repeat(20)))
                }
            })
            .collect()
    }

    fn policy(recent: usize, budget: usize) -> CompactionPolicy {
        CompactionPolicy {
            recent_messages: recent,
            summary_token_budget: budget,
        }
    }

    #[tokio::test]
    async fn test_short_history_is_untouched() {
        let summarizer = ScriptedSummarizer::new();
        let out = compact_history(&history(3), policy(5, 100), &summarizer).await;
        assert!(out.summary.is_none());
        assert_eq!(out.recent.len(), 3);
        assert_eq!(summarizer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_window_keeps_latest_user_message() {
        let summarizer = ScriptedSummarizer::new();
        // 10 messages, last one is an assistant message, window of 1
        let out = compact_history(&history(10), policy(1, 1000), &summarizer).await;

        assert_eq!(out.recent.len(), 2);
        assert!(out.recent[0].content.starts_with("question 8"));
        assert!(out.recent[1].content.starts_with("answer 9"));
        assert!(out.summary.is_some());
    }

    #[tokio::test]
    async fn test_stubborn_summarizer_is_truncated_after_max_passes() {
        let summarizer = ScriptedSummarizer::new().always("x".repeat(4000));
        let out = compact_history(&history(12), policy(2, 50), &summarizer).await;

        assert_eq!(out.passes, MAX_SUMMARY_PASSES);
        assert_eq!(summarizer.call_count(), MAX_SUMMARY_PASSES);
        assert!(out.degraded);
        assert!(estimate_tokens(out.summary.as_deref().unwrap()) <= 50);
    }

    #[tokio::test]
    async fn test_failing_summarizer_falls_back_to_extraction() {
        let summarizer = ScriptedSummarizer::failing();
        let out = compact_history(&history(12), policy(2, 60), &summarizer).await;

        assert!(out.degraded);
        assert_eq!(out.passes, 1);
        assert!(estimate_tokens(out.summary.as_deref().unwrap()) <= 60);
    }
}
