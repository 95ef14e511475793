//! Summarization backends used by compaction and synthesis.

use std::sync::Arc;

use async_trait::async_trait;

use crate::budget::{estimate_tokens, truncate_to_tokens};
use crate::llm::{ChatMessage, LlmError, ModelGateway};

/// Condenses text to roughly `target_tokens`.
///
/// Implementations may overshoot; callers re-check against their budget.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, target_tokens: usize) -> Result<String, LlmError>;
}

const SUMMARY_PROMPT: &str = "You condense conversation history and intermediate results for \
another agent. Write a factual, third-person summary. Keep names, numbers, file paths, \
decisions and open questions. Drop greetings and chat conventions. Do not add commentary.";

/// Summarizer backed by a model gateway.
pub struct GatewaySummarizer {
    gateway: Arc<dyn ModelGateway>,
}

impl GatewaySummarizer {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Summarizer for GatewaySummarizer {
    async fn summarize(&self, text: &str, target_tokens: usize) -> Result<String, LlmError> {
        if estimate_tokens(text) <= target_tokens {
            return Ok(text.to_string());
        }
        let messages = vec![
            ChatMessage::system(SUMMARY_PROMPT),
            ChatMessage::user(format!(
                "Summarize the following in at most {} words.\n\n{}",
                (target_tokens * 3 / 4).max(1),
                text
            )),
        ];
        let completion = self.gateway.complete(&messages, None).await?;
        let summary = completion.content.trim().to_string();
        if summary.is_empty() {
            return Err(LlmError::parse_error(
                "summarizer returned an empty response".to_string(),
            ));
        }
        Ok(summary)
    }
}

/// Model-free summarizer: keeps the leading and trailing sentences that fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    /// Synchronous form, also used as the fallback when a model summarizer fails.
    pub fn extract(text: &str, target_tokens: usize) -> String {
        if estimate_tokens(text) <= target_tokens {
            return text.to_string();
        }
        let sentences = split_sentences(text);
        let marker = " [...] ";
        let budget = target_tokens.saturating_sub(estimate_tokens(marker));

        let mut head: Vec<&str> = Vec::new();
        let mut tail: Vec<&str> = Vec::new();
        let mut used = 0usize;
        let (mut front, mut back) = (0usize, sentences.len());
        let mut take_front = true;

        // Alternate between the start and the end of the text
        while front < back {
            let candidate = if take_front { sentences[front] } else { sentences[back - 1] };
            let cost = estimate_tokens(candidate) + 1;
            if used + cost > budget {
                break;
            }
            used += cost;
            if take_front {
                head.push(candidate);
                front += 1;
            } else {
                tail.push(candidate);
                back -= 1;
            }
            take_front = !take_front;
        }

        if head.is_empty() && tail.is_empty() {
            return truncate_to_tokens(text, target_tokens).to_string();
        }

        tail.reverse();
        let mut out = head.join(" ");
        if front < back {
            out.push_str(marker);
        } else if !tail.is_empty() {
            out.push(' ');
        }
        out.push_str(&tail.join(" "));
        out.trim().to_string()
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, text: &str, target_tokens: usize) -> Result<String, LlmError> {
        Ok(Self::extract(text, target_tokens))
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGateway;

    #[test]
    fn test_extract_short_text_is_unchanged() {
        assert_eq!(ExtractiveSummarizer::extract("Hello there.", 100), "Hello there.");
    }

    #[test]
    fn test_extract_keeps_head_and_tail_within_budget() {
        let text = (1..=40)
            .map(|i| format!("Sentence number {i} carries some detail."))
            .collect::<Vec<_>>()
            .join(" ");
        let summary = ExtractiveSummarizer::extract(&text, 40);

        assert!(estimate_tokens(&summary) <= 40);
        assert!(summary.starts_with("Sentence number 1 "));
        assert!(summary.ends_with("Sentence number 40 carries some detail."));
        assert!(summary.contains("[...]"));
    }

    #[test]
    fn test_extract_single_long_sentence_truncates() {
        let text = "x".repeat(1000);
        let summary = ExtractiveSummarizer::extract(&text, 10);
        assert_eq!(summary.len(), 40);
    }

    #[tokio::test]
    async fn test_gateway_summarizer_passthrough_when_short() {
        let gateway = Arc::new(ScriptedGateway::new());
        let summarizer = GatewaySummarizer::new(gateway.clone());
        let out = summarizer.summarize("tiny", 50).await.unwrap();
        assert_eq!(out, "tiny");
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_gateway_summarizer_calls_model() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_text("condensed");
        let summarizer = GatewaySummarizer::new(gateway.clone());
        let out = summarizer.summarize(&"word ".repeat(400), 20).await.unwrap();
        assert_eq!(out, "condensed");
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn test_gateway_summarizer_empty_response_is_error() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_text("   ");
        let summarizer = GatewaySummarizer::new(gateway);
        assert!(summarizer.summarize(&"word ".repeat(400), 20).await.is_err());
    }
}
