//! Agent working context and its merge semantics.
//!
//! # Merge
//! `merge` is the only way a context changes after construction:
//! - sequences (`conversation_history`, `file_references`, `rag_chunks`) append
//! - keyed values (`tool_results`, `metadata`, `agent_state` entries) are
//!   last-write-wins, keeping the position of the first occurrence
//!
//! Both rules are associative, so folding a batch of deltas left-to-right or
//! in any grouping gives the same result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::budget::estimate_tokens;
use crate::llm::Role;
use crate::memory::Chunk;

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl ContextMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.content) + 4
    }
}

/// A keyed tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub key: String,
    pub value: serde_json::Value,
}

impl ToolResult {
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.key) + estimate_tokens(&self.value.to_string())
    }
}

/// Per-agent key/value state.
pub type AgentState = BTreeMap<String, serde_json::Value>;

/// Working context handed to an agent.
///
/// # Invariants
/// - `tool_results` keys are unique
/// - Never mutated by a running subtask; subtasks receive private copies and
///   report additions through `AgentResult::updated_context`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub conversation_history: Vec<ContextMessage>,
    tool_results: Vec<ToolResult>,
    pub file_references: Vec<String>,
    pub rag_chunks: Vec<Chunk>,
    pub agent_state: BTreeMap<String, AgentState>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AgentContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with a conversation.
    pub fn with_history(history: Vec<ContextMessage>) -> Self {
        Self {
            conversation_history: history,
            ..Self::default()
        }
    }

    pub fn tool_results(&self) -> &[ToolResult] {
        &self.tool_results
    }

    pub fn tool_result(&self, key: &str) -> Option<&serde_json::Value> {
        self.tool_results
            .iter()
            .find(|r| r.key == key)
            .map(|r| &r.value)
    }

    /// Insert or replace a tool result, keeping the key unique.
    pub fn set_tool_result(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        match self.tool_results.iter_mut().find(|r| r.key == key) {
            Some(existing) => existing.value = value,
            None => self.tool_results.push(ToolResult { key, value }),
        }
    }

    /// Remove and return the oldest tool result.
    pub fn pop_oldest_tool_result(&mut self) -> Option<ToolResult> {
        if self.tool_results.is_empty() {
            None
        } else {
            Some(self.tool_results.remove(0))
        }
    }

    pub fn set_agent_state(
        &mut self,
        agent: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.agent_state
            .entry(agent.into())
            .or_default()
            .insert(key.into(), value);
    }

    /// The most recent user message, if any.
    pub fn latest_user_message(&self) -> Option<&ContextMessage> {
        self.conversation_history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
    }

    pub fn is_empty(&self) -> bool {
        self.conversation_history.is_empty()
            && self.tool_results.is_empty()
            && self.file_references.is_empty()
            && self.rag_chunks.is_empty()
            && self.agent_state.is_empty()
            && self.metadata.is_empty()
    }

    /// Merge `other` into `self` (append sequences, last-write-wins for keys).
    pub fn merge(&mut self, other: &AgentContext) {
        self.conversation_history
            .extend(other.conversation_history.iter().cloned());
        self.file_references
            .extend(other.file_references.iter().cloned());
        self.rag_chunks.extend(other.rag_chunks.iter().cloned());

        for result in &other.tool_results {
            self.set_tool_result(result.key.clone(), result.value.clone());
        }
        for (agent, state) in &other.agent_state {
            let entry = self.agent_state.entry(agent.clone()).or_default();
            for (k, v) in state {
                entry.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &other.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
    }

    /// Non-mutating form of [`AgentContext::merge`].
    pub fn merged(&self, other: &AgentContext) -> AgentContext {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Estimated token cost of sending this context verbatim.
    pub fn estimated_tokens(&self) -> usize {
        let history: usize = self
            .conversation_history
            .iter()
            .map(ContextMessage::estimated_tokens)
            .sum();
        let tools: usize = self.tool_results.iter().map(ToolResult::estimated_tokens).sum();
        let files: usize = self.file_references.iter().map(|f| estimate_tokens(f)).sum();
        let chunks: usize = self.rag_chunks.iter().map(Chunk::estimated_tokens).sum();
        let state: usize = self
            .agent_state
            .iter()
            .map(|(agent, s)| {
                estimate_tokens(agent)
                    + s.iter()
                        .map(|(k, v)| estimate_tokens(k) + estimate_tokens(&v.to_string()))
                        .sum::<usize>()
            })
            .sum();
        let metadata: usize = self
            .metadata
            .iter()
            .map(|(k, v)| estimate_tokens(k) + estimate_tokens(&v.to_string()))
            .sum();
        history + tools + files + chunks + state + metadata
    }

    /// Render the non-conversation parts as a prompt section.
    ///
    /// Returns an empty string when there is nothing to show.
    pub fn render_reference_section(&self) -> String {
        let mut sections = Vec::new();

        if !self.rag_chunks.is_empty() {
            let chunks = self
                .rag_chunks
                .iter()
                .map(|c| format!("• {}", c.content))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("### Relevant Context\n{}", chunks));
        }

        if !self.tool_results.is_empty() {
            let results = self
                .tool_results
                .iter()
                .map(|r| format!("• {}: {}", r.key, r.value))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("### Tool Results\n{}", results));
        }

        if !self.file_references.is_empty() {
            let files = self
                .file_references
                .iter()
                .map(|f| format!("• {}", f))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("### Files\n{}", files));
        }

        if sections.is_empty() {
            String::new()
        } else {
            format!("## Context\n\n{}\n", sections.join("\n\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(tag: &str, key_value: (&str, i64)) -> AgentContext {
        let mut c = AgentContext::with_history(vec![ContextMessage::user(format!("msg {tag}"))]);
        c.file_references.push(format!("{tag}.txt"));
        c.set_tool_result(key_value.0, json!(key_value.1));
        c.metadata.insert("last".into(), json!(tag));
        c.set_agent_state("coder", "step", json!(tag));
        c
    }

    #[test]
    fn test_merge_appends_sequences() {
        let a = ctx("a", ("k1", 1));
        let b = ctx("b", ("k2", 2));
        let merged = a.merged(&b);

        assert_eq!(merged.conversation_history.len(), 2);
        assert_eq!(merged.file_references, vec!["a.txt", "b.txt"]);
        assert_eq!(merged.tool_results().len(), 2);
    }

    #[test]
    fn test_merge_last_write_wins_for_keys() {
        let a = ctx("a", ("shared", 1));
        let b = ctx("b", ("shared", 2));
        let merged = a.merged(&b);

        assert_eq!(merged.tool_result("shared"), Some(&json!(2)));
        assert_eq!(merged.tool_results().len(), 1);
        assert_eq!(merged.metadata["last"], json!("b"));
        assert_eq!(merged.agent_state["coder"]["step"], json!("b"));
    }

    #[test]
    fn test_merge_is_associative() {
        let a = ctx("a", ("x", 1));
        let b = ctx("b", ("y", 2));
        let mut c = ctx("c", ("x", 3));
        c.set_agent_state("writer", "draft", json!(true));

        let left = a.merged(&b).merged(&c);
        let right = a.merged(&b.merged(&c));
        assert_eq!(left, right);
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let a = ctx("a", ("x", 1));
        assert_eq!(a.merged(&AgentContext::new()), a);
        assert_eq!(AgentContext::new().merged(&a), a);
    }

    #[test]
    fn test_latest_user_message() {
        let c = AgentContext::with_history(vec![
            ContextMessage::user("first"),
            ContextMessage::assistant("reply"),
            ContextMessage::user("second"),
            ContextMessage::assistant("reply 2"),
        ]);
        assert_eq!(c.latest_user_message().unwrap().content, "second");
    }

    #[test]
    fn test_render_reference_section_empty() {
        assert!(AgentContext::new().render_reference_section().is_empty());
    }
}
