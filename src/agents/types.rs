//! Identities, results and errors shared by every agent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::AgentContext;
use crate::llm::{LlmError, TokenUsage, ToolCall};
use crate::task::TaskId;

/// Process-unique agent identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named skill used to match subtasks to agents.
///
/// Names are normalized on construction: trimmed, lowercased, with spaces
/// and underscores folded into `-`, so `"Web Search"` and `"web_search"`
/// are the same capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    pub const COORDINATION: &'static str = "coordination";

    pub fn new(name: impl AsRef<str>) -> Self {
        let normalized = name
            .as_ref()
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '_' || c.is_whitespace() { '-' } else { c })
            .collect();
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Capability::new(s)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Capability::new(s)
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build a capability set from string-like values.
pub fn capability_set<I, S>(names: I) -> BTreeSet<Capability>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| Capability::new(n))
        .filter(|c| !c.as_str().is_empty())
        .collect()
}

/// Identity and capabilities of a registered agent.
///
/// # Invariants
/// - Immutable after construction; there are no setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    id: AgentId,
    name: String,
    capabilities: BTreeSet<Capability>,
}

impl AgentDescriptor {
    pub fn new<I, S>(name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            id: AgentId::new(),
            name: name.into(),
            capabilities: capability_set(capabilities),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Check whether this agent holds every capability in `required`.
    pub fn has_all(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Number of `required` capabilities this agent holds.
    pub fn overlap(&self, required: &BTreeSet<Capability>) -> usize {
        required.intersection(&self.capabilities).count()
    }
}

/// Result of an agent processing a task.
///
/// # Invariants
/// - If `success == false`, `error` explains why
/// - `updated_context` holds only what the agent added (a delta), never a
///   copy of the context it was given
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub task_id: TaskId,
    pub content: String,
    pub success: bool,
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub updated_context: Option<AgentContext>,
    pub usage: Option<TokenUsage>,
}

impl AgentResult {
    /// Successful result with the given content.
    pub fn success(
        agent: &AgentDescriptor,
        task_id: TaskId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent.id(),
            agent_name: agent.name().to_string(),
            task_id,
            content: content.into(),
            success: true,
            error: None,
            tool_calls: Vec::new(),
            updated_context: None,
            usage: None,
        }
    }

    /// Create a failure result.
    pub fn failure(agent: &AgentDescriptor, task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent.id(),
            agent_name: agent.name().to_string(),
            task_id,
            content: String::new(),
            success: false,
            error: Some(error.into()),
            tool_calls: Vec::new(),
            updated_context: None,
            usage: None,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_context(mut self, delta: AgentContext) -> Self {
        self.updated_context = Some(delta);
        self
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }
}

/// Why an agent could not produce a result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] LlmError),

    #[error("Agent failed: {0}")]
    Failed(String),
}

impl AgentError {
    /// Whether the underlying cause is an unreachable model.
    pub fn is_gateway_unavailable(&self) -> bool {
        matches!(self, AgentError::Gateway(e) if e.is_unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_normalization() {
        assert_eq!(Capability::new(" Web Search "), Capability::new("web_search"));
        assert_eq!(Capability::new("File-Reading").as_str(), "file-reading");
    }

    #[test]
    fn test_capability_serde_normalizes() {
        let cap: Capability = serde_json::from_str("\"Code_Review\"").unwrap();
        assert_eq!(cap.as_str(), "code-review");
    }

    #[test]
    fn test_descriptor_has_all() {
        let agent = AgentDescriptor::new("researcher", ["web-search", "summarize"]);
        assert!(agent.has_all(&capability_set(["web search"])));
        assert!(agent.has_all(&BTreeSet::new()));
        assert!(!agent.has_all(&capability_set(["web-search", "coding"])));
        assert_eq!(agent.overlap(&capability_set(["web-search", "coding"])), 1);
    }

    #[test]
    fn test_empty_capability_names_dropped() {
        assert!(capability_set(["", "  "]).is_empty());
    }
}
