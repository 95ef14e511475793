//! Agents module - the workers the orchestrator delegates to.
//!
//! # Agent Types
//! - **LlmAgent**: Renders its isolated context into a prompt and calls a `ModelGateway`
//! - Any other `Agent` implementation registered with the `AgentRegistry`
//!
//! # Design Principles
//! - Agents are stateless with respect to the shared context: they read a
//!   private copy and report additions as a delta
//! - Capabilities, not names, decide who can run a subtask

mod context;
mod llm_agent;
mod registry;
mod types;

pub use context::{AgentContext, AgentState, ContextMessage, ToolResult};
pub use llm_agent::LlmAgent;
pub use registry::{
    name_key, normalize_name, same_name, AgentRegistry, NameMatch, RegistrySnapshot,
    FUZZY_NAME_THRESHOLD,
};
pub use types::{capability_set, AgentDescriptor, AgentError, AgentId, AgentResult, Capability};

use std::sync::Arc;

use async_trait::async_trait;

use crate::task::AgentTask;

/// Reference to a registered agent.
pub type AgentRef = Arc<dyn Agent>;

/// Base trait for all agents.
///
/// # Invariants
/// - `process()` never mutates `context`; additions go in
///   `AgentResult::updated_context`
/// - `process()` never panics; all errors are returned as `Err`
#[async_trait]
pub trait Agent: Send + Sync {
    /// Identity and capabilities. Must not change over the agent's lifetime.
    fn descriptor(&self) -> &AgentDescriptor;

    /// Process a task.
    ///
    /// # Errors
    /// Returns `Err` if the task could not be processed (gateway failure,
    /// unusable output). An `Ok` result with `success == false` is also
    /// treated as a failed attempt by the scheduler.
    async fn process(
        &self,
        task: &AgentTask,
        context: &AgentContext,
    ) -> Result<AgentResult, AgentError>;

    /// Get a human-readable description of this agent.
    fn description(&self) -> &str {
        "Generic agent"
    }
}
