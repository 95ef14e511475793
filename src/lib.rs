//! # taskweave
//!
//! Multi-agent task orchestration: one request is decomposed into a graph of
//! subtasks, each subtask runs on a specialist agent with a private,
//! budget-bounded view of the shared context, and the results are
//! synthesized into one answer.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────┐
//!   AgentTask ───▶│       Orchestrator       │───▶ AgentResult + metrics
//!                 └────────────┬─────────────┘
//!        ┌────────────┬────────┴─────┬──────────────────┐
//!        ▼            ▼              ▼                  ▼
//!  TaskDecomposer  SubtaskPruner  DependencyScheduler  ResultSynthesizer
//!                                    │
//!                       ┌────────────┴────────────┐
//!                       ▼                         ▼
//!           ContextIsolationBuilder        AgentRegistry
//!                       │                         │
//!                       ▼                         ▼
//!          RagRetriever / Summarizer       Agent ─▶ ModelGateway
//! ```
//!
//! ## Task Flow
//! 1. Decide whether the request needs delegation at all
//! 2. Ask the coordinator for an analysis and parse it into subtasks
//! 3. Prune subtasks no agent can run, and near duplicates
//! 4. Run the subtask graph wave by wave with retries
//! 5. Synthesize the partial results
//!
//! ## Modules
//! - `agents`: the `Agent` trait, registry and the model-backed `LlmAgent`
//! - `budget`: token estimation and per-subtask budgets
//! - `llm`: the `ModelGateway` seam and an OpenRouter client
//! - `memory`: retrieval, summarization, compaction and context isolation
//! - `task`: tasks, subtask graphs, decomposition and pruning
//! - `scheduler`: dependency-ordered parallel execution
//! - `orchestrator`: the state machine, events, synthesis and metrics

pub mod agents;
pub mod budget;
pub mod config;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod scheduler;
pub mod task;

#[cfg(test)]
mod testing;

pub use config::{Config, OrchestratorConfig};
pub use orchestrator::{OrchestrationFailed, OrchestrationOutcome, Orchestrator};
