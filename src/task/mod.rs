//! Task module - tasks, subtask graphs, decomposition and pruning.
//!
//! This module is designed with formal verification in mind:
//! - All types use algebraic data types with exhaustive matching
//! - Invariants are documented and enforced in constructors
//! - Pure functions are separated from IO operations (nothing here awaits)

mod decomposer;
mod pruner;
mod subtask;
pub mod task;

pub use decomposer::{analysis_prompt, TaskDecomposer};
pub use pruner::{prune, PruneOutcome, PruneReason, DUPLICATE_SIMILARITY};
pub use subtask::{
    repair_cycles, DecomposedSubtask, DecompositionError, DecompositionSource, SubtaskId,
    TaskDecomposition,
};
pub use task::{AgentTask, TaskId, TaskPriority};
