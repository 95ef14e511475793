//! Subtask graph produced by decomposition.
//!
//! A decomposition is a list of subtasks in declaration order. Dependencies
//! reference other subtasks of the same decomposition by id and form a DAG
//! once [`repair_cycles`] has run.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::agents::{capability_set, Capability};

/// Identifier of a subtask, unique within one decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtaskId(String);

impl SubtaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The default id for the subtask at 1-based `position`.
    pub fn numbered(position: usize) -> Self {
        Self(format!("subtask-{position}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubtaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SubtaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of delegated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecomposedSubtask {
    pub id: SubtaskId,
    pub description: String,
    /// Name of the agent that will run this subtask.
    pub agent: String,
    /// `false` when the name the coordinator claimed matched no agent.
    pub agent_resolved: bool,
    /// The agent name as written by the coordinator, if any.
    pub claimed_agent: Option<String>,
    pub required_capabilities: BTreeSet<Capability>,
    /// Ids of subtasks that must complete first, in declared order.
    pub dependencies: Vec<SubtaskId>,
    pub parallelizable: bool,
}

impl DecomposedSubtask {
    pub fn new(id: impl Into<SubtaskId>, description: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            agent: agent.into(),
            agent_resolved: true,
            claimed_agent: None,
            required_capabilities: BTreeSet::new(),
            dependencies: Vec::new(),
            parallelizable: true,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubtaskId>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.required_capabilities = capability_set(capabilities);
        self
    }

    /// Mark as not parallelizable.
    pub fn sequential(mut self) -> Self {
        self.parallelizable = false;
        self
    }

    pub fn depends_on(&self, other: &SubtaskId) -> bool {
        self.dependencies.contains(other)
    }
}

/// Which parse tier produced a decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionSource {
    /// JSON object or array.
    Structured,
    /// Numbered or bulleted list.
    NumberedList,
    /// Unparseable analysis; the whole task became one subtask.
    Fallback,
    /// No analysis: the coordinator answered directly or a pattern built the plan.
    Direct,
}

/// A task split into subtasks.
///
/// # Invariants
/// - Subtask ids are unique
/// - Every dependency references a subtask of this decomposition
/// - The dependency graph is acyclic
///
/// # Design for Provability
/// Never mutated after construction; pruning builds a replacement via
/// [`TaskDecomposition::replace_subtasks`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDecomposition {
    analysis: String,
    subtasks: Vec<DecomposedSubtask>,
    warnings: Vec<String>,
    source: DecompositionSource,
}

impl TaskDecomposition {
    pub fn new(
        analysis: impl Into<String>,
        subtasks: Vec<DecomposedSubtask>,
        warnings: Vec<String>,
        source: DecompositionSource,
    ) -> Self {
        Self {
            analysis: analysis.into(),
            subtasks,
            warnings,
            source,
        }
    }

    /// Decomposition built without an analysis call.
    pub fn direct(subtasks: Vec<DecomposedSubtask>) -> Self {
        Self::new(String::new(), subtasks, Vec::new(), DecompositionSource::Direct)
    }

    pub fn analysis(&self) -> &str {
        &self.analysis
    }

    pub fn subtasks(&self) -> &[DecomposedSubtask] {
        &self.subtasks
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn source(&self) -> DecompositionSource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn get(&self, id: &SubtaskId) -> Option<&DecomposedSubtask> {
        self.subtasks.iter().find(|s| &s.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &SubtaskId> {
        self.subtasks.iter().map(|s| &s.id)
    }

    /// New decomposition with the same analysis and source.
    pub fn replace_subtasks(
        &self,
        subtasks: Vec<DecomposedSubtask>,
        extra_warnings: Vec<String>,
    ) -> TaskDecomposition {
        let mut warnings = self.warnings.clone();
        warnings.extend(extra_warnings);
        TaskDecomposition {
            analysis: self.analysis.clone(),
            subtasks,
            warnings,
            source: self.source,
        }
    }
}

/// Problems found while turning an analysis into a subtask graph.
///
/// None of these abort decomposition; each is recovered locally and kept as
/// a warning on the resulting [`TaskDecomposition`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecompositionError {
    #[error("Analysis is not a usable plan: {0}")]
    Malformed(String),

    #[error("Subtask at position {position} has no description and was dropped")]
    EmptyDescription { position: usize },

    #[error("Duplicate subtask id {original} renamed to {renamed}")]
    DuplicateId { original: String, renamed: SubtaskId },

    #[error("Subtask {subtask} references unknown dependency {dependency}")]
    UnknownDependency { subtask: SubtaskId, dependency: String },

    #[error("Subtask {subtask} depends on itself")]
    SelfDependency { subtask: SubtaskId },

    #[error("Dropped dependency {subtask} -> {dependency} to break a cycle")]
    CycleBroken { subtask: SubtaskId, dependency: SubtaskId },

    #[error("Agent '{claimed}' for subtask {subtask} not found; assigned {assigned}")]
    UnresolvedAgent {
        subtask: SubtaskId,
        claimed: String,
        assigned: String,
    },

    #[error("Agent '{claimed}' for subtask {subtask} resolved to {resolved}")]
    ApproximateAgent {
        subtask: SubtaskId,
        claimed: String,
        resolved: String,
    },

    #[error("No agent named for subtask {subtask}; assigned {assigned}")]
    UnassignedAgent { subtask: SubtaskId, assigned: String },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    OnStack,
    Done,
}

/// Break every dependency cycle by dropping back edges.
///
/// Depth-first traversal over subtasks in declaration order, visiting each
/// subtask's dependencies in declared order. An edge reaching a subtask that
/// is still on the traversal stack closes a cycle and is removed. References
/// to unknown ids are ignored here.
///
/// Returns one [`DecompositionError::CycleBroken`] per dropped edge.
pub fn repair_cycles(subtasks: &mut [DecomposedSubtask]) -> Vec<DecompositionError> {
    let index: HashMap<SubtaskId, usize> = subtasks
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();
    let mut marks = vec![Mark::New; subtasks.len()];
    let mut back_edges: Vec<(usize, SubtaskId)> = Vec::new();

    for root in 0..subtasks.len() {
        if marks[root] != Mark::New {
            continue;
        }
        marks[root] = Mark::OnStack;
        let mut stack = vec![(root, 0usize)];

        while let Some(top) = stack.len().checked_sub(1) {
            let (node, next) = stack[top];
            let Some(dep_id) = subtasks[node].dependencies.get(next).cloned() else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            stack[top].1 += 1;

            let Some(&dep) = index.get(&dep_id) else {
                continue;
            };
            match marks[dep] {
                Mark::OnStack => back_edges.push((node, dep_id)),
                Mark::New => {
                    marks[dep] = Mark::OnStack;
                    stack.push((dep, 0));
                }
                Mark::Done => {}
            }
        }
    }

    back_edges
        .into_iter()
        .map(|(node, dep_id)| {
            subtasks[node].dependencies.retain(|d| d != &dep_id);
            DecompositionError::CycleBroken {
                subtask: subtasks[node].id.clone(),
                dependency: dep_id,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(subtasks: &[DecomposedSubtask], at: usize) -> Vec<&str> {
        subtasks[at].dependencies.iter().map(SubtaskId::as_str).collect()
    }

    #[test]
    fn test_acyclic_graph_is_untouched() {
        let mut subtasks = vec![
            DecomposedSubtask::new("a", "first", "x"),
            DecomposedSubtask::new("b", "second", "x").with_dependencies(["a"]),
            DecomposedSubtask::new("c", "third", "x").with_dependencies(["a", "b"]),
        ];
        let before = subtasks.clone();
        assert!(repair_cycles(&mut subtasks).is_empty());
        assert_eq!(subtasks, before);
    }

    #[test]
    fn test_two_cycle_drops_back_edge() {
        // a depends on b, b depends on a: traversal from a reaches b, whose
        // edge back to a closes the cycle.
        let mut subtasks = vec![
            DecomposedSubtask::new("a", "first", "x").with_dependencies(["b"]),
            DecomposedSubtask::new("b", "second", "x").with_dependencies(["a"]),
        ];
        let warnings = repair_cycles(&mut subtasks);

        assert_eq!(
            warnings,
            vec![DecompositionError::CycleBroken {
                subtask: SubtaskId::from("b"),
                dependency: SubtaskId::from("a"),
            }]
        );
        assert_eq!(ids(&subtasks, 0), vec!["b"]);
        assert!(ids(&subtasks, 1).is_empty());
    }

    #[test]
    fn test_self_loop_and_long_cycle() {
        let mut subtasks = vec![
            DecomposedSubtask::new("a", "1", "x").with_dependencies(["a", "c"]),
            DecomposedSubtask::new("b", "2", "x").with_dependencies(["a"]),
            DecomposedSubtask::new("c", "3", "x").with_dependencies(["b"]),
        ];
        let warnings = repair_cycles(&mut subtasks);

        assert_eq!(warnings.len(), 2);
        assert_eq!(ids(&subtasks, 0), vec!["c"]);
        assert!(ids(&subtasks, 1).is_empty());
        assert_eq!(ids(&subtasks, 2), vec!["b"]);
        assert!(repair_cycles(&mut subtasks).is_empty());
    }

    #[test]
    fn test_unknown_references_are_ignored() {
        let mut subtasks = vec![DecomposedSubtask::new("a", "1", "x").with_dependencies(["zzz"])];
        assert!(repair_cycles(&mut subtasks).is_empty());
        assert_eq!(ids(&subtasks, 0), vec!["zzz"]);
    }

    #[test]
    fn test_replace_subtasks_keeps_metadata() {
        let decomposition = TaskDecomposition::new(
            "raw",
            vec![DecomposedSubtask::new("a", "1", "x")],
            vec!["w1".into()],
            DecompositionSource::Structured,
        );
        let replaced = decomposition.replace_subtasks(Vec::new(), vec!["w2".into()]);

        assert_eq!(replaced.analysis(), "raw");
        assert_eq!(replaced.source(), DecompositionSource::Structured);
        assert_eq!(replaced.warnings(), &["w1".to_string(), "w2".to_string()]);
        assert!(replaced.is_empty());
    }
}
