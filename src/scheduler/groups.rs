//! Level-order topological layering of a subtask graph.
//!
//! # Property
//! For every subtask in group `k`, each dependency lies in a group `< k`,
//! and `k` is the smallest such index.

use std::collections::{HashMap, HashSet};

use crate::task::{SubtaskId, TaskDecomposition};

/// Invalid subtask graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate subtask id: {0}")]
    DuplicateId(SubtaskId),

    #[error("Subtask {subtask} depends on unknown subtask {dependency}")]
    UnknownDependency {
        subtask: SubtaskId,
        dependency: SubtaskId,
    },

    #[error("Dependency cycle among subtasks: {}", format_ids(.0))]
    Cycle(Vec<SubtaskId>),
}

fn format_ids(ids: &[SubtaskId]) -> String {
    ids.iter()
        .map(SubtaskId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Split a decomposition into parallel groups (Kahn frontiers).
///
/// Subtasks keep declaration order inside each group.
///
/// # Errors
/// [`GraphError`] for duplicate ids, unknown dependencies or cycles.
pub fn parallel_groups(decomposition: &TaskDecomposition) -> Result<Vec<Vec<SubtaskId>>, GraphError> {
    let subtasks = decomposition.subtasks();

    let mut seen = HashSet::with_capacity(subtasks.len());
    for subtask in subtasks {
        if !seen.insert(&subtask.id) {
            return Err(GraphError::DuplicateId(subtask.id.clone()));
        }
    }

    let mut indegree: HashMap<&SubtaskId, usize> = HashMap::with_capacity(subtasks.len());
    let mut dependents: HashMap<&SubtaskId, Vec<&SubtaskId>> = HashMap::new();
    for subtask in subtasks {
        let mut unique = HashSet::new();
        for dep in &subtask.dependencies {
            if !seen.contains(dep) {
                return Err(GraphError::UnknownDependency {
                    subtask: subtask.id.clone(),
                    dependency: dep.clone(),
                });
            }
            if unique.insert(dep) {
                dependents.entry(dep).or_default().push(&subtask.id);
            }
        }
        indegree.insert(&subtask.id, unique.len());
    }

    let mut groups = Vec::new();
    let mut placed = 0;
    let mut frontier: HashSet<&SubtaskId> = subtasks
        .iter()
        .filter(|s| indegree.get(&s.id) == Some(&0))
        .map(|s| &s.id)
        .collect();

    while !frontier.is_empty() {
        let group: Vec<SubtaskId> = subtasks
            .iter()
            .filter(|s| frontier.contains(&s.id))
            .map(|s| s.id.clone())
            .collect();

        let mut next = HashSet::new();
        for id in &frontier {
            for succ in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(succ) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        next.insert(*succ);
                    }
                }
            }
        }

        placed += group.len();
        groups.push(group);
        frontier = next;
    }

    if placed != subtasks.len() {
        let unresolved = subtasks
            .iter()
            .filter(|s| indegree.get(&s.id).is_some_and(|d| *d > 0))
            .map(|s| s.id.clone())
            .collect();
        return Err(GraphError::Cycle(unresolved));
    }

    Ok(groups)
}
