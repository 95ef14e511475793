//! Removes subtasks that cannot or need not run.
//!
//! # Algorithm
//! 1. Drop subtasks whose required capabilities no single agent holds;
//!    edges pointing at them are removed
//! 2. Collapse near duplicates: same agent and token Jaccard similarity at or
//!    above [`DUPLICATE_SIMILARITY`]; the first occurrence survives and
//!    references to the removed subtask are rewritten to it
//! 3. Normalize dependency lists and re-run cycle repair
//!
//! # Property
//! `prune(prune(d)) == prune(d)`

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::subtask::{repair_cycles, DecomposedSubtask, SubtaskId, TaskDecomposition};
use crate::agents::{same_name, RegistrySnapshot};
use crate::memory::tokenize;

/// Minimum token Jaccard similarity for two subtasks to count as duplicates.
pub const DUPLICATE_SIMILARITY: f64 = 0.8;

/// Why a subtask was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PruneReason {
    UnsatisfiableCapabilities,
    DuplicateOf { survivor: SubtaskId },
}

/// Result of pruning.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneOutcome {
    pub decomposition: TaskDecomposition,
    pub pruned_count: usize,
    pub removed: Vec<(SubtaskId, PruneReason)>,
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Prune a decomposition against the agents currently registered.
pub fn prune(decomposition: &TaskDecomposition, snapshot: &RegistrySnapshot) -> PruneOutcome {
    let mut warnings = Vec::new();
    let mut removed: Vec<(SubtaskId, PruneReason)> = Vec::new();
    // Removed id -> id its dependents should point at (None: drop the edge)
    let mut redirect: HashMap<SubtaskId, Option<SubtaskId>> = HashMap::new();

    let mut survivors: Vec<(DecomposedSubtask, BTreeSet<String>)> = Vec::new();
    for subtask in decomposition.subtasks() {
        if !snapshot.satisfies(&subtask.required_capabilities) {
            warnings.push(format!(
                "Pruned subtask {}: no agent holds all of its required capabilities",
                subtask.id
            ));
            redirect.insert(subtask.id.clone(), None);
            removed.push((subtask.id.clone(), PruneReason::UnsatisfiableCapabilities));
            continue;
        }

        let tokens: BTreeSet<String> = tokenize(&subtask.description).into_iter().collect();
        let duplicate_of = survivors.iter().find(|(kept, kept_tokens)| {
            same_name(&kept.agent, &subtask.agent)
                && jaccard(kept_tokens, &tokens) >= DUPLICATE_SIMILARITY
        });

        if let Some((kept, _)) = duplicate_of {
            warnings.push(format!(
                "Pruned subtask {}: near duplicate of {}",
                subtask.id, kept.id
            ));
            redirect.insert(subtask.id.clone(), Some(kept.id.clone()));
            removed.push((
                subtask.id.clone(),
                PruneReason::DuplicateOf {
                    survivor: kept.id.clone(),
                },
            ));
            continue;
        }

        survivors.push((subtask.clone(), tokens));
    }

    let known: BTreeSet<SubtaskId> = survivors.iter().map(|(s, _)| s.id.clone()).collect();
    let mut subtasks: Vec<DecomposedSubtask> = survivors
        .into_iter()
        .map(|(mut subtask, _)| {
            let mut dependencies = Vec::with_capacity(subtask.dependencies.len());
            for dep in &subtask.dependencies {
                let target = match redirect.get(dep) {
                    Some(Some(survivor)) => survivor.clone(),
                    Some(None) => continue,
                    None => dep.clone(),
                };
                if target != subtask.id && known.contains(&target) && !dependencies.contains(&target) {
                    dependencies.push(target);
                }
            }
            subtask.dependencies = dependencies;
            subtask
        })
        .collect();

    warnings.extend(repair_cycles(&mut subtasks).iter().map(ToString::to_string));

    if !removed.is_empty() {
        debug!(
            "Pruned {} of {} subtasks",
            removed.len(),
            decomposition.len()
        );
    }

    PruneOutcome {
        decomposition: decomposition.replace_subtasks(subtasks, warnings),
        pruned_count: removed.len(),
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentDescriptor;
    use crate::task::DecompositionSource;

    fn snapshot() -> RegistrySnapshot {
        RegistrySnapshot::from_descriptors(vec![
            AgentDescriptor::new("researcher", ["web-search"]),
            AgentDescriptor::new("coder", ["coding", "testing"]),
        ])
    }

    fn decomposition(subtasks: Vec<DecomposedSubtask>) -> TaskDecomposition {
        TaskDecomposition::new("", subtasks, Vec::new(), DecompositionSource::Structured)
    }

    fn deps(d: &TaskDecomposition, id: &str) -> Vec<String> {
        d.get(&SubtaskId::from(id))
            .unwrap()
            .dependencies
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_unsatisfiable_subtasks_dropped_with_edges() {
        let d = decomposition(vec![
            DecomposedSubtask::new("a", "search the web", "researcher").with_capabilities(["web-search"]),
            DecomposedSubtask::new("b", "fly a drone", "researcher").with_capabilities(["flying"]),
            DecomposedSubtask::new("c", "write code", "coder")
                .with_capabilities(["coding", "web-search"])
                .with_dependencies(["a"]),
            DecomposedSubtask::new("d", "test code", "coder").with_dependencies(["a", "b"]),
        ]);
        let outcome = prune(&d, &snapshot());

        let ids: Vec<_> = outcome.decomposition.ids().map(SubtaskId::as_str).collect();
        // c needs two capabilities no single agent holds
        assert_eq!(ids, vec!["a", "d"]);
        assert_eq!(outcome.pruned_count, 2);
        assert_eq!(deps(&outcome.decomposition, "d"), vec!["a"]);
    }

    #[test]
    fn test_near_duplicates_collapse_to_first() {
        let d = decomposition(vec![
            DecomposedSubtask::new("a", "Research the pricing of competitor products", "researcher"),
            DecomposedSubtask::new("b", "research pricing of the competitor products", "researcher"),
            DecomposedSubtask::new("c", "Research the pricing of competitor products", "coder"),
            DecomposedSubtask::new("d", "Summarize", "coder").with_dependencies(["b", "a"]),
        ]);
        let outcome = prune(&d, &snapshot());

        let ids: Vec<_> = outcome.decomposition.ids().map(SubtaskId::as_str).collect();
        // Same text on a different agent is not a duplicate
        assert_eq!(ids, vec!["a", "c", "d"]);
        assert_eq!(deps(&outcome.decomposition, "d"), vec!["a"]);
        assert_eq!(
            outcome.removed,
            vec![(
                SubtaskId::from("b"),
                PruneReason::DuplicateOf {
                    survivor: SubtaskId::from("a")
                }
            )]
        );
    }

    #[test]
    fn test_redirect_to_self_is_dropped() {
        let d = decomposition(vec![
            DecomposedSubtask::new("a", "collect all the logs", "coder").with_dependencies(["b"]),
            DecomposedSubtask::new("b", "collect the logs all", "coder"),
        ]);
        let outcome = prune(&d, &snapshot());

        assert_eq!(outcome.decomposition.len(), 1);
        assert!(deps(&outcome.decomposition, "a").is_empty());
    }

    #[test]
    fn test_prune_is_idempotent() {
        let d = decomposition(vec![
            DecomposedSubtask::new("a", "search the web for sources", "researcher"),
            DecomposedSubtask::new("b", "search web for the sources", "researcher"),
            DecomposedSubtask::new("c", "fly", "coder").with_capabilities(["flying"]),
            DecomposedSubtask::new("d", "write code", "coder").with_dependencies(["b", "c", "d"]),
            DecomposedSubtask::new("e", "test code", "coder").with_dependencies(["d"]),
        ]);
        let once = prune(&d, &snapshot());
        let twice = prune(&once.decomposition, &snapshot());

        assert_eq!(twice.decomposition, once.decomposition);
        assert_eq!(twice.pruned_count, 0);
    }

    #[test]
    fn test_jaccard() {
        let set = |s: &str| tokenize(s).into_iter().collect::<BTreeSet<_>>();
        assert_eq!(jaccard(&set("a b"), &set("")), 0.0);
        assert_eq!(jaccard(&set("alpha beta"), &set("beta alpha")), 1.0);
        assert!((jaccard(&set("alpha beta gamma"), &set("alpha beta delta")) - 0.5).abs() < 1e-9);
    }
}
