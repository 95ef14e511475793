//! Agent registry and immutable lookup snapshots.
//!
//! # Indexes
//! - `by_id`: id → agent
//! - `by_name`: lowercased name → id
//! - `by_capability`: capability → ids holding it
//!
//! # Invariants
//! - Names are unique case-insensitively
//! - An id is listed under a capability iff the agent holds that capability
//! - No capability bucket is empty

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::types::{AgentDescriptor, AgentId, Capability};
use super::AgentRef;

/// Minimum Jaro-Winkler similarity for a fuzzy name match.
pub const FUZZY_NAME_THRESHOLD: f64 = 0.88;

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<AgentId, AgentRef>,
    by_name: HashMap<String, AgentId>,
    by_capability: HashMap<Capability, HashSet<AgentId>>,
    /// Registration order, used for deterministic iteration.
    order: Vec<AgentId>,
}

/// Shared registry of available agents.
///
/// Cloning yields another handle to the same registry. Writers are
/// serialized by the lock; readers share it.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent.
    ///
    /// # Postconditions
    /// - Returns `false` and changes nothing if the name is already taken
    pub fn register(&self, agent: AgentRef) -> bool {
        let descriptor = agent.descriptor().clone();
        let key = name_key(descriptor.name());
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if inner.by_name.contains_key(&key) {
            debug!("Agent '{}' already registered, ignoring", descriptor.name());
            return false;
        }

        let id = descriptor.id();
        for capability in descriptor.capabilities() {
            inner
                .by_capability
                .entry(capability.clone())
                .or_default()
                .insert(id);
        }
        inner.by_name.insert(key, id);
        inner.by_id.insert(id, agent);
        inner.order.push(id);

        info!(
            "Registered agent '{}' with capabilities [{}]",
            descriptor.name(),
            descriptor
                .capabilities()
                .iter()
                .map(Capability::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        true
    }

    /// Remove an agent by name (case-insensitive).
    pub fn unregister(&self, name: &str) -> Option<AgentRef> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = inner.by_name.remove(&name_key(name))?;
        let agent = inner.by_id.remove(&id)?;

        for capability in agent.descriptor().capabilities() {
            if let Some(bucket) = inner.by_capability.get_mut(capability) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    inner.by_capability.remove(capability);
                }
            }
        }
        inner.order.retain(|other| *other != id);

        info!("Unregistered agent '{}'", agent.descriptor().name());
        Some(agent)
    }

    pub fn get_by_id(&self, id: &AgentId) -> Option<AgentRef> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<AgentRef> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_name
            .get(&name_key(name))
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Agents holding every capability in `required`, in registration order.
    ///
    /// An empty `required` set matches every agent.
    pub fn agents_with_all_capabilities(&self, required: &BTreeSet<Capability>) -> Vec<AgentRef> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        if required.is_empty() {
            return inner
                .order
                .iter()
                .filter_map(|id| inner.by_id.get(id).cloned())
                .collect();
        }

        let mut buckets = Vec::with_capacity(required.len());
        for capability in required {
            match inner.by_capability.get(capability) {
                Some(bucket) => buckets.push(bucket),
                None => return Vec::new(),
            }
        }
        // Intersect starting from the smallest bucket
        buckets.sort_by_key(|bucket| bucket.len());
        let Some((smallest, rest)) = buckets.split_first() else {
            return Vec::new();
        };
        let matching: HashSet<AgentId> = smallest
            .iter()
            .filter(|id| rest.iter().all(|bucket| bucket.contains(id)))
            .copied()
            .collect();

        inner
            .order
            .iter()
            .filter(|id| matching.contains(id))
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// All agents in registration order.
    pub fn all(&self) -> Vec<AgentRef> {
        self.agents_with_all_capabilities(&BTreeSet::new())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Immutable view of the registered descriptors.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        RegistrySnapshot {
            agents: inner
                .order
                .iter()
                .filter_map(|id| inner.by_id.get(id))
                .map(|agent| agent.descriptor().clone())
                .collect(),
        }
    }
}

/// How a claimed agent name was matched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NameMatch {
    Exact,
    Normalized,
    Fuzzy(f64),
}

/// Point-in-time copy of the registry's descriptors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    agents: Vec<AgentDescriptor>,
}

/// Registry key for an agent name; every case-insensitive name comparison
/// goes through this.
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}

/// Names equal under [`name_key`].
pub fn same_name(a: &str, b: &str) -> bool {
    name_key(a) == name_key(b)
}

/// Lowercase alphanumerics only: `"Code_Writer-2"` → `"codewriter2"`.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl RegistrySnapshot {
    pub fn from_descriptors(agents: Vec<AgentDescriptor>) -> Self {
        Self { agents }
    }

    pub fn descriptors(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Case-insensitive exact lookup.
    pub fn get(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents
            .iter()
            .find(|a| same_name(a.name(), name))
    }

    /// Resolve a possibly misspelled agent name.
    ///
    /// Tries exact (case-insensitive), then alphanumeric-normalized equality,
    /// then the highest Jaro-Winkler similarity at or above
    /// [`FUZZY_NAME_THRESHOLD`]. Earlier registrations win ties.
    pub fn resolve_name(&self, claimed: &str) -> Option<(&AgentDescriptor, NameMatch)> {
        let claimed = claimed.trim();
        if claimed.is_empty() {
            return None;
        }
        if let Some(agent) = self.get(claimed) {
            return Some((agent, NameMatch::Exact));
        }

        let wanted = normalize_name(claimed);
        if wanted.is_empty() {
            return None;
        }
        if let Some(agent) = self.agents.iter().find(|a| normalize_name(a.name()) == wanted) {
            return Some((agent, NameMatch::Normalized));
        }

        let mut best: Option<(&AgentDescriptor, f64)> = None;
        for agent in &self.agents {
            let score = strsim::jaro_winkler(&wanted, &normalize_name(agent.name()));
            if score >= FUZZY_NAME_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
                best = Some((agent, score));
            }
        }
        best.map(|(agent, score)| (agent, NameMatch::Fuzzy(score)))
    }

    /// Agent best covering `required`.
    ///
    /// Ranking: most capabilities covered, then full coverage, then the
    /// smallest capability set, then registration order. `None` when nothing
    /// overlaps or `required` is empty.
    pub fn best_capability_match(&self, required: &BTreeSet<Capability>) -> Option<&AgentDescriptor> {
        if required.is_empty() {
            return None;
        }
        let mut best: Option<(&AgentDescriptor, (usize, bool, std::cmp::Reverse<usize>))> = None;
        for agent in &self.agents {
            let overlap = agent.overlap(required);
            if overlap == 0 {
                continue;
            }
            let rank = (
                overlap,
                agent.has_all(required),
                std::cmp::Reverse(agent.capabilities().len()),
            );
            if best.as_ref().map_or(true, |(_, r)| rank > *r) {
                best = Some((agent, rank));
            }
        }
        best.map(|(agent, _)| agent)
    }

    /// Whether a single agent holds all of `required`.
    pub fn satisfies(&self, required: &BTreeSet<Capability>) -> bool {
        self.agents.iter().any(|a| a.has_all(required))
    }
}
