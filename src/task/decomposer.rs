//! Turns a coordinator's analysis into a subtask graph.
//!
//! The analysis is untrusted model output. Parsing tries, in order:
//! 1. **Structured**: the first JSON object/array in the text (code fences
//!    stripped, trailing commas tolerated, common field aliases accepted)
//! 2. **Numbered list**: `1. do x (agent: coder) (depends on: 1)` or
//!    `- [writer] do y`
//! 3. **Fallback**: the whole task as one subtask
//!
//! Decomposition never fails. Everything that had to be repaired is recorded
//! as a warning.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::subtask::{
    repair_cycles, DecomposedSubtask, DecompositionError, DecompositionSource, SubtaskId,
    TaskDecomposition,
};
use super::task::AgentTask;
use crate::agents::{capability_set, Capability, NameMatch, RegistrySnapshot};

const LIST_KEYS: &[&str] = &["subtasks", "tasks", "steps", "plan"];
const ID_KEYS: &[&str] = &["id"];
const DESCRIPTION_KEYS: &[&str] = &["description", "task", "title", "goal"];
const AGENT_KEYS: &[&str] = &["agent", "assigned_agent", "agent_name", "assignee"];
const DEPENDENCY_KEYS: &[&str] = &["dependencies", "depends_on", "deps", "after"];
const PARALLEL_KEYS: &[&str] = &["parallel", "parallelizable", "can_parallelize"];
const CAPABILITY_KEYS: &[&str] = &["capabilities", "required_capabilities"];

/// A subtask as written by the coordinator, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
struct RawSubtask {
    id: Option<String>,
    description: String,
    agent: Option<String>,
    dependencies: Vec<String>,
    parallel: Option<bool>,
    capabilities: Vec<String>,
}

/// Builds the analysis prompt sent to the coordinator.
///
/// The format requested here is the one the structured tier parses.
pub fn analysis_prompt(task: &AgentTask, snapshot: &RegistrySnapshot) -> String {
    let roster = snapshot
        .descriptors()
        .iter()
        .map(|a| {
            let caps = a
                .capabilities()
                .iter()
                .map(Capability::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            format!("- {}: {}", a.name(), caps)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Break the request below into subtasks for the available agents.

## Available Agents
{roster}

## Request
{request}

## Response Format
Return ONLY a JSON object:
{{"subtasks": [
  {{"id": "1", "description": "...", "agent": "<agent name>",
   "dependencies": ["<ids of subtasks that must finish first>"],
   "parallel": true, "capabilities": ["..."]}}
]}}

Keep subtasks independent where possible. Use as few subtasks as the request needs."#,
        request = task.description()
    )
}

/// Parses coordinator analyses against a registry snapshot.
pub struct TaskDecomposer<'a> {
    snapshot: &'a RegistrySnapshot,
    coordinator: &'a str,
}

impl<'a> TaskDecomposer<'a> {
    pub fn new(snapshot: &'a RegistrySnapshot, coordinator: &'a str) -> Self {
        Self {
            snapshot,
            coordinator,
        }
    }

    /// Decompose `analysis` for `task`.
    ///
    /// # Postconditions
    /// - At least one subtask
    /// - Ids unique, dependencies known and acyclic
    /// - Every subtask is assigned to some agent name
    pub fn decompose(&self, analysis: &str, task: &AgentTask) -> TaskDecomposition {
        let mut errors = Vec::new();

        let (raws, source) = if let Some(raws) = parse_structured(analysis) {
            (raws, DecompositionSource::Structured)
        } else if let Some(raws) = parse_numbered_list(analysis) {
            (raws, DecompositionSource::NumberedList)
        } else {
            (Vec::new(), DecompositionSource::Fallback)
        };

        let mut subtasks = self.normalize(raws, &mut errors);

        let source = if subtasks.is_empty() {
            errors.push(DecompositionError::Malformed(
                "no subtasks found; running the task as a single subtask".to_string(),
            ));
            subtasks = vec![self.fallback_subtask(task)];
            DecompositionSource::Fallback
        } else {
            source
        };

        errors.extend(repair_cycles(&mut subtasks));

        for error in &errors {
            warn!("Decomposition: {}", error);
        }
        debug!(
            "Decomposed task {} into {} subtasks ({:?})",
            task.id(),
            subtasks.len(),
            source
        );

        TaskDecomposition::new(
            analysis,
            subtasks,
            errors.iter().map(ToString::to_string).collect(),
            source,
        )
    }

    fn fallback_subtask(&self, task: &AgentTask) -> DecomposedSubtask {
        let agent = self
            .snapshot
            .best_capability_match(task.required_capabilities())
            .map(|a| a.name().to_string())
            .unwrap_or_else(|| self.coordinator.to_string());
        let mut subtask = DecomposedSubtask::new(SubtaskId::numbered(1), task.description(), agent);
        subtask.required_capabilities = task.required_capabilities().clone();
        subtask
    }

    fn normalize(
        &self,
        raws: Vec<RawSubtask>,
        errors: &mut Vec<DecompositionError>,
    ) -> Vec<DecomposedSubtask> {
        // Pass 1: descriptions and ids. Positions count every entry the
        // model emitted, dropped ones included.
        let mut kept: Vec<(RawSubtask, SubtaskId)> = Vec::new();
        let mut by_position: HashMap<usize, SubtaskId> = HashMap::new();
        let mut taken: HashSet<SubtaskId> = HashSet::new();
        let mut by_raw_id: HashMap<String, SubtaskId> = HashMap::new();

        for (i, raw) in raws.into_iter().enumerate() {
            if raw.description.trim().is_empty() {
                errors.push(DecompositionError::EmptyDescription { position: i + 1 });
                continue;
            }
            let position = i + 1;
            let raw_id = raw.id.as_deref().map(str::trim).filter(|s| !s.is_empty());
            let base = match raw_id {
                Some(id) if id.chars().all(|c| c.is_ascii_digit()) => {
                    SubtaskId::new(format!("subtask-{id}"))
                }
                Some(id) => SubtaskId::new(id),
                None => SubtaskId::numbered(position),
            };

            let mut id = base.clone();
            let mut suffix = 2;
            while taken.contains(&id) {
                id = SubtaskId::new(format!("{}-{}", base, suffix));
                suffix += 1;
            }
            if id != base {
                errors.push(DecompositionError::DuplicateId {
                    original: base.to_string(),
                    renamed: id.clone(),
                });
            }
            if let Some(raw_id) = raw_id {
                by_raw_id.entry(raw_id.to_string()).or_insert_with(|| id.clone());
            }
            taken.insert(id.clone());
            by_position.insert(position, id.clone());
            kept.push((raw, id));
        }

        // Pass 2: dependencies and agents
        kept.into_iter()
            .map(|(raw, id)| {
                let mut dependencies: Vec<SubtaskId> = Vec::new();
                for reference in &raw.dependencies {
                    match resolve_reference(reference, &taken, &by_raw_id, &by_position) {
                        Some(dep) if dep == id => {
                            errors.push(DecompositionError::SelfDependency { subtask: id.clone() })
                        }
                        Some(dep) => {
                            if !dependencies.contains(&dep) {
                                dependencies.push(dep);
                            }
                        }
                        None => errors.push(DecompositionError::UnknownDependency {
                            subtask: id.clone(),
                            dependency: reference.clone(),
                        }),
                    }
                }

                let capabilities = capability_set(&raw.capabilities);
                let claimed = raw
                    .agent
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                let (agent, resolved) = self.assign_agent(&id, claimed.as_deref(), &capabilities, errors);

                DecomposedSubtask {
                    id,
                    description: raw.description.trim().to_string(),
                    agent,
                    agent_resolved: resolved,
                    claimed_agent: claimed,
                    required_capabilities: capabilities,
                    dependencies,
                    parallelizable: raw.parallel.unwrap_or(true),
                }
            })
            .collect()
    }

    /// Resolve the agent for a subtask: claimed name (exact, normalized,
    /// fuzzy), then best capability match, then the coordinator.
    fn assign_agent(
        &self,
        subtask: &SubtaskId,
        claimed: Option<&str>,
        capabilities: &std::collections::BTreeSet<Capability>,
        errors: &mut Vec<DecompositionError>,
    ) -> (String, bool) {
        if let Some(claimed) = claimed {
            if let Some((agent, how)) = self.snapshot.resolve_name(claimed) {
                if how != NameMatch::Exact {
                    errors.push(DecompositionError::ApproximateAgent {
                        subtask: subtask.clone(),
                        claimed: claimed.to_string(),
                        resolved: agent.name().to_string(),
                    });
                }
                return (agent.name().to_string(), true);
            }
        }

        let assigned = self
            .snapshot
            .best_capability_match(capabilities)
            .map(|a| a.name().to_string())
            .unwrap_or_else(|| self.coordinator.to_string());

        match claimed {
            Some(claimed) => {
                errors.push(DecompositionError::UnresolvedAgent {
                    subtask: subtask.clone(),
                    claimed: claimed.to_string(),
                    assigned: assigned.clone(),
                });
                (assigned, false)
            }
            None => {
                errors.push(DecompositionError::UnassignedAgent {
                    subtask: subtask.clone(),
                    assigned: assigned.clone(),
                });
                (assigned, true)
            }
        }
    }
}

/// Resolve a dependency reference: final id, then raw id, then 1-based position.
fn resolve_reference(
    reference: &str,
    taken: &HashSet<SubtaskId>,
    by_raw_id: &HashMap<String, SubtaskId>,
    by_position: &HashMap<usize, SubtaskId>,
) -> Option<SubtaskId> {
    let reference = reference.trim();
    let as_id = SubtaskId::new(reference);
    if taken.contains(&as_id) {
        return Some(as_id);
    }
    if let Some(id) = by_raw_id.get(reference) {
        return Some(id.clone());
    }
    // "2", "step 2", "#2"
    let digits: String = reference
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let position: usize = digits.parse().ok()?;
    by_position.get(&position).cloned()
}

// ---------------------------------------------------------------------------
// Structured tier
// ---------------------------------------------------------------------------

fn parse_structured(text: &str) -> Option<Vec<RawSubtask>> {
    let mut candidates: Vec<&str> = fenced_blocks(text);
    candidates.push(text);

    for candidate in candidates {
        for (start, _) in candidate.match_indices(['{', '[']) {
            let Some(slice) = balanced_slice(&candidate[start..]) else {
                continue;
            };
            let cleaned = strip_trailing_commas(slice);
            let Ok(value) = serde_json::from_str::<Value>(&cleaned) else {
                continue;
            };
            if let Some(raws) = subtasks_from_value(&value) {
                return Some(raws);
            }
        }
    }
    None
}

/// Contents of every ``` fenced block, in order.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        // Skip the language tag line
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(body[..close].trim());
        rest = &body[close + 3..];
    }
    blocks
}

/// The first balanced `{...}` or `[...]` at the start of `text`, ignoring
/// brackets inside strings.
fn balanced_slice(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove commas directly followed (modulo whitespace) by `}` or `]`.
fn strip_trailing_commas(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn subtasks_from_value(value: &Value) -> Option<Vec<RawSubtask>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))?,
        _ => return None,
    };
    let raws: Vec<RawSubtask> = items.iter().filter_map(raw_from_value).collect();
    (!raws.is_empty()).then_some(raws)
}

fn raw_from_value(value: &Value) -> Option<RawSubtask> {
    match value {
        Value::String(description) => Some(RawSubtask {
            description: description.clone(),
            ..RawSubtask::default()
        }),
        Value::Object(map) => Some(RawSubtask {
            id: field(map, ID_KEYS).and_then(scalar_string),
            description: field(map, DESCRIPTION_KEYS)
                .and_then(scalar_string)
                .unwrap_or_default(),
            agent: field(map, AGENT_KEYS).and_then(scalar_string),
            dependencies: field(map, DEPENDENCY_KEYS)
                .map(string_list)
                .unwrap_or_default(),
            parallel: field(map, PARALLEL_KEYS).and_then(|v| match v {
                Value::Bool(b) => Some(*b),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }),
            capabilities: field(map, CAPABILITY_KEYS)
                .map(string_list)
                .unwrap_or_default(),
        }),
        _ => None,
    }
}

fn field<'v>(map: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v Value> {
    keys.iter()
        .find_map(|key| map.get(*key))
        .filter(|v| !v.is_null())
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A list of strings/numbers, a single scalar, or a comma-separated string.
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_string).collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Numbered-list tier
// ---------------------------------------------------------------------------

fn parse_numbered_list(text: &str) -> Option<Vec<RawSubtask>> {
    let item = Regex::new(r"^\s*(?:(\d+)[.)]|[-*•])\s+(.+?)\s*$").ok()?;
    let leading_agent = Regex::new(r"^\[([^\]]+)\]\s*").ok()?;
    let agent_tag = Regex::new(r"(?i)\((?:agent|assigned(?:\s+to)?)\s*:\s*([^)]+)\)").ok()?;
    let deps_tag = Regex::new(r"(?i)\((?:depends\s+on|after|deps?)\s*:?\s*([^)]*)\)").ok()?;
    let sequential_tag = Regex::new(r"(?i)\(sequential\)").ok()?;

    let mut raws = Vec::new();
    for line in text.lines() {
        let Some(caps) = item.captures(line) else {
            continue;
        };
        let id = caps.get(1).map(|m| m.as_str().to_string());
        let mut body = caps.get(2).map(|m| m.as_str()).unwrap_or_default().to_string();

        let mut agent = None;
        if let Some(m) = leading_agent.captures(&body) {
            agent = m.get(1).map(|a| a.as_str().trim().to_string());
            body = leading_agent.replace(&body, "").into_owned();
        }
        if let Some(m) = agent_tag.captures(&body) {
            agent = m.get(1).map(|a| a.as_str().trim().to_string());
        }
        let dependencies = deps_tag
            .captures(&body)
            .and_then(|m| m.get(1))
            .map(|m| {
                m.as_str()
                    .split([',', ' '])
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("and"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let parallel = sequential_tag.is_match(&body).then_some(false);

        let body = agent_tag.replace_all(&body, "");
        let body = deps_tag.replace_all(&body, "");
        let body = sequential_tag.replace_all(&body, "");

        raws.push(RawSubtask {
            id,
            description: body.trim().to_string(),
            agent,
            dependencies,
            parallel,
            capabilities: Vec::new(),
        });
    }

    (!raws.is_empty()).then_some(raws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentDescriptor;

    fn snapshot() -> RegistrySnapshot {
        RegistrySnapshot::from_descriptors(vec![
            AgentDescriptor::new("coordinator", ["coordination"]),
            AgentDescriptor::new("researcher", ["web-search", "summarize"]),
            AgentDescriptor::new("coder", ["coding"]),
            AgentDescriptor::new("writer", ["writing"]),
        ])
    }

    fn decompose(analysis: &str) -> TaskDecomposition {
        let snapshot = snapshot();
        TaskDecomposer::new(&snapshot, "coordinator")
            .decompose(analysis, &AgentTask::new("Build a report"))
    }

    fn deps(d: &TaskDecomposition, at: usize) -> Vec<&str> {
        d.subtasks()[at]
            .dependencies
            .iter()
            .map(SubtaskId::as_str)
            .collect()
    }

    #[test]
    fn test_structured_fenced_json_with_trailing_commas() {
        let analysis = r#"Here is the plan:
```json
{"subtasks": [
  {"id": "research", "description": "Find sources", "agent": "researcher",},
  {"id": "write", "task": "Draft the report {with braces}", "assigned_agent": "Writer",
   "depends_on": ["research"], "parallel": false},
]}
```
Done."#;
        let d = decompose(analysis);

        assert_eq!(d.source(), DecompositionSource::Structured);
        assert_eq!(d.len(), 2);
        assert_eq!(d.subtasks()[0].agent, "researcher");
        assert_eq!(d.subtasks()[1].description, "Draft the report {with braces}");
        assert_eq!(d.subtasks()[1].agent, "writer");
        assert!(!d.subtasks()[1].parallelizable);
        assert_eq!(deps(&d, 1), vec!["research"]);
        assert!(d.warnings().is_empty());
    }

    #[test]
    fn test_structured_bare_array_with_numeric_ids() {
        let analysis = r#"[
            {"id": 1, "goal": "Collect data", "agent": "researcher"},
            {"id": 2, "goal": "Analyze data", "agent": "coder", "deps": [1]},
            {"id": 3, "goal": "Write it up", "agent": "writer", "after": "1, 2"}
        ]"#;
        let d = decompose(analysis);

        let ids: Vec<_> = d.ids().map(SubtaskId::as_str).collect();
        assert_eq!(ids, vec!["subtask-1", "subtask-2", "subtask-3"]);
        assert_eq!(deps(&d, 1), vec!["subtask-1"]);
        assert_eq!(deps(&d, 2), vec!["subtask-1", "subtask-2"]);
    }

    #[test]
    fn test_missing_and_duplicate_ids() {
        let analysis = r#"{"tasks": [
            {"description": "A", "agent": "coder"},
            {"id": "x", "description": "B", "agent": "coder"},
            {"id": "x", "description": "C", "agent": "coder", "dependencies": ["x"]},
            {"description": "", "agent": "coder"}
        ]}"#;
        let d = decompose(analysis);

        let ids: Vec<_> = d.ids().map(SubtaskId::as_str).collect();
        assert_eq!(ids, vec!["subtask-1", "x", "x-2"]);
        // "x" resolves to the first subtask that claimed it
        assert_eq!(deps(&d, 2), vec!["x"]);
        assert!(d.warnings().iter().any(|w| w.contains("Duplicate")));
        assert!(d.warnings().iter().any(|w| w.contains("no description")));
    }

    #[test]
    fn test_positions_count_dropped_entries() {
        let analysis = r#"{"subtasks": [
            {"description": "  ", "agent": "coder"},
            {"description": "Collect data", "agent": "researcher"},
            {"description": "Chart it", "agent": "coder", "dependencies": ["2"]},
            {"description": "Write it up", "agent": "writer", "dependencies": ["step 3"]}
        ]}"#;
        let d = decompose(analysis);

        let ids: Vec<_> = d.ids().map(SubtaskId::as_str).collect();
        assert_eq!(ids, vec!["subtask-2", "subtask-3", "subtask-4"]);
        assert_eq!(deps(&d, 1), vec!["subtask-2"]);
        assert_eq!(deps(&d, 2), vec!["subtask-3"]);
        assert!(d.warnings().iter().any(|w| w.contains("no description")));
    }

    #[test]
    fn test_unknown_and_self_dependencies_dropped() {
        let analysis = r#"{"steps": [
            {"id": "a", "description": "A", "agent": "coder", "dependencies": ["a", "ghost"]},
            {"id": "b", "description": "B", "agent": "coder", "dependencies": ["1"]}
        ]}"#;
        let d = decompose(analysis);

        assert!(deps(&d, 0).is_empty());
        // Positional reference
        assert_eq!(deps(&d, 1), vec!["a"]);
        assert_eq!(d.warnings().len(), 2);
    }

    #[test]
    fn test_agent_resolution_tiers() {
        let analysis = r#"{"subtasks": [
            {"id": "1", "description": "exact", "agent": "CODER"},
            {"id": "2", "description": "fuzzy", "agent": "researchr"},
            {"id": "3", "description": "by capability", "agent": "designer", "capabilities": ["writing"]},
            {"id": "4", "description": "nothing matches", "agent": "designer"},
            {"id": "5", "description": "unassigned"}
        ]}"#;
        let d = decompose(analysis);
        let s = d.subtasks();

        assert_eq!((s[0].agent.as_str(), s[0].agent_resolved), ("coder", true));
        assert_eq!((s[1].agent.as_str(), s[1].agent_resolved), ("researcher", true));
        assert_eq!((s[2].agent.as_str(), s[2].agent_resolved), ("writer", false));
        assert_eq!(s[2].claimed_agent.as_deref(), Some("designer"));
        assert_eq!((s[3].agent.as_str(), s[3].agent_resolved), ("coordinator", false));
        assert_eq!((s[4].agent.as_str(), s[4].agent_resolved), ("coordinator", true));
        assert_eq!(d.warnings().len(), 4);
    }

    #[test]
    fn test_numbered_list_tier() {
        let analysis = "Plan:\n\
            1. Gather pricing data (agent: researcher)\n\
            2. Build the comparison table (agent: coder) (depends on: 1)\n\
            3. [writer] Write the summary (depends on: 1, 2) (sequential)\n";
        let d = decompose(analysis);

        assert_eq!(d.source(), DecompositionSource::NumberedList);
        assert_eq!(d.len(), 3);
        assert_eq!(d.subtasks()[0].description, "Gather pricing data");
        assert_eq!(d.subtasks()[1].agent, "coder");
        assert_eq!(deps(&d, 1), vec!["subtask-1"]);
        assert_eq!(d.subtasks()[2].agent, "writer");
        assert_eq!(d.subtasks()[2].description, "Write the summary");
        assert_eq!(deps(&d, 2), vec!["subtask-1", "subtask-2"]);
        assert!(!d.subtasks()[2].parallelizable);
    }

    #[test]
    fn test_fallback_on_prose() {
        let d = decompose("I think we should just do the whole thing at once.");

        assert_eq!(d.source(), DecompositionSource::Fallback);
        assert_eq!(d.len(), 1);
        assert_eq!(d.subtasks()[0].id.as_str(), "subtask-1");
        assert_eq!(d.subtasks()[0].description, "Build a report");
        assert_eq!(d.subtasks()[0].agent, "coordinator");
        assert!(!d.warnings().is_empty());
    }

    #[test]
    fn test_fallback_uses_capability_match() {
        let snapshot = snapshot();
        let task = AgentTask::new("Fix the bug").with_capabilities(["coding"]);
        let d = TaskDecomposer::new(&snapshot, "coordinator").decompose("", &task);
        assert_eq!(d.subtasks()[0].agent, "coder");
    }

    #[test]
    fn test_cycles_are_repaired() {
        let analysis = r#"[
            {"id": "a", "description": "A", "agent": "coder", "dependencies": ["b"]},
            {"id": "b", "description": "B", "agent": "coder", "dependencies": ["a"]}
        ]"#;
        let d = decompose(analysis);

        assert_eq!(deps(&d, 0), vec!["b"]);
        assert!(deps(&d, 1).is_empty());
        assert!(d.warnings().iter().any(|w| w.contains("cycle")));
    }

    #[test]
    fn test_balanced_slice_ignores_brackets_in_strings() {
        let text = r#"{"a": "}]", "b": [1, {"c": 2}]} trailing"#;
        assert_eq!(balanced_slice(text), Some(r#"{"a": "}]", "b": [1, {"c": 2}]}"#));
        assert_eq!(balanced_slice("{ unclosed"), None);
    }

    #[test]
    fn test_strip_trailing_commas_keeps_string_content() {
        assert_eq!(strip_trailing_commas(r#"[1, 2, ]"#), "[1, 2 ]");
        assert_eq!(strip_trailing_commas(r#"{"a": ",}"}"#), r#"{"a": ",}"}"#);
    }
}
