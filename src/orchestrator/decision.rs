//! Whether to delegate at all, and how.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a delegated task is spread over agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationPattern {
    /// One subtask for the best capability match, no analysis call.
    SingleAgent,
    /// Analyze, decompose, prune, schedule, synthesize.
    #[default]
    Orchestrator,
    /// Every agent covering a required capability works the whole task in one wave.
    Collaborative,
    /// Orchestrator flow plus a final coordinator review of every sink subtask.
    Hierarchical,
}

impl DelegationPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationPattern::SingleAgent => "single_agent",
            DelegationPattern::Orchestrator => "orchestrator",
            DelegationPattern::Collaborative => "collaborative",
            DelegationPattern::Hierarchical => "hierarchical",
        }
    }
}

impl FromStr for DelegationPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "single_agent" | "single" => Ok(DelegationPattern::SingleAgent),
            "orchestrator" => Ok(DelegationPattern::Orchestrator),
            "collaborative" => Ok(DelegationPattern::Collaborative),
            "hierarchical" => Ok(DelegationPattern::Hierarchical),
            other => Err(format!("unknown delegation pattern '{}'", other)),
        }
    }
}

/// Outcome of the decision phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationDecision {
    pub delegate: bool,
    pub reason: String,
}

/// Inputs shorter than this (in words) are answered directly unless they
/// carry a multi-step marker.
pub const SHORT_INPUT_WORDS: usize = 12;

const MULTI_STEP_MARKERS: &[&str] = &[
    "and then",
    "after that",
    "afterwards",
    "first",
    "then",
    "finally",
    "step by step",
    "steps",
    "compare",
    "research",
    "analyze",
    "analyse",
    "implement",
    "plan",
    "write a report",
    "summarize",
];

const GREETINGS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "hiya",
    "yo",
    "thanks",
    "thank you",
    "thx",
    "good morning",
    "good afternoon",
    "good evening",
    "how are you",
    "bye",
    "goodbye",
];

/// Input that is only a greeting or pleasantry, possibly with a couple of
/// trailing words ("hi there").
fn is_greeting(normalized: &str) -> bool {
    GREETINGS.iter().any(|g| {
        normalized == *g
            || normalized.strip_prefix(g).is_some_and(|rest| {
                rest.starts_with(' ') && rest.split_whitespace().count() <= 2
            })
    })
}

fn normalize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn has_multi_step_marker(input: &str, normalized: &str) -> bool {
    let padded = format!(" {} ", normalized);
    let marker = MULTI_STEP_MARKERS
        .iter()
        .any(|m| padded.contains(&format!(" {} ", m)));
    // Enumerations such as "1. foo\n2. bar"
    let enumerated = input
        .lines()
        .filter(|l| {
            let l = l.trim_start();
            l.starts_with("- ")
                || (l.chars().next().is_some_and(|c| c.is_ascii_digit()) && l.contains('.'))
        })
        .count()
        >= 2;
    let questions = input.matches('?').count() >= 2;
    marker || enumerated || questions
}

/// Cheap heuristic: should this input go through the full orchestration?
///
/// # Postconditions
/// - Greetings and short inputs without multi-step markers are not delegated
pub fn decide(input: &str) -> DelegationDecision {
    let normalized = normalize(input);
    if normalized.is_empty() {
        return DelegationDecision {
            delegate: false,
            reason: "empty input".to_string(),
        };
    }
    if is_greeting(&normalized) {
        return DelegationDecision {
            delegate: false,
            reason: "greeting".to_string(),
        };
    }

    let words = normalized.split_whitespace().count();
    if has_multi_step_marker(input, &normalized) {
        return DelegationDecision {
            delegate: true,
            reason: "multi-step request".to_string(),
        };
    }
    if words < SHORT_INPUT_WORDS {
        return DelegationDecision {
            delegate: false,
            reason: format!("short input ({} words)", words),
        };
    }
    DelegationDecision {
        delegate: true,
        reason: format!("long input ({} words)", words),
    }
}
