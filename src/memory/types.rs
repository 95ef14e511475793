//! Types for the retrieval and summarization boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::budget::estimate_tokens;

/// A retrieved piece of prior content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Relevance score (higher is more relevant).
    pub score: f64,
}

impl Chunk {
    pub fn new(content: impl Into<String>, score: f64) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
            score,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// How a query is matched against passages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Relevance-ranked term matching.
    #[default]
    Ranked,
    /// The query is a case-insensitive regex; every hit scores 1.0 and hits
    /// come back in index order.
    Exact,
}

/// Where a retrieval query may look.
///
/// Empty `sources` means "any source"; `filters` are exact metadata matches.
/// With `task_id` set, passages tagged with a different `task_id` are
/// excluded; untagged passages stay visible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub sources: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub mode: SearchMode,
}

impl SearchScope {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task_id: None,
            sources: sources.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Match the query as a regex instead of ranking terms.
    pub fn exact(mut self) -> Self {
        self.mode = SearchMode::Exact;
        self
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }

    /// Check whether a chunk's metadata falls inside this scope.
    pub fn admits(&self, metadata: &BTreeMap<String, serde_json::Value>) -> bool {
        let source_ok = self.sources.is_empty()
            || metadata
                .get("source")
                .and_then(|v| v.as_str())
                .map(|s| self.sources.iter().any(|want| want == s))
                .unwrap_or(false);
        let task_ok = match (&self.task_id, metadata.get("task_id")) {
            (Some(want), Some(have)) => have.as_str() == Some(want.as_str()),
            _ => true,
        };
        source_ok
            && task_ok
            && self
                .filters
                .iter()
                .all(|(k, v)| metadata.get(k) == Some(v))
    }
}

/// Errors from a retrieval backend. Callers degrade gracefully on both.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrievalError {
    #[error("Corpus not indexed: {0}")]
    NotIndexed(String),

    #[error("Retriever unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid search pattern: {0}")]
    InvalidPattern(String),
}
