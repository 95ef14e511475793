//! Retrieval backends for context isolation.
//!
//! [`RagRetriever`] is the seam to any semantic-search service. The bundled
//! [`LexicalRetriever`] is an in-process term-frequency index over passages
//! with source metadata, good enough to run the RAG path locally.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::json;

use super::types::{Chunk, RetrievalError, SearchMode, SearchScope};
use crate::agents::ContextMessage;

/// Semantic retrieval over a conversation/document corpus.
#[async_trait]
pub trait RagRetriever: Send + Sync {
    /// Return at most `top_k` chunks ordered by descending score.
    async fn search(
        &self,
        query: &str,
        scope: &SearchScope,
        top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError>;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "of", "on", "or", "that", "the", "then", "this", "to", "with",
];

/// Lowercased alphanumeric terms with stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

struct Passage {
    content: String,
    metadata: BTreeMap<String, serde_json::Value>,
    term_counts: HashMap<String, usize>,
    length: usize,
}

impl Passage {
    fn to_chunk(&self, score: f64) -> Chunk {
        Chunk {
            content: self.content.clone(),
            metadata: self.metadata.clone(),
            score,
        }
    }
}

/// Statistics about an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub passages: usize,
    pub sources: Vec<String>,
}

/// In-memory term-frequency index.
#[derive(Default)]
pub struct LexicalRetriever {
    passages: RwLock<Vec<Passage>>,
}

impl LexicalRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a passage. Empty passages are skipped.
    ///
    /// Returns `true` if the passage was indexed.
    pub fn add_text(
        &self,
        content: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> bool {
        let content = content.into();
        if content.trim().is_empty() {
            return false;
        }
        let terms = tokenize(&content);
        let mut term_counts = HashMap::new();
        for term in &terms {
            *term_counts.entry(term.clone()).or_insert(0) += 1;
        }
        let passage = Passage {
            length: terms.len().max(1),
            content,
            metadata,
            term_counts,
        };
        self.passages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(passage);
        true
    }

    /// Index every message of a conversation under `source`.
    pub fn index_conversation(&self, source: &str, messages: &[ContextMessage]) -> usize {
        messages
            .iter()
            .enumerate()
            .filter(|(position, message)| {
                let mut metadata = BTreeMap::new();
                metadata.insert("source".to_string(), json!(source));
                metadata.insert("role".to_string(), json!(message.role.to_string()));
                metadata.insert("position".to_string(), json!(position));
                self.add_text(message.content.clone(), metadata)
            })
            .count()
    }

    pub fn stats(&self) -> IndexStats {
        let passages = self.passages.read().unwrap_or_else(PoisonError::into_inner);
        let mut sources: Vec<String> = passages
            .iter()
            .filter_map(|p| p.metadata.get("source").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sources.sort();
        IndexStats {
            passages: passages.len(),
            sources,
        }
    }
}

#[async_trait]
impl RagRetriever for LexicalRetriever {
    async fn search(
        &self,
        query: &str,
        scope: &SearchScope,
        top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError> {
        let passages = self.passages.read().unwrap_or_else(PoisonError::into_inner);
        if passages.is_empty() {
            return Err(RetrievalError::NotIndexed(
                "no passages have been indexed".to_string(),
            ));
        }

        let candidates = passages.iter().filter(|p| scope.admits(&p.metadata));
        if scope.mode == SearchMode::Exact {
            let pattern = RegexBuilder::new(query)
                .case_insensitive(true)
                .build()
                .map_err(|e| RetrievalError::InvalidPattern(e.to_string()))?;
            return Ok(candidates
                .filter(|p| pattern.is_match(&p.content))
                .take(top_k)
                .map(|p| p.to_chunk(1.0))
                .collect());
        }

        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let candidates: Vec<&Passage> = candidates.collect();
        let n = candidates.len() as f64;
        let document_frequency: HashMap<&str, f64> = query_terms
            .iter()
            .map(|term| {
                let df = candidates
                    .iter()
                    .filter(|p| p.term_counts.contains_key(term))
                    .count();
                (term.as_str(), df as f64)
            })
            .collect();

        let mut scored: Vec<(f64, usize, &Passage)> = candidates
            .iter()
            .enumerate()
            .filter_map(|(i, passage)| {
                let score: f64 = query_terms
                    .iter()
                    .filter_map(|term| {
                        let tf = *passage.term_counts.get(term)? as f64;
                        let df = document_frequency.get(term.as_str()).copied()?;
                        let idf = (1.0 + n / df).ln();
                        let norm_tf = tf / (tf + 1.2 * (passage.length as f64 / 50.0).max(0.5));
                        Some(idf * norm_tf)
                    })
                    .sum();
                (score > 0.0).then_some((score, i, *passage))
            })
            .collect();

        // Highest score first; earlier passages win ties
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, _, p)| p.to_chunk(score))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stopwords_and_punctuation() {
        assert_eq!(
            tokenize("Fetch the latest PRICE, then plot it!"),
            vec!["fetch", "latest", "price", "plot"]
        );
    }

    #[tokio::test]
    async fn test_search_unindexed_corpus_errors() {
        let retriever = LexicalRetriever::new();
        let err = retriever
            .search("anything", &SearchScope::any(), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::NotIndexed(_)));
    }

    #[tokio::test]
    async fn test_search_ranks_relevant_passages_first() {
        let retriever = LexicalRetriever::new();
        retriever.index_conversation(
            "conversation",
            &[
                ContextMessage::user("We deployed the billing service on Tuesday"),
                ContextMessage::assistant("The weather in Lisbon was sunny"),
                ContextMessage::user("Billing service latency spiked after the deploy"),
            ],
        );

        let chunks = retriever
            .search("billing latency", &SearchScope::any(), 2)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("latency"));
        assert!(chunks[0].score >= chunks[1].score);
        assert!(chunks.iter().all(|c| !c.content.contains("Lisbon")));
    }

    #[tokio::test]
    async fn test_search_respects_scope() {
        let retriever = LexicalRetriever::new();
        let mut doc_meta = BTreeMap::new();
        doc_meta.insert("source".to_string(), json!("documents"));
        retriever.add_text("quarterly revenue report", doc_meta);
        retriever.index_conversation("conversation", &[ContextMessage::user("revenue question")]);

        let chunks = retriever
            .search("revenue", &SearchScope::sources(["documents"]), 5)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata["source"], json!("documents"));

        let stats = retriever.stats();
        assert_eq!(stats.passages, 2);
        assert_eq!(stats.sources, vec!["conversation", "documents"]);
    }

    #[tokio::test]
    async fn test_exact_mode_matches_pattern_within_scope() {
        let retriever = LexicalRetriever::new();
        let mut doc_meta = BTreeMap::new();
        doc_meta.insert("source".to_string(), json!("documents"));
        retriever.add_text("fn parse_config(path: &Path) -> Config", doc_meta.clone());
        retriever.add_text("The config loader is slow", doc_meta);
        retriever.index_conversation(
            "conversation",
            &[ContextMessage::user("Where is PARSE_CONFIG defined?")],
        );

        let scope = SearchScope::sources(["documents"]).exact();
        let chunks = retriever.search(r"parse_\w+\(", &scope, 5).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].score, 1.0);
        assert!(chunks[0].content.starts_with("fn parse_config"));
        assert_eq!(chunks[0].metadata["source"], json!("documents"));

        // Case-insensitive, index order, capped at top_k
        let all = retriever
            .search("parse_config", &SearchScope::any().exact(), 1)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].content.starts_with("fn parse_config"));

        let err = retriever
            .search("parse_(", &SearchScope::any().exact(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidPattern(_)));
    }

    #[tokio::test]
    async fn test_ranking_unchanged_by_scope_size() {
        let retriever = LexicalRetriever::new();
        for i in 0..20 {
            retriever.add_text(format!("routine status update number {i}"), BTreeMap::new());
        }
        retriever.add_text("rare outage in the payments cluster", BTreeMap::new());

        let chunks = retriever
            .search("payments outage status", &SearchScope::any(), 3)
            .await
            .unwrap();
        assert!(chunks[0].content.contains("payments"));
        assert!(chunks[0].score > chunks[1].score);
    }
}
