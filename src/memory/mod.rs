//! Memory subsystem: what each subtask gets to see of the shared context.
//!
//! This module provides:
//! - Retrieval of relevant prior content ([`RagRetriever`], [`LexicalRetriever`])
//! - Summarization ([`Summarizer`], [`GatewaySummarizer`], [`ExtractiveSummarizer`])
//! - Sliding-window compaction of long conversations
//! - Per-subtask context isolation under a token budget
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────┐
//!  AgentContext ─▶│ ContextIsolationBuilder  │─▶ IsolatedContext
//!                 └────────────┬─────────────┘
//!                   ┌──────────┴──────────┐
//!                   ▼                     ▼
//!            ┌─────────────┐      ┌──────────────┐
//!            │ RagRetriever│      │  compaction  │
//!            └─────────────┘      └──────┬───────┘
//!                                        ▼
//!                                 ┌──────────────┐
//!                                 │  Summarizer  │
//!                                 └──────────────┘
//! ```

mod compaction;
mod isolation;
mod retriever;
mod summarizer;
mod types;

pub use compaction::{
    compact_history, render_transcript, CompactedHistory, CompactionPolicy, MAX_SUMMARY_PASSES,
};
pub use isolation::{
    ArtifactVisibility, ContextIsolationBuilder, ContextReport, IsolatedContext, IsolationConfig,
    IsolationRequest,
};
pub use retriever::{tokenize, IndexStats, LexicalRetriever, RagRetriever};
pub use summarizer::{ExtractiveSummarizer, GatewaySummarizer, Summarizer};
pub use types::{Chunk, RetrievalError, SearchMode, SearchScope};
