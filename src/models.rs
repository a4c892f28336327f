//! Core data models used throughout Quarry.
//!
//! These types represent the cache rows, chunks, sections, memories, and
//! session state that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// A cached source row: fetched web page or ingested local document.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub cache_id: String,
    pub canonical_url: String,
    pub content_text: String,
    pub links: Vec<Link>,
    /// Unix seconds of the last successful fetch.
    pub fetched_at: i64,
    pub ttl_seconds: i64,
    pub content_hash: String,
    pub links_hash: String,
}

/// A hyperlink discovered in a cached page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    pub anchor_text: String,
}

/// A chunk of a cached document's text.
///
/// `chunk_id` is deterministic: `chunk:{cache_id}:{index}`. The
/// `embedding_model` column always names the model that produced the
/// vector row referencing this chunk; a model change re-embeds rather
/// than mutating.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub cache_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    pub section_id: Option<String>,
    pub embedding_model: String,
}

/// A document section identified by the heading heuristic.
///
/// Canonical sections are addressable as `section-NNN`; non-canonical
/// sections (tiny or non-body) are listed but refused by summarization.
#[derive(Debug, Clone)]
pub struct Section {
    pub section_id: String,
    pub title: String,
    pub ordinal: i64,
    pub start_byte: usize,
    pub end_byte: usize,
    pub canonical: bool,
    pub aliases: Vec<String>,
}

/// A persisted research insight, scoped to a session when one is active.
#[derive(Debug, Clone)]
pub struct Finding {
    pub finding_id: String,
    pub session_id: Option<String>,
    pub text: String,
    pub created_at: i64,
}

/// A global user memory. Near-duplicates update in place.
#[derive(Debug, Clone)]
pub struct UserMemory {
    pub memory_id: String,
    pub text: String,
    pub tags: Vec<String>,
    pub updated_at: i64,
}

/// Persistent, resumable conversation session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub name: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub compacted_summary: Option<String>,
    pub research_mode: bool,
    /// `"web"`, `"local_only"`, or `"mixed"`.
    pub research_source_mode: Option<String>,
    pub local_corpus_paths: Vec<String>,
}

/// A stored message. `session_id = None` means standalone history
/// (paired user+assistant rows); `Some` means one message in a thread.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: Option<String>,
    pub role: String,
    pub content: String,
    pub summary: Option<String>,
    pub token_count: i64,
    pub timestamp: i64,
}

/// One ranked chunk returned from hybrid retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub text: String,
    /// Fused score in `[0.0, 1.0]`.
    pub score: f64,
    pub source_url: String,
    pub section_id: Option<String>,
}

/// A shortlist candidate after scoring.
#[derive(Debug, Clone, Serialize)]
pub struct ShortlistEntry {
    pub url: String,
    pub score: f64,
    pub title: String,
    pub extracted_text: String,
    pub reasons: Vec<String>,
}

/// How a preloaded source landed in the first model message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadStatus {
    FullContent,
    SummarizedDueBudget,
    SummaryTruncatedDueBudget,
    FetchError,
}

impl PreloadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PreloadStatus::FullContent => "full_content",
            PreloadStatus::SummarizedDueBudget => "summarized_due_budget",
            PreloadStatus::SummaryTruncatedDueBudget => "summary_truncated_due_budget",
            PreloadStatus::FetchError => "fetch_error",
        }
    }
}

/// Which URLs were preloaded for a turn and how.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreloadProvenance {
    pub entries: Vec<(String, PreloadStatus)>,
}

impl PreloadProvenance {
    /// True when every seed landed as `full_content` with no fetch errors.
    pub fn is_complete(&self) -> bool {
        !self.entries.is_empty()
            && self
                .entries
                .iter()
                .all(|(_, s)| *s == PreloadStatus::FullContent)
    }
}
