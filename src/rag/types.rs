//! Type definitions for the retrieval engine

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Every document type the chunk store understands, in context order
pub const ALL_DOC_TYPES: [&str; 8] = [
    "style_guide",
    "world",
    "outline",
    "characters",
    "chapter_summary",
    "facts",
    "foreshadowing",
    "chapter",
];

/// Origin of a retrieval hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub enum Channel {
    #[serde(rename = "vector")]
    Vector,
    #[serde(rename = "keyword")]
    Keyword,
    #[serde(rename = "vector+keyword")]
    VectorKeyword,
    #[serde(rename = "rerank")]
    Rerank,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Vector => write!(f, "vector"),
            Channel::Keyword => write!(f, "keyword"),
            Channel::VectorKeyword => write!(f, "vector+keyword"),
            Channel::Rerank => write!(f, "rerank"),
        }
    }
}

/// A retrievable, indexed unit of text with facets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub project_id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub text: String,
    pub snippet: String,
    pub score: f64,
    pub channel: Channel,
    /// Free-form facet mirror: source_id, chapter_no, characters, pov, ...
    pub metadata: serde_json::Value,
}

impl Chunk {
    /// Chapter number facet, when present
    pub fn chapter_no(&self) -> Option<i64> {
        self.metadata.get("chapter_no").and_then(|v| v.as_i64())
    }

    /// Source document facet, when present
    pub fn source_id(&self) -> Option<&str> {
        self.metadata.get("source_id").and_then(|v| v.as_str())
    }
}

/// Filters steering one retrieval call
#[derive(Debug, Clone)]
pub struct RetrievalFilters {
    /// Restrict hits to these document types
    pub types: Option<Vec<String>>,
    /// Target chapter the caller is writing
    pub chapter_no: Option<i64>,
    /// Exclude chapter chunks at or beyond the target chapter
    pub chapter_only_before: bool,
    /// Dense channel fan-out; defaults to `max(6, top_k)`
    pub top_k_v: Option<usize>,
    /// Sparse channel fan-out; defaults to `max(6, top_k)`
    pub top_k_kw: Option<usize>,
}

impl Default for RetrievalFilters {
    fn default() -> Self {
        Self {
            types: None,
            chapter_no: None,
            chapter_only_before: true,
            top_k_v: None,
            top_k_kw: None,
        }
    }
}

/// Per-stage view of one retrieval, used by the preview endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalDebug {
    pub query: String,
    pub vector_results: Vec<Chunk>,
    pub keyword_results: Vec<Chunk>,
    pub merged_candidates: Vec<Chunk>,
    pub final_selected: Vec<Chunk>,
    pub context_string: String,
}

/// Shared sink for degraded-mode notes.
///
/// The chunk store and the retriever both record fallbacks here; the
/// orchestrator drains them into the project event log after each call.
#[derive(Debug, Clone, Default)]
pub struct DegradedNotes {
    notes: Arc<Mutex<Vec<String>>>,
}

impl DegradedNotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, note: impl Into<String>) {
        self.notes.lock().expect("notes lock").push(note.into());
    }

    /// Take all accumulated notes, leaving the sink empty
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.notes.lock().expect("notes lock"))
    }
}
