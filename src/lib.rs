//! novelforge: narrative writing core
//!
//! Orchestrates LLM agents (outline, characters, chapter expansion,
//! consistency critique, post-write extraction) over persistent project
//! state. The load-bearing piece is the hybrid retrieval-augmented context
//! engine: durable chunk storage with keyword and vector indexes, an
//! embedding cache, dual-channel retrieval with reranking and per-type
//! quotas, and write-back indexing that preserves point-in-time causality
//! between chapters.
//!
//! # Example
//!
//! ```rust,no_run
//! use novelforge::{NovelService, Settings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::from_env()?;
//!     let service = NovelService::from_settings(settings).await?;
//!
//!     let (project, _logs) = service
//!         .create_project("mystery", "a fog-bound port town", "noir", "tide,fog", "adult", 12)
//!         .await?;
//!
//!     println!("project created: {}", project.id);
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod api;
pub mod config;
pub mod critic;
pub mod error;
pub mod llm;
pub mod rag;
pub mod service;
pub mod storage;
pub mod writeback;

// Re-export main types
pub use agents::{CharacterAgent, CharacterSheet, OutlineAgent, WriterAgent};
pub use config::Settings;
pub use critic::{ConsistencyCritic, CriticIssue, CriticReview};
pub use error::{LlmError, NovelError, RagError, Result};
pub use llm::{parse_llm_json, CompletionClient, MockCompletionClient, OpenAiCompatClient};
pub use rag::{
    build_context, chunk_novel_text, Channel, Chunk, ChunkStore, DegradedNotes, Embedder,
    EmbeddingCache, MockEmbedder, MockReranker, Reranker, RetrievalDebug, RetrievalFilters,
    Retriever, SqliteVectorIndex, VectorIndex, ALL_DOC_TYPES,
};
pub use service::{CoreBuilder, ExpandOutcome, NovelService, RetrievedChunkSummary};
pub use storage::{AgentLog, Chapter, Project, ProjectStore};
pub use writeback::{ExtractedMemory, WritebackExtractor};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
