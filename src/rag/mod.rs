//! Hybrid retrieval-augmented context engine
//!
//! Chunk storage with keyword and vector secondary indexes, a cached
//! embedding layer, dual-channel retrieval with reranking and quota
//! selection, and context assembly for the writing agents.

pub mod chunker;
pub mod context;
pub mod embedding_cache;
pub mod embeddings;
pub mod rerank;
pub mod retriever;
pub mod store;
pub mod types;
pub mod vector_index;

pub use chunker::{chunk_novel_text, ChunkedText};
pub use context::build_context;
pub use embedding_cache::EmbeddingCache;
pub use embeddings::{Embedder, MockEmbedder};
pub use rerank::{MockReranker, Reranker, RerankerKind};
pub use retriever::Retriever;
pub use store::{ChunkStore, IndexOutcome, TypeStats};
pub use types::{Channel, Chunk, DegradedNotes, RetrievalDebug, RetrievalFilters, ALL_DOC_TYPES};
pub use vector_index::{SqliteVectorIndex, VectorIndex, VectorRecord};
