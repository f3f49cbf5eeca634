//! Embedder port and backends
//!
//! Dense vectors are always unit-norm in the embedder's configured
//! dimension; the cache and the vector index both rely on that. The mock
//! backend hashes the input into a seed and draws a pseudo-random vector,
//! so tests get stable embeddings without any model on disk.

use crate::error::{RagError, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Fixed batch size for embedding calls, bounding peak memory
pub const EMBED_BATCH_SIZE: usize = 16;

/// Trait for dense embedding backends
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of documents
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a retrieval query
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>>;

    /// Model identifier, used to scope the embedding cache
    fn model_name(&self) -> &str;

    /// Output vector dimension
    fn dimension(&self) -> usize;
}

/// Scale a vector to unit L2 norm; zero vectors are returned unchanged
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// Hash-seeded pseudo-random embedder for tests and offline runs
pub struct MockEmbedder {
    dim: usize,
    model_name: String,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            model_name: format!("mock-hash-{}", dim),
        }
    }

    fn vec_for(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());
        let raw: Vec<f32> = (0..self.dim).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        l2_normalize(raw)
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vec_for(t)).collect())
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        Ok(self.vec_for(query))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Local BGE-family embedder backed by fastembed
#[cfg(feature = "local-models")]
pub struct LocalBgeEmbedder {
    model: std::sync::Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    model_name: String,
    dim: usize,
}

#[cfg(feature = "local-models")]
impl LocalBgeEmbedder {
    /// Load a supported local embedding model; unknown names fail so the
    /// caller can downgrade to the mock with a recorded note.
    pub fn new(model_name: &str) -> Result<Self> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let (model_id, dim) = match model_name {
            "BAAI/bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
            "BAAI/bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
            "BAAI/bge-large-en-v1.5" => (EmbeddingModel::BGELargeENV15, 1024),
            other => {
                return Err(RagError::BackendUnavailable(format!(
                    "unsupported local embedding model: {}",
                    other
                ))
                .into())
            }
        };

        let model = TextEmbedding::try_new(InitOptions::new(model_id))
            .map_err(|e| RagError::BackendUnavailable(e.to_string()))?;

        Ok(Self {
            model: std::sync::Arc::new(std::sync::Mutex::new(model)),
            model_name: model_name.to_string(),
            dim,
        })
    }
}

#[cfg(feature = "local-models")]
#[async_trait]
impl Embedder for LocalBgeEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let docs = texts.to_vec();
        let vectors = tokio::task::spawn_blocking(move || {
            let model = model.lock().expect("embedding model lock");
            model.embed(docs, Some(EMBED_BATCH_SIZE))
        })
        .await
        .map_err(|e| RagError::EmbeddingFailed(e.to_string()))?
        .map_err(|e| RagError::EmbeddingFailed(e.to_string()))?;

        Ok(vectors.into_iter().map(l2_normalize).collect())
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_texts(&[query.to_string()]).await?;
        out.pop()
            .ok_or_else(|| RagError::EmbeddingFailed("empty embedding batch".to_string()).into())
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
