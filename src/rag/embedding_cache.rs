//! Persistent embedding cache keyed by (model, content)
//!
//! Cache keys are `model_name + ":" + uuid5(DNS, text)`, so entries from
//! different embedding models never collide and re-indexing identical text
//! costs one row lookup instead of a model call.

use crate::error::Result;
use crate::rag::embeddings::{Embedder, EMBED_BATCH_SIZE};
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

/// SQLite-backed embedding cache shared across projects
#[derive(Clone)]
pub struct EmbeddingCache {
    pool: SqlitePool,
}

impl EmbeddingCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Deterministic cache key for one (model, text) pair
    pub fn cache_key(model_name: &str, text: &str) -> String {
        format!(
            "{}:{}",
            model_name,
            Uuid::new_v5(&Uuid::NAMESPACE_DNS, text.as_bytes())
        )
    }

    /// Return one vector per input text, computing and persisting any that
    /// are not cached yet. Writes use an upsert so racing writers cannot
    /// duplicate rows.
    pub async fn embed_cached(
        &self,
        embedder: &dyn Embedder,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let model_name = embedder.model_name();
        let mut out: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];
        let mut missing: Vec<(usize, String, String)> = Vec::new();

        for (idx, text) in texts.iter().enumerate() {
            let key = Self::cache_key(model_name, text);
            let row = sqlx::query("SELECT vector_json FROM embeddings_cache WHERE cache_key = ?1")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => {
                    let vector_json: String = row.get("vector_json");
                    out[idx] = serde_json::from_str(&vector_json)?;
                }
                None => missing.push((idx, key, text.clone())),
            }
        }

        if missing.is_empty() {
            return Ok(out);
        }
        debug!(
            "Embedding cache: {} hits, {} misses ({})",
            texts.len() - missing.len(),
            missing.len(),
            model_name
        );

        for batch in missing.chunks(EMBED_BATCH_SIZE) {
            let batch_texts: Vec<String> = batch.iter().map(|(_, _, t)| t.clone()).collect();
            let vectors = embedder.embed_texts(&batch_texts).await?;
            let now = Utc::now().to_rfc3339();

            for ((idx, key, _), vector) in batch.iter().zip(vectors) {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO embeddings_cache (cache_key, model_name, vector_json, created_at)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                )
                .bind(key)
                .bind(model_name)
                .bind(serde_json::to_string(&vector)?)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                out[*idx] = vector;
            }
        }

        Ok(out)
    }
}
