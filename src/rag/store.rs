//! Durable chunk store
//!
//! Three physical structures are kept in lock-step per chunk: the primary
//! `rag_chunks` table, the FTS5 keyword index and the vector index.
//! Replacement of a `(project, type, source_id)` set is delete-then-insert,
//! atomic for the primary + keyword pair; the vector index is written
//! outside the transaction and is allowed to fail into degraded mode.

use crate::error::Result;
use crate::rag::chunker::{chunk_novel_text, SNIPPET_CHARS};
use crate::rag::embedding_cache::EmbeddingCache;
use crate::rag::embeddings::Embedder;
use crate::rag::types::DegradedNotes;
use crate::rag::vector_index::{VectorIndex, VectorRecord};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of one indexing call
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub indexed_chunks: usize,
}

/// Per-type stats for a project's chunks
#[derive(Debug, Clone, Serialize)]
pub struct TypeStats {
    pub chunks: i64,
    pub last_updated_at: Option<String>,
}

/// Chunk storage with keyword and vector secondary indexes
pub struct ChunkStore {
    pool: SqlitePool,
    vector_index: Arc<dyn VectorIndex>,
    cache: EmbeddingCache,
    embedder: Arc<dyn Embedder>,
    notes: DegradedNotes,
    fts_enabled: bool,
    max_chunk_chars: usize,
    overlap_ratio: f32,
}

impl ChunkStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        vector_index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        notes: DegradedNotes,
        fts_enabled: bool,
        max_chunk_chars: usize,
        overlap_ratio: f32,
    ) -> Self {
        Self {
            cache: EmbeddingCache::new(pool.clone()),
            pool,
            vector_index,
            embedder,
            notes,
            fts_enabled,
            max_chunk_chars,
            overlap_ratio,
        }
    }

    pub fn notes(&self) -> &DegradedNotes {
        &self.notes
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    /// Chunk, embed and index one document, replacing any prior chunks of
    /// the same `(project, type, source_id)` in all three structures.
    pub async fn index_document(
        &self,
        project_id: &str,
        doc_type: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<IndexOutcome> {
        let chunks = chunk_novel_text(text, self.max_chunk_chars, self.overlap_ratio, SNIPPET_CHARS);
        if chunks.is_empty() {
            return Ok(IndexOutcome { indexed_chunks: 0 });
        }

        let source_id = metadata
            .get("source_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let chapter_no = metadata.get("chapter_no").and_then(|v| v.as_i64());
        let facet = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        let characters = facet("characters");
        let locations = facet("locations");
        let pov = facet("pov");

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.cache.embed_cached(self.embedder.as_ref(), &texts).await?;

        let chunk_ids: Vec<String> = chunks.iter().map(|_| Uuid::new_v4().to_string()).collect();
        let created_at = Utc::now().to_rfc3339();

        let mut chunk_metas: Vec<serde_json::Value> = Vec::with_capacity(chunks.len());
        for chunk_id in &chunk_ids {
            let mut meta = match &metadata {
                serde_json::Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            meta.insert("project_id".to_string(), serde_json::json!(project_id));
            meta.insert("type".to_string(), serde_json::json!(doc_type));
            meta.insert("chapter_no".to_string(), serde_json::json!(chapter_no));
            meta.insert("chunk_id".to_string(), serde_json::json!(chunk_id));
            meta.insert("created_at".to_string(), serde_json::json!(created_at));
            meta.insert("source_id".to_string(), serde_json::json!(source_id));
            meta.insert("characters".to_string(), serde_json::json!(characters));
            meta.insert("locations".to_string(), serde_json::json!(locations));
            meta.insert("pov".to_string(), serde_json::json!(pov));
            chunk_metas.push(serde_json::Value::Object(meta));
        }

        let old_ids = if source_id.is_empty() {
            Vec::new()
        } else {
            self.chunk_ids_for_source(project_id, doc_type, &source_id).await?
        };

        // Primary + keyword replacement is a single transaction; a crash
        // can never leave a partially replaced set.
        let mut tx = self.pool.begin().await?;
        for old_id in &old_ids {
            sqlx::query("DELETE FROM rag_chunks WHERE id = ?1")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
            if self.fts_enabled {
                sqlx::query("DELETE FROM rag_chunks_fts WHERE chunk_id = ?1")
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for ((chunk_id, chunk), meta) in chunk_ids.iter().zip(&chunks).zip(&chunk_metas) {
            sqlx::query(
                r#"
                INSERT INTO rag_chunks
                    (id, project_id, type, created_at, source_id, chapter_no, characters, locations, pov, text, snippet, metadata_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(chunk_id)
            .bind(project_id)
            .bind(doc_type)
            .bind(&created_at)
            .bind(&source_id)
            .bind(chapter_no)
            .bind(&characters)
            .bind(&locations)
            .bind(&pov)
            .bind(&chunk.text)
            .bind(&chunk.snippet)
            .bind(serde_json::to_string(meta)?)
            .execute(&mut *tx)
            .await?;

            if self.fts_enabled {
                sqlx::query(
                    "INSERT INTO rag_chunks_fts (chunk_id, project_id, type, chapter_no, text) VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .bind(chunk_id)
                .bind(project_id)
                .bind(doc_type)
                .bind(chapter_no)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        // Vector index writes are best-effort; the primary + keyword pair
        // stays authoritative when they fail.
        let records: Vec<VectorRecord> = chunk_ids
            .iter()
            .zip(&chunks)
            .zip(&vectors)
            .zip(&chunk_metas)
            .map(|(((id, chunk), vector), meta)| VectorRecord {
                id: id.clone(),
                doc_type: doc_type.to_string(),
                embedding: vector.clone(),
                document: chunk.text.clone(),
                metadata: meta.clone(),
            })
            .collect();

        let vector_write = async {
            if !old_ids.is_empty() {
                self.vector_index.delete(project_id, &old_ids).await?;
            }
            self.vector_index.upsert(project_id, &records).await
        };
        if let Err(e) = vector_write.await {
            warn!("Vector index write failed for {}/{}: {}", project_id, doc_type, e);
            self.notes.push(format!(
                "Vector index write failed for type {doc_type}; retrieval degraded to keyword channel. Re-index to retry."
            ));
        }

        debug!(
            "Indexed {} chunks for {}/{} (source {})",
            chunks.len(),
            project_id,
            doc_type,
            source_id
        );
        Ok(IndexOutcome {
            indexed_chunks: chunks.len(),
        })
    }

    /// Remove every chunk of a `(project, type, source_id)` from all three
    /// structures.
    pub async fn delete_by_source(
        &self,
        project_id: &str,
        doc_type: &str,
        source_id: &str,
    ) -> Result<usize> {
        let ids = self.chunk_ids_for_source(project_id, doc_type, source_id).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in &ids {
            sqlx::query("DELETE FROM rag_chunks WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if self.fts_enabled {
                sqlx::query("DELETE FROM rag_chunks_fts WHERE chunk_id = ?1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        if let Err(e) = self.vector_index.delete(project_id, &ids).await {
            warn!("Vector index delete failed for {}/{}: {}", project_id, doc_type, e);
            self.notes.push(format!(
                "Vector index delete failed for type {doc_type}; stale vectors may linger until re-index."
            ));
        }
        Ok(ids.len())
    }

    /// Per-type chunk counts and last update times for a project
    pub async fn stats(&self, project_id: &str) -> Result<HashMap<String, TypeStats>> {
        let rows = sqlx::query(
            r#"
            SELECT type, COUNT(1) AS cnt, MAX(created_at) AS last_ts
            FROM rag_chunks
            WHERE project_id = ?1
            GROUP BY type
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::new();
        for row in rows {
            out.insert(
                row.get::<String, _>("type"),
                TypeStats {
                    chunks: row.get("cnt"),
                    last_updated_at: row.get("last_ts"),
                },
            );
        }
        Ok(out)
    }

    async fn chunk_ids_for_source(
        &self,
        project_id: &str,
        doc_type: &str,
        source_id: &str,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM rag_chunks WHERE project_id = ?1 AND type = ?2 AND source_id = ?3",
        )
        .bind(project_id)
        .bind(doc_type)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;
    use crate::rag::embeddings::MockEmbedder;
    use crate::rag::vector_index::{SqliteVectorIndex, VectorHit};
    use crate::storage::init_db;
    use async_trait::async_trait;

    async fn test_store() -> (ChunkStore, SqlitePool, Arc<SqliteVectorIndex>) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let fts = init_db(&pool).await.unwrap();
        let index = Arc::new(SqliteVectorIndex::in_memory().await.unwrap());
        let store = ChunkStore::new(
            pool.clone(),
            index.clone(),
            Arc::new(MockEmbedder::default()),
            DegradedNotes::new(),
            fts,
            1400,
            0.2,
        );
        (store, pool, index)
    }

    async fn primary_count(pool: &SqlitePool, project: &str) -> i64 {
        sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM rag_chunks WHERE project_id = ?1")
            .bind(project)
            .fetch_one(pool)
            .await
            .unwrap()
            .0
    }

    async fn fts_count(pool: &SqlitePool, project: &str) -> i64 {
        sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM rag_chunks_fts WHERE project_id = ?1")
            .bind(project)
            .fetch_one(pool)
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_three_way_count_parity() {
        let (store, pool, index) = test_store().await;
        let outcome = store
            .index_document(
                "p1",
                "outline",
                "Act one.\n\nAct two.\n\nAct three.",
                serde_json::json!({"source_id": "doc1"}),
            )
            .await
            .unwrap();
        assert!(outcome.indexed_chunks > 0);

        let n = outcome.indexed_chunks as i64;
        assert_eq!(primary_count(&pool, "p1").await, n);
        assert_eq!(fts_count(&pool, "p1").await, n);
        assert_eq!(index.count("p1").await.unwrap() as i64, n);
    }

    #[tokio::test]
    async fn test_empty_input_indexes_nothing() {
        let (store, pool, _) = test_store().await;
        let outcome = store
            .index_document("p1", "world", "   \n\n  ", serde_json::json!({"source_id": "w1"}))
            .await
            .unwrap();
        assert_eq!(outcome.indexed_chunks, 0);
        assert_eq!(primary_count(&pool, "p1").await, 0);
    }

    #[tokio::test]
    async fn test_replacement_law() {
        let (store, pool, index) = test_store().await;
        let meta = serde_json::json!({"source_id": "s1"});
        store
            .index_document("p1", "chapter", "old draft alpha.\n\nold draft beta.", meta.clone())
            .await
            .unwrap();
        let second = store
            .index_document("p1", "chapter", "new draft only.", meta)
            .await
            .unwrap();

        assert_eq!(second.indexed_chunks, 1);
        assert_eq!(primary_count(&pool, "p1").await, 1);
        assert_eq!(fts_count(&pool, "p1").await, 1);
        assert_eq!(index.count("p1").await.unwrap(), 1);

        let text: (String,) = sqlx::query_as("SELECT text FROM rag_chunks WHERE project_id = 'p1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(text.0, "new draft only.");
    }

    #[tokio::test]
    async fn test_delete_by_source() {
        let (store, pool, index) = test_store().await;
        store
            .index_document("p1", "outline", "some outline", serde_json::json!({"source_id": "s1"}))
            .await
            .unwrap();
        let removed = store.delete_by_source("p1", "outline", "s1").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(primary_count(&pool, "p1").await, 0);
        assert_eq!(fts_count(&pool, "p1").await, 0);
        assert_eq!(index.count("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_by_type() {
        let (store, _, _) = test_store().await;
        store
            .index_document("p1", "outline", "beats", serde_json::json!({"source_id": "o1"}))
            .await
            .unwrap();
        store
            .index_document("p1", "facts", "facts text", serde_json::json!({"source_id": "f1"}))
            .await
            .unwrap();

        let stats = store.stats("p1").await.unwrap();
        assert_eq!(stats["outline"].chunks, 1);
        assert_eq!(stats["facts"].chunks, 1);
        assert!(stats["facts"].last_updated_at.is_some());
        assert!(store.stats("p2").await.unwrap().is_empty());
    }

    /// Vector backend that always fails, for degraded-mode coverage
    struct BrokenVectorIndex;

    #[async_trait]
    impl VectorIndex for BrokenVectorIndex {
        async fn upsert(&self, _: &str, _: &[VectorRecord]) -> crate::error::Result<()> {
            Err(RagError::BackendUnavailable("vector backend offline".to_string()).into())
        }
        async fn delete(&self, _: &str, _: &[String]) -> crate::error::Result<()> {
            Err(RagError::BackendUnavailable("vector backend offline".to_string()).into())
        }
        async fn query(
            &self,
            _: &str,
            _: &[f32],
            _: usize,
            _: Option<&[String]>,
        ) -> crate::error::Result<Vec<VectorHit>> {
            Err(RagError::BackendUnavailable("vector backend offline".to_string()).into())
        }
        async fn count(&self, _: &str) -> crate::error::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_vector_failure_is_degraded_not_fatal() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let fts = init_db(&pool).await.unwrap();
        let notes = DegradedNotes::new();
        let store = ChunkStore::new(
            pool.clone(),
            Arc::new(BrokenVectorIndex),
            Arc::new(MockEmbedder::default()),
            notes.clone(),
            fts,
            1400,
            0.2,
        );

        let outcome = store
            .index_document("p1", "outline", "still indexed", serde_json::json!({"source_id": "s1"}))
            .await
            .unwrap();
        assert_eq!(outcome.indexed_chunks, 1);
        assert_eq!(primary_count(&pool, "p1").await, 1);

        let drained = notes.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].contains("degraded"));
    }
}
