//! Vector index port and SQLite-backed implementation
//!
//! The index is a per-project namespace of unit-norm vectors. It is a
//! secondary structure: the primary chunk table stays authoritative and a
//! lost or failing index only degrades retrieval, never correctness.

use crate::error::{RagError, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// One chunk's entry in the vector index
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub doc_type: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: serde_json::Value,
}

/// A nearest-neighbour hit with its cosine distance
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub document: String,
    pub metadata: serde_json::Value,
    pub distance: f64,
}

/// Trait for per-project vector indexes
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace entries in a project's namespace
    async fn upsert(&self, project_id: &str, records: &[VectorRecord]) -> Result<()>;

    /// Remove entries by chunk id
    async fn delete(&self, project_id: &str, ids: &[String]) -> Result<()>;

    /// Nearest-neighbour query, optionally restricted to document types
    async fn query(
        &self,
        project_id: &str,
        query: &[f32],
        top_k: usize,
        types: Option<&[String]>,
    ) -> Result<Vec<VectorHit>>;

    /// Number of entries in a project's namespace
    async fn count(&self, project_id: &str) -> Result<usize>;
}

/// Brute-force cosine index persisted in its own SQLite file
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    /// Open (or create) the index under the given persist directory
    pub async fn open(persist_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = persist_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("vectors.db");

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .map_err(|e| RagError::IndexFailed(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.ensure_schema().await?;
        info!("Vector index ready at {}", db_path.display());
        Ok(index)
    }

    /// In-memory index for tests
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        let index = Self { pool };
        index.ensure_schema().await?;
        Ok(index)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_entries (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                type TEXT NOT NULL,
                document TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vector_entries_project ON vector_entries(project_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Serialize an embedding as little-endian f32 bytes
    pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding
            .iter()
            .flat_map(|f| f.to_le_bytes().to_vec())
            .collect()
    }

    /// Deserialize an embedding from storage
    pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Cosine similarity between two vectors
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, project_id: &str, records: &[VectorRecord]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        for record in records {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO vector_entries (id, project_id, type, document, embedding, metadata, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&record.id)
            .bind(project_id)
            .bind(&record.doc_type)
            .bind(&record.document)
            .bind(Self::serialize_embedding(&record.embedding))
            .bind(serde_json::to_string(&record.metadata)?)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn delete(&self, project_id: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM vector_entries WHERE id = ?1 AND project_id = ?2")
                .bind(id)
                .bind(project_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn query(
        &self,
        project_id: &str,
        query: &[f32],
        top_k: usize,
        types: Option<&[String]>,
    ) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query(
            "SELECT id, type, document, embedding, metadata FROM vector_entries WHERE project_id = ?1",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<VectorHit> = Vec::new();
        for row in rows {
            let doc_type: String = row.get("type");
            if let Some(types) = types {
                if !types.iter().any(|t| t == &doc_type) {
                    continue;
                }
            }
            let embedding = Self::deserialize_embedding(row.get::<Vec<u8>, _>("embedding").as_slice());
            let similarity = Self::cosine_similarity(query, &embedding);
            let metadata: serde_json::Value =
                serde_json::from_str(row.get::<String, _>("metadata").as_str())
                    .unwrap_or_else(|_| serde_json::json!({}));
            hits.push(VectorHit {
                id: row.get("id"),
                document: row.get("document"),
                metadata,
                distance: (1.0 - similarity) as f64,
            });
        }

        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn count(&self, project_id: &str) -> Result<usize> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vector_entries WHERE project_id = ?1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, doc_type: &str, embedding: Vec<f32>, document: &str) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            doc_type: doc_type.to_string(),
            embedding,
            document: document.to_string(),
            metadata: serde_json::json!({"type": doc_type}),
        }
    }

    #[test]
    fn test_embedding_serialization_round_trip() {
        let embedding = vec![1.5, -2.3, 0.0, 42.1];
        let bytes = SqliteVectorIndex::serialize_embedding(&embedding);
        let restored = SqliteVectorIndex::deserialize_embedding(&bytes);
        assert_eq!(embedding, restored);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert_eq!(SqliteVectorIndex::cosine_similarity(&a, &b), 1.0);
        assert_eq!(SqliteVectorIndex::cosine_similarity(&a, &c), 0.0);
    }

    #[tokio::test]
    async fn test_query_ranks_by_distance() {
        let index = SqliteVectorIndex::in_memory().await.unwrap();
        index
            .upsert(
                "p1",
                &[
                    record("near", "chapter", vec![1.0, 0.05, 0.0], "near doc"),
                    record("far", "chapter", vec![0.0, 1.0, 0.0], "far doc"),
                ],
            )
            .await
            .unwrap();

        let hits = index.query("p1", &[1.0, 0.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[tokio::test]
    async fn test_namespace_and_type_filter() {
        let index = SqliteVectorIndex::in_memory().await.unwrap();
        index
            .upsert("p1", &[record("a", "outline", vec![1.0, 0.0], "outline text")])
            .await
            .unwrap();
        index
            .upsert("p2", &[record("b", "chapter", vec![1.0, 0.0], "chapter text")])
            .await
            .unwrap();

        // namespaces never leak
        let hits = index.query("p1", &[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        // type filter applies within a namespace
        let filtered = index
            .query("p1", &[1.0, 0.0], 10, Some(&["chapter".to_string()]))
            .await
            .unwrap();
        assert!(filtered.is_empty());
        assert_eq!(index.count("p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_removes() {
        let index = SqliteVectorIndex::in_memory().await.unwrap();
        index
            .upsert("p1", &[record("a", "chapter", vec![1.0, 0.0], "v1")])
            .await
            .unwrap();
        index
            .upsert("p1", &[record("a", "chapter", vec![0.0, 1.0], "v2")])
            .await
            .unwrap();
        assert_eq!(index.count("p1").await.unwrap(), 1);

        let hits = index.query("p1", &[0.0, 1.0], 10, None).await.unwrap();
        assert_eq!(hits[0].document, "v2");

        index.delete("p1", &["a".to_string()]).await.unwrap();
        assert_eq!(index.count("p1").await.unwrap(), 0);
    }
}
