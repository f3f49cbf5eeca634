//! Hybrid retriever
//!
//! One retrieval is a fixed pipeline: resolve the causal bound, fan out the
//! dense and sparse channels concurrently, merge by chunk id, rerank, apply
//! the rule lift when the reranker is a rule scorer, overwrite causally
//! excluded chapter chunks with a sentinel score, then select under
//! per-type quotas. Channel failures are isolated; a retrieval never fails
//! because one side of the hybrid did.

use crate::error::Result;
use crate::rag::context::build_context;
use crate::rag::embeddings::Embedder;
use crate::rag::rerank::{default_type_weights, rule_score, Reranker, RerankerKind};
use crate::rag::types::{Channel, Chunk, DegradedNotes, RetrievalDebug, RetrievalFilters, ALL_DOC_TYPES};
use crate::rag::vector_index::VectorIndex;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Score assigned to causally excluded chunks; below any real score
const CAUSAL_REJECT_SCORE: f64 = -1e9;

/// Default per-type selection quotas
pub fn default_type_quotas() -> HashMap<String, usize> {
    HashMap::from([
        ("style_guide".to_string(), 1),
        ("world".to_string(), 2),
        ("outline".to_string(), 2),
        ("characters".to_string(), 3),
        ("chapter_summary".to_string(), 3),
        ("facts".to_string(), 3),
        ("foreshadowing".to_string(), 2),
        ("chapter".to_string(), 4),
    ])
}

/// Dual-channel hybrid retriever over the chunk store's indexes
pub struct Retriever {
    pool: SqlitePool,
    vector_index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    notes: DegradedNotes,
    type_weights: HashMap<String, f64>,
    type_quotas: HashMap<String, usize>,
    fts_enabled: bool,
    top_k_v_default: usize,
    top_k_kw_default: usize,
}

impl Retriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        vector_index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        notes: DegradedNotes,
        fts_enabled: bool,
        top_k_v_default: usize,
        top_k_kw_default: usize,
    ) -> Self {
        Self {
            pool,
            vector_index,
            embedder,
            reranker,
            notes,
            type_weights: default_type_weights(),
            type_quotas: default_type_quotas(),
            fts_enabled,
            top_k_v_default,
            top_k_kw_default,
        }
    }

    pub fn notes(&self) -> &DegradedNotes {
        &self.notes
    }

    /// Run the full retrieval pipeline and return the selected chunks,
    /// best first. An empty result is a valid (empty) context, not an
    /// error.
    pub async fn retrieve(
        &self,
        project_id: &str,
        query: &str,
        filters: &RetrievalFilters,
        top_k: usize,
    ) -> Result<Vec<Chunk>> {
        let chapter_max = causal_bound(filters);
        let types = filters.types.as_deref();
        let top_k_v = filters.top_k_v.unwrap_or_else(|| top_k.max(6));
        let top_k_kw = filters.top_k_kw.unwrap_or_else(|| top_k.max(6));

        let (vector_hits, keyword_hits) = futures::future::join(
            self.vector_channel(project_id, query, types, top_k_v),
            self.keyword_channel(project_id, query, types, chapter_max, top_k_kw),
        )
        .await;

        let candidates = merge_channels(vector_hits, keyword_hits);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let rerank_scores = match self.reranker.rerank(query, &texts).await {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(_) | Err(_) => {
                warn!("Rerank unavailable, reusing merged channel scores");
                candidates.iter().map(|c| c.score).collect()
            }
        };

        let apply_rule_lift = self.reranker.kind() == RerankerKind::Rule;
        let target_chapter = filters.chapter_no;

        let mut scored: Vec<(f64, Chunk)> = Vec::with_capacity(candidates.len());
        for (chunk, rr) in candidates.into_iter().zip(rerank_scores) {
            let mut score = if apply_rule_lift {
                rule_score(
                    query,
                    &chunk.text,
                    &chunk.doc_type,
                    chunk.chapter_no(),
                    chunk.score,
                    target_chapter,
                    &self.type_weights,
                )
            } else {
                rr
            };

            if let Some(chapter_max) = chapter_max {
                if chunk.doc_type == "chapter" {
                    if let Some(chapter_no) = chunk.chapter_no() {
                        if chapter_no > chapter_max {
                            score = CAUSAL_REJECT_SCORE;
                        }
                    }
                }
            }
            scored.push((score, chunk));
        }

        // stable sort keeps merge insertion order on ties
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected: Vec<Chunk> = Vec::new();
        let mut used: HashMap<String, usize> = HashMap::new();
        for (score, mut chunk) in scored {
            if score <= -1e8 {
                continue;
            }
            let limit = self.type_quotas.get(&chunk.doc_type).copied().unwrap_or(2);
            let count = used.entry(chunk.doc_type.clone()).or_insert(0);
            if *count >= limit {
                continue;
            }
            chunk.score = score;
            chunk.channel = Channel::Rerank;
            selected.push(chunk);
            *count += 1;
            if selected.len() >= top_k {
                break;
            }
        }

        debug!(
            "Retrieved {} chunks for {} (query: {:.40})",
            selected.len(),
            project_id,
            query
        );
        Ok(selected)
    }

    /// Stage-by-stage retrieval for the preview endpoint.
    ///
    /// The debug channels run without a type filter while the final stage
    /// applies the full filter set; the two views intentionally differ.
    pub async fn preview(
        &self,
        project_id: &str,
        query: &str,
        chapter_no: Option<i64>,
        top_k: usize,
    ) -> Result<RetrievalDebug> {
        let chapter_max = chapter_no.map(|n| n - 1);
        let vector_results = self
            .vector_channel(project_id, query, None, self.top_k_v_default)
            .await;
        let keyword_results = self
            .keyword_channel(project_id, query, None, chapter_max, self.top_k_kw_default)
            .await;

        let filters = RetrievalFilters {
            types: Some(ALL_DOC_TYPES.iter().map(|t| t.to_string()).collect()),
            chapter_no,
            chapter_only_before: true,
            top_k_v: Some(self.top_k_v_default),
            top_k_kw: Some(self.top_k_kw_default),
        };
        let final_selected = self.retrieve(project_id, query, &filters, top_k).await?;
        let context_string = build_context(&final_selected);

        let merged_candidates = merge_channels(vector_results.clone(), keyword_results.clone());

        Ok(RetrievalDebug {
            query: query.to_string(),
            vector_results,
            keyword_results,
            merged_candidates,
            final_selected,
            context_string,
        })
    }

    /// Dense channel: embed the query and search the vector index.
    /// The causal bound is not applied here; the post-rerank override
    /// handles chapter chunks from this channel.
    async fn vector_channel(
        &self,
        project_id: &str,
        query: &str,
        types: Option<&[String]>,
        top_k: usize,
    ) -> Vec<Chunk> {
        let query_vec = match self.embedder.embed_query(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Vector channel embedding failed: {}", e);
                return Vec::new();
            }
        };

        let hits = match self.vector_index.query(project_id, &query_vec, top_k, types).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Vector channel query failed: {}", e);
                return Vec::new();
            }
        };

        hits.into_iter()
            .map(|hit| {
                let doc_type = hit
                    .metadata
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let snippet = leading_snippet(&hit.document, 240);
                Chunk {
                    id: hit.id,
                    project_id: project_id.to_string(),
                    doc_type,
                    text: hit.document,
                    snippet,
                    score: 1.0 / (1.0 + hit.distance),
                    channel: Channel::Vector,
                    metadata: hit.metadata,
                }
            })
            .collect()
    }

    /// Sparse channel: FTS5 match ranked by bm25, with a substring-scoring
    /// fallback when FTS is unavailable or rejects the query. The causal
    /// bound for chapter chunks is part of the predicate here.
    async fn keyword_channel(
        &self,
        project_id: &str,
        query: &str,
        types: Option<&[String]>,
        chapter_max: Option<i64>,
        top_k: usize,
    ) -> Vec<Chunk> {
        match self
            .keyword_channel_inner(project_id, query, types, chapter_max, top_k)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Keyword channel failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn keyword_channel_inner(
        &self,
        project_id: &str,
        query: &str,
        types: Option<&[String]>,
        chapter_max: Option<i64>,
        top_k: usize,
    ) -> Result<Vec<Chunk>> {
        // (chunk_id, rank) pairs; rank converts to score as 1/(1+rank)
        let mut ranked: Vec<(String, f64)> = Vec::new();
        let mut fts_failed = !self.fts_enabled;

        if self.fts_enabled {
            match self
                .fts_query(project_id, query, types, chapter_max, top_k)
                .await
            {
                Ok(rows) => ranked = rows,
                Err(e) => {
                    debug!("FTS query rejected ({}), using substring fallback", e);
                    fts_failed = true;
                }
            }
        }

        // an empty FTS result is a real answer; only a failed FTS falls back
        if fts_failed {
            ranked = self
                .substring_fallback(project_id, query, types, chapter_max, top_k)
                .await?;
        }
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let mut hydrated = Vec::with_capacity(ranked.len());
        for (chunk_id, rank) in ranked {
            let row = sqlx::query(
                "SELECT id, type, text, snippet, metadata_json FROM rag_chunks WHERE id = ?1",
            )
            .bind(&chunk_id)
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else { continue };

            let metadata: serde_json::Value =
                serde_json::from_str(row.get::<String, _>("metadata_json").as_str())
                    .unwrap_or_else(|_| serde_json::json!({}));
            hydrated.push(Chunk {
                id: row.get("id"),
                project_id: project_id.to_string(),
                doc_type: row.get("type"),
                text: row.get("text"),
                snippet: row.get("snippet"),
                score: 1.0 / (1.0 + rank),
                channel: Channel::Keyword,
                metadata,
            });
        }
        Ok(hydrated)
    }

    async fn fts_query(
        &self,
        project_id: &str,
        query: &str,
        types: Option<&[String]>,
        chapter_max: Option<i64>,
        top_k: usize,
    ) -> Result<Vec<(String, f64)>> {
        let mut sql = String::from(
            "SELECT chunk_id, bm25(rag_chunks_fts) AS rank FROM rag_chunks_fts \
             WHERE project_id = ? AND rag_chunks_fts MATCH ?",
        );
        if let Some(types) = types {
            let placeholders = vec!["?"; types.len()].join(",");
            sql.push_str(&format!(" AND type IN ({})", placeholders));
        }
        if chapter_max.is_some() {
            sql.push_str(" AND (type != 'chapter' OR chapter_no <= ?)");
        }
        sql.push_str(" ORDER BY rank ASC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(project_id).bind(query);
        if let Some(types) = types {
            for t in types {
                q = q.bind(t);
            }
        }
        if let Some(chapter_max) = chapter_max {
            q = q.bind(chapter_max);
        }
        q = q.bind(top_k as i64);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("chunk_id"), r.get::<f64, _>("rank")))
            .collect())
    }

    async fn substring_fallback(
        &self,
        project_id: &str,
        query: &str,
        types: Option<&[String]>,
        chapter_max: Option<i64>,
        top_k: usize,
    ) -> Result<Vec<(String, f64)>> {
        let tokens: Vec<String> = query
            .replace('，', " ")
            .replace(',', " ")
            .split_whitespace()
            .filter(|t| t.chars().count() >= 2)
            .take(8)
            .map(|t| t.to_string())
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from("SELECT id, type, chapter_no, text FROM rag_chunks WHERE project_id = ?");
        if let Some(types) = types {
            let placeholders = vec!["?"; types.len()].join(",");
            sql.push_str(&format!(" AND type IN ({})", placeholders));
        }
        if chapter_max.is_some() {
            sql.push_str(" AND (type != 'chapter' OR chapter_no <= ?)");
        }

        let mut q = sqlx::query(&sql).bind(project_id);
        if let Some(types) = types {
            for t in types {
                q = q.bind(t);
            }
        }
        if let Some(chapter_max) = chapter_max {
            q = q.bind(chapter_max);
        }

        let rows = q.fetch_all(&self.pool).await?;
        let mut scored: Vec<(usize, String)> = rows
            .into_iter()
            .filter_map(|row| {
                let text: String = row.get("text");
                let hits: usize = tokens.iter().map(|t| text.matches(t.as_str()).count()).sum();
                if hits > 0 {
                    Some((hits, row.get::<String, _>("id")))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(hits, id)| (id, 1.0 / (1.0 + hits as f64)))
            .collect())
    }
}

fn causal_bound(filters: &RetrievalFilters) -> Option<i64> {
    match filters.chapter_no {
        Some(n) if filters.chapter_only_before => Some(n - 1),
        _ => None,
    }
}

/// Deduplicate channel hits by chunk id, keeping the higher score and
/// marking chunks seen on both channels.
fn merge_channels(vector_hits: Vec<Chunk>, keyword_hits: Vec<Chunk>) -> Vec<Chunk> {
    let mut order: Vec<Chunk> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for chunk in vector_hits.into_iter().chain(keyword_hits) {
        match by_id.get(&chunk.id) {
            None => {
                by_id.insert(chunk.id.clone(), order.len());
                order.push(chunk);
            }
            Some(&idx) => {
                let existing = &mut order[idx];
                existing.score = existing.score.max(chunk.score);
                existing.channel = Channel::VectorKeyword;
            }
        }
    }
    order
}

fn leading_snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}…", head)
    } else {
        text.to_string()
    }
}
