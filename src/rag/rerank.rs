//! Reranker port, mock scorer and rule-based lift

use crate::error::{RagError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Fixed batch size for cross-encoder scoring
pub const RERANK_BATCH_SIZE: usize = 16;

/// What a reranker's scores mean for the downstream pipeline.
///
/// Rule scorers get the additional type/recency lift applied on top;
/// a real cross-encoder already encodes relevance, so lifting it again
/// would double-count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankerKind {
    Rule,
    CrossEncoder,
}

/// Trait for (query, text) relevance scoring backends
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each text against the query; higher is better
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f64>>;

    /// Model identifier for logging
    fn model_name(&self) -> &str;

    /// Scoring family, gates the rule-based lift
    fn kind(&self) -> RerankerKind;
}

static QUERY_TOKEN_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s,，。；;、/]+").expect("static regex"));

/// Count occurrences of query tokens (≥ 2 chars) in a text
pub fn count_hits(query: &str, text: &str) -> usize {
    let mut hits = 0;
    for token in QUERY_TOKEN_SPLIT.split(query.trim()) {
        let token = token.trim();
        if token.chars().count() < 2 {
            continue;
        }
        hits += text.matches(token).count();
    }
    hits
}

/// Term-hit scorer with a logarithmic length penalty
pub struct MockReranker;

#[async_trait]
impl Reranker for MockReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        Ok(texts
            .iter()
            .map(|t| {
                let hits = count_hits(query, t) as f64;
                let len = t.chars().count().max(1) as f64;
                let length_penalty = 1.0 / (1.0 + (1.0 + len).ln());
                hits * 2.0 + length_penalty
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "mock-weighted"
    }

    fn kind(&self) -> RerankerKind {
        RerankerKind::Rule
    }
}

/// Default per-type score multipliers for the rule lift
pub fn default_type_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("style_guide".to_string(), 1.8),
        ("world".to_string(), 1.5),
        ("outline".to_string(), 1.6),
        ("characters".to_string(), 1.7),
        ("chapter_summary".to_string(), 1.4),
        ("facts".to_string(), 1.5),
        ("foreshadowing".to_string(), 1.3),
        ("chapter".to_string(), 1.0),
    ])
}

/// Rule-based lift applied on top of the merged channel score when the
/// active reranker is a rule scorer.
pub fn rule_score(
    query: &str,
    text: &str,
    doc_type: &str,
    chunk_chapter_no: Option<i64>,
    base_score: f64,
    target_chapter: Option<i64>,
    type_weights: &HashMap<String, f64>,
) -> f64 {
    let mut score = base_score * type_weights.get(doc_type).copied().unwrap_or(1.0);

    let hits = count_hits(query, text) as f64;
    score += (hits * 0.5).min(3.0);

    if let (Some(target), Some(chapter_no)) = (target_chapter, chunk_chapter_no) {
        let gap = (target - chapter_no).max(0) as f64;
        score += 1.5 / (1.0 + gap);
    }

    if text.chars().count() > 1600 {
        score *= 0.85;
    }
    score
}

/// Local BGE cross-encoder backed by fastembed
#[cfg(feature = "local-models")]
pub struct LocalBgeReranker {
    model: std::sync::Arc<std::sync::Mutex<fastembed::TextRerank>>,
    model_name: String,
}

#[cfg(feature = "local-models")]
impl LocalBgeReranker {
    pub fn new(model_name: &str) -> Result<Self> {
        use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

        let model_id = match model_name {
            "BAAI/bge-reranker-base" => RerankerModel::BGERerankerBase,
            "BAAI/bge-reranker-v2-m3" => RerankerModel::BGERerankerV2M3,
            other => {
                return Err(RagError::BackendUnavailable(format!(
                    "unsupported local rerank model: {}",
                    other
                ))
                .into())
            }
        };

        let model = TextRerank::try_new(RerankInitOptions::new(model_id))
            .map_err(|e| RagError::BackendUnavailable(e.to_string()))?;

        Ok(Self {
            model: std::sync::Arc::new(std::sync::Mutex::new(model)),
            model_name: model_name.to_string(),
        })
    }
}

#[cfg(feature = "local-models")]
#[async_trait]
impl Reranker for LocalBgeReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        let model = self.model.clone();
        let query = query.to_string();
        let docs = texts.to_vec();
        let count = docs.len();

        let results = tokio::task::spawn_blocking(move || {
            let model = model.lock().expect("rerank model lock");
            model.rerank(query, docs, false, Some(RERANK_BATCH_SIZE))
        })
        .await
        .map_err(|e| RagError::RerankFailed(e.to_string()))?
        .map_err(|e| RagError::RerankFailed(e.to_string()))?;

        // results arrive sorted by score; restore input order
        let mut scores = vec![0.0f64; count];
        for r in results {
            if let Some(slot) = scores.get_mut(r.index) {
                *slot = r.score as f64;
            }
        }
        Ok(scores)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn kind(&self) -> RerankerKind {
        RerankerKind::CrossEncoder
    }
}
