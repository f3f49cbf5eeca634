//! Configuration management for the narrative writing core
//!
//! All settings come from the environment (optionally via a `.env`-style
//! launcher); every field has a default so the core runs fully offline with
//! the mock backends.

use serde::{Deserialize, Serialize};

/// Main configuration, deserialized from environment variables
/// (`DB_PATH`, `MOCK_LLM`, `RAG_MAX_CHUNK_CHARS`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite database file path (projects, chunks, embedding cache)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Comma-separated list of allowed CORS origins
    #[serde(default = "default_cors_origins")]
    pub backend_cors_origins: String,

    /// Bind host for the HTTP server
    #[serde(default = "default_server_host")]
    pub server_host: String,

    /// Bind port for the HTTP server
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Use the deterministic mock completion backend
    #[serde(default = "default_true")]
    pub mock_llm: bool,

    /// Completion provider identifier ("openai_compatible")
    #[serde(default = "default_llm_provider")]
    pub llm_provider: String,

    /// API key for the completion backend
    #[serde(default)]
    pub llm_api_key: Option<String>,

    /// Base URL override for OpenAI-compatible backends
    #[serde(default)]
    pub llm_base_url: Option<String>,

    /// Completion model name
    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    /// Sampling temperature for completions
    #[serde(default = "default_llm_temperature")]
    pub llm_temperature: f32,

    /// Directory holding the persistent vector index
    #[serde(default = "default_chroma_persist_dir")]
    pub chroma_persist_dir: String,

    /// Embeddings provider: "local_bge_m3" or "mock"
    #[serde(default = "default_mock_provider")]
    pub embeddings_provider: String,

    /// Model name for the local embeddings provider
    #[serde(default = "default_bge_m3_model")]
    pub bge_m3_model_name: String,

    /// Rerank provider: "local_bge" or "mock"
    #[serde(default = "default_mock_provider")]
    pub rerank_provider: String,

    /// Model name for the local rerank provider
    #[serde(default = "default_bge_rerank_model")]
    pub bge_rerank_model_name: String,

    /// Device hint for local model backends ("cpu", "cuda")
    #[serde(default)]
    pub rag_device: Option<String>,

    /// Maximum characters per chunk
    #[serde(default = "default_max_chunk_chars")]
    pub rag_max_chunk_chars: usize,

    /// Fraction of a chunk re-used as overlap with its successor
    #[serde(default = "default_overlap_ratio")]
    pub rag_overlap_ratio: f32,

    /// Dense channel fan-out for preview retrieval
    #[serde(default = "default_top_k_channel")]
    pub rag_top_k_v: usize,

    /// Sparse channel fan-out for preview retrieval
    #[serde(default = "default_top_k_channel")]
    pub rag_top_k_kw: usize,

    /// Critic provider: "llm" or "mock"
    #[serde(default = "default_mock_provider")]
    pub critic_provider: String,

    /// Apply critic-suggested rewrites automatically
    #[serde(default)]
    pub auto_revise: bool,
}

fn default_db_path() -> String {
    "data/app.db".to_string()
}

fn default_cors_origins() -> String {
    "http://localhost:3000".to_string()
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_llm_provider() -> String {
    "openai_compatible".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_temperature() -> f32 {
    0.7
}

fn default_chroma_persist_dir() -> String {
    "data/chroma".to_string()
}

fn default_mock_provider() -> String {
    "mock".to_string()
}

fn default_bge_m3_model() -> String {
    "BAAI/bge-m3".to_string()
}

fn default_bge_rerank_model() -> String {
    "BAAI/bge-reranker-v2-m3".to_string()
}

fn default_max_chunk_chars() -> usize {
    1400
}

fn default_overlap_ratio() -> f32 {
    0.2
}

fn default_top_k_channel() -> usize {
    10
}

impl Default for Settings {
    fn default() -> Self {
        // serde fills every field from its default fn
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

impl Settings {
    /// Load configuration from the process environment
    pub fn from_env() -> crate::error::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .map_err(|e| crate::error::NovelError::Config(e.to_string()))?;

        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| crate::error::NovelError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parsed CORS origin list
    pub fn cors_origins(&self) -> Vec<String> {
        self.backend_cors_origins
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.db_path.is_empty() {
            return Err(crate::error::NovelError::Config(
                "DB_PATH cannot be empty".to_string(),
            ));
        }

        if !matches!(self.embeddings_provider.as_str(), "local_bge_m3" | "mock") {
            return Err(crate::error::NovelError::Config(format!(
                "unknown embeddings provider: {}",
                self.embeddings_provider
            )));
        }

        if !matches!(self.rerank_provider.as_str(), "local_bge" | "mock") {
            return Err(crate::error::NovelError::Config(format!(
                "unknown rerank provider: {}",
                self.rerank_provider
            )));
        }

        if !matches!(self.critic_provider.as_str(), "llm" | "mock") {
            return Err(crate::error::NovelError::Config(format!(
                "unknown critic provider: {}",
                self.critic_provider
            )));
        }

        if self.rag_max_chunk_chars == 0 {
            return Err(crate::error::NovelError::Config(
                "RAG_MAX_CHUNK_CHARS must be greater than 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.rag_overlap_ratio) {
            return Err(crate::error::NovelError::Config(
                "RAG_OVERLAP_RATIO must be in [0, 1)".to_string(),
            ));
        }

        if self.rag_top_k_v == 0 || self.rag_top_k_kw == 0 {
            return Err(crate::error::NovelError::Config(
                "RAG_TOP_K_V / RAG_TOP_K_KW must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// SQLite connection URL for the configured database path
    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.mock_llm);
        assert_eq!(settings.rag_max_chunk_chars, 1400);
        assert_eq!(settings.embeddings_provider, "mock");
        assert!((settings.rag_overlap_ratio - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.embeddings_provider = "bge-large".to_string();
        assert!(settings.validate().is_err());

        settings = Settings::default();
        settings.rag_overlap_ratio = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_cors_origins_parsing() {
        let mut settings = Settings::default();
        settings.backend_cors_origins = "http://a.example, http://b.example ,".to_string();
        assert_eq!(
            settings.cors_origins(),
            vec!["http://a.example".to_string(), "http://b.example".to_string()]
        );
    }
}
