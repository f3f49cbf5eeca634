//! Error handling for the narrative writing core

use thiserror::Error;

/// Result type alias for the narrative writing core
pub type Result<T> = std::result::Result<T, NovelError>;

/// Main error type for the narrative writing core
#[derive(Error, Debug)]
pub enum NovelError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    Rag(#[from] RagError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Errors related to completion backends
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout: operation took too long")]
    Timeout,
}

/// Errors related to the retrieval engine and its indexes
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Degraded: {0}")]
    Degraded(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Rerank failed: {0}")]
    RerankFailed(String),

    #[error("Index failed: {0}")]
    IndexFailed(String),
}

impl NovelError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NovelError::Llm(LlmError::Timeout)
                | NovelError::Llm(LlmError::BackendUnavailable(_))
                | NovelError::Rag(RagError::BackendUnavailable(_))
                | NovelError::Http(_)
        )
    }

    /// Get error category for logging and API error codes
    pub fn category(&self) -> &'static str {
        match self {
            NovelError::Llm(LlmError::BackendUnavailable(_)) => "backend_unavailable",
            NovelError::Llm(_) => "llm",
            NovelError::Rag(RagError::BackendUnavailable(_)) => "backend_unavailable",
            NovelError::Rag(RagError::Degraded(_)) => "degraded",
            NovelError::Rag(_) => "rag",
            NovelError::NotFound(_) => "not_found",
            NovelError::Precondition(_) => "precondition",
            NovelError::Validation(_) => "validation",
            NovelError::Config(_) => "config",
            NovelError::Io(_) => "io",
            NovelError::Serialization(_) => "serialization",
            NovelError::Http(_) => "http",
            NovelError::Database(_) => "database",
            NovelError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let timeout_error = NovelError::Llm(LlmError::Timeout);
        assert!(timeout_error.is_retryable());

        let validation_error = NovelError::Validation("out of bounds".to_string());
        assert!(!validation_error.is_retryable());
    }

    #[test]
    fn test_error_category() {
        let not_found = NovelError::NotFound("project".to_string());
        assert_eq!(not_found.category(), "not_found");

        let degraded = NovelError::Rag(RagError::Degraded("vector index down".to_string()));
        assert_eq!(degraded.category(), "degraded");

        let unavailable = NovelError::Llm(LlmError::BackendUnavailable("no key".to_string()));
        assert_eq!(unavailable.category(), "backend_unavailable");
    }
}
