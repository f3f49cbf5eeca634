//! Completion port and backends
//!
//! The core never talks to an LLM directly; every agent goes through the
//! [`CompletionClient`] trait. The mock backend keeps the whole pipeline
//! runnable and deterministic without any provider configured.

use crate::config::Settings;
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Message role in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Trait for single-shot completion backends
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run one system+prompt completion and return the raw text
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    /// Backend identifier for logging
    fn name(&self) -> &str;
}

/// Deterministic offline backend; echoes a bounded view of its inputs
pub struct MockCompletionClient;

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let system_head: String = system.trim().chars().take(120).collect();
        let prompt_head: String = prompt.trim().chars().take(800).collect();
        Ok(format!(
            "[MOCK MODE OUTPUT]\nSystem: {}\nPrompt: {}\n\n(set MOCK_LLM=0 and the LLM_* variables to enable a real backend)",
            system_head, prompt_head
        ))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// OpenAI-compatible chat completion backend
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Message,
}

impl OpenAiCompatClient {
    /// Create a client from settings; fails when no API key is configured
    pub fn new(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .llm_api_key
            .clone()
            .ok_or_else(|| LlmError::BackendUnavailable("LLM_API_KEY is missing".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::BackendUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings
                .llm_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model: settings.llm_model.clone(),
            temperature: settings.llm_temperature,
            timeout_secs: 120,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        debug!("Requesting completion from {}", self.model);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: Role::System,
                    content: system.to_string(),
                },
                Message {
                    role: Role::User,
                    content: prompt.to_string(),
                },
            ],
            temperature: self.temperature,
        };

        let response = timeout(
            Duration::from_secs(self.timeout_secs),
            self.client
                .post(self.api_url())
                .bearer_auth(&self.api_key)
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
        .map_err(|e| LlmError::BackendUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Completion API error: {}", error_text);
            return Err(LlmError::GenerationFailed(error_text).into());
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()))?;

        info!("Completion returned {} chars", text.chars().count());
        Ok(text)
    }

    fn name(&self) -> &str {
        "openai_compatible"
    }
}

/// Select a completion backend from settings.
///
/// Mock mode or a missing API key always yields the mock backend, so the
/// core stays operational offline.
pub fn completion_from_settings(settings: &Settings) -> Arc<dyn CompletionClient> {
    if settings.mock_llm || settings.llm_api_key.is_none() {
        return Arc::new(MockCompletionClient);
    }
    match OpenAiCompatClient::new(settings) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Completion backend init failed, using mock: {}", e);
            Arc::new(MockCompletionClient)
        }
    }
}

/// Extract the first balanced-looking JSON object from raw LLM output.
///
/// LLMs routinely wrap JSON in prose or code fences; this takes the span
/// from the first `{` to the last `}` and parses it. Returns `None` when no
/// such span parses.
pub fn parse_llm_json(raw: &str) -> Option<serde_json::Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::automock;

    #[automock]
    #[async_trait]
    #[allow(dead_code)]
    pub trait ScriptableCompletion: Send + Sync {
        async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
    }

    #[tokio::test]
    async fn test_mocked_completion_port() {
        let mut mock = MockScriptableCompletion::new();
        mock.expect_complete()
            .times(1)
            .returning(|_, _| Ok("a quiet draft".to_string()));

        let out = mock.complete("sys", "write chapter 1").await.unwrap();
        assert_eq!(out, "a quiet draft");
    }

    #[tokio::test]
    async fn test_mock_completion_is_deterministic() {
        let client = MockCompletionClient;
        let a = client.complete("sys", "write chapter 1").await.unwrap();
        let b = client.complete("sys", "write chapter 1").await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("write chapter 1"));
    }

    #[test]
    fn test_parse_llm_json_plain() {
        let value = parse_llm_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_parse_llm_json_wrapped() {
        let raw = "Sure, here you go:\n```json\n{\"facts\": []}\n```\nHope that helps.";
        let value = parse_llm_json(raw).unwrap();
        assert!(value["facts"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_parse_llm_json_garbage() {
        assert!(parse_llm_json("no json here").is_none());
        assert!(parse_llm_json("} reversed {").is_none());
    }

    #[test]
    fn test_api_url_generation() {
        let mut settings = Settings::default();
        settings.llm_api_key = Some("k".to_string());
        settings.llm_base_url = Some("http://localhost:8080/v1/".to_string());
        let client = OpenAiCompatClient::new(&settings).unwrap();
        assert_eq!(client.api_url(), "http://localhost:8080/v1/chat/completions");
    }
}
