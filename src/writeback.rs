//! Post-write extraction of derived chapter memory
//!
//! After a chapter is written, the extractor asks the completion backend
//! for a strict-JSON digest (summary, facts, foreshadowing) and tolerates
//! sloppy output. The three results come back as strings so the chunk
//! store can index them uniformly.

use crate::error::Result;
use crate::llm::{parse_llm_json, CompletionClient};
use crate::storage::{AgentLog, Project};
use std::sync::Arc;

/// Derived memory for one chapter write
#[derive(Debug, Clone)]
pub struct ExtractedMemory {
    pub chapter_summary: String,
    /// JSON-serialised list of fact entries
    pub facts: String,
    /// JSON-serialised list of foreshadowing entries
    pub foreshadowing: String,
}

impl ExtractedMemory {
    /// (doc_type, text) pairs in indexing order
    pub fn entries(&self) -> [(&'static str, &str); 3] {
        [
            ("chapter_summary", self.chapter_summary.as_str()),
            ("facts", self.facts.as_str()),
            ("foreshadowing", self.foreshadowing.as_str()),
        ]
    }
}

/// LLM-driven extractor of summary / facts / foreshadowing
pub struct WritebackExtractor {
    completion: Arc<dyn CompletionClient>,
}

impl WritebackExtractor {
    pub const NAME: &'static str = "WritebackExtractor";

    pub fn new(completion: Arc<dyn CompletionClient>) -> Self {
        Self { completion }
    }

    pub async fn extract(
        &self,
        project: &Project,
        chapter_no: i64,
        chapter_text: &str,
    ) -> Result<(ExtractedMemory, Vec<AgentLog>)> {
        let system = "You are a fiction editor's assistant. Without rewriting the prose, \
                      produce a 300-600 word summary, extracted facts and extracted \
                      foreshadowing for the chapter. Output strict JSON only.";
        let prompt = format!(
            r#"Project background:
- Genre: {genre}
- Setting: {setting}
- Style: {style}

Distill the body of chapter {chapter_no}:
Body:
{chapter_text}

Output strict JSON:
{{
  "chapter_summary": "...(300-600 words)",
  "facts": [
    {{"category":"character_state|relationship|location|world_rule|inventory|goal","subject":"...","change":"...","evidence":"..."}}
  ],
  "foreshadowing": [
    {{"hook":"...","clue":"...","expected_payoff":"...","range":"e.g. chapters 3-5"}}
  ]
}}
"#,
            genre = project.genre,
            setting = project.setting,
            style = project.style,
        );

        let raw = self.completion.complete(system, &prompt).await?;
        let data = parse_llm_json(&raw).unwrap_or_else(|| serde_json::json!({}));

        let summary = data
            .get("chapter_summary")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| raw.chars().take(600).collect());

        let as_list = |key: &str| -> serde_json::Value {
            match data.get(key) {
                Some(serde_json::Value::Array(items)) => serde_json::Value::Array(items.clone()),
                _ => serde_json::Value::Array(Vec::new()),
            }
        };
        let facts = serde_json::to_string_pretty(&as_list("facts"))?;
        let foreshadowing = serde_json::to_string_pretty(&as_list("foreshadowing"))?;

        let logs = vec![AgentLog::new(
            Self::NAME,
            "extract",
            format!("Post-write extraction: summary/facts/foreshadowing (chapter {chapter_no})"),
            Some(summary.chars().take(280).collect()),
        )];

        Ok((
            ExtractedMemory {
                chapter_summary: summary,
                facts,
                foreshadowing,
            },
            logs,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FixedCompletion(String);

    #[async_trait]
    impl CompletionClient for FixedCompletion {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn project() -> Project {
        Project {
            id: "p".into(),
            genre: "mystery".into(),
            setting: "harbor".into(),
            style: "noir".into(),
            keywords: String::new(),
            audience: String::new(),
            target_chapters: 10,
            outline: String::new(),
            characters_json: "{}".into(),
            characters_text: String::new(),
            chapters_json: "{}".into(),
            agent_logs_json: "[]".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_extract_strict_json() {
        let reply = r#"{"chapter_summary": "Mara finds the ledger.",
                        "facts": [{"category":"location","subject":"ledger","change":"found","evidence":"desk"}],
                        "foreshadowing": []}"#;
        let extractor = WritebackExtractor::new(Arc::new(FixedCompletion(reply.to_string())));
        let (memory, logs) = extractor.extract(&project(), 2, "body").await.unwrap();

        assert_eq!(memory.chapter_summary, "Mara finds the ledger.");
        let facts: serde_json::Value = serde_json::from_str(&memory.facts).unwrap();
        assert_eq!(facts.as_array().unwrap().len(), 1);
        assert_eq!(memory.foreshadowing.trim(), "[]");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "extract");
    }

    #[tokio::test]
    async fn test_extract_tolerates_wrapped_json() {
        let reply = "Here is the digest:\n{\"chapter_summary\": \"wrapped\", \"facts\": [], \"foreshadowing\": []}\nDone.";
        let extractor = WritebackExtractor::new(Arc::new(FixedCompletion(reply.to_string())));
        let (memory, _) = extractor.extract(&project(), 1, "body").await.unwrap();
        assert_eq!(memory.chapter_summary, "wrapped");
    }

    #[tokio::test]
    async fn test_extract_falls_back_on_garbage() {
        let reply = "no json at all, just prose about the chapter";
        let extractor = WritebackExtractor::new(Arc::new(FixedCompletion(reply.to_string())));
        let (memory, _) = extractor.extract(&project(), 1, "body").await.unwrap();
        assert_eq!(memory.chapter_summary, reply);
        assert_eq!(memory.facts.trim(), "[]");
        assert_eq!(memory.foreshadowing.trim(), "[]");
    }

    struct FailingCompletion;

    #[async_trait]
    impl CompletionClient for FailingCompletion {
        async fn complete(&self, _: &str, _: &str) -> Result<String> {
            Err(LlmError::BackendUnavailable("down".into()).into())
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_extract_propagates_backend_failure() {
        let extractor = WritebackExtractor::new(Arc::new(FailingCompletion));
        assert!(extractor.extract(&project(), 1, "body").await.is_err());
    }
}
