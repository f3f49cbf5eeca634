//! Chapter expansion writer agent

use crate::agents::AgentResult;
use crate::error::Result;
use crate::llm::CompletionClient;
use crate::storage::AgentLog;
use std::sync::Arc;

/// Expands one chapter from the assembled retrieval context
pub struct WriterAgent {
    completion: Arc<dyn CompletionClient>,
}

impl WriterAgent {
    pub const NAME: &'static str = "WriterAgent";

    pub fn new(completion: Arc<dyn CompletionClient>) -> Self {
        Self { completion }
    }

    pub async fn run(
        &self,
        chapter_number: i64,
        context: &str,
        target_words: i64,
        style: &str,
    ) -> Result<AgentResult<String>> {
        let system = "You are a novelist. You follow the outline and character sheets \
                      strictly, keep voice and motivation consistent, and mind \
                      foreshadowing and callbacks. Output prose only, no analysis.";
        let prompt = format!(
            r#"Expand chapter {chapter_number}, aiming for about {target_words} words.

- Writing style: {style}

Use the context below strictly (rules / outline / characters / facts / foreshadowing / related passages / user instruction):
{context}

Requirements:
1) A chapter title (optional) plus the body
2) Character behaviour and motivation must match the character sheets
3) Do not introduce hard settings or key props without cause
4) Echo earlier chapters and plant hooks for later ones
"#
        );

        let text = self.completion.complete(system, &prompt).await?;
        let logs = vec![AgentLog::new(
            Self::NAME,
            "expand_chapter",
            format!("Expanded chapter {chapter_number}"),
            Some(text.chars().take(500).collect()),
        )];
        Ok(AgentResult { data: text, logs })
    }
}
