//! Outline generation agent

use crate::agents::AgentResult;
use crate::error::Result;
use crate::llm::CompletionClient;
use crate::storage::{AgentLog, Project};
use std::sync::Arc;

/// Turns project metadata and a theme into a volume/chapter outline
pub struct OutlineAgent {
    completion: Arc<dyn CompletionClient>,
}

impl OutlineAgent {
    pub const NAME: &'static str = "OutlineAgent";

    pub fn new(completion: Arc<dyn CompletionClient>) -> Self {
        Self { completion }
    }

    pub async fn run(
        &self,
        project: &Project,
        theme: &str,
        total_words: i64,
    ) -> Result<AgentResult<String>> {
        let system = "You are a fiction development editor. You turn a brief into a clear \
                      volume/chapter outline whose chapters advance causally, planting \
                      foreshadowing and paying it off. Output readable outline text.";
        let prompt = format!(
            r#"Generate a novel outline (volume/chapter structure, at least {target_chapters} chapters; 3-6 sentence synopsis per chapter) from:

- Genre: {genre}
- World / setting: {setting}
- Style: {style}
- Keywords: {keywords}
- Audience: {audience}
- Theme: {theme}
- Target total words: {total_words}
"#,
            target_chapters = project.target_chapters,
            genre = project.genre,
            setting = project.setting,
            style = project.style,
            keywords = project.keywords,
            audience = project.audience,
        );

        let outline = self.completion.complete(system, &prompt).await?;
        let logs = vec![AgentLog::new(
            Self::NAME,
            "generate_outline",
            format!("Generated outline (target chapters={})", project.target_chapters),
            Some(outline.chars().take(500).collect()),
        )];
        Ok(AgentResult { data: outline, logs })
    }
}
