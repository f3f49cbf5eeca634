//! Character sheet generation agent

use crate::agents::AgentResult;
use crate::error::Result;
use crate::llm::{parse_llm_json, CompletionClient};
use crate::storage::{AgentLog, Project};
use std::sync::Arc;

/// Character artifact: the structured sheet plus the readable reply
#[derive(Debug, Clone)]
pub struct CharacterSheet {
    pub characters: serde_json::Value,
    pub characters_text: String,
}

/// Builds the cast: roles, motivations, arcs and relationship web
pub struct CharacterAgent {
    completion: Arc<dyn CompletionClient>,
}

impl CharacterAgent {
    pub const NAME: &'static str = "CharacterAgent";

    pub fn new(completion: Arc<dyn CompletionClient>) -> Self {
        Self { completion }
    }

    pub async fn run(&self, project: &Project, constraints: &str) -> Result<AgentResult<CharacterSheet>> {
        let system = "You are a character designer and consistency reviewer for fiction. \
                      Output two parts: 1) a strict-JSON character sheet; 2) a readable summary.";
        let prompt = format!(
            r#"Design the cast from the brief below, including the relationship web and each character's arc, then audit behavioural consistency (name risks and fixes).

- Genre: {genre}
- World / setting: {setting}
- Style: {style}
- Keywords: {keywords}
- Audience: {audience}
- Outline: {outline}
- Extra constraints: {constraints}

Output strict JSON first, suggested fields:
{{
  "characters": [{{"name": "...", "role": "...", "motivation": "...", "arc": "...", "traits": ["..."], "relationships": [{{"with": "...", "type": "...", "note": "..."}}]}}],
  "consistency_checks": [{{"risk": "...", "suggestion": "..."}}],
  "world_rules": ["..."]
}}
Then a readable summary.
"#,
            genre = project.genre,
            setting = project.setting,
            style = project.style,
            keywords = project.keywords,
            audience = project.audience,
            outline = project.outline,
        );

        let raw = self.completion.complete(system, &prompt).await?;

        // keep whatever parses; the raw reply is still stored for humans
        let characters = parse_llm_json(&raw).unwrap_or_else(|| serde_json::json!({ "raw": raw }));

        let logs = vec![AgentLog::new(
            Self::NAME,
            "generate_characters",
            "Generated character sheet and consistency checks",
            Some(raw.chars().take(500).collect()),
        )];
        Ok(AgentResult {
            data: CharacterSheet {
                characters,
                characters_text: raw,
            },
            logs,
        })
    }
}
