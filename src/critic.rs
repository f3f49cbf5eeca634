//! Consistency critic
//!
//! Reviews a chapter draft against the project's known characters and the
//! retrieved constraint chunks. The rule mode is mechanical and fully
//! offline; the LLM mode asks for a strict-JSON review and may propose a
//! rewrite when auto-revise is enabled.

use crate::error::Result;
use crate::llm::{parse_llm_json, CompletionClient};
use crate::rag::types::Chunk;
use crate::storage::Project;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use utoipa::ToSchema;

/// One consistency finding
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CriticIssue {
    pub issue_type: String,
    pub severity: String,
    pub conflict: String,
    #[serde(default)]
    pub evidence_snippet: Option<String>,
}

/// One suggested edit from the LLM mode
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SuggestedEdit {
    pub edit: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Outcome of one review
#[derive(Debug, Clone, Default)]
pub struct CriticReview {
    pub issues: Vec<CriticIssue>,
    pub suggested_edits: Vec<SuggestedEdit>,
    pub revised_text: Option<String>,
}

/// Rule-based + LLM draft reviewer
pub struct ConsistencyCritic {
    completion: Arc<dyn CompletionClient>,
    use_llm: bool,
    auto_revise: bool,
}

static TABOO_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,，、\s]+").expect("static regex"));

impl ConsistencyCritic {
    pub const NAME: &'static str = "ConsistencyCritic";

    pub fn new(completion: Arc<dyn CompletionClient>, use_llm: bool, auto_revise: bool) -> Self {
        Self {
            completion,
            use_llm,
            auto_revise,
        }
    }

    pub async fn review(
        &self,
        project: &Project,
        chapter_no: i64,
        draft_text: &str,
        constraints: &[Chunk],
        context_used: &str,
    ) -> Result<CriticReview> {
        if !self.use_llm {
            return Ok(self.rule_review(project, draft_text, context_used));
        }
        self.llm_review(chapter_no, draft_text, constraints).await
    }

    async fn llm_review(
        &self,
        chapter_no: i64,
        draft_text: &str,
        constraints: &[Chunk],
    ) -> Result<CriticReview> {
        let system = "You are a consistency critic for long-form fiction. Output strict JSON \
                      only, with no commentary. Review without rewriting by default; a \
                      revised_text field is allowed only when asked for.";

        let key_constraints = constraints
            .iter()
            .take(10)
            .map(|c| format!("[{}] {}", c.doc_type, c.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let revised_field = if self.auto_revise {
            ",\n  \"revised_text\": \"...\""
        } else {
            ""
        };
        let prompt = format!(
            r#"Review the chapter {chapter_no} draft against the key constraints below, checking:
1) character motivation, temperament and relationships stay self-consistent
2) hard world rules are neither violated nor introduced without cause
3) the timeline never silently regresses or conflicts
4) foreshadowing neither contradicts existing hooks nor misses a due payoff

Key constraints (retrieved):
{key_constraints}

Draft:
{draft_text}

Output strict JSON:
{{
  "issues":[{{"issue_type":"character|world|timeline|foreshadowing|style","severity":"low|medium|high","conflict":"...","evidence_snippet":"..."}}],
  "suggested_edits":[{{"edit":"...","reason":"..."}}]{revised_field}
}}
"#
        );

        let raw = self.completion.complete(system, &prompt).await?;
        let parsed = parse_llm_json(&raw).unwrap_or_else(|| serde_json::json!({}));

        let issues = parsed
            .get("issues")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let suggested_edits = parsed
            .get("suggested_edits")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let revised_text = if self.auto_revise {
            parsed
                .get("revised_text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        } else {
            None
        };

        Ok(CriticReview {
            issues,
            suggested_edits,
            revised_text,
        })
    }

    fn rule_review(&self, project: &Project, draft_text: &str, context_used: &str) -> CriticReview {
        let mut issues = Vec::new();

        let names = project.character_names();
        if !names.is_empty() && !names.iter().any(|n| draft_text.contains(n.as_str())) {
            issues.push(CriticIssue {
                issue_type: "character".to_string(),
                severity: "medium".to_string(),
                conflict: "No known principal character appears in this chapter; the cast may \
                           have drifted or an unplanned character was introduced."
                    .to_string(),
                evidence_snippet: Some(draft_text.chars().take(160).collect()),
            });
        }

        for term in taboo_terms(context_used) {
            if draft_text.contains(term.as_str()) {
                issues.push(CriticIssue {
                    issue_type: "style".to_string(),
                    severity: "low".to_string(),
                    conflict: format!("Taboo term hit: {}", term),
                    evidence_snippet: Some(term),
                });
            }
        }

        if draft_text.contains("return to") && draft_text.contains("yesterday") {
            issues.push(CriticIssue {
                issue_type: "timeline".to_string(),
                severity: "low".to_string(),
                conflict: "Possible timeline regression (\"return to\" alongside \"yesterday\"); \
                           confirm it is an explicit flashback."
                    .to_string(),
                evidence_snippet: Some("return to… yesterday…".to_string()),
            });
        }

        CriticReview {
            issues,
            suggested_edits: Vec::new(),
            revised_text: None,
        }
    }
}

/// Parse the taboo vocabulary out of the assembled context: any line whose
/// "taboo"/"forbidden" label precedes a colon contributes the tokens after
/// the colon. Tokens shorter than two chars are noise; the set is capped
/// at twenty.
fn taboo_terms(context_used: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for line in context_used.lines() {
        let lower = line.to_lowercase();
        let labelled = lower.contains("taboo") || lower.contains("forbidden");
        if !labelled {
            continue;
        }
        let tail = match (line.split_once('：'), line.split_once(':')) {
            (Some((_, tail)), _) => tail,
            (None, Some((_, tail))) => tail,
            (None, None) => continue,
        };
        for token in TABOO_SPLIT.split(tail) {
            let token = token.trim();
            if token.chars().count() >= 2 {
                terms.push(token.to_string());
            }
        }
    }
    terms.truncate(20);
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompletionClient;
    use async_trait::async_trait;
    use chrono::Utc;

    fn project_with_characters(json: &str) -> Project {
        Project {
            id: "p".into(),
            genre: String::new(),
            setting: String::new(),
            style: String::new(),
            keywords: String::new(),
            audience: String::new(),
            target_chapters: 10,
            outline: String::new(),
            characters_json: json.into(),
            characters_text: String::new(),
            chapters_json: "{}".into(),
            agent_logs_json: "[]".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rule_critic() -> ConsistencyCritic {
        ConsistencyCritic::new(Arc::new(MockCompletionClient), false, false)
    }

    #[tokio::test]
    async fn test_missing_characters_flagged() {
        let project = project_with_characters(r#"{"characters":[{"name":"Mara"},{"name":"Iven"}]}"#);
        let review = rule_critic()
            .review(&project, 1, "A stranger walked the empty pier.", &[], "")
            .await
            .unwrap();
        assert_eq!(review.issues.len(), 1);
        assert_eq!(review.issues[0].issue_type, "character");
        assert_eq!(review.issues[0].severity, "medium");
    }

    #[tokio::test]
    async fn test_present_character_passes() {
        let project = project_with_characters(r#"{"characters":[{"name":"Mara"}]}"#);
        let review = rule_critic()
            .review(&project, 1, "Mara walked the pier.", &[], "")
            .await
            .unwrap();
        assert!(review.issues.is_empty());
    }

    #[tokio::test]
    async fn test_taboo_hits_from_context() {
        let project = project_with_characters("{}");
        let context = "## style_guide (rules/taboos)\n- Taboos: deus-ex-machina, sudden-powers";
        let review = rule_critic()
            .review(&project, 1, "The deus-ex-machina saved them.", &[], context)
            .await
            .unwrap();
        assert_eq!(review.issues.len(), 1);
        assert_eq!(review.issues[0].issue_type, "style");
        assert_eq!(review.issues[0].severity, "low");
        assert!(review.issues[0].conflict.contains("deus-ex-machina"));
    }

    #[tokio::test]
    async fn test_timeline_hint() {
        let project = project_with_characters("{}");
        let review = rule_critic()
            .review(&project, 1, "They return to the inn where yesterday began.", &[], "")
            .await
            .unwrap();
        assert!(review.issues.iter().any(|i| i.issue_type == "timeline"));
    }

    struct ScriptedCompletion(String);

    #[async_trait]
    impl CompletionClient for ScriptedCompletion {
        async fn complete(&self, _: &str, _: &str) -> Result<String> {
            Ok(self.0.clone())
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_llm_mode_revised_text_gated_by_auto_revise() {
        let reply = r#"{"issues":[],"suggested_edits":[],"revised_text":"NEW"}"#.to_string();
        let project = project_with_characters("{}");

        let critic = ConsistencyCritic::new(Arc::new(ScriptedCompletion(reply.clone())), true, true);
        let review = critic.review(&project, 1, "draft", &[], "").await.unwrap();
        assert_eq!(review.revised_text.as_deref(), Some("NEW"));

        let critic = ConsistencyCritic::new(Arc::new(ScriptedCompletion(reply)), true, false);
        let review = critic.review(&project, 1, "draft", &[], "").await.unwrap();
        assert!(review.revised_text.is_none());
    }

    #[test]
    fn test_taboo_terms_parsing() {
        let context = "prose line\n- Taboos: alpha-term, beta-term、gamma-term\nForbidden topics: delta-term";
        let terms = taboo_terms(context);
        assert_eq!(terms, vec!["alpha-term", "beta-term", "gamma-term", "delta-term"]);
    }
}
