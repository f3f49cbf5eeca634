//! Orchestrator scenarios: the full write loop, auto-revise and degraded mode

use async_trait::async_trait;
use novelforge::error::{LlmError, RagError, Result};
use novelforge::llm::CompletionClient;
use novelforge::rag::vector_index::{SqliteVectorIndex, VectorHit, VectorIndex, VectorRecord};
use novelforge::rag::{Embedder, MockEmbedder, MockReranker};
use novelforge::service::CoreBuilder;
use novelforge::{NovelError, NovelService, Settings};
use sqlx::sqlite::SqlitePool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Completion backend that replays a fixed script of replies
struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedCompletion {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        self.replies
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| LlmError::GenerationFailed("script exhausted".to_string()).into())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

const CHARACTERS_REPLY: &str =
    r#"{"characters":[{"name":"Mara","role":"lead"},{"name":"Iven","role":"foil"}],"world_rules":["the tide keeps time"]}"#;
const EXTRACT_REPLY: &str = r#"{"chapter_summary":"Mara counts lanterns on the pier and finds one dark.",
"facts":[{"category":"location","subject":"pier","change":"one lantern dark","evidence":"Mara's count"}],
"foreshadowing":[{"hook":"dark lantern","clue":"salt on the glass","expected_payoff":"the smuggler's signal","range":"chapters 2-4"}]}"#;

async fn service_with(
    completion: Arc<dyn CompletionClient>,
    vector_index: Arc<dyn VectorIndex>,
    settings: Settings,
) -> NovelService {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    CoreBuilder::new(settings)
        .with_pool(pool)
        .with_vector_index(vector_index)
        .with_embedder(Arc::new(MockEmbedder::default()))
        .with_reranker(Arc::new(MockReranker))
        .with_completion(completion)
        .build()
        .await
        .unwrap()
}

async fn bootstrap_project(service: &NovelService) -> String {
    let (project, _) = service
        .create_project("mystery", "a fog-bound port town", "noir", "fog,tide", "adult", 12)
        .await
        .unwrap();
    service
        .generate_outline(&project.id, "the missing keeper", 80_000)
        .await
        .unwrap();
    service.generate_characters(&project.id, "").await.unwrap();
    project.id
}

#[tokio::test]
async fn preconditions_guard_characters_and_expansion() {
    let completion = ScriptedCompletion::new(&[]);
    let index = Arc::new(SqliteVectorIndex::in_memory().await.unwrap());
    let service = service_with(completion, index, Settings::default()).await;

    let (project, _) = service
        .create_project("mystery", "", "noir", "", "", 10)
        .await
        .unwrap();

    let err = service.generate_characters(&project.id, "").await.unwrap_err();
    assert!(matches!(err, NovelError::Precondition(_)));

    let err = service
        .expand_chapter(&project.id, 1, "open on the pier", 2500)
        .await
        .unwrap_err();
    assert!(matches!(err, NovelError::Precondition(_)));

    let err = service.get_project_or_404("missing").await.unwrap_err();
    assert!(matches!(err, NovelError::NotFound(_)));
}

#[tokio::test]
async fn expand_runs_the_full_write_loop() {
    let completion = ScriptedCompletion::new(&[
        "Volume one: Mara investigates the harbor.\n\nChapter 1: the dark lantern.",
        CHARACTERS_REPLY,
        "Chapter One\n\nMara walked the pier at dusk, counting lanterns while Iven watched the tide.",
        EXTRACT_REPLY,
    ]);
    let index = Arc::new(SqliteVectorIndex::in_memory().await.unwrap());
    let service = service_with(completion, index, Settings::default()).await;
    let project_id = bootstrap_project(&service).await;

    let (project, outcome, logs) = service
        .expand_chapter(&project_id, 1, "open on the dark lantern", 2500)
        .await
        .unwrap();

    assert_eq!(outcome.chapter_number, 1);
    assert!(outcome.text.contains("Mara walked the pier"));
    assert!(!outcome.revised);
    assert!(outcome.context_used.contains("## user instruction"));
    assert!(!outcome.retrieved_context_sources.is_empty());

    // chapter row and project chapter map both hold the draft
    let chapter = service.store().get_chapter(&project_id, 1).await.unwrap().unwrap();
    assert_eq!(chapter.text, outcome.text);
    assert_eq!(project.chapters_map().get("1").unwrap(), &outcome.text);

    // the write-back indexed chapter + all three derived memory types
    let stats = service.rag_stats(&project_id).await.unwrap();
    for doc_type in ["style_guide", "world", "outline", "characters", "chapter", "chapter_summary", "facts", "foreshadowing"] {
        assert!(stats.contains_key(doc_type), "missing stats for {doc_type}");
        assert!(stats[doc_type].chunks >= 1);
    }

    // every boundary emitted an event
    let actions: Vec<&str> = logs.iter().map(|l| l.action.as_str()).collect();
    for action in ["dispatch", "expand_chapter", "retrieve", "index", "extract", "review"] {
        assert!(actions.contains(&action), "missing {action} event");
    }
}

#[tokio::test]
async fn auto_revise_replaces_chapter_text_and_chunks() {
    let completion = ScriptedCompletion::new(&[
        "Outline: Mara and the lantern.",
        CHARACTERS_REPLY,
        "ORIGINAL DRAFT about Mara on the pier.",
        EXTRACT_REPLY,
        r#"{"issues":[],"suggested_edits":[],"revised_text":"NEW"}"#,
    ]);
    let index = Arc::new(SqliteVectorIndex::in_memory().await.unwrap());

    let mut settings = Settings::default();
    settings.critic_provider = "llm".to_string();
    settings.mock_llm = false;
    settings.auto_revise = true;

    let service = service_with(completion, index.clone(), settings).await;
    let project_id = bootstrap_project(&service).await;

    let (project, outcome, _) = service
        .expand_chapter(&project_id, 1, "open on the pier", 2500)
        .await
        .unwrap();

    assert!(outcome.revised);
    assert_eq!(outcome.text, "NEW");
    assert_eq!(
        service.store().get_chapter(&project_id, 1).await.unwrap().unwrap().text,
        "NEW"
    );
    assert_eq!(project.chapters_map().get("1").unwrap(), "NEW");

    // primary table holds only the revised chapter chunks
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT text FROM rag_chunks WHERE project_id = ?1 AND type = 'chapter'",
    )
    .bind(&project_id)
    .fetch_all(service.store().pool())
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "NEW");

    // and so does the vector index namespace
    let embedder = MockEmbedder::default();
    let query_vec = embedder.embed_query("NEW").await.unwrap();
    let hits = index
        .query(&project_id, &query_vec, 50, Some(&["chapter".to_string()]))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document, "NEW");
}

#[tokio::test]
async fn re_expansion_replaces_prior_chapter_chunks() {
    let completion = ScriptedCompletion::new(&[
        "Outline text.",
        CHARACTERS_REPLY,
        "FIRST DRAFT with Mara.",
        EXTRACT_REPLY,
        "SECOND DRAFT with Mara.",
        EXTRACT_REPLY,
    ]);
    let index = Arc::new(SqliteVectorIndex::in_memory().await.unwrap());
    let service = service_with(completion, index, Settings::default()).await;
    let project_id = bootstrap_project(&service).await;

    service.expand_chapter(&project_id, 1, "", 2500).await.unwrap();
    let (_, outcome, _) = service.expand_chapter(&project_id, 1, "", 2500).await.unwrap();
    assert!(outcome.text.contains("SECOND DRAFT"));

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT text FROM rag_chunks WHERE project_id = ?1 AND type = 'chapter'",
    )
    .bind(&project_id)
    .fetch_all(service.store().pool())
    .await
    .unwrap();
    assert_eq!(rows.len(), 1, "re-expansion must replace, not accumulate");
    assert!(rows[0].0.contains("SECOND DRAFT"));
}

/// Vector backend that always fails, to exercise degraded mode end to end
struct BrokenVectorIndex;

#[async_trait]
impl VectorIndex for BrokenVectorIndex {
    async fn upsert(&self, _: &str, _: &[VectorRecord]) -> Result<()> {
        Err(RagError::BackendUnavailable("vector backend offline".to_string()).into())
    }
    async fn delete(&self, _: &str, _: &[String]) -> Result<()> {
        Err(RagError::BackendUnavailable("vector backend offline".to_string()).into())
    }
    async fn query(&self, _: &str, _: &[f32], _: usize, _: Option<&[String]>) -> Result<Vec<VectorHit>> {
        Err(RagError::BackendUnavailable("vector backend offline".to_string()).into())
    }
    async fn count(&self, _: &str) -> Result<usize> {
        Ok(0)
    }
}

#[tokio::test]
async fn degraded_vector_backend_still_completes_expansion() {
    let completion = ScriptedCompletion::new(&[
        "Outline text about the tide.",
        CHARACTERS_REPLY,
        "DRAFT: Mara listens to the tide.",
        EXTRACT_REPLY,
    ]);
    let service = service_with(completion, Arc::new(BrokenVectorIndex), Settings::default()).await;
    let project_id = bootstrap_project(&service).await;

    let (project, outcome, _) = service
        .expand_chapter(&project_id, 1, "the tide", 2500)
        .await
        .unwrap();

    assert!(outcome.text.contains("Mara listens to the tide"));
    assert_eq!(
        service.store().get_chapter(&project_id, 1).await.unwrap().unwrap().text,
        outcome.text
    );

    // degraded mode is visible in the event log
    let logs = project.agent_logs();
    assert!(logs.iter().any(|l| l.action == "fallback"), "no fallback event recorded");

    // retrieval still works off the keyword channel alone
    let debug = service
        .rag_preview(&project_id, Some(2), Some("tide"), 10)
        .await
        .unwrap();
    assert!(debug.vector_results.is_empty());
    assert!(!debug.keyword_results.is_empty());
    assert!(!debug.final_selected.is_empty());
}

#[tokio::test]
async fn preview_uses_default_query_when_absent() {
    let completion = ScriptedCompletion::new(&[]);
    let index = Arc::new(SqliteVectorIndex::in_memory().await.unwrap());
    let service = service_with(completion, index, Settings::default()).await;
    let (project, _) = service
        .create_project("mystery", "fog over the water", "noir", "", "", 10)
        .await
        .unwrap();

    let debug = service.rag_preview(&project.id, Some(3), None, 10).await.unwrap();
    assert_eq!(debug.query, "Chapter 3");

    let debug = service.rag_preview(&project.id, None, None, 10).await.unwrap();
    assert_eq!(debug.query, "writing consistency retrieval");
}
