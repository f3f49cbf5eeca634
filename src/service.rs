//! Project service and expansion orchestrator
//!
//! Drives the full write loop: retrieve → assemble context → write →
//! index → extract memory → index → critique → (maybe revise → re-index),
//! emitting a structured event at every boundary. Post-write failures
//! degrade into fallback events instead of losing the chapter text.

use crate::agents::{CharacterAgent, OutlineAgent, WriterAgent};
use crate::config::Settings;
use crate::critic::{ConsistencyCritic, CriticIssue};
use crate::error::{NovelError, Result};
use crate::llm::{completion_from_settings, CompletionClient};
use crate::rag::context::build_context;
use crate::rag::embeddings::{Embedder, MockEmbedder};
use crate::rag::rerank::{MockReranker, Reranker};
use crate::rag::retriever::Retriever;
use crate::rag::store::{ChunkStore, TypeStats};
use crate::rag::types::{Channel, Chunk, DegradedNotes, RetrievalDebug, RetrievalFilters, ALL_DOC_TYPES};
use crate::rag::vector_index::{SqliteVectorIndex, VectorIndex};
use crate::storage::{self, AgentLog, Project, ProjectStore, ProjectUpdate};
use crate::writeback::WritebackExtractor;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;

/// Number of chunks requested for one chapter expansion
const EXPAND_TOP_K: usize = 18;

/// Compact view of one retrieved chunk, returned to API callers
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RetrievedChunkSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub score: f64,
    pub channel: Channel,
    pub chapter_no: Option<i64>,
    pub source_id: Option<String>,
    pub snippet: String,
}

impl RetrievedChunkSummary {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id.clone(),
            doc_type: chunk.doc_type.clone(),
            score: chunk.score,
            channel: chunk.channel,
            chapter_no: chunk.chapter_no(),
            source_id: chunk.source_id().map(|s| s.to_string()),
            snippet: chunk.snippet.clone(),
        }
    }
}

/// Result of one chapter expansion
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ExpandOutcome {
    pub chapter_number: i64,
    pub text: String,
    pub context_used: String,
    pub retrieved_context_sources: Vec<RetrievedChunkSummary>,
    pub critic_issues: Vec<CriticIssue>,
    pub revised: bool,
}

/// Explicit wiring for the core; every backend can be swapped for tests
pub struct CoreBuilder {
    settings: Settings,
    pool: Option<SqlitePool>,
    vector_index: Option<Arc<dyn VectorIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    completion: Option<Arc<dyn CompletionClient>>,
}

impl CoreBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            pool: None,
            vector_index: None,
            embedder: None,
            reranker: None,
            completion: None,
        }
    }

    pub fn with_pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_vector_index(mut self, vector_index: Arc<dyn VectorIndex>) -> Self {
        self.vector_index = Some(vector_index);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub async fn build(self) -> Result<NovelService> {
        let settings = self.settings;
        let notes = DegradedNotes::new();

        let pool = match self.pool {
            Some(pool) => pool,
            None => storage::connect(&settings.db_path).await?,
        };
        let fts_enabled = storage::init_db(&pool).await?;

        let vector_index: Arc<dyn VectorIndex> = match self.vector_index {
            Some(index) => index,
            None => Arc::new(SqliteVectorIndex::open(&settings.chroma_persist_dir).await?),
        };

        if let Some(device) = &settings.rag_device {
            info!("RAG device hint: {}", device);
        }

        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => embedder_from_settings(&settings, &notes),
        };
        let reranker = match self.reranker {
            Some(reranker) => reranker,
            None => reranker_from_settings(&settings, &notes),
        };
        let completion = match self.completion {
            Some(completion) => completion,
            None => completion_from_settings(&settings),
        };

        let chunks = ChunkStore::new(
            pool.clone(),
            vector_index.clone(),
            embedder.clone(),
            notes.clone(),
            fts_enabled,
            settings.rag_max_chunk_chars,
            settings.rag_overlap_ratio,
        );
        let retriever = Retriever::new(
            pool.clone(),
            vector_index,
            embedder,
            reranker,
            notes.clone(),
            fts_enabled,
            settings.rag_top_k_v,
            settings.rag_top_k_kw,
        );

        let use_llm_critic = settings.critic_provider == "llm" && !settings.mock_llm;
        let critic = ConsistencyCritic::new(completion.clone(), use_llm_critic, settings.auto_revise);

        Ok(NovelService {
            store: ProjectStore::new(pool),
            chunks,
            retriever,
            notes,
            outline_agent: OutlineAgent::new(completion.clone()),
            character_agent: CharacterAgent::new(completion.clone()),
            writer_agent: WriterAgent::new(completion.clone()),
            extractor: WritebackExtractor::new(completion),
            critic,
            auto_revise: settings.auto_revise,
            expansion_locks: tokio::sync::Mutex::new(HashMap::new()),
        })
    }
}

fn embedder_from_settings(settings: &Settings, notes: &DegradedNotes) -> Arc<dyn Embedder> {
    if settings.embeddings_provider == "local_bge_m3" {
        #[cfg(feature = "local-models")]
        {
            match crate::rag::embeddings::LocalBgeEmbedder::new(&settings.bge_m3_model_name) {
                Ok(embedder) => return Arc::new(embedder),
                Err(e) => {
                    warn!("Local embeddings init failed: {}", e);
                    notes.push("Embeddings local_bge_m3 load failed; fallback to mock.");
                }
            }
        }
        #[cfg(not(feature = "local-models"))]
        notes.push("Embeddings local_bge_m3 requires the local-models feature; fallback to mock.");
    }
    Arc::new(MockEmbedder::default())
}

fn reranker_from_settings(settings: &Settings, notes: &DegradedNotes) -> Arc<dyn Reranker> {
    if settings.rerank_provider == "local_bge" {
        #[cfg(feature = "local-models")]
        {
            match crate::rag::rerank::LocalBgeReranker::new(&settings.bge_rerank_model_name) {
                Ok(reranker) => return Arc::new(reranker),
                Err(e) => {
                    warn!("Local reranker init failed: {}", e);
                    notes.push("Reranker local_bge load failed; fallback to mock.");
                }
            }
        }
        #[cfg(not(feature = "local-models"))]
        notes.push("Reranker local_bge requires the local-models feature; fallback to mock.");
    }
    Arc::new(MockReranker)
}

/// The narrative writing core: project state, retrieval engine and agents
pub struct NovelService {
    store: ProjectStore,
    chunks: ChunkStore,
    retriever: Retriever,
    notes: DegradedNotes,
    outline_agent: OutlineAgent,
    character_agent: CharacterAgent,
    writer_agent: WriterAgent,
    extractor: WritebackExtractor,
    critic: ConsistencyCritic,
    auto_revise: bool,
    /// One in-flight expansion per (project, chapter)
    expansion_locks: tokio::sync::Mutex<HashMap<(String, i64), Arc<tokio::sync::Mutex<()>>>>,
}

impl NovelService {
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        CoreBuilder::new(settings).build().await
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub async fn get_project_or_404(&self, project_id: &str) -> Result<Project> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| NovelError::NotFound("project not found".to_string()))
    }

    fn drain_fallback_logs(&self) -> Vec<AgentLog> {
        self.notes
            .drain()
            .into_iter()
            .map(|note| AgentLog::new("RAG", "fallback", note, None))
            .collect()
    }

    /// Create a project and seed its style-guide and world memory
    pub async fn create_project(
        &self,
        genre: &str,
        setting: &str,
        style: &str,
        keywords: &str,
        audience: &str,
        target_chapters: i64,
    ) -> Result<(Project, Vec<AgentLog>)> {
        let project = self
            .store
            .create_project(genre, setting, style, keywords, audience, target_chapters)
            .await?;

        let mut logs: Vec<AgentLog> = self.drain_fallback_logs();

        let style_text = format!(
            "Writing rules (style_guide):\n\
             - Overall style: {style}\n\
             - Narrative requirements: keep characters consistent, advance the timeline monotonically, keep foreshadowing recoverable.\n\
             - Taboos: deus-ex-machina, unmotivated-reversal, sudden-hard-setting\n"
        );
        let style_doc = self
            .store
            .add_source_document(&project.id, "style_guide", None, "style_guide", &style_text)
            .await?;
        self.chunks
            .index_document(
                &project.id,
                "style_guide",
                &style_text,
                serde_json::json!({"source_id": style_doc.id, "project_id": project.id, "type": "style_guide"}),
            )
            .await?;
        logs.push(AgentLog::new(
            "RAG",
            "index",
            "Indexed style_guide",
            Some(style_text.chars().take(240).collect()),
        ));
        logs.extend(self.drain_fallback_logs());

        if !setting.trim().is_empty() {
            let world_doc = self
                .store
                .add_source_document(&project.id, "world", None, "world", setting)
                .await?;
            self.chunks
                .index_document(
                    &project.id,
                    "world",
                    setting,
                    serde_json::json!({"source_id": world_doc.id, "project_id": project.id, "type": "world"}),
                )
                .await?;
            logs.push(AgentLog::new(
                "RAG",
                "index",
                "Indexed world",
                Some(setting.chars().take(240).collect()),
            ));
            logs.extend(self.drain_fallback_logs());
        }

        let project = self
            .store
            .update_artifacts(
                &project,
                ProjectUpdate {
                    append_logs: logs.clone(),
                    ..Default::default()
                },
            )
            .await?;
        Ok((project, logs))
    }

    /// Generate the outline artifact and replace its chunks
    pub async fn generate_outline(
        &self,
        project_id: &str,
        theme: &str,
        total_words: i64,
    ) -> Result<(Project, Vec<AgentLog>)> {
        let project = self.get_project_or_404(project_id).await?;

        let mut logs = vec![AgentLog::new(
            "Coordinator",
            "dispatch",
            "Dispatching outline generation: OutlineAgent",
            None,
        )];
        let result = self.outline_agent.run(&project, theme, total_words).await?;
        logs.extend(result.logs);

        let project = self
            .store
            .update_artifacts(
                &project,
                ProjectUpdate {
                    outline: Some(result.data.clone()),
                    append_logs: logs.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let doc = self
            .store
            .add_source_document(&project.id, "outline", None, "outline", &project.outline)
            .await?;
        self.chunks
            .index_document(
                &project.id,
                "outline",
                &project.outline,
                serde_json::json!({"source_id": doc.id, "project_id": project.id, "type": "outline"}),
            )
            .await?;

        let rag_log = AgentLog::new(
            "RAG",
            "index",
            "Indexed outline",
            Some(project.outline.chars().take(240).collect()),
        );
        let fallback_logs = self.drain_fallback_logs();
        let mut tail_logs = vec![rag_log];
        tail_logs.extend(fallback_logs);

        let project = self
            .store
            .update_artifacts(
                &project,
                ProjectUpdate {
                    append_logs: tail_logs.clone(),
                    ..Default::default()
                },
            )
            .await?;

        logs.extend(tail_logs);
        Ok((project, logs))
    }

    /// Generate the character sheet artifact and replace its chunks
    pub async fn generate_characters(
        &self,
        project_id: &str,
        constraints: &str,
    ) -> Result<(Project, Vec<AgentLog>)> {
        let project = self.get_project_or_404(project_id).await?;
        if project.outline.trim().is_empty() {
            return Err(NovelError::Precondition(
                "outline is empty; generate outline first".to_string(),
            ));
        }

        let mut logs = vec![AgentLog::new(
            "Coordinator",
            "dispatch",
            "Dispatching character generation: CharacterAgent",
            None,
        )];
        let result = self.character_agent.run(&project, constraints).await?;
        logs.extend(result.logs.clone());

        let project = self
            .store
            .update_artifacts(
                &project,
                ProjectUpdate {
                    characters: Some(result.data.characters.clone()),
                    characters_text: Some(result.data.characters_text.clone()),
                    append_logs: logs.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let names = project.character_names();
        let combined_text = format!(
            "Character sheet JSON:\n{}\n\nCharacter summary:\n{}",
            project.characters_json, project.characters_text
        );
        let doc = self
            .store
            .add_source_document(&project.id, "characters", None, "characters", &combined_text)
            .await?;
        self.chunks
            .index_document(
                &project.id,
                "characters",
                &combined_text,
                serde_json::json!({
                    "source_id": doc.id,
                    "project_id": project.id,
                    "type": "characters",
                    "characters": names.join(","),
                }),
            )
            .await?;

        let rag_log = AgentLog::new(
            "RAG",
            "index",
            "Indexed characters",
            Some(combined_text.chars().take(240).collect()),
        );
        let fallback_logs = self.drain_fallback_logs();
        let mut tail_logs = vec![rag_log];
        tail_logs.extend(fallback_logs);

        let project = self
            .store
            .update_artifacts(
                &project,
                ProjectUpdate {
                    append_logs: tail_logs.clone(),
                    ..Default::default()
                },
            )
            .await?;

        logs.extend(tail_logs);
        Ok((project, logs))
    }

    /// Expand one chapter: the central retrieve → write → index → extract →
    /// critique → (maybe revise) sequence.
    pub async fn expand_chapter(
        &self,
        project_id: &str,
        chapter_number: i64,
        instruction: &str,
        target_words: i64,
    ) -> Result<(Project, ExpandOutcome, Vec<AgentLog>)> {
        let project = self.get_project_or_404(project_id).await?;
        if project.outline.trim().is_empty() {
            return Err(NovelError::Precondition(
                "outline is empty; generate outline first".to_string(),
            ));
        }
        let characters_trimmed = project.characters_json.trim();
        if characters_trimmed.is_empty() || characters_trimmed == "{}" {
            return Err(NovelError::Precondition(
                "characters are empty; generate characters first".to_string(),
            ));
        }

        let lock = self.expansion_lock(project_id, chapter_number).await;
        let _guard = lock.lock().await;
        // re-read under the lock so a just-finished expansion is visible
        let project = self.get_project_or_404(project_id).await?;

        let query = format!("Chapter {chapter_number} expansion: {instruction}")
            .trim()
            .to_string();
        let names = project.character_names();

        let filters = RetrievalFilters {
            types: Some(ALL_DOC_TYPES.iter().map(|t| t.to_string()).collect()),
            chapter_no: Some(chapter_number),
            chapter_only_before: true,
            top_k_v: None,
            top_k_kw: None,
        };
        let retrieved = self
            .retriever
            .retrieve(&project.id, &query, &filters, EXPAND_TOP_K)
            .await?;
        let mut fallback_logs = self.drain_fallback_logs();

        let context = build_context(&retrieved);
        let context_with_instruction = format!("{}\n\n## user instruction\n{}", context, instruction)
            .trim()
            .to_string();

        let writer_result = self
            .writer_agent
            .run(
                chapter_number,
                &format!("[Follow the retrieved context strictly]\n\n{context_with_instruction}"),
                target_words,
                &project.style,
            )
            .await?;
        let mut writer_logs = vec![AgentLog::new(
            "Coordinator",
            "dispatch",
            format!("Dispatching chapter expansion: WriterAgent (chapter {chapter_number})"),
            None,
        )];
        writer_logs.extend(writer_result.logs);

        let mut chapters = project.chapters_map();
        chapters.insert(chapter_number.to_string(), writer_result.data.clone());
        let project = self
            .store
            .update_artifacts(
                &project,
                ProjectUpdate {
                    chapters: Some(chapters),
                    append_logs: writer_logs.clone(),
                    ..Default::default()
                },
            )
            .await?;

        // normalized chapter row gives chunk replacement a stable source_id
        let chapter = self
            .store
            .upsert_chapter(&project.id, chapter_number, &writer_result.data)
            .await?;
        self.chunks
            .index_document(
                &project.id,
                "chapter",
                &chapter.text,
                serde_json::json!({
                    "source_id": chapter.id,
                    "project_id": project.id,
                    "type": "chapter",
                    "chapter_no": chapter_number,
                    "characters": names.join(","),
                }),
            )
            .await?;

        let rag_log = AgentLog::new(
            "RAG",
            "retrieve",
            format!("Retrieved {} context chunks before expansion", retrieved.len()),
            Some(context.chars().take(400).collect()),
        );
        let index_log = AgentLog::new(
            "RAG",
            "index",
            format!("Indexed chapter #{chapter_number}"),
            Some(chapter.text.chars().take(240).collect()),
        );

        // Post-write extraction; an extraction failure never loses the
        // chapter, it becomes a fallback event.
        let mut mem_logs: Vec<AgentLog> = Vec::new();
        let mut extract_logs: Vec<AgentLog> = Vec::new();
        match self.extractor.extract(&project, chapter_number, &chapter.text).await {
            Ok((memory, logs)) => {
                extract_logs = logs;
                for (mem_type, mem_text) in memory.entries() {
                    let mem = self
                        .store
                        .add_chapter_memory(&project.id, &chapter.id, chapter_number, mem_type, mem_text)
                        .await?;
                    self.chunks
                        .index_document(
                            &project.id,
                            mem_type,
                            mem_text,
                            serde_json::json!({
                                "source_id": mem.id,
                                "project_id": project.id,
                                "type": mem_type,
                                "chapter_no": chapter_number,
                                "characters": names.join(","),
                            }),
                        )
                        .await?;
                    mem_logs.push(AgentLog::new(
                        "RAG",
                        "index",
                        format!("Indexed {mem_type} (chapter {chapter_number})"),
                        Some(mem_text.chars().take(240).collect()),
                    ));
                }
            }
            Err(e) => {
                warn!("Post-write extraction failed: {}", e);
                mem_logs.push(AgentLog::new(
                    WritebackExtractor::NAME,
                    "fallback",
                    format!("Post-write extraction failed; chapter kept without derived memory: {e}"),
                    None,
                ));
            }
        }
        fallback_logs.extend(self.drain_fallback_logs());

        let constraint_chunks: Vec<Chunk> = retrieved
            .iter()
            .filter(|c| matches!(c.doc_type.as_str(), "characters" | "world" | "facts" | "outline"))
            .cloned()
            .collect();
        let review = match self
            .critic
            .review(
                &project,
                chapter_number,
                &chapter.text,
                &constraint_chunks,
                &context_with_instruction,
            )
            .await
        {
            Ok(review) => review,
            Err(e) => {
                warn!("Critic review failed: {}", e);
                fallback_logs.push(AgentLog::new(
                    ConsistencyCritic::NAME,
                    "fallback",
                    format!("Critic review failed; chapter kept unreviewed: {e}"),
                    None,
                ));
                Default::default()
            }
        };

        let mut revised = false;
        let mut final_text = chapter.text.clone();
        let mut project = project;
        if let Some(revised_text) = review.revised_text.as_ref().filter(|t| !t.is_empty()) {
            if self.auto_revise {
                revised = true;
                final_text = revised_text.clone();
                let chapter = self
                    .store
                    .upsert_chapter(&project.id, chapter_number, &final_text)
                    .await?;
                self.chunks
                    .index_document(
                        &project.id,
                        "chapter",
                        &final_text,
                        serde_json::json!({
                            "source_id": chapter.id,
                            "project_id": project.id,
                            "type": "chapter",
                            "chapter_no": chapter_number,
                            "characters": names.join(","),
                        }),
                    )
                    .await?;
                let mut chapters = project.chapters_map();
                chapters.insert(chapter_number.to_string(), final_text.clone());
                project = self
                    .store
                    .update_artifacts(
                        &project,
                        ProjectUpdate {
                            chapters: Some(chapters),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        fallback_logs.extend(self.drain_fallback_logs());

        let critic_log = AgentLog::new(
            ConsistencyCritic::NAME,
            "review",
            format!(
                "Consistency review: issues={} revised={}",
                review.issues.len(),
                revised
            ),
            serde_json::to_string(&review.issues)
                .ok()
                .map(|s| s.chars().take(500).collect()),
        );

        let mut boundary_logs = fallback_logs.clone();
        boundary_logs.push(rag_log);
        boundary_logs.push(index_log);
        boundary_logs.extend(extract_logs);
        boundary_logs.extend(mem_logs);
        boundary_logs.push(critic_log);

        let project = self
            .store
            .update_artifacts(
                &project,
                ProjectUpdate {
                    append_logs: boundary_logs.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let context_used = {
            let full = &context_with_instruction;
            if full.chars().count() > 4000 {
                let head: String = full.chars().take(4000).collect();
                format!("{}…", head)
            } else {
                full.clone()
            }
        };
        let outcome = ExpandOutcome {
            chapter_number,
            text: final_text,
            context_used,
            retrieved_context_sources: retrieved.iter().map(RetrievedChunkSummary::from_chunk).collect(),
            critic_issues: review.issues,
            revised,
        };

        let mut logs = writer_logs;
        logs.extend(boundary_logs);
        Ok((project, outcome, logs))
    }

    /// Per-type chunk stats for a project
    pub async fn rag_stats(&self, project_id: &str) -> Result<HashMap<String, TypeStats>> {
        self.get_project_or_404(project_id).await?;
        self.chunks.stats(project_id).await
    }

    /// Stage-by-stage retrieval preview
    pub async fn rag_preview(
        &self,
        project_id: &str,
        chapter_no: Option<i64>,
        query: Option<&str>,
        top_k: usize,
    ) -> Result<RetrievalDebug> {
        self.get_project_or_404(project_id).await?;
        let query = match query.map(|q| q.trim()).filter(|q| !q.is_empty()) {
            Some(q) => q.to_string(),
            None => match chapter_no {
                Some(n) => format!("Chapter {n}"),
                None => "writing consistency retrieval".to_string(),
            },
        };
        self.retriever.preview(project_id, &query, chapter_no, top_k).await
    }

    async fn expansion_lock(&self, project_id: &str, chapter_no: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.expansion_locks.lock().await;
        locks
            .entry((project_id.to_string(), chapter_no))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
