//! Project state persistence
//!
//! One SQLite file holds the project record, its source documents,
//! chapters, derived chapter memories, the chunk store's primary table and
//! the embedding cache. The project's `agent_logs_json` column is the
//! append-only structured event log every orchestration writes to.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

/// One structured event emitted at an orchestration boundary
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AgentLog {
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    pub agent: String,
    pub action: String,
    pub summary: String,
    #[serde(default)]
    pub output_preview: Option<String>,
}

impl AgentLog {
    pub fn new(
        agent: impl Into<String>,
        action: impl Into<String>,
        summary: impl Into<String>,
        output_preview: Option<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            agent: agent.into(),
            action: action.into(),
            summary: summary.into(),
            output_preview,
        }
    }
}

/// A narrative project with its derived artifacts
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub genre: String,
    pub setting: String,
    pub style: String,
    pub keywords: String,
    pub audience: String,
    pub target_chapters: i64,
    pub outline: String,
    pub characters_json: String,
    pub characters_text: String,
    pub chapters_json: String,
    pub agent_logs_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Character sheet artifact as JSON
    pub fn characters_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.characters_json).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Names of the project's known characters.
    ///
    /// The only structural read of the character sheet the core performs.
    pub fn character_names(&self) -> Vec<String> {
        let value = self.characters_value();
        let Some(list) = value.get("characters").and_then(|c| c.as_array()) else {
            return Vec::new();
        };
        list.iter()
            .filter_map(|c| c.get("name").and_then(|n| n.as_str()))
            .map(|n| n.to_string())
            .collect()
    }

    /// Chapter map artifact (chapter number -> text)
    pub fn chapters_map(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.chapters_json).unwrap_or_default()
    }

    /// Full event log
    pub fn agent_logs(&self) -> Vec<AgentLog> {
        serde_json::from_str(&self.agent_logs_json).unwrap_or_default()
    }

    /// Tail of the event log
    pub fn logs_tail(&self, limit: usize) -> Vec<AgentLog> {
        let logs = self.agent_logs();
        let skip = logs.len().saturating_sub(limit);
        logs.into_iter().skip(skip).collect()
    }
}

/// A versioned input document feeding the chunk store
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub id: String,
    pub project_id: String,
    pub doc_type: String,
    pub chapter_no: Option<i64>,
    pub title: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A chapter row, unique on (project_id, chapter_no)
#[derive(Debug, Clone)]
pub struct Chapter {
    pub id: String,
    pub project_id: String,
    pub chapter_no: i64,
    pub text: String,
}

/// Derived per-chapter memory (summary, facts, foreshadowing)
#[derive(Debug, Clone)]
pub struct ChapterMemory {
    pub id: String,
    pub project_id: String,
    pub chapter_id: String,
    pub chapter_no: i64,
    pub doc_type: String,
    pub text: String,
}

/// Partial update applied to a project's derived artifacts
#[derive(Debug, Default)]
pub struct ProjectUpdate {
    pub outline: Option<String>,
    pub characters: Option<serde_json::Value>,
    pub characters_text: Option<String>,
    pub chapters: Option<HashMap<String, String>>,
    pub append_logs: Vec<AgentLog>,
}

/// CRUD surface over the project tables
#[derive(Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
}

/// Open the configured database file, creating it when missing
pub async fn connect(db_path: &str) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let options =
        SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create every table the core needs.
///
/// Returns whether the FTS5 keyword index is available; SQLite builds
/// without FTS5 still work, keyword retrieval then uses substring scoring.
pub async fn init_db(pool: &SqlitePool) -> Result<bool> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            genre TEXT NOT NULL DEFAULT '',
            setting TEXT NOT NULL DEFAULT '',
            style TEXT NOT NULL DEFAULT '',
            keywords TEXT NOT NULL DEFAULT '',
            audience TEXT NOT NULL DEFAULT '',
            target_chapters INTEGER NOT NULL DEFAULT 10,
            outline TEXT NOT NULL DEFAULT '',
            characters_json TEXT NOT NULL DEFAULT '{}',
            characters_text TEXT NOT NULL DEFAULT '',
            chapters_json TEXT NOT NULL DEFAULT '{}',
            agent_logs_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_documents (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            type TEXT NOT NULL,
            chapter_no INTEGER,
            title TEXT NOT NULL DEFAULT '',
            text TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_source_documents_project ON source_documents(project_id, type)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chapters (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            chapter_no INTEGER NOT NULL,
            text TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(project_id, chapter_no)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chapter_memories (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            chapter_id TEXT NOT NULL,
            chapter_no INTEGER NOT NULL,
            type TEXT NOT NULL,
            text TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chapter_memories_project ON chapter_memories(project_id, chapter_no)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_chunks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            source_id TEXT NOT NULL DEFAULT '',
            chapter_no INTEGER,
            characters TEXT NOT NULL DEFAULT '',
            locations TEXT NOT NULL DEFAULT '',
            pov TEXT NOT NULL DEFAULT '',
            text TEXT NOT NULL DEFAULT '',
            snippet TEXT NOT NULL DEFAULT '',
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rag_chunks_source ON rag_chunks(project_id, type, source_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings_cache (
            cache_key TEXT PRIMARY KEY,
            model_name TEXT NOT NULL,
            vector_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let fts = sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS rag_chunks_fts
        USING fts5(
            chunk_id UNINDEXED,
            project_id UNINDEXED,
            type UNINDEXED,
            chapter_no UNINDEXED,
            text
        )
        "#,
    )
    .execute(pool)
    .await;

    match fts {
        Ok(_) => {
            info!("Database schema ready (FTS5 keyword index enabled)");
            Ok(true)
        }
        Err(e) => {
            warn!("FTS5 unavailable, keyword retrieval will use substring fallback: {}", e);
            Ok(false)
        }
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        genre: row.get("genre"),
        setting: row.get("setting"),
        style: row.get("style"),
        keywords: row.get("keywords"),
        audience: row.get("audience"),
        target_chapters: row.get("target_chapters"),
        outline: row.get("outline"),
        characters_json: row.get("characters_json"),
        characters_text: row.get("characters_text"),
        chapters_json: row.get("chapters_json"),
        agent_logs_json: row.get("agent_logs_json"),
        created_at: parse_ts(row.get::<String, _>("created_at").as_str()),
        updated_at: parse_ts(row.get::<String, _>("updated_at").as_str()),
    }
}

impl ProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_project(
        &self,
        genre: &str,
        setting: &str,
        style: &str,
        keywords: &str,
        audience: &str,
        target_chapters: i64,
    ) -> Result<Project> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO projects (id, genre, setting, style, keywords, audience, target_chapters, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(&id)
        .bind(genre)
        .bind(setting)
        .bind(style)
        .bind(keywords)
        .bind(audience)
        .bind(target_chapters)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_project(&id)
            .await?
            .ok_or_else(|| crate::error::NovelError::NotFound(format!("project {id}")))
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| project_from_row(&r)))
    }

    /// Apply a partial artifact update and append event-log entries
    pub async fn update_artifacts(&self, project: &Project, update: ProjectUpdate) -> Result<Project> {
        let outline = update.outline.unwrap_or_else(|| project.outline.clone());
        let characters_json = match update.characters {
            Some(value) => serde_json::to_string_pretty(&value)?,
            None => project.characters_json.clone(),
        };
        let characters_text = update
            .characters_text
            .unwrap_or_else(|| project.characters_text.clone());
        let chapters_json = match update.chapters {
            Some(map) => serde_json::to_string_pretty(&map)?,
            None => project.chapters_json.clone(),
        };
        let agent_logs_json = if update.append_logs.is_empty() {
            project.agent_logs_json.clone()
        } else {
            let mut logs = project.agent_logs();
            logs.extend(update.append_logs);
            serde_json::to_string_pretty(&logs)?
        };

        sqlx::query(
            r#"
            UPDATE projects
            SET outline = ?1, characters_json = ?2, characters_text = ?3,
                chapters_json = ?4, agent_logs_json = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(&outline)
        .bind(&characters_json)
        .bind(&characters_text)
        .bind(&chapters_json)
        .bind(&agent_logs_json)
        .bind(Utc::now().to_rfc3339())
        .bind(&project.id)
        .execute(&self.pool)
        .await?;

        self.get_project(&project.id)
            .await?
            .ok_or_else(|| crate::error::NovelError::NotFound(format!("project {}", project.id)))
    }

    /// Record a new version of an input document (append-only)
    pub async fn add_source_document(
        &self,
        project_id: &str,
        doc_type: &str,
        chapter_no: Option<i64>,
        title: &str,
        text: &str,
    ) -> Result<SourceDocument> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO source_documents (id, project_id, type, chapter_no, title, text, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&id)
        .bind(project_id)
        .bind(doc_type)
        .bind(chapter_no)
        .bind(title)
        .bind(text)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(SourceDocument {
            id,
            project_id: project_id.to_string(),
            doc_type: doc_type.to_string(),
            chapter_no,
            title: title.to_string(),
            text: text.to_string(),
            created_at: now,
        })
    }

    /// Create or update the chapter row for (project, chapter_no)
    pub async fn upsert_chapter(
        &self,
        project_id: &str,
        chapter_no: i64,
        text: &str,
    ) -> Result<Chapter> {
        let existing = sqlx::query(
            "SELECT id FROM chapters WHERE project_id = ?1 AND chapter_no = ?2",
        )
        .bind(project_id)
        .bind(chapter_no)
        .fetch_optional(&self.pool)
        .await?;

        let now = Utc::now().to_rfc3339();
        let id = match existing {
            Some(row) => {
                let id: String = row.get("id");
                sqlx::query("UPDATE chapters SET text = ?1, updated_at = ?2 WHERE id = ?3")
                    .bind(text)
                    .bind(&now)
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO chapters (id, project_id, chapter_no, text, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                    "#,
                )
                .bind(&id)
                .bind(project_id)
                .bind(chapter_no)
                .bind(text)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                id
            }
        };

        Ok(Chapter {
            id,
            project_id: project_id.to_string(),
            chapter_no,
            text: text.to_string(),
        })
    }

    pub async fn get_chapter(&self, project_id: &str, chapter_no: i64) -> Result<Option<Chapter>> {
        let row = sqlx::query(
            "SELECT id, project_id, chapter_no, text FROM chapters WHERE project_id = ?1 AND chapter_no = ?2",
        )
        .bind(project_id)
        .bind(chapter_no)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Chapter {
            id: r.get("id"),
            project_id: r.get("project_id"),
            chapter_no: r.get("chapter_no"),
            text: r.get("text"),
        }))
    }

    /// Record one derived memory row for a chapter write
    pub async fn add_chapter_memory(
        &self,
        project_id: &str,
        chapter_id: &str,
        chapter_no: i64,
        doc_type: &str,
        text: &str,
    ) -> Result<ChapterMemory> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO chapter_memories (id, project_id, chapter_id, chapter_no, type, text, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&id)
        .bind(project_id)
        .bind(chapter_id)
        .bind(chapter_no)
        .bind(doc_type)
        .bind(text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ChapterMemory {
            id,
            project_id: project_id.to_string(),
            chapter_id: chapter_id.to_string(),
            chapter_no,
            doc_type: doc_type.to_string(),
            text: text.to_string(),
        })
    }
}
