//! REST API for the narrative writing core
//!
//! A thin controller over [`NovelService`]: request validation, the
//! `{data, error?, agent_logs[]}` response envelope and OpenAPI docs. All
//! behaviour lives in the core.

use crate::config::Settings;
use crate::error::{LlmError, NovelError, RagError, Result};
use crate::service::{NovelService, RetrievedChunkSummary};
use crate::storage::{AgentLog, Project};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tower_http::cors::{Any, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::{OpenApi, ToSchema};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<NovelService>,
    pub settings: Settings,
}

impl AppState {
    pub async fn new(settings: Settings) -> Result<Self> {
        let service = Arc::new(NovelService::from_settings(settings.clone()).await?);
        Ok(Self { service, settings })
    }
}

/// Error payload inside the response envelope
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Uniform response envelope
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse {
    #[schema(value_type = Object, nullable)]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    pub agent_logs: Vec<AgentLog>,
}

impl ApiResponse {
    fn ok(data: serde_json::Value, agent_logs: Vec<AgentLog>) -> Self {
        Self {
            data: Some(data),
            error: None,
            agent_logs,
        }
    }
}

/// Error wrapper mapping core errors onto HTTP statuses
#[derive(Debug)]
pub struct ApiError(NovelError);

impl From<NovelError> for ApiError {
    fn from(err: NovelError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NovelError::NotFound(_) => StatusCode::NOT_FOUND,
            NovelError::Precondition(_) | NovelError::Validation(_) | NovelError::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            NovelError::Llm(LlmError::BackendUnavailable(_))
            | NovelError::Rag(RagError::BackendUnavailable(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ApiResponse {
            data: None,
            error: Some(ApiErrorBody {
                code: self.0.category().to_string(),
                message: self.0.to_string(),
                details: None,
            }),
            agent_logs: Vec::new(),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Request to create a project
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProjectRequest {
    pub genre: String,
    #[serde(default)]
    pub setting: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default = "default_target_chapters")]
    pub target_chapters: i64,
}

fn default_target_chapters() -> i64 {
    10
}

/// Request to generate the outline
#[derive(Debug, Deserialize, ToSchema)]
pub struct OutlineRequest {
    #[serde(default)]
    pub theme: String,
    #[serde(default = "default_total_words")]
    pub total_words: i64,
}

fn default_total_words() -> i64 {
    80_000
}

/// Request to generate the character sheet
#[derive(Debug, Deserialize, ToSchema)]
pub struct CharactersRequest {
    #[serde(default)]
    pub constraints: String,
}

/// Request to expand one chapter
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExpandChapterRequest {
    #[serde(default)]
    pub instruction: String,
    #[serde(default = "default_target_words")]
    pub target_words: i64,
}

fn default_target_words() -> i64 {
    2_500
}

/// Query parameters for the retrieval preview
#[derive(Debug, Deserialize)]
pub struct PreviewParams {
    pub chapter: Option<i64>,
    pub query: Option<String>,
    pub top_k: Option<usize>,
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(NovelError::Validation(message.to_string()))
    }
}

fn project_state(project: &Project) -> serde_json::Value {
    serde_json::json!({
        "id": project.id,
        "genre": project.genre,
        "setting": project.setting,
        "style": project.style,
        "keywords": project.keywords,
        "audience": project.audience,
        "target_chapters": project.target_chapters,
        "outline": project.outline,
        "characters": project.characters_value(),
        "characters_text": project.characters_text,
        "chapters": project.chapters_map(),
        "created_at": project.created_at,
        "updated_at": project.updated_at,
    })
}

fn summarize(chunks: &[crate::rag::types::Chunk]) -> Vec<RetrievedChunkSummary> {
    chunks.iter().map(RetrievedChunkSummary::from_chunk).collect()
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        create_project_handler,
        get_project_handler,
        generate_outline_handler,
        generate_characters_handler,
        expand_chapter_handler,
        rag_stats_handler,
        rag_preview_handler,
    ),
    components(schemas(
        ApiResponse,
        ApiErrorBody,
        AgentLog,
        CreateProjectRequest,
        OutlineRequest,
        CharactersRequest,
        ExpandChapterRequest,
        HealthResponse,
    )),
    info(
        title = "novelforge API",
        description = "Narrative writing core: project lifecycle, hybrid retrieval and chapter expansion"
    )
)]
struct ApiDoc;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .settings
        .cors_origins()
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/projects", post(create_project_handler))
        .route("/projects/{id}", get(get_project_handler))
        .route("/projects/{id}/outline", post(generate_outline_handler))
        .route("/projects/{id}/characters", post(generate_characters_handler))
        .route(
            "/projects/{id}/chapters/{chapter_number}/expand",
            post(expand_chapter_handler),
        )
        .route("/projects/{id}/rag/stats", get(rag_stats_handler))
        .route("/projects/{id}/rag/preview", get(rag_preview_handler))
        .route("/api-docs/openapi.json", get(openapi_spec_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn openapi_spec_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

#[utoipa::path(post, path = "/projects", request_body = CreateProjectRequest,
    responses((status = 200, body = ApiResponse)))]
async fn create_project_handler(
    State(state): State<AppState>,
    Json(payload): Json<CreateProjectRequest>,
) -> ApiResult<Json<ApiResponse>> {
    let genre_len = payload.genre.trim().chars().count();
    ensure(genre_len >= 1, "genre must not be empty")?;
    ensure(genre_len <= 200, "genre too long")?;
    ensure(payload.setting.chars().count() <= 4000, "setting too long")?;
    ensure(payload.style.chars().count() <= 200, "style too long")?;
    ensure(payload.keywords.chars().count() <= 1000, "keywords too long")?;
    ensure(payload.audience.chars().count() <= 1000, "audience too long")?;
    ensure(
        (1..=200).contains(&payload.target_chapters),
        "target_chapters must be in [1, 200]",
    )?;

    let (project, logs) = state
        .service
        .create_project(
            &payload.genre,
            &payload.setting,
            &payload.style,
            &payload.keywords,
            &payload.audience,
            payload.target_chapters,
        )
        .await?;
    Ok(Json(ApiResponse::ok(project_state(&project), logs)))
}

#[utoipa::path(get, path = "/projects/{id}", params(("id" = String, Path, description = "Project id")),
    responses((status = 200, body = ApiResponse), (status = 404, body = ApiResponse)))]
async fn get_project_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse>> {
    let project = state.service.get_project_or_404(&id).await?;
    let logs = project.logs_tail(50);
    Ok(Json(ApiResponse::ok(project_state(&project), logs)))
}

#[utoipa::path(post, path = "/projects/{id}/outline", request_body = OutlineRequest,
    params(("id" = String, Path, description = "Project id")), responses((status = 200, body = ApiResponse)))]
async fn generate_outline_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<OutlineRequest>,
) -> ApiResult<Json<ApiResponse>> {
    ensure(payload.theme.chars().count() <= 500, "theme too long")?;
    ensure(
        (1_000..=2_000_000).contains(&payload.total_words),
        "total_words must be in [1000, 2000000]",
    )?;

    let (project, logs) = state
        .service
        .generate_outline(&id, &payload.theme, payload.total_words)
        .await?;
    Ok(Json(ApiResponse::ok(project_state(&project), logs)))
}

#[utoipa::path(post, path = "/projects/{id}/characters", request_body = CharactersRequest,
    params(("id" = String, Path, description = "Project id")), responses((status = 200, body = ApiResponse)))]
async fn generate_characters_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CharactersRequest>,
) -> ApiResult<Json<ApiResponse>> {
    ensure(payload.constraints.chars().count() <= 2000, "constraints too long")?;

    let (project, logs) = state
        .service
        .generate_characters(&id, &payload.constraints)
        .await?;
    Ok(Json(ApiResponse::ok(project_state(&project), logs)))
}

#[utoipa::path(post, path = "/projects/{id}/chapters/{chapter_number}/expand",
    request_body = ExpandChapterRequest,
    params(("id" = String, Path, description = "Project id"), ("chapter_number" = i64, Path, description = "Target chapter")),
    responses((status = 200, body = ApiResponse)))]
async fn expand_chapter_handler(
    State(state): State<AppState>,
    Path((id, chapter_number)): Path<(String, i64)>,
    Json(payload): Json<ExpandChapterRequest>,
) -> ApiResult<Json<ApiResponse>> {
    ensure(
        (1..=200).contains(&chapter_number),
        "chapter_number must be in [1, 200]",
    )?;
    ensure(payload.instruction.chars().count() <= 2000, "instruction too long")?;
    ensure(
        (200..=20_000).contains(&payload.target_words),
        "target_words must be in [200, 20000]",
    )?;

    let (_, outcome, logs) = state
        .service
        .expand_chapter(&id, chapter_number, &payload.instruction, payload.target_words)
        .await?;
    Ok(Json(ApiResponse::ok(serde_json::to_value(&outcome).map_err(NovelError::from)?, logs)))
}

#[utoipa::path(get, path = "/projects/{id}/rag/stats", params(("id" = String, Path, description = "Project id")),
    responses((status = 200, body = ApiResponse)))]
async fn rag_stats_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse>> {
    let stats = state.service.rag_stats(&id).await?;
    let ordered: BTreeMap<String, _> = stats.into_iter().collect();
    Ok(Json(ApiResponse::ok(
        serde_json::to_value(&ordered).map_err(NovelError::from)?,
        Vec::new(),
    )))
}

#[utoipa::path(get, path = "/projects/{id}/rag/preview",
    params(("id" = String, Path, description = "Project id"), ("chapter" = Option<i64>, Query, description = "Target chapter"),
           ("query" = Option<String>, Query, description = "Retrieval query"), ("top_k" = Option<usize>, Query, description = "Selection size")),
    responses((status = 200, body = ApiResponse)))]
async fn rag_preview_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PreviewParams>,
) -> ApiResult<Json<ApiResponse>> {
    let top_k = params.top_k.unwrap_or(18);
    let debug = state
        .service
        .rag_preview(&id, params.chapter, params.query.as_deref(), top_k)
        .await?;

    let mut grouped: HashMap<String, Vec<RetrievedChunkSummary>> = HashMap::new();
    for chunk in &debug.final_selected {
        grouped
            .entry(chunk.doc_type.clone())
            .or_default()
            .push(RetrievedChunkSummary::from_chunk(chunk));
    }
    let grouped: BTreeMap<String, Vec<RetrievedChunkSummary>> = grouped.into_iter().collect();

    let payload = serde_json::json!({
        "query": debug.query,
        "vector_results": summarize(&debug.vector_results),
        "keyword_results": summarize(&debug.keyword_results),
        "merged_candidates": summarize(&debug.merged_candidates),
        "final_selected": summarize(&debug.final_selected),
        "final_selected_grouped": grouped,
        "context_string": format!("{}\n\n## user instruction\n{}", debug.context_string, debug.query).trim(),
    });
    Ok(Json(ApiResponse::ok(payload, Vec::new())))
}

/// Start the API server
pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| NovelError::Config(format!("server error: {e}")))?;
    Ok(())
}
