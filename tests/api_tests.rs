//! HTTP surface tests: envelope shape, 404 and validation mapping

use axum::body::Body;
use axum::http::{Request, StatusCode};
use novelforge::api::{create_router, AppState};
use novelforge::rag::vector_index::SqliteVectorIndex;
use novelforge::rag::{MockEmbedder, MockReranker};
use novelforge::service::CoreBuilder;
use novelforge::Settings;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tower::ServiceExt;

async fn test_state() -> AppState {
    let settings = Settings::default();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let service = CoreBuilder::new(settings.clone())
        .with_pool(pool)
        .with_vector_index(Arc::new(SqliteVectorIndex::in_memory().await.unwrap()))
        .with_embedder(Arc::new(MockEmbedder::default()))
        .with_reranker(Arc::new(MockReranker))
        .build()
        .await
        .unwrap();
    AppState {
        service: Arc::new(service),
        settings,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn create_and_fetch_project_envelope() {
    let app = create_router(test_state().await);

    let response = app
        .clone()
        .oneshot(
            Request::post("/projects")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"genre":"mystery","setting":"a fog-bound port","style":"noir"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let envelope = body_json(response).await;
    assert!(envelope["error"].is_null() || envelope.get("error").is_none());
    let project_id = envelope["data"]["id"].as_str().unwrap().to_string();
    assert!(envelope["agent_logs"].as_array().unwrap().iter().any(|l| l["action"] == "index"));

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/projects/{project_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope = body_json(response).await;
    assert_eq!(envelope["data"]["genre"], "mystery");
}

#[tokio::test]
async fn unknown_project_is_404() {
    let app = create_router(test_state().await);
    let response = app
        .oneshot(Request::get("/projects/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["code"], "not_found");
}

#[tokio::test]
async fn validation_errors_are_400() {
    let app = create_router(test_state().await);

    // empty genre
    let response = app
        .clone()
        .oneshot(
            Request::post("/projects")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"genre":"  "}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["code"], "validation");
}

#[tokio::test]
async fn precondition_errors_are_400() {
    let app = create_router(test_state().await);

    let response = app
        .clone()
        .oneshot(
            Request::post("/projects")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"genre":"mystery"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    let envelope = body_json(response).await;
    let project_id = envelope["data"]["id"].as_str().unwrap().to_string();

    // characters before outline
    let response = app
        .clone()
        .oneshot(
            Request::post(format!("/projects/{project_id}/characters"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"constraints":""}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["code"], "precondition");

    // out-of-bounds chapter number
    let response = app
        .clone()
        .oneshot(
            Request::post(format!("/projects/{project_id}/chapters/500/expand"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"instruction":""}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_and_preview_endpoints_respond() {
    let app = create_router(test_state().await);

    let response = app
        .clone()
        .oneshot(
            Request::post("/projects")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"genre":"mystery","setting":"the fog"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    let envelope = body_json(response).await;
    let project_id = envelope["data"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/projects/{project_id}/rag/stats"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope = body_json(response).await;
    assert!(envelope["data"]["style_guide"]["chunks"].as_i64().unwrap() >= 1);

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/projects/{project_id}/rag/preview?chapter=2&query=fog"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope = body_json(response).await;
    assert_eq!(envelope["data"]["query"], "fog");
    assert!(envelope["data"]["context_string"]
        .as_str()
        .unwrap()
        .contains("## user instruction"));
}
