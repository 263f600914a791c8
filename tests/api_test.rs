use anyhow::Result;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use scrape_tracker::api::{router, AppState};
use scrape_tracker::db;
use scrape_tracker::executor::{ExecutionOutcome, RunContext, ScriptExecutor};
use scrape_tracker::generator::{GenerationRequest, PhaseGenerator};
use scrape_tracker::model::ProgressUpdate;
use scrape_tracker::progress::MemoryProgressStore;
use scrape_tracker::runs::{RunService, RunSettings};
use scrape_tracker::sessions::SessionService;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

struct OneBatch;

#[async_trait]
impl ScriptExecutor for OneBatch {
    async fn execute(&self, ctx: &RunContext) -> Result<ExecutionOutcome> {
        ctx.reporter
            .report(ProgressUpdate {
                items_processed: 3,
                current_batch: 1,
                total_batches: Some(1),
            })
            .await?;
        Ok(ExecutionOutcome {
            items_processed: 3,
            batches: 1,
        })
    }
}

struct EchoGenerator;

#[async_trait]
impl PhaseGenerator for EchoGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        Ok(json!({ "phase": request.phase.as_str(), "script": "print(1)" }))
    }
}

async fn app() -> (TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/api.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let runs = RunService::new(
        pool.clone(),
        Arc::new(MemoryProgressStore::new()),
        Arc::new(OneBatch),
        RunSettings::default(),
    );
    let sessions = SessionService::new(pool, Arc::new(EchoGenerator));
    (dir, router(AppState { runs, sessions }))
}

async fn send(app: &Router, method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        req = req.header("x-user-id", user);
    }
    let req = match body {
        Some(body) => req
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_scraper(app: &Router, user: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/scrapers",
        Some(user),
        Some(json!({"name": "shop", "url": "https://shop.example", "script": "print(1)"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_ok() {
    let (_dir, app) = app().await;
    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_user_header_is_unauthorized() {
    let (_dir, app) = app().await;
    let (status, body) = send(&app, "GET", "/runs/active", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, "GET", "/sessions", Some("  "), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn trigger_poll_and_stop_over_http() {
    let (_dir, app) = app().await;
    let scraper_id = create_scraper(&app, "alice").await;

    let uri = format!("/scrapers/{}/runs", scraper_id);
    let (status, body) = send(&app, "POST", &uri, Some("alice"), Some(json!({"test_run": true}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let status_uri = format!("/scrapers/{}/runs/{}/status", scraper_id, run_id);
    let (status, snap) = send(&app, "GET", &status_uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snap["run_id"], run_id);
    assert_eq!(snap["is_test_run"], true);

    let (status, _) = send(&app, "GET", &status_uri, Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let stop_uri = format!("/scrapers/{}/runs/{}/stop", scraper_id, run_id);
    let (status, outcome) = send(&app, "POST", &stop_uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(outcome["run"]["is_complete"].as_bool().unwrap());

    let (status, body) = send(&app, "POST", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["run_id"].is_string());
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let (_dir, app) = app().await;
    let scraper_id = create_scraper(&app, "alice").await;

    let uri = format!("/scrapers/{}/runs/{}/status", scraper_id, Uuid::new_v4());
    let (status, body) = send(&app, "GET", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let uri = format!("/scrapers/{}/runs", Uuid::new_v4());
    let (status, _) = send(&app, "POST", &uri, Some("alice"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/sessions/{}/approve-analysis", Uuid::new_v4());
    let (status, _) = send(&app, "POST", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_approvals_over_http() {
    let (_dir, app) = app().await;
    let (status, session) = send(
        &app,
        "POST",
        "/sessions",
        Some("alice"),
        Some(json!({"url": "https://shop.example"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["state"]["phase"], "analysis");

    let (status, _) = send(&app, "POST", &format!("/sessions/{}/approve-data-validation", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // No body at all means no feedback.
    let (status, session) = send(&app, "POST", &format!("/sessions/{}/approve-analysis", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["state"]["phase"], "data_extraction");

    let (status, session) = send(
        &app,
        "POST",
        &format!("/sessions/{}/approve-data-extraction", id),
        Some("alice"),
        Some(json!({"user_feedback": "include sizes"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["state"]["extraction"]["feedback"], "include sizes");

    let (status, _) = send(&app, "POST", &format!("/sessions/{}/approve-data-validation", id), Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, "POST", &format!("/sessions/{}/approve-data-validation", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "POST", &format!("/sessions/{}/finalize", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["state"]["phase"], "done");
    assert_eq!(body["scraper"]["script"], "print(1)");

    let (status, list) = send(&app, "GET", "/sessions", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_trigger_body_is_rejected() {
    let (_dir, app) = app().await;
    let scraper_id = create_scraper(&app, "alice").await;

    let req = Request::builder()
        .method("POST")
        .uri(format!("/scrapers/{}/runs", scraper_id))
        .header("x-user-id", "alice")
        .header("content-type", "application/json")
        .body(Body::from("{\"test_run\": tru"))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let history = format!("/scrapers/{}/runs", scraper_id);
    let (status, runs) = send(&app, "GET", &history, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(runs.as_array().unwrap().is_empty());
}
