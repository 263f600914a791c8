use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::error::ServiceError;
use crate::model::{NewScraper, Phase, Run, RunSnapshot, Scraper, Session};
use crate::runs::StopOutcome;
use crate::sessions::Finalized;

/// Header carrying the caller id set by the upstream auth proxy.
pub const USER_HEADER: &str = "x-user-id";

/// Caller identity taken from [`USER_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| AuthUser(v.to_string()))
            .ok_or_else(|| ServiceError::Unauthorized.into())
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    database: &'static str,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    match sqlx::query("SELECT 1").execute(state.runs.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(Health {
                status: "ok",
                database: "ok",
            }),
        ),
        Err(err) => {
            tracing::error!(?err, "health check query failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Health {
                    status: "degraded",
                    database: "error",
                }),
            )
        }
    }
}

pub async fn create_scraper(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<NewScraper>,
) -> ApiResult<(StatusCode, Json<Scraper>)> {
    let scraper = state.runs.register_scraper(&user, body).await?;
    Ok((StatusCode::CREATED, Json(scraper)))
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerBody {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub test_run: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Triggered {
    pub run_id: Uuid,
}

pub async fn trigger_run(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(scraper_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Triggered>)> {
    // Parsed by hand: the body and content type are optional, and
    // `Option<Json<_>>` would turn malformed JSON into `None` instead of a 400.
    let body: TriggerBody = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid request body: {}", err)))?
    };
    let run_id = state
        .runs
        .trigger(&user, scraper_id, body.run_id, body.test_run)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(Triggered { run_id })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    20
}

pub async fn run_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(scraper_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    Ok(Json(state.runs.history(&user, scraper_id, query.limit).await?))
}

pub async fn run_status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((scraper_id, run_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<RunSnapshot>> {
    Ok(Json(state.runs.get_progress(&user, scraper_id, run_id).await?))
}

pub async fn stop_run(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((scraper_id, run_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<StopOutcome>> {
    Ok(Json(state.runs.stop(&user, scraper_id, run_id).await?))
}

pub async fn active_runs(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Vec<Run>>> {
    Ok(Json(state.runs.active_runs(&user).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateSession {
    pub url: String,
}

pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateSession>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.sessions.create(&user, &body.url).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.sessions.list(&user).await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sessions.get(&user, id).await?))
}

pub async fn generate_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sessions.generate(&user, id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    #[serde(default)]
    pub user_feedback: Option<String>,
}

/// Feedback from an approve body. Empty or malformed bodies carry none.
pub fn parse_feedback(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ApproveBody>(body)
        .ok()
        .and_then(|b| b.user_feedback)
}

async fn approve(state: AppState, user: String, id: Uuid, phase: Phase, body: Bytes) -> ApiResult<Json<Session>> {
    let feedback = parse_feedback(&body);
    let session = state
        .sessions
        .approve(&user, id, phase, feedback.as_deref())
        .await?;
    Ok(Json(session))
}

pub async fn approve_analysis(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<Session>> {
    approve(state, user, id, Phase::Analysis, body).await
}

pub async fn approve_data_extraction(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<Session>> {
    approve(state, user, id, Phase::DataExtraction, body).await
}

pub async fn approve_data_validation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<Session>> {
    approve(state, user, id, Phase::DataValidation, body).await
}

pub async fn finalize_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Finalized>> {
    Ok(Json(state.sessions.finalize(&user, id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_parsing_is_lenient() {
        assert_eq!(
            parse_feedback(br#"{"user_feedback":"add sizes"}"#).as_deref(),
            Some("add sizes")
        );
        assert_eq!(parse_feedback(b""), None);
        assert_eq!(parse_feedback(b"not json"), None);
        assert_eq!(parse_feedback(br#"{"other":1}"#), None);
    }
}
