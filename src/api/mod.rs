//! JSON HTTP API.

pub mod error;
pub mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::runs::RunService;
use crate::sessions::SessionService;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<RunService>,
    pub sessions: Arc<SessionService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/scrapers", post(routes::create_scraper))
        .route(
            "/scrapers/:scraper_id/runs",
            get(routes::run_history).post(routes::trigger_run),
        )
        .route(
            "/scrapers/:scraper_id/runs/:run_id/status",
            get(routes::run_status),
        )
        .route(
            "/scrapers/:scraper_id/runs/:run_id/stop",
            post(routes::stop_run),
        )
        .route("/runs/active", get(routes::active_runs))
        .route(
            "/sessions",
            get(routes::list_sessions).post(routes::create_session),
        )
        .route("/sessions/:id", get(routes::get_session))
        .route("/sessions/:id/generate", post(routes::generate_session))
        .route("/sessions/:id/approve-analysis", post(routes::approve_analysis))
        .route(
            "/sessions/:id/approve-data-extraction",
            post(routes::approve_data_extraction),
        )
        .route(
            "/sessions/:id/approve-data-validation",
            post(routes::approve_data_validation),
        )
        .route("/sessions/:id/finalize", post(routes::finalize_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
