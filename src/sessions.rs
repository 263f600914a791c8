//! Authoring sessions: approval-gated generation of a scraper script.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::error::{ServiceError, ServiceResult};
use crate::generator::{ApprovedPhase, GenerationRequest, PhaseGenerator};
use crate::model::{NewScraper, Phase, Scraper, Session};
use crate::pipeline::{Pipeline, TransitionError};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Finalized {
    pub session: Session,
    pub scraper: Scraper,
}

pub struct SessionService {
    pool: Pool,
    generator: Arc<dyn PhaseGenerator>,
}

impl SessionService {
    pub fn new(pool: Pool, generator: Arc<dyn PhaseGenerator>) -> Arc<Self> {
        Arc::new(Self { pool, generator })
    }

    /// Open a session for `url` and generate its analysis.
    ///
    /// The session is stored before generation, so a generator failure leaves
    /// it in place for a later `generate` call.
    #[instrument(skip_all)]
    pub async fn create(&self, user_id: &str, url: &str) -> ServiceResult<Session> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ServiceError::BadRequest("url must be non-empty".into()));
        }
        let now = Utc::now();
        let mut session = Session {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            url: url.to_string(),
            state: Pipeline::default(),
            created_at: now,
            updated_at: now,
        };
        db::insert_session(&self.pool, &session).await?;
        info!(session_id = %session.id, "session created");

        self.fill_current_phase(&mut session).await?;
        Ok(session)
    }

    pub async fn get(&self, user_id: &str, session_id: Uuid) -> ServiceResult<Session> {
        let session = db::fetch_session(&self.pool, session_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("session", session_id))?;
        if session.user_id != user_id {
            return Err(ServiceError::Forbidden("session belongs to another user".into()));
        }
        Ok(session)
    }

    pub async fn list(&self, user_id: &str) -> ServiceResult<Vec<Session>> {
        Ok(db::list_sessions(&self.pool, user_id).await?)
    }

    /// Generate the current phase payload if it is still missing.
    #[instrument(skip_all, fields(%session_id))]
    pub async fn generate(&self, user_id: &str, session_id: Uuid) -> ServiceResult<Session> {
        let mut session = self.get(user_id, session_id).await?;
        if session.phase() == Phase::Done {
            return Err(TransitionError::Finished.into());
        }
        if session.state.current_payload().is_none() {
            self.fill_current_phase(&mut session).await?;
        }
        Ok(session)
    }

    /// Approve `phase` with optional feedback, advance, and generate the next phase.
    #[instrument(skip_all, fields(%session_id, phase = phase.as_str()))]
    pub async fn approve(
        &self,
        user_id: &str,
        session_id: Uuid,
        phase: Phase,
        feedback: Option<&str>,
    ) -> ServiceResult<Session> {
        let mut session = self.get(user_id, session_id).await?;
        if matches!(phase, Phase::Assembly | Phase::Done) {
            return Err(ServiceError::BadRequest(format!(
                "phase {} is completed with finalize",
                phase.as_str()
            )));
        }
        session.state = session.state.approve(phase, feedback)?;
        session.updated_at = Utc::now();
        if !db::update_session_state(&self.pool, &session, phase).await? {
            return Err(concurrent_update(session_id));
        }
        info!(next = session.phase().as_str(), "phase approved");

        self.fill_current_phase(&mut session).await?;
        Ok(session)
    }

    /// Turn the assembled script into a registered scraper and close the session.
    #[instrument(skip_all, fields(%session_id))]
    pub async fn finalize(&self, user_id: &str, session_id: Uuid) -> ServiceResult<Finalized> {
        let mut session = self.get(user_id, session_id).await?;
        if session.phase() != Phase::Assembly {
            return Err(TransitionError::OutOfOrder {
                requested: Phase::Assembly.as_str(),
                current: session.phase().as_str(),
            }
            .into());
        }
        let assembly = session
            .state
            .current_payload()
            .ok_or(TransitionError::MissingPayload(Phase::Assembly.as_str()))?;
        let new = scraper_from_assembly(&session.url, assembly)?;
        let scraper = new
            .into_scraper(user_id)
            .map_err(|msg| ServiceError::BadRequest(msg.to_string()))?;

        session.state = session.state.approve(Phase::Assembly, None)?;
        session.updated_at = Utc::now();
        if !db::finalize_session(&self.pool, &session, Phase::Assembly, &scraper).await? {
            return Err(concurrent_update(session_id));
        }
        info!(scraper_id = %scraper.id, "session finalized");
        Ok(Finalized { session, scraper })
    }

    async fn fill_current_phase(&self, session: &mut Session) -> ServiceResult<()> {
        let request = GenerationRequest {
            session_id: session.id,
            phase: session.phase(),
            url: session.url.clone(),
            approved: session
                .state
                .approved()
                .into_iter()
                .map(|(phase, approved)| ApprovedPhase::new(phase, approved))
                .collect(),
        };
        let payload = match self.generator.generate(&request).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(?err, session_id = %session.id, phase = request.phase.as_str(), "generation failed");
                return Err(ServiceError::Generation(
                    err.context(format!("session {}", session.id)),
                ));
            }
        };
        session.state.set_payload(payload)?;
        session.updated_at = Utc::now();
        if !db::update_session_state(&self.pool, session, request.phase).await? {
            return Err(concurrent_update(session.id));
        }
        Ok(())
    }
}

fn concurrent_update(session_id: Uuid) -> ServiceError {
    ServiceError::BadRequest(format!("session {} was changed by another request", session_id))
}

/// Read the scraper fields out of an assembly payload. Only `script` is required.
fn scraper_from_assembly(session_url: &str, assembly: &Value) -> ServiceResult<NewScraper> {
    let script = assembly
        .get("script")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("assembly payload has no script".into()))?;
    let name = assembly
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| default_name(session_url));
    let required_libraries = assembly
        .get("required_libraries")
        .and_then(Value::as_array)
        .map(|libs| {
            libs.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(NewScraper {
        name,
        url: session_url.to_string(),
        script: script.to_string(),
        required_libraries,
    })
}

fn default_name(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| format!("{} scraper", h)))
        .unwrap_or_else(|| "Generated scraper".to_string())
}
