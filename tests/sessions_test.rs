use anyhow::{anyhow, Result};
use async_trait::async_trait;
use scrape_tracker::db;
use scrape_tracker::error::ServiceError;
use scrape_tracker::generator::{GenerationRequest, PhaseGenerator};
use scrape_tracker::model::Phase;
use scrape_tracker::sessions::SessionService;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Records every request; replays queued responses, then falls back to a
/// canned payload per phase.
#[derive(Clone, Default)]
struct RecordingGenerator {
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
    responses: Arc<Mutex<VecDeque<Result<Value>>>>,
}

impl RecordingGenerator {
    async fn fail_next(&self, msg: &str) {
        self.responses.lock().await.push_back(Err(anyhow!(msg.to_string())));
    }
}

#[async_trait]
impl PhaseGenerator for RecordingGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        self.requests.lock().await.push(request.clone());
        if let Some(next) = self.responses.lock().await.pop_front() {
            return next;
        }
        Ok(match request.phase {
            Phase::Assembly => json!({
                "name": "Shoe prices",
                "script": "print('assembled')",
                "required_libraries": ["httpx", "selectolax"],
            }),
            phase => json!({ "phase": phase.as_str() }),
        })
    }
}

async fn setup() -> (TempDir, Arc<SessionService>, RecordingGenerator, db::Pool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/sessions.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let generator = RecordingGenerator::default();
    let service = SessionService::new(pool.clone(), Arc::new(generator.clone()));
    (dir, service, generator, pool)
}

#[tokio::test]
async fn full_walk_registers_scraper() {
    let (_dir, service, generator, pool) = setup().await;
    let session = service.create("alice", "https://shop.example/shoes").await.unwrap();
    assert_eq!(session.phase(), Phase::Analysis);
    assert_eq!(session.state.current_payload(), Some(&json!({"phase": "analysis"})));

    let session = service
        .approve("alice", session.id, Phase::Analysis, Some("focus on prices"))
        .await
        .unwrap();
    assert_eq!(session.phase(), Phase::DataExtraction);
    assert!(session.state.current_payload().is_some());

    let session = service
        .approve("alice", session.id, Phase::DataExtraction, Some("   "))
        .await
        .unwrap();
    let session = service
        .approve("alice", session.id, Phase::DataValidation, None)
        .await
        .unwrap();
    assert_eq!(session.phase(), Phase::Assembly);

    {
        let requests = generator.requests.lock().await;
        let phases: Vec<Phase> = requests.iter().map(|r| r.phase).collect();
        assert_eq!(
            phases,
            vec![Phase::Analysis, Phase::DataExtraction, Phase::DataValidation, Phase::Assembly]
        );
        let last = requests.last().unwrap();
        assert_eq!(last.approved.len(), 3);
        assert_eq!(last.approved[0].feedback.as_deref(), Some("focus on prices"));
        assert_eq!(last.approved[1].feedback, None);
    }

    let finalized = service.finalize("alice", session.id).await.unwrap();
    assert_eq!(finalized.session.phase(), Phase::Done);
    assert_eq!(finalized.scraper.name, "Shoe prices");
    assert_eq!(finalized.scraper.url, "https://shop.example/shoes");
    assert_eq!(finalized.scraper.user_id, "alice");

    let stored = db::fetch_scraper(&pool, finalized.scraper.id).await.unwrap().unwrap();
    assert_eq!(stored.script, "print('assembled')");
    assert_eq!(stored.required_libraries, vec!["httpx".to_string(), "selectolax".to_string()]);

    let reloaded = service.get("alice", session.id).await.unwrap();
    assert_eq!(reloaded.phase(), Phase::Done);
    let err = service.finalize("alice", session.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
}

#[tokio::test]
async fn skipping_or_repeating_a_phase_is_rejected() {
    let (_dir, service, _generator, _pool) = setup().await;
    let session = service.create("alice", "https://shop.example").await.unwrap();

    let err = service
        .approve("alice", session.id, Phase::DataValidation, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
    let err = service.finalize("alice", session.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    service
        .approve("alice", session.id, Phase::Analysis, None)
        .await
        .unwrap();
    let err = service
        .approve("alice", session.id, Phase::Analysis, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
    assert_eq!(
        service.get("alice", session.id).await.unwrap().phase(),
        Phase::DataExtraction
    );
}

#[tokio::test]
async fn empty_feedback_still_advances() {
    let (_dir, service, _generator, _pool) = setup().await;
    let session = service.create("alice", "https://shop.example").await.unwrap();
    let session = service
        .approve("alice", session.id, Phase::Analysis, Some(""))
        .await
        .unwrap();
    assert_eq!(session.phase(), Phase::DataExtraction);
    let approved = session.state.approved();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].1.feedback, None);
}

#[tokio::test]
async fn other_users_are_forbidden_everywhere() {
    let (_dir, service, _generator, _pool) = setup().await;
    let session = service.create("alice", "https://shop.example").await.unwrap();

    for phase in [Phase::Analysis, Phase::DataExtraction, Phase::DataValidation] {
        let err = service
            .approve("mallory", session.id, phase, Some("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)), "phase {:?}", phase);
    }
    assert!(matches!(
        service.get("mallory", session.id).await.unwrap_err(),
        ServiceError::Forbidden(_)
    ));
    assert!(matches!(
        service.finalize("mallory", session.id).await.unwrap_err(),
        ServiceError::Forbidden(_)
    ));
    assert!(service.list("mallory").await.unwrap().is_empty());
    assert_eq!(service.get("alice", session.id).await.unwrap().phase(), Phase::Analysis);

    let err = service
        .approve("alice", Uuid::new_v4(), Phase::Analysis, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound { entity: "session", .. }));
}

#[tokio::test]
async fn generation_failure_is_reported_and_retryable() {
    let (_dir, service, generator, _pool) = setup().await;
    let session = service.create("alice", "https://shop.example").await.unwrap();

    generator.fail_next("model overloaded").await;
    let err = service
        .approve("alice", session.id, Phase::Analysis, Some("ok"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Generation(_)));
    assert!(err.to_string().contains("model overloaded"));

    // The advance was persisted without a payload.
    let stored = service.get("alice", session.id).await.unwrap();
    assert_eq!(stored.phase(), Phase::DataExtraction);
    assert!(stored.state.current_payload().is_none());
    let err = service
        .approve("alice", session.id, Phase::DataExtraction, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    let regenerated = service.generate("alice", session.id).await.unwrap();
    assert_eq!(
        regenerated.state.current_payload(),
        Some(&json!({"phase": "data_extraction"}))
    );
}

#[tokio::test]
async fn failed_create_keeps_session_for_retry() {
    let (_dir, service, generator, _pool) = setup().await;
    generator.fail_next("timeout").await;
    let err = service.create("alice", "https://shop.example").await.unwrap_err();
    assert!(matches!(err, ServiceError::Generation(_)));

    let sessions = service.list("alice").await.unwrap();
    assert_eq!(sessions.len(), 1);
    let session = service.generate("alice", sessions[0].id).await.unwrap();
    assert_eq!(session.phase(), Phase::Analysis);
    assert!(session.state.current_payload().is_some());

    let err = service.create("alice", "   ").await.unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
}

#[tokio::test]
async fn racing_approvals_and_finalizes_apply_once() {
    let (_dir, service, generator, pool) = setup().await;
    let session = service.create("alice", "https://shop.example").await.unwrap();

    let (a, b) = tokio::join!(
        service.approve("alice", session.id, Phase::Analysis, Some("first")),
        service.approve("alice", session.id, Phase::Analysis, Some("second")),
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(ServiceError::BadRequest(_)))));
    {
        let phases: Vec<Phase> = generator.requests.lock().await.iter().map(|r| r.phase).collect();
        assert_eq!(phases, vec![Phase::Analysis, Phase::DataExtraction]);
    }

    service
        .approve("alice", session.id, Phase::DataExtraction, None)
        .await
        .unwrap();
    service
        .approve("alice", session.id, Phase::DataValidation, None)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        service.finalize("alice", session.id),
        service.finalize("alice", session.id),
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(ServiceError::BadRequest(_)))));

    let scrapers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scrapers")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(scrapers, 1);
    assert_eq!(service.get("alice", session.id).await.unwrap().phase(), Phase::Done);
}
