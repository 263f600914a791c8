//! Scraper run execution and progress tracking.
//!
//! `trigger` persists the run record before returning and hands the work to a
//! detached tokio task. Pollers read the progress cache first and fall back to
//! the run table when the cache has no entry (e.g. after a restart). `stop`
//! only marks the record and signals the in-process cancellation token.

use anyhow::anyhow;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Runs as RunsConfig;
use crate::db::{self, Pool, RunCompletion};
use crate::error::{ServiceError, ServiceResult};
use crate::executor::{Cancelled, ExecutionOutcome, ProgressReporter, RunContext, ScriptExecutor};
use crate::model::{
    elapsed_ms, items_per_second, NewScraper, ProgressUpdate, Run, RunSnapshot, RunStatus, Scraper,
    STOPPED_BY_USER,
};
use crate::progress::{ProgressEntry, ProgressStore};

/// Upper bound on rows returned by the run history listing.
pub const MAX_HISTORY: i64 = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StopOutcome {
    pub already_terminal: bool,
    pub run: RunSnapshot,
}

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub test_item_limit: u32,
    pub recent_messages: usize,
}

impl From<&RunsConfig> for RunSettings {
    fn from(cfg: &RunsConfig) -> Self {
        Self {
            test_item_limit: cfg.test_item_limit,
            recent_messages: cfg.recent_messages as usize,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        (&RunsConfig::default()).into()
    }
}

pub struct RunService {
    pool: Pool,
    store: Arc<dyn ProgressStore>,
    executor: Arc<dyn ScriptExecutor>,
    settings: RunSettings,
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl RunService {
    pub fn new(
        pool: Pool,
        store: Arc<dyn ProgressStore>,
        executor: Arc<dyn ScriptExecutor>,
        settings: RunSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            store,
            executor,
            settings,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Persist a new scraper owned by `user_id`.
    #[instrument(skip_all)]
    pub async fn register_scraper(&self, user_id: &str, new: NewScraper) -> ServiceResult<Scraper> {
        let scraper = new
            .into_scraper(user_id)
            .map_err(|msg| ServiceError::BadRequest(msg.to_string()))?;
        db::insert_scraper(&self.pool, &scraper).await?;
        info!(scraper_id = %scraper.id, name = %scraper.name, "scraper registered");
        Ok(scraper)
    }

    /// Start a run of `scraper_id` for `user_id` and return its id immediately.
    #[instrument(skip_all, fields(%scraper_id, test_run = is_test_run))]
    pub async fn trigger(
        self: &Arc<Self>,
        user_id: &str,
        scraper_id: Uuid,
        run_id: Option<Uuid>,
        is_test_run: bool,
    ) -> ServiceResult<Uuid> {
        let scraper = db::fetch_scraper(&self.pool, scraper_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("scraper", scraper_id))?;
        if scraper.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "scraper belongs to another user".into(),
            ));
        }

        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let run = Run {
            id: run_id,
            scraper_id,
            user_id: scraper.user_id.clone(),
            is_test_run,
            status: RunStatus::Initializing,
            items_processed: 0,
            current_batch: 0,
            total_batches: None,
            started_at: Utc::now(),
            completed_at: None,
            execution_time_ms: None,
            items_per_second: None,
            error_message: None,
        };
        if !db::insert_run(&self.pool, &run).await? {
            return Err(ServiceError::Conflict(format!("run {} already exists", run_id)));
        }

        self.store
            .put(ProgressEntry {
                run_id,
                scraper_id,
                user_id: run.user_id.clone(),
                is_test_run,
                status: RunStatus::Initializing,
                progress: ProgressUpdate::default(),
                started_at: run.started_at,
                completed_at: None,
                error_message: None,
                messages: Vec::new(),
            })
            .await;

        let cancel = CancellationToken::new();
        self.lock_tokens().insert(run_id, cancel.clone());

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.execute(run, scraper, cancel).await;
        });

        info!(%run_id, "run triggered");
        Ok(run_id)
    }

    /// Background body of a run. Never panics the caller; every failure ends
    /// up as a `failed` record unless the run was stopped first.
    #[instrument(skip_all, fields(run_id = %run.id))]
    async fn execute(self: Arc<Self>, run: Run, scraper: Scraper, cancel: CancellationToken) {
        let run_id = run.id;
        let reporter = ProgressReporter::new(
            run_id,
            run.started_at,
            self.pool.clone(),
            Arc::clone(&self.store),
            cancel.clone(),
        );

        let result = match db::mark_run_running(&self.pool, run_id).await {
            Ok(false) => Err(Cancelled.into()),
            Err(err) => Err(err.context("failed to mark run running")),
            Ok(true) => {
                self.stamp_scraper(&run, RunStatus::Running).await;
                self.store
                    .update(
                        run_id,
                        Box::new(|e: &mut ProgressEntry| e.status = RunStatus::Running),
                    )
                    .await;
                reporter.message("Starting scraper run...").await;
                let kind = if run.is_test_run { "Test Run" } else { "Full Run" };
                reporter
                    .message(format!("Executing {} ({})", scraper.name, kind))
                    .await;

                if cancel.is_cancelled() {
                    Err(Cancelled.into())
                } else {
                    let item_limit = run.is_test_run.then_some(self.settings.test_item_limit);
                    let ctx = RunContext::new(
                        run_id,
                        scraper,
                        run.is_test_run,
                        item_limit,
                        reporter.clone(),
                        cancel.clone(),
                    );
                    // Own task so a panicking executor still ends as a failed run.
                    let executor = Arc::clone(&self.executor);
                    match tokio::spawn(async move { executor.execute(&ctx).await }).await {
                        Ok(result) => result,
                        Err(err) if err.is_panic() => Err(anyhow!("scraper executor panicked")),
                        Err(err) => Err(anyhow!("scraper executor task aborted: {}", err)),
                    }
                }
            }
        };

        self.finish(&run, &reporter, result).await;
        self.lock_tokens().remove(&run_id);
    }

    async fn finish(
        &self,
        run: &Run,
        reporter: &ProgressReporter,
        result: anyhow::Result<ExecutionOutcome>,
    ) {
        let completed_at = Utc::now();
        let execution_time_ms = elapsed_ms(run.started_at, Some(completed_at), completed_at);

        let (status, outcome, error_message) = match result {
            Ok(outcome) => (RunStatus::Success, outcome, None),
            Err(err) if err.downcast_ref::<Cancelled>().is_some() => {
                info!(run_id = %run.id, "execution ended after stop request");
                return;
            }
            Err(err) => {
                warn!(?err, run_id = %run.id, "scraper execution failed");
                (RunStatus::Failed, ExecutionOutcome::default(), Some(format!("{:#}", err)))
            }
        };

        let progress = ProgressUpdate {
            items_processed: outcome.items_processed,
            current_batch: outcome.batches,
            total_batches: Some(outcome.batches),
        };
        let rate = items_per_second(outcome.items_processed, execution_time_ms);
        let completion = RunCompletion {
            status,
            progress,
            completed_at,
            execution_time_ms,
            items_per_second: rate,
            error_message,
        };

        let Some(completion) = self.persist_completion(run.id, completion).await else {
            return;
        };
        self.stamp_scraper(run, completion.status).await;

        let summary = match completion.status {
            RunStatus::Success => format!(
                "Run finished: {} items in {} batches ({:.1}s, {:.1}/sec)",
                outcome.items_processed,
                outcome.batches,
                execution_time_ms as f64 / 1000.0,
                rate.unwrap_or(0.0)
            ),
            _ => format!(
                "Run failed: {}",
                completion.error_message.as_deref().unwrap_or("Unknown error")
            ),
        };
        reporter.message(summary).await;
        let status = completion.status;
        self.store
            .update(
                run.id,
                Box::new(move |e: &mut ProgressEntry| {
                    e.status = completion.status;
                    e.progress = completion.progress;
                    e.completed_at = Some(completion.completed_at);
                    e.error_message = completion.error_message;
                }),
            )
            .await;
        info!(run_id = %run.id, status = status.as_str(), "run finished");
    }

    /// Write the terminal outcome, retrying once. A success that still cannot
    /// be written is recorded as `failed` instead. Returns the outcome that was
    /// stored, or `None` when nothing new was stored.
    async fn persist_completion(&self, run_id: Uuid, completion: RunCompletion) -> Option<RunCompletion> {
        let mut last_err = None;
        for attempt in 1..=2 {
            match db::finish_run(&self.pool, run_id, &completion).await {
                Ok(true) => return Some(completion),
                Ok(false) => {
                    info!(%run_id, "run already terminal; keeping stored outcome");
                    return None;
                }
                Err(err) => {
                    warn!(?err, %run_id, attempt, "failed to persist run outcome");
                    last_err = Some(err);
                }
            }
        }

        if completion.status == RunStatus::Failed {
            error!(%run_id, "run outcome not stored; leaving run open");
            return None;
        }
        let reason = last_err.map(|err| format!("{:#}", err)).unwrap_or_default();
        let failed = RunCompletion {
            status: RunStatus::Failed,
            error_message: Some(format!("failed to record run outcome: {}", reason)),
            ..completion
        };
        match db::finish_run(&self.pool, run_id, &failed).await {
            Ok(true) => Some(failed),
            Ok(false) => None,
            Err(err) => {
                error!(?err, %run_id, "run outcome not stored; leaving run open");
                None
            }
        }
    }

    async fn stamp_scraper(&self, run: &Run, status: RunStatus) {
        if let Err(err) = db::record_scraper_run(&self.pool, run.scraper_id, run.started_at, status).await {
            warn!(?err, run_id = %run.id, "failed to record scraper last run");
        }
    }

    /// Current snapshot of a run, preferring the in-process cache.
    #[instrument(skip_all, fields(%run_id))]
    pub async fn get_progress(
        &self,
        user_id: &str,
        scraper_id: Uuid,
        run_id: Uuid,
    ) -> ServiceResult<RunSnapshot> {
        if let Some(entry) = self.store.get(run_id).await {
            check_access(user_id, scraper_id, run_id, &entry.user_id, entry.scraper_id)?;
            return Ok(self.snapshot_from_entry(&entry));
        }
        let run = self.load_run(user_id, scraper_id, run_id).await?;
        self.snapshot_from_record(&run).await
    }

    /// Mark a run stopped. Terminal runs are reported as-is.
    #[instrument(skip_all, fields(%run_id))]
    pub async fn stop(&self, user_id: &str, scraper_id: Uuid, run_id: Uuid) -> ServiceResult<StopOutcome> {
        let run = self.load_run(user_id, scraper_id, run_id).await?;
        if run.status.is_terminal() {
            info!(status = run.status.as_str(), "run already terminal");
            return Ok(StopOutcome {
                already_terminal: true,
                run: self.current_snapshot(&run).await?,
            });
        }

        let completed_at = Utc::now();
        let stopped = db::stop_run(&self.pool, run_id, completed_at).await?;
        if let Some(token) = self.lock_tokens().get(&run_id) {
            token.cancel();
        }

        let run = db::fetch_run(&self.pool, run_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("run", run_id))?;
        if stopped {
            self.stamp_scraper(&run, RunStatus::Stopped).await;
            self.store
                .update(
                    run_id,
                    Box::new(move |e: &mut ProgressEntry| {
                        e.push_message("Run stopped by user");
                        e.status = RunStatus::Stopped;
                        e.completed_at = Some(completed_at);
                        e.error_message = Some(STOPPED_BY_USER.to_string());
                    }),
                )
                .await;
            if let Err(err) = db::append_run_message(&self.pool, run_id, "Run stopped by user").await {
                warn!(?err, "failed to append stop message");
            }
            info!("run stopped");
        } else {
            info!(status = run.status.as_str(), "stop lost race; run already terminal");
        }

        Ok(StopOutcome {
            already_terminal: !stopped,
            run: self.current_snapshot(&run).await?,
        })
    }

    /// Runs of `user_id` that have not reached a terminal state, newest first.
    pub async fn active_runs(&self, user_id: &str) -> ServiceResult<Vec<Run>> {
        Ok(db::list_active_runs(&self.pool, user_id).await?)
    }

    /// Recent runs of a scraper owned by `user_id`, newest first.
    pub async fn history(&self, user_id: &str, scraper_id: Uuid, limit: i64) -> ServiceResult<Vec<Run>> {
        let scraper = db::fetch_scraper(&self.pool, scraper_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("scraper", scraper_id))?;
        if scraper.user_id != user_id {
            return Err(ServiceError::Forbidden("scraper belongs to another user".into()));
        }
        Ok(db::list_runs_for_scraper(&self.pool, scraper_id, limit.clamp(1, MAX_HISTORY)).await?)
    }

    /// Periodically drop finished cache entries older than `max_age`.
    pub fn spawn_cache_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let max_age = ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::hours(2));
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = service.store.evict_finished(max_age).await;
                        if evicted > 0 {
                            info!(evicted, "evicted finished progress entries");
                        }
                    }
                }
            }
        })
    }

    async fn load_run(&self, user_id: &str, scraper_id: Uuid, run_id: Uuid) -> ServiceResult<Run> {
        let run = db::fetch_run(&self.pool, run_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("run", run_id))?;
        check_access(user_id, scraper_id, run_id, &run.user_id, run.scraper_id)?;
        Ok(run)
    }

    /// Snapshot for a run record that was just read, using the cache when the
    /// entry agrees with the stored status.
    async fn current_snapshot(&self, run: &Run) -> ServiceResult<RunSnapshot> {
        match self.store.get(run.id).await {
            Some(entry) if entry.status == run.status => Ok(self.snapshot_from_entry(&entry)),
            _ => self.snapshot_from_record(run).await,
        }
    }

    fn snapshot_from_entry(&self, entry: &ProgressEntry) -> RunSnapshot {
        let elapsed = elapsed_ms(entry.started_at, entry.completed_at, Utc::now());
        let skip = entry.messages.len().saturating_sub(self.settings.recent_messages);
        RunSnapshot {
            run_id: entry.run_id,
            scraper_id: entry.scraper_id,
            status: entry.status,
            is_test_run: entry.is_test_run,
            items_processed: entry.progress.items_processed,
            current_batch: entry.progress.current_batch,
            total_batches: entry.progress.total_batches,
            started_at: entry.started_at,
            completed_at: entry.completed_at,
            elapsed_ms: elapsed,
            items_per_second: items_per_second(entry.progress.items_processed, elapsed),
            error_message: entry.error_message.clone(),
            progress_messages: entry.messages[skip..].to_vec(),
            is_complete: entry.status.is_terminal(),
        }
    }

    async fn snapshot_from_record(&self, run: &Run) -> ServiceResult<RunSnapshot> {
        let messages =
            db::recent_run_messages(&self.pool, run.id, self.settings.recent_messages as i64).await?;
        let elapsed = elapsed_ms(run.started_at, run.completed_at, Utc::now());
        Ok(RunSnapshot {
            run_id: run.id,
            scraper_id: run.scraper_id,
            status: run.status,
            is_test_run: run.is_test_run,
            items_processed: run.items_processed,
            current_batch: run.current_batch,
            total_batches: run.total_batches,
            started_at: run.started_at,
            completed_at: run.completed_at,
            elapsed_ms: elapsed,
            items_per_second: run
                .items_per_second
                .or_else(|| items_per_second(run.items_processed, elapsed)),
            error_message: run.error_message.clone(),
            progress_messages: messages,
            is_complete: run.status.is_terminal(),
        })
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn check_access(
    user_id: &str,
    scraper_id: Uuid,
    run_id: Uuid,
    owner: &str,
    parent: Uuid,
) -> ServiceResult<()> {
    if owner != user_id {
        return Err(ServiceError::Forbidden("run belongs to another user".into()));
    }
    if parent != scraper_id {
        return Err(ServiceError::Conflict(format!(
            "run {} does not belong to scraper {}",
            run_id, scraper_id
        )));
    }
    Ok(())
}
