//! Execution seam between the run service and whatever actually scrapes.
//!
//! An executor receives a [`RunContext`] carrying the scraper, the test-run
//! limits, a cancellation token and a [`ProgressReporter`]. Cancellation is
//! cooperative: executors must poll [`RunContext::is_cancelled`] (or await
//! [`RunContext::cancelled`]) and treat a `Cancelled` report as a stop signal.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::model::{elapsed_ms, items_per_second, ProgressUpdate, Scraper};
use crate::progress::{ProgressEntry, ProgressStore};

/// Returned to an executor once its run has been stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run was stopped")]
pub struct Cancelled;

/// Final counters reported by a finished execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub items_processed: i64,
    pub batches: i64,
}

#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(&self, ctx: &RunContext) -> Result<ExecutionOutcome>;
}

pub struct RunContext {
    pub run_id: Uuid,
    pub scraper: Scraper,
    pub is_test_run: bool,
    /// Item cap for test runs; `None` for full runs.
    pub item_limit: Option<u32>,
    pub reporter: ProgressReporter,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        scraper: Scraper,
        is_test_run: bool,
        item_limit: Option<u32>,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            scraper,
            is_test_run,
            item_limit,
            reporter,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Relays executor progress into the progress cache and the run table.
#[derive(Clone)]
pub struct ProgressReporter {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    pool: Pool,
    store: Arc<dyn ProgressStore>,
    cancel: CancellationToken,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        pool: Pool,
        store: Arc<dyn ProgressStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            started_at,
            pool,
            store,
            cancel,
        }
    }

    /// Record the latest counters.
    ///
    /// Returns `Err(Cancelled)` once the stored run is terminal, which is how a
    /// stop issued by another process reaches this executor.
    pub async fn report(&self, update: ProgressUpdate) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let elapsed = elapsed_ms(self.started_at, None, Utc::now());
        let rate = items_per_second(update.items_processed, elapsed);
        let summary = format!(
            "Batch {}: Found {} items ({:.1}/sec)",
            update.current_batch,
            update.items_processed,
            rate.unwrap_or(0.0)
        );
        debug!(run_id = %self.run_id, %summary, "progress update");

        let cached_summary = summary.clone();
        self.store
            .update(
                self.run_id,
                Box::new(move |e: &mut ProgressEntry| {
                    e.progress = update;
                    e.push_message(cached_summary);
                }),
            )
            .await;

        match db::update_run_progress(&self.pool, self.run_id, &update, elapsed, rate).await {
            Ok(true) => {}
            Ok(false) => {
                info!(run_id = %self.run_id, "run is terminal in store; cancelling executor");
                self.cancel.cancel();
                return Err(Cancelled);
            }
            Err(err) => warn!(?err, run_id = %self.run_id, "failed to persist progress"),
        }
        self.persist_message(&summary).await;
        Ok(())
    }

    /// Append a free-form progress message. Failures are logged, never returned.
    pub async fn message(&self, message: impl Into<String>) {
        let message = message.into();
        let cached = message.clone();
        self.store
            .update(
                self.run_id,
                Box::new(move |e: &mut ProgressEntry| e.push_message(cached)),
            )
            .await;
        self.persist_message(&message).await;
    }

    async fn persist_message(&self, message: &str) {
        if let Err(err) = db::append_run_message(&self.pool, self.run_id, message).await {
            warn!(?err, run_id = %self.run_id, "failed to append run message");
        }
    }
}

/// Runs scraper scripts on an external worker over HTTP.
#[derive(Clone)]
pub struct HttpScriptExecutor {
    http: Client,
    endpoint: Url,
}

impl fmt::Debug for HttpScriptExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpScriptExecutor")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    run_id: Uuid,
    script_content: &'a str,
    requirements: &'a [String],
    is_test_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_items: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    /// Older workers report the count as `product_count`.
    #[serde(default, alias = "product_count")]
    items_processed: Option<i64>,
    #[serde(default)]
    batches: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpScriptExecutor {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid worker url")?;
        let http = Client::builder()
            .user_agent("scrape-tracker/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build worker http client")?;
        Ok(Self { http, endpoint })
    }

    pub fn build_request(&self, ctx: &RunContext) -> Result<reqwest::Request> {
        let body = WorkerRequest {
            run_id: ctx.run_id,
            script_content: &ctx.scraper.script,
            requirements: &ctx.scraper.required_libraries,
            is_test_run: ctx.is_test_run,
            max_items: ctx.item_limit,
        };
        self.http
            .post(self.endpoint.clone())
            .json(&body)
            .build()
            .context("failed to build worker request")
    }

    async fn call_worker(&self, ctx: &RunContext) -> Result<ExecutionOutcome> {
        let request = self.build_request(ctx)?;
        info!(run_id = %ctx.run_id, url = %request.url(), "dispatching script to worker");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach script worker")?;
        let status = res.status();
        let body = res.text().await.context("failed to read worker response")?;
        parse_worker_response(status.is_success(), status.as_u16(), &body)
    }
}

fn parse_worker_response(success: bool, status: u16, body: &str) -> Result<ExecutionOutcome> {
    let parsed: Option<WorkerResponse> = serde_json::from_str(body).ok();
    if !success {
        let detail = parsed
            .and_then(|p| p.error)
            .unwrap_or_else(|| format!("worker responded with status {}", status));
        return Err(anyhow!(detail));
    }
    let parsed = parsed.ok_or_else(|| anyhow!("invalid worker response JSON"))?;
    if let Some(error) = parsed.error {
        return Err(anyhow!(error));
    }
    let items = parsed.items_processed.unwrap_or(0);
    let batches = parsed.batches.unwrap_or(if items > 0 { 1 } else { 0 });
    Ok(ExecutionOutcome {
        items_processed: items,
        batches,
    })
}

#[async_trait]
impl ScriptExecutor for HttpScriptExecutor {
    async fn execute(&self, ctx: &RunContext) -> Result<ExecutionOutcome> {
        ctx.reporter.message("Dispatching script to worker...").await;
        let outcome = tokio::select! {
            res = self.call_worker(ctx) => res?,
            _ = ctx.cancelled() => return Err(Cancelled.into()),
        };
        if outcome.items_processed > 0 {
            ctx.reporter
                .report(ProgressUpdate {
                    items_processed: outcome.items_processed,
                    current_batch: outcome.batches,
                    total_batches: Some(outcome.batches),
                })
                .await?;
        }
        Ok(outcome)
    }
}
