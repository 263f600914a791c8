use super::model::RunCompletion;
use crate::model::{Phase, ProgressUpdate, Run, RunStatus, Scraper, Session, STOPPED_BY_USER};
use crate::pipeline::Pipeline;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteExecutor, SqliteJournalMode, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with stricter durability.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.get(column);
    Uuid::parse_str(&raw).with_context(|| format!("column {} holds invalid uuid {}", column, raw))
}

// ---------------------------------------------------------------------------
// Scrapers

#[instrument(skip_all)]
pub async fn insert_scraper<'e, E>(executor: E, scraper: &Scraper) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    let libraries = serde_json::to_string(&scraper.required_libraries)?;
    sqlx::query(
        "INSERT INTO scrapers (id, user_id, name, url, script, required_libraries, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(scraper.id.to_string())
    .bind(&scraper.user_id)
    .bind(&scraper.name)
    .bind(&scraper.url)
    .bind(&scraper.script)
    .bind(libraries)
    .bind(scraper.created_at)
    .execute(executor)
    .await
    .context("failed to insert scraper")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_scraper(pool: &Pool, scraper_id: Uuid) -> Result<Option<Scraper>> {
    let row = sqlx::query(
        "SELECT id, user_id, name, url, script, required_libraries, created_at, last_run_at, last_status \
         FROM scrapers WHERE id = ?",
    )
    .bind(scraper_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let libraries: String = row.get("required_libraries");
    let last_status = match row.try_get::<Option<String>, _>("last_status")? {
        Some(raw) => Some(
            RunStatus::parse_status(&raw)
                .ok_or_else(|| anyhow!("scraper {} has unknown last_status {}", scraper_id, raw))?,
        ),
        None => None,
    };
    Ok(Some(Scraper {
        id: parse_uuid(&row, "id")?,
        user_id: row.get("user_id"),
        name: row.get("name"),
        url: row.get("url"),
        script: row.get("script"),
        required_libraries: serde_json::from_str(&libraries)
            .with_context(|| format!("scraper {} has malformed required_libraries", scraper_id))?,
        created_at: row.get("created_at"),
        last_run_at: row.try_get::<Option<DateTime<Utc>>, _>("last_run_at")?,
        last_status,
    }))
}

/// Stamp a scraper with the status of the run started at `run_started_at`.
/// Returns `false` when a newer run already owns the stamp.
#[instrument(skip_all)]
pub async fn record_scraper_run(
    pool: &Pool,
    scraper_id: Uuid,
    run_started_at: DateTime<Utc>,
    status: RunStatus,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE scrapers SET last_run_at = ?, last_status = ? \
         WHERE id = ? AND (last_run_at IS NULL OR julianday(last_run_at) <= julianday(?))",
    )
    .bind(run_started_at)
    .bind(status.as_str())
    .bind(scraper_id.to_string())
    .bind(run_started_at)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Runs
//
// Every mutation of a run is guarded by `status NOT IN ('success', 'failed',
// 'stopped')`, so a terminal record is never rewritten and concurrent writers
// resolve through SQLite's single-row update atomicity.

const RUN_COLUMNS: &str = "id, scraper_id, user_id, is_test_run, status, items_processed, current_batch, total_batches, started_at, completed_at, execution_time_ms, items_per_second, error_message";

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let id = parse_uuid(row, "id")?;
    let status: String = row.get("status");
    let status = RunStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("run {} has unknown status {}", id, status))?;
    Ok(Run {
        id,
        scraper_id: parse_uuid(row, "scraper_id")?,
        user_id: row.get("user_id"),
        is_test_run: row.get("is_test_run"),
        status,
        items_processed: row.get("items_processed"),
        current_batch: row.get("current_batch"),
        total_batches: row.try_get::<Option<i64>, _>("total_batches").ok().flatten(),
        started_at: row.get("started_at"),
        completed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("completed_at")
            .ok()
            .flatten(),
        execution_time_ms: row.try_get::<Option<i64>, _>("execution_time_ms").ok().flatten(),
        items_per_second: row.try_get::<Option<f64>, _>("items_per_second").ok().flatten(),
        error_message: row
            .try_get::<Option<String>, _>("error_message")
            .ok()
            .flatten(),
    })
}

/// Insert a new run. Returns `false` when a run with the same id already exists.
#[instrument(skip_all)]
pub async fn insert_run(pool: &Pool, run: &Run) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO scraper_runs (id, scraper_id, user_id, is_test_run, status, items_processed, current_batch, total_batches, started_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
    )
    .bind(run.id.to_string())
    .bind(run.scraper_id.to_string())
    .bind(&run.user_id)
    .bind(run.is_test_run)
    .bind(run.status.as_str())
    .bind(run.items_processed)
    .bind(run.current_batch)
    .bind(run.total_batches)
    .bind(run.started_at)
    .execute(pool)
    .await
    .context("failed to insert run")?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn fetch_run(pool: &Pool, run_id: Uuid) -> Result<Option<Run>> {
    let row = sqlx::query(&format!("SELECT {} FROM scraper_runs WHERE id = ?", RUN_COLUMNS))
        .bind(run_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

/// Move a non-terminal run to `running`. Returns `false` if the run is terminal.
#[instrument(skip_all)]
pub async fn mark_run_running(pool: &Pool, run_id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE scraper_runs SET status = 'running' \
         WHERE id = ? AND status NOT IN ('success', 'failed', 'stopped')",
    )
    .bind(run_id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Persist the latest counters. Returns `false` if the run is terminal.
#[instrument(skip_all)]
pub async fn update_run_progress(
    pool: &Pool,
    run_id: Uuid,
    progress: &ProgressUpdate,
    execution_time_ms: i64,
    items_per_second: Option<f64>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE scraper_runs SET status = 'running', items_processed = ?, current_batch = ?, total_batches = ?, \
         execution_time_ms = ?, items_per_second = ? \
         WHERE id = ? AND status NOT IN ('success', 'failed', 'stopped')",
    )
    .bind(progress.items_processed)
    .bind(progress.current_batch)
    .bind(progress.total_batches)
    .bind(execution_time_ms)
    .bind(items_per_second)
    .bind(run_id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Write the terminal outcome of an execution. Returns `false` if another
/// writer (e.g. a stop request) already finished the run.
#[instrument(skip_all)]
pub async fn finish_run(pool: &Pool, run_id: Uuid, completion: &RunCompletion) -> Result<bool> {
    if !completion.status.is_terminal() {
        return Err(anyhow!(
            "cannot finish run {} with non-terminal status {}",
            run_id,
            completion.status.as_str()
        ));
    }
    let res = sqlx::query(
        "UPDATE scraper_runs SET status = ?, items_processed = ?, current_batch = ?, total_batches = ?, \
         completed_at = ?, execution_time_ms = ?, items_per_second = ?, error_message = ? \
         WHERE id = ? AND status NOT IN ('success', 'failed', 'stopped')",
    )
    .bind(completion.status.as_str())
    .bind(completion.progress.items_processed)
    .bind(completion.progress.current_batch)
    .bind(completion.progress.total_batches)
    .bind(completion.completed_at)
    .bind(completion.execution_time_ms)
    .bind(completion.items_per_second)
    .bind(completion.error_message.as_deref())
    .bind(run_id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Mark a run stopped by its owner. Returns `false` if it was already terminal.
#[instrument(skip_all)]
pub async fn stop_run(pool: &Pool, run_id: Uuid, completed_at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE scraper_runs SET status = 'stopped', error_message = ?, completed_at = ?, \
         execution_time_ms = CAST((julianday(?) - julianday(started_at)) * 86400000 AS INTEGER) \
         WHERE id = ? AND status NOT IN ('success', 'failed', 'stopped')",
    )
    .bind(STOPPED_BY_USER)
    .bind(completed_at)
    .bind(completed_at)
    .bind(run_id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Active runs owned by `user_id`, newest first.
#[instrument(skip_all)]
pub async fn list_active_runs(pool: &Pool, user_id: &str) -> Result<Vec<Run>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM scraper_runs WHERE user_id = ? AND status IN ('pending', 'initializing', 'running') \
         ORDER BY started_at DESC",
        RUN_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(run_from_row).collect()
}

/// Most recent runs of a scraper, newest first.
#[instrument(skip_all)]
pub async fn list_runs_for_scraper(pool: &Pool, scraper_id: Uuid, limit: i64) -> Result<Vec<Run>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM scraper_runs WHERE scraper_id = ? ORDER BY started_at DESC LIMIT ?",
        RUN_COLUMNS
    ))
    .bind(scraper_id.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(run_from_row).collect()
}

/// Append a progress message; sequence numbers run 1..N per run.
///
/// The sequence is computed inside the insert so concurrent writers on the
/// same run never reuse a number.
#[instrument(skip_all)]
pub async fn append_run_message(pool: &Pool, run_id: Uuid, message: &str) -> Result<i64> {
    let sequence: i64 = sqlx::query_scalar(
        "INSERT INTO run_messages (run_id, sequence, message, created_at) \
         SELECT ?, COALESCE(MAX(sequence), 0) + 1, ?, ? FROM run_messages WHERE run_id = ? \
         RETURNING sequence",
    )
    .bind(run_id.to_string())
    .bind(message)
    .bind(Utc::now())
    .bind(run_id.to_string())
    .fetch_one(pool)
    .await
    .context("failed to append run message")?;
    Ok(sequence)
}

/// The latest `limit` messages of a run in append order.
#[instrument(skip_all)]
pub async fn recent_run_messages(pool: &Pool, run_id: Uuid, limit: i64) -> Result<Vec<String>> {
    let mut messages: Vec<String> = sqlx::query_scalar(
        "SELECT message FROM run_messages WHERE run_id = ? ORDER BY sequence DESC LIMIT ?",
    )
    .bind(run_id.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    messages.reverse();
    Ok(messages)
}

// ---------------------------------------------------------------------------
// Authoring sessions

fn session_from_row(row: &SqliteRow) -> Result<Session> {
    let id = parse_uuid(row, "id")?;
    let state: String = row.get("state");
    let state: Pipeline = serde_json::from_str(&state)
        .with_context(|| format!("session {} has malformed state", id))?;
    Ok(Session {
        id,
        user_id: row.get("user_id"),
        url: row.get("url"),
        state,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[instrument(skip_all)]
pub async fn insert_session(pool: &Pool, session: &Session) -> Result<()> {
    sqlx::query(
        "INSERT INTO authoring_sessions (id, user_id, url, phase, state, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(session.id.to_string())
    .bind(&session.user_id)
    .bind(&session.url)
    .bind(session.phase().as_str())
    .bind(serde_json::to_string(&session.state)?)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(pool)
    .await
    .context("failed to insert session")?;
    Ok(())
}

/// Persist the pipeline state of a session that is still in phase `expected`.
/// Returns `false` when another writer moved the session on first.
#[instrument(skip_all)]
pub async fn update_session_state<'e, E>(executor: E, session: &Session, expected: Phase) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "UPDATE authoring_sessions SET phase = ?, state = ?, updated_at = ? WHERE id = ? AND phase = ?",
    )
    .bind(session.phase().as_str())
    .bind(serde_json::to_string(&session.state)?)
    .bind(session.updated_at)
    .bind(session.id.to_string())
    .bind(expected.as_str())
    .execute(executor)
    .await
    .context("failed to persist session state")?;
    Ok(res.rows_affected() == 1)
}

/// Close a session and register its scraper in one transaction. Nothing is
/// written unless the session is still in phase `expected`.
#[instrument(skip_all)]
pub async fn finalize_session(
    pool: &Pool,
    session: &Session,
    expected: Phase,
    scraper: &Scraper,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    if !update_session_state(&mut *tx, session, expected).await? {
        return Ok(false);
    }
    insert_scraper(&mut *tx, scraper).await?;
    tx.commit().await.context("failed to commit finalized session")?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn fetch_session(pool: &Pool, session_id: Uuid) -> Result<Option<Session>> {
    let row = sqlx::query(
        "SELECT id, user_id, url, state, created_at, updated_at FROM authoring_sessions WHERE id = ?",
    )
    .bind(session_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(session_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_sessions(pool: &Pool, user_id: &str) -> Result<Vec<Session>> {
    let rows = sqlx::query(
        "SELECT id, user_id, url, state, created_at, updated_at FROM authoring_sessions WHERE user_id = ? ORDER BY updated_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(session_from_row).collect()
}
