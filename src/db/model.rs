//! Database view models used by repositories.
//!
//! Keep these structs focused on the data written or returned by queries.
//! Business logic lives in the run and session services.

use crate::model::{ProgressUpdate, RunStatus};
use chrono::{DateTime, Utc};

/// Terminal outcome written once an execution finishes.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub progress: ProgressUpdate,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: i64,
    pub items_per_second: Option<f64>,
    pub error_message: Option<String>,
}
