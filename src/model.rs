use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Initializing,
    Running,
    Success,
    Failed,
    Stopped,
}

impl RunStatus {
    pub const TERMINAL: [RunStatus; 3] = [RunStatus::Success, RunStatus::Failed, RunStatus::Stopped];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Initializing => "initializing",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "initializing" => Some(RunStatus::Initializing),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "stopped" => Some(RunStatus::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

/// Fixed message recorded when a user stops a run.
pub const STOPPED_BY_USER: &str = "Manually stopped by user";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scraper {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub script: String,
    pub required_libraries: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Start time of the most recent run that reported a status.
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
}

/// Fields supplied when registering a scraper.
#[derive(Debug, Clone, Deserialize)]
pub struct NewScraper {
    pub name: String,
    pub url: String,
    pub script: String,
    #[serde(default)]
    pub required_libraries: Vec<String>,
}

impl NewScraper {
    /// Build the scraper owned by `user_id`. Name and script are required.
    pub fn into_scraper(self, user_id: &str) -> Result<Scraper, &'static str> {
        if self.name.trim().is_empty() {
            return Err("scraper name must be non-empty");
        }
        if self.script.trim().is_empty() {
            return Err("scraper script must be non-empty");
        }
        Ok(Scraper {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: self.name.trim().to_string(),
            url: self.url,
            script: self.script,
            required_libraries: self.required_libraries,
            created_at: Utc::now(),
            last_run_at: None,
            last_status: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: Uuid,
    pub scraper_id: Uuid,
    pub user_id: String,
    pub is_test_run: bool,
    pub status: RunStatus,
    pub items_processed: i64,
    pub current_batch: i64,
    pub total_batches: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub items_per_second: Option<f64>,
    pub error_message: Option<String>,
}

/// Counters reported by an executing scraper.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub items_processed: i64,
    pub current_batch: i64,
    pub total_batches: Option<i64>,
}

/// Normalized view of a run returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub scraper_id: Uuid,
    pub status: RunStatus,
    pub is_test_run: bool,
    pub items_processed: i64,
    pub current_batch: i64,
    pub total_batches: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
    pub items_per_second: Option<f64>,
    pub error_message: Option<String>,
    pub progress_messages: Vec<String>,
    pub is_complete: bool,
}

/// Milliseconds between `started_at` and `completed_at`, or `now` while active.
pub fn elapsed_ms(
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> i64 {
    let end = completed_at.unwrap_or(now);
    (end - started_at).num_milliseconds().max(0)
}

/// Throughput rounded to two decimals; `None` when nothing was processed.
pub fn items_per_second(items: i64, elapsed_ms: i64) -> Option<f64> {
    if items <= 0 || elapsed_ms <= 0 {
        return None;
    }
    let rate = items as f64 / (elapsed_ms as f64 / 1000.0);
    Some((rate * 100.0).round() / 100.0)
}

/// Authoring phases in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analysis,
    DataExtraction,
    DataValidation,
    Assembly,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Analysis => "analysis",
            Phase::DataExtraction => "data_extraction",
            Phase::DataValidation => "data_validation",
            Phase::Assembly => "assembly",
            Phase::Done => "done",
        }
    }
}

/// AI-assisted scraper authoring session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub url: String,
    pub state: Pipeline,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }
}

/// Payload of a phase the user approved, with the feedback given at approval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Approved {
    pub data: Value,
    pub feedback: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_round_trips_through_strings() {
        for s in ["pending", "initializing", "running", "success", "failed", "stopped"] {
            assert_eq!(RunStatus::parse_status(s).unwrap().as_str(), s);
        }
        assert!(RunStatus::parse_status("completed").is_none());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Initializing.is_terminal());
    }

    #[test]
    fn elapsed_uses_completion_when_present() {
        let start = Utc::now() - Duration::seconds(10);
        let end = start + Duration::milliseconds(2500);
        assert_eq!(elapsed_ms(start, Some(end), Utc::now()), 2500);
        assert!(elapsed_ms(start, None, Utc::now()) >= 10_000);
    }

    #[test]
    fn rate_is_rounded_and_skips_empty_runs() {
        assert_eq!(items_per_second(10, 4000), Some(2.5));
        assert_eq!(items_per_second(1, 3000), Some(0.33));
        assert_eq!(items_per_second(0, 3000), None);
    }

    #[test]
    fn phase_names_match_serde() {
        for phase in [
            Phase::Analysis,
            Phase::DataExtraction,
            Phase::DataValidation,
            Phase::Assembly,
            Phase::Done,
        ] {
            assert_eq!(serde_json::to_value(phase).unwrap(), phase.as_str());
        }
    }
}
