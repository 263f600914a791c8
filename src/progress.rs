//! Live progress of runs owned by this process.
//!
//! The store is injected into the run service so tests can substitute their
//! own and so a cache miss visibly falls back to the run table.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{ProgressUpdate, RunStatus};

/// Messages kept per entry; the full log lives in the database.
const MAX_CACHED_MESSAGES: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEntry {
    pub run_id: Uuid,
    pub scraper_id: Uuid,
    pub user_id: String,
    pub is_test_run: bool,
    pub status: RunStatus,
    pub progress: ProgressUpdate,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub messages: Vec<String>,
}

impl ProgressEntry {
    pub fn push_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
        if self.messages.len() > MAX_CACHED_MESSAGES {
            let excess = self.messages.len() - MAX_CACHED_MESSAGES;
            self.messages.drain(..excess);
        }
    }
}

pub type EntryUpdate = Box<dyn FnOnce(&mut ProgressEntry) + Send>;

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, run_id: Uuid) -> Option<ProgressEntry>;

    async fn put(&self, entry: ProgressEntry);

    /// Apply `f` to a non-terminal entry. Returns `false` when the entry is
    /// missing or already terminal.
    async fn update(&self, run_id: Uuid, f: EntryUpdate) -> bool;

    /// Drop terminal entries completed before `now - max_age`. Returns how many were removed.
    async fn evict_finished(&self, max_age: Duration) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    entries: RwLock<HashMap<Uuid, ProgressEntry>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get(&self, run_id: Uuid) -> Option<ProgressEntry> {
        self.entries.read().await.get(&run_id).cloned()
    }

    async fn put(&self, entry: ProgressEntry) {
        self.entries.write().await.insert(entry.run_id, entry);
    }

    async fn update(&self, run_id: Uuid, f: EntryUpdate) -> bool {
        let mut guard = self.entries.write().await;
        match guard.get_mut(&run_id) {
            Some(entry) if !entry.status.is_terminal() => {
                f(entry);
                true
            }
            _ => false,
        }
    }

    async fn evict_finished(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, e| {
            !(e.status.is_terminal() && e.completed_at.map(|at| at < cutoff).unwrap_or(false))
        });
        before - guard.len()
    }
}
