pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, JobState, StateKind};

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("job {id} is not in state {expected}")]
    Conflict { id: JobId, expected: StateKind },

    #[error("job {0} not found")]
    NotFound(JobId),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Field changes applied together with a state transition.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub state: JobState,
    /// New due time; `None` leaves the stored `run_at` untouched.
    pub run_at: Option<DateTime<Utc>>,
    /// New last-error text; `None` leaves the stored value untouched.
    pub error: Option<String>,
    /// Increment the attempt counter as part of this transition.
    pub bump_attempt: bool,
}

impl StateUpdate {
    pub fn to(state: JobState) -> Self {
        Self {
            state,
            run_at: None,
            error: None,
            bump_attempt: false,
        }
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn error<S: Into<String>>(mut self, error: S) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn bump_attempt(mut self) -> Self {
        self.bump_attempt = true;
        self
    }
}

/// Per-state job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub retrying: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
}

/// Durable record of job state; the ground truth for every other component.
///
/// `transition` is the sole mutation gateway: a compare-and-swap on the state
/// column that fails with [`StorageError::Conflict`] when the job is no longer
/// in the expected state. The dedup operations back the dedup index, which is
/// the only component that calls them.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<JobId>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    async fn transition(&self, id: &JobId, expected: StateKind, update: StateUpdate) -> Result<()>;

    /// Pending and retrying jobs due at or before `before`, with their due
    /// times, ordered by due time.
    async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<(JobId, DateTime<Utc>)>>;

    /// Leased jobs whose lease expired before `now`.
    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    /// Claim `key` for `id`. Returns the current holder if the key is taken.
    async fn dedup_reserve(&self, key: &str, id: &JobId) -> Result<Option<JobId>>;

    /// Drop the reservation, but only if `id` still holds it.
    async fn dedup_release(&self, key: &str, id: &JobId) -> Result<()>;

    /// Move the reservation from one job to another without a release gap.
    /// Returns false if `from` no longer holds the key.
    async fn dedup_update(&self, key: &str, from: &JobId, to: &JobId) -> Result<bool>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Release the underlying handles. No mutation is permitted afterwards.
    async fn close(&self);
}
