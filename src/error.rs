use crate::job::JobId;
use crate::store::StorageError;

/// Errors surfaced to enqueue/cancel/status callers.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("duplicate job for dedup key, existing job is {existing}")]
    Duplicate { existing: JobId },

    #[error("job not found")]
    NotFound,

    #[error("job is currently executing and cannot be cancelled")]
    AlreadyRunning,

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("queue is shutting down, no new jobs accepted")]
    ShuttingDown,
}
