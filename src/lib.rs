mod config;
mod deadletter;
mod dedup;
mod error;
mod handle;
mod job;
mod queue;
mod ready;
mod registry;
mod retry;
mod scheduler;
mod shutdown;
mod store;
mod worker;

pub use config::QueueConfig;
pub use deadletter::{DeadLetter, DeadLetterSink, MemorySink, TracingSink};
pub use dedup::DedupPolicy;
pub use error::QueueError;
pub use handle::{JobHandle, JobOptions};
pub use job::{BackoffPolicy, Job, JobId, JobKind, JobState, StateKind};
pub use queue::TaskQueue;
pub use shutdown::shutdown_signal;
pub use store::{JobStore, QueueStats, SqliteStore, StateUpdate, StorageError};
