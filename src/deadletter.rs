use async_trait::async_trait;
use tracing::error;

use crate::job::JobId;

/// Record emitted for every job that exhausts its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub error: String,
    pub attempts: u32,
}

/// Destination for dead-lettered jobs. Where the records end up (a queue, a
/// log, a table) is the embedder's business.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: DeadLetter);
}

/// Default sink: logs the record and moves on.
pub struct TracingSink;

#[async_trait]
impl DeadLetterSink for TracingSink {
    async fn publish(&self, letter: DeadLetter) {
        error!(
            job_id = %letter.job_id,
            job_type = %letter.job_type,
            attempts = letter.attempts,
            error = %letter.error,
            "job dead-lettered"
        );
    }
}

/// Collects records in memory. Useful in tests and for embedders that flush
/// dead letters in batches.
#[derive(Default)]
pub struct MemorySink {
    letters: std::sync::Mutex<Vec<DeadLetter>>,
}

impl MemorySink {
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemorySink {
    async fn publish(&self, letter: DeadLetter) {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter);
    }
}
