use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::deadletter::{DeadLetter, DeadLetterSink};
use crate::dedup::DedupIndex;
use crate::job::{add_duration, BackoffPolicy, Job, JobState, StateKind};
use crate::scheduler::Scheduler;
use crate::store::{JobStore, StateUpdate, StorageError};

/// Delay before attempt `attempt + 1`, per the job's backoff policy.
pub(crate) fn next_delay(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let (raw, jitter) = match policy {
        BackoffPolicy::Linear { base, jitter } => (base.saturating_mul(attempt + 1), jitter),
        BackoffPolicy::Exponential { base, cap, jitter } => {
            let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
            (base.saturating_mul(factor).min(*cap), jitter)
        }
    };

    match jitter {
        Some(bound) if !bound.is_zero() => {
            let offset = rand::rng().random_range(0..=bound.as_millis() as u64);
            raw + Duration::from_millis(offset)
        }
        _ => raw,
    }
}

/// Decides retry-with-delay versus dead-letter for every handler failure.
pub(crate) struct RetryManager {
    store: Arc<dyn JobStore>,
    scheduler: Arc<Scheduler>,
    dedup: DedupIndex,
    sink: Arc<dyn DeadLetterSink>,
}

impl RetryManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        scheduler: Arc<Scheduler>,
        dedup: DedupIndex,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            store,
            scheduler,
            dedup,
            sink,
        }
    }

    /// Route a failed execution. `retryable` is false for failures that no
    /// amount of retrying can fix, e.g. a missing handler registration.
    pub async fn fail(&self, job: &Job, error: String, retryable: bool) {
        let attempts = job.attempt + 1;

        if !retryable || attempts >= job.max_attempts {
            self.dead_letter(job, error, attempts).await;
            return;
        }

        let delay = next_delay(&job.backoff, job.attempt);
        let run_at = add_duration(Utc::now(), delay);
        let update = StateUpdate::to(JobState::Retrying)
            .run_at(run_at)
            .error(error)
            .bump_attempt();

        match self
            .store
            .transition(&job.id, StateKind::Leased, update)
            .await
        {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                self.scheduler.schedule(job.id.clone(), run_at);
            }
            Err(StorageError::Conflict { .. }) => {
                // The lease was reaped while the handler ran; the reaper owns
                // the retry now.
                debug!(job_id = %job.id, "lease lost before retry transition");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to schedule retry");
            }
        }
    }

    async fn dead_letter(&self, job: &Job, error: String, attempts: u32) {
        let update =
            StateUpdate::to(JobState::DeadLettered { error: error.clone() }).bump_attempt();

        match self
            .store
            .transition(&job.id, StateKind::Leased, update)
            .await
        {
            Ok(()) => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts,
                    "job failed permanently"
                );
                if let Some(key) = &job.dedup_key {
                    if let Err(e) = self.dedup.release(key, &job.id).await {
                        error!(job_id = %job.id, error = %e, "failed to release dedup key");
                    }
                }
                self.sink
                    .publish(DeadLetter {
                        job_id: job.id.clone(),
                        job_type: job.job_type.clone(),
                        payload: job.payload.clone(),
                        error,
                        attempts,
                    })
                    .await;
            }
            Err(StorageError::Conflict { .. }) => {
                debug!(job_id = %job.id, "lease lost before dead-letter transition");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to dead-letter job");
            }
        }
    }
}
