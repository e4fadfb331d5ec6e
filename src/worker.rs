use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::dedup::{DedupIndex, Reservation};
use crate::job::{add_duration, Job, JobId, JobKind, JobState, StateKind};
use crate::ready::ReadyQueue;
use crate::registry::{HandlerError, HandlerRegistry};
use crate::retry::RetryManager;
use crate::scheduler::{next_occurrence, Scheduler};
use crate::store::{JobStore, StateUpdate, StorageError};

/// One execution slot. Pops due job ids, leases them with a compare-and-swap,
/// runs the handler, and finalizes the outcome. Exits when the ready queue is
/// closed and drained.
pub(crate) struct Worker {
    owner: String,
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    ready: ReadyQueue,
    scheduler: Arc<Scheduler>,
    dedup: DedupIndex,
    retry: RetryManager,
    lease_duration: std::time::Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: String,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        ready: ReadyQueue,
        scheduler: Arc<Scheduler>,
        dedup: DedupIndex,
        retry: RetryManager,
        lease_duration: std::time::Duration,
    ) -> Self {
        Self {
            owner,
            store,
            registry,
            ready,
            scheduler,
            dedup,
            retry,
            lease_duration,
        }
    }

    pub async fn run(self) {
        info!(worker = %self.owner, "worker started");

        while let Some(id) = self.ready.pop().await {
            self.process(id).await;
        }

        info!(worker = %self.owner, "worker stopped");
    }

    async fn process(&self, id: JobId) {
        let expires_at = add_duration(Utc::now(), self.lease_duration);
        let lease = StateUpdate::to(JobState::Leased {
            owner: self.owner.clone(),
            expires_at,
        });

        match self.store.transition(&id, StateKind::Pending, lease).await {
            Ok(()) => {}
            // Another worker won the race, or the job was cancelled between
            // promotion and here. Not an error; just take the next one.
            Err(StorageError::Conflict { .. }) | Err(StorageError::NotFound(_)) => {
                debug!(job_id = %id, "job no longer claimable, skipping");
                return;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to lease job");
                return;
            }
        }

        let job = match self.store.get(&id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %id, "leased job disappeared from the store");
                return;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to load leased job");
                return;
            }
        };

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt,
            "executing job"
        );

        match self.registry.execute(&job).await {
            Ok(()) => self.finalize_success(&job).await,
            Err(err) => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %err, "job failed");
                let retryable = !matches!(err, HandlerError::NotRegistered(_));
                self.retry.fail(&job, err.to_string(), retryable).await;
            }
        }
    }

    async fn finalize_success(&self, job: &Job) {
        // A recurring job chains its next occurrence before the current one
        // is finalized; the dedup reservation moves over with it.
        let mut release_key = job.dedup_key.is_some();
        if let JobKind::Recurring { cron } = &job.kind {
            if self.reinsert_recurring(job, cron).await {
                release_key = false;
            }
        }

        match self
            .store
            .transition(&job.id, StateKind::Leased, StateUpdate::to(JobState::Succeeded))
            .await
        {
            Ok(()) => {
                info!(job_id = %job.id, job_type = %job.job_type, "job succeeded");
                if release_key {
                    if let Some(key) = &job.dedup_key {
                        if let Err(e) = self.dedup.release(key, &job.id).await {
                            error!(job_id = %job.id, error = %e, "failed to release dedup key");
                        }
                    }
                }
            }
            Err(StorageError::Conflict { .. }) => {
                // The lease was reaped mid-execution; the job will run again.
                // Handlers are required to be idempotent for exactly this case.
                warn!(job_id = %job.id, "lease lost before completion, job may run again");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to finalize job");
            }
        }
    }

    /// Insert and schedule the next occurrence of a recurring job. Returns
    /// true when the dedup reservation was carried over to the new job.
    async fn reinsert_recurring(&self, job: &Job, cron: &str) -> bool {
        let next = match next_occurrence(cron, job.run_at, Utc::now()) {
            Ok(Some(next)) => next,
            Ok(None) => {
                info!(job_id = %job.id, job_type = %job.job_type, "recurring schedule exhausted");
                return false;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "recurring rule no longer computes");
                return false;
            }
        };

        let next_job = job.next_occurrence(next);
        let next_id = next_job.id.clone();

        if let Err(e) = self.store.insert(next_job).await {
            error!(job_id = %job.id, error = %e, "failed to insert next occurrence");
            return false;
        }

        let mut transferred = false;
        if let Some(key) = &job.dedup_key {
            transferred = match self.dedup.transfer(key, &job.id, &next_id).await {
                Ok(true) => true,
                Ok(false) => {
                    // The reservation went missing; take it fresh for the new
                    // occurrence, or back out if someone else now holds it.
                    match self.dedup.reserve(key, &next_id).await {
                        Ok(Reservation::Reserved) => true,
                        Ok(Reservation::Held(holder)) => {
                            warn!(
                                job_id = %next_id,
                                holder = %holder,
                                "dedup key taken, dropping next occurrence"
                            );
                            if let Err(e) = self
                                .store
                                .transition(
                                    &next_id,
                                    StateKind::Pending,
                                    StateUpdate::to(JobState::Cancelled),
                                )
                                .await
                            {
                                error!(job_id = %next_id, error = %e, "failed to drop next occurrence");
                            }
                            return false;
                        }
                        Err(e) => {
                            error!(job_id = %next_id, error = %e, "failed to re-reserve dedup key");
                            true
                        }
                    }
                }
                Err(e) => {
                    error!(job_id = %next_id, error = %e, "failed to transfer dedup key");
                    true
                }
            };
        }

        self.scheduler.schedule(next_id, next);
        debug!(job_id = %job.id, next_run = %next, "recurring job re-scheduled");

        job.dedup_key.is_some() && transferred
    }
}
