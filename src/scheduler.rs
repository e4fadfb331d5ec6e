use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deadletter::{DeadLetter, DeadLetterSink};
use crate::dedup::DedupIndex;
use crate::error::QueueError;
use crate::job::{JobId, JobState, StateKind};
use crate::ready::ReadyQueue;
use crate::store::{JobStore, StateUpdate, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DueEntry {
    due: DateTime<Utc>,
    id: JobId,
}

/// Time-ordered view over every schedulable job, plus the lease reaper.
///
/// Delayed, recurring, and retrying jobs are parked in a min-heap keyed by
/// due time; a periodic tick promotes everything due into the ready queue.
/// One tick loop serves any number of jobs, so there are no per-job timers.
/// The heap is rebuilt from the store on startup; entries whose job was
/// cancelled or finished in the meantime are discarded lazily at pop time.
pub(crate) struct Scheduler {
    store: Arc<dyn JobStore>,
    ready: ReadyQueue,
    wheel: Mutex<BinaryHeap<Reverse<DueEntry>>>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, ready: ReadyQueue, tick_interval: Duration) -> Self {
        Self {
            store,
            ready,
            wheel: Mutex::new(BinaryHeap::new()),
            tick_interval,
        }
    }

    /// Park a job until its due time. The only insert path into the wheel.
    pub fn schedule(&self, id: JobId, due: DateTime<Utc>) {
        let mut wheel = self.wheel.lock().unwrap_or_else(|e| e.into_inner());
        wheel.push(Reverse(DueEntry { due, id }));
    }

    pub async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        dedup: DedupIndex,
        sink: Arc<dyn DeadLetterSink>,
    ) {
        info!("scheduler started");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.tick_interval) => {
                    self.tick(&dedup, &sink).await;
                }
            }
        }
    }

    async fn tick(&self, dedup: &DedupIndex, sink: &Arc<dyn DeadLetterSink>) {
        self.promote_due().await;

        if let Err(e) = self.reap_expired(dedup, sink).await {
            error!(error = %e, "lease reaper sweep failed");
        }
    }

    /// Move every due wheel entry into the ready queue. Promotion never
    /// leases; the job stays schedulable until a worker claims it.
    async fn promote_due(&self) {
        let now = Utc::now();
        let due = {
            let mut wheel = self.wheel.lock().unwrap_or_else(|e| e.into_inner());
            let mut due = Vec::new();
            loop {
                match wheel.peek() {
                    Some(Reverse(entry)) if entry.due <= now => {
                        if let Some(Reverse(entry)) = wheel.pop() {
                            due.push(entry);
                        }
                    }
                    _ => break,
                }
            }
            due
        };

        for entry in due {
            let job = match self.store.get(&entry.id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(job_id = %entry.id, error = %e, "failed to load due job");
                    continue;
                }
            };

            match job.state.kind() {
                StateKind::Pending => {
                    debug!(job_id = %entry.id, "job due, handing to workers");
                    self.ready.push(entry.id);
                }
                StateKind::Retrying => {
                    // Restore to Pending so the worker lease CAS has a single
                    // expected state. Losing this CAS means a concurrent cancel.
                    match self
                        .store
                        .transition(&entry.id, StateKind::Retrying, StateUpdate::to(JobState::Pending))
                        .await
                    {
                        Ok(()) => {
                            debug!(job_id = %entry.id, attempt = job.attempt, "retry due, handing to workers");
                            self.ready.push(entry.id);
                        }
                        Err(StorageError::Conflict { .. }) | Err(StorageError::NotFound(_)) => {}
                        Err(e) => {
                            error!(job_id = %entry.id, error = %e, "failed to promote retrying job");
                        }
                    }
                }
                // Cancelled or already terminal; the wheel entry is stale.
                _ => {}
            }
        }
    }

    /// At-least-once enforcement: jobs whose worker crashed or hung past the
    /// lease are returned to the schedulable pool with the attempt charged.
    async fn reap_expired(
        &self,
        dedup: &DedupIndex,
        sink: &Arc<dyn DeadLetterSink>,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let expired = self.store.list_expired_leases(now).await?;

        for id in expired {
            reap_lease(&self.store, dedup, sink, &self.ready, &id).await;
        }

        Ok(())
    }
}

/// Force one expired (or force-expired) lease back into circulation.
///
/// The attempt is charged exactly once: the execution may well have run to
/// the brink of completion before the worker died. A job out of budget goes
/// to the dead-letter sink instead of back to Pending.
pub(crate) async fn reap_lease(
    store: &Arc<dyn JobStore>,
    dedup: &DedupIndex,
    sink: &Arc<dyn DeadLetterSink>,
    ready: &ReadyQueue,
    id: &JobId,
) {
    let job = match store.get(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            error!(job_id = %id, error = %e, "failed to load expired lease");
            return;
        }
    };

    if job.state.kind() != StateKind::Leased {
        return;
    }

    let attempts = job.attempt + 1;
    if attempts >= job.max_attempts {
        let error = "lease expired".to_string();
        let update =
            StateUpdate::to(JobState::DeadLettered { error: error.clone() }).bump_attempt();
        match store.transition(id, StateKind::Leased, update).await {
            Ok(()) => {
                warn!(job_id = %id, attempts, "lease expired with no retry budget left");
                if let Some(key) = &job.dedup_key {
                    if let Err(e) = dedup.release(key, id).await {
                        error!(job_id = %id, error = %e, "failed to release dedup key");
                    }
                }
                sink.publish(DeadLetter {
                    job_id: job.id.clone(),
                    job_type: job.job_type.clone(),
                    payload: job.payload.clone(),
                    error,
                    attempts,
                })
                .await;
            }
            Err(StorageError::Conflict { .. }) => {}
            Err(e) => error!(job_id = %id, error = %e, "failed to dead-letter expired lease"),
        }
        return;
    }

    let now = Utc::now();
    let update = StateUpdate::to(JobState::Pending)
        .run_at(now)
        .error("lease expired")
        .bump_attempt();
    match store.transition(id, StateKind::Leased, update).await {
        Ok(()) => {
            warn!(job_id = %id, attempt = attempts, "lease expired, re-queueing job");
            ready.push(id.clone());
        }
        // The worker finished (or another sweep won) between listing and now.
        Err(StorageError::Conflict { .. }) | Err(StorageError::NotFound(_)) => {}
        Err(e) => error!(job_id = %id, error = %e, "failed to re-queue expired lease"),
    }
}

/// Next occurrence of a cron rule, computed from the previous scheduled time
/// so long-running handlers do not drift the schedule. A computation landing
/// in the past (the handler overran one or more intervals) re-anchors on
/// `now`: missed occurrences are skipped, never replayed in a burst.
///
/// Returns `Ok(None)` when the rule has no future occurrences left.
pub(crate) fn next_occurrence(
    rule: &str,
    after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, QueueError> {
    let schedule = Schedule::from_str(rule).map_err(|e| QueueError::InvalidCron(e.to_string()))?;

    match schedule.after(&after).next() {
        Some(next) if next > now => Ok(Some(next)),
        Some(_) => Ok(schedule.after(&now).next()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn next_occurrence_from_previous_scheduled_time() {
        // Hourly, on the hour.
        let next = next_occurrence("0 0 * * * *", at("2026-01-01T00:00:00Z"), at("2026-01-01T00:00:05Z"))
            .expect("valid rule")
            .expect("has occurrence");
        assert_eq!(next, at("2026-01-01T01:00:00Z"));
    }

    #[test]
    fn missed_occurrences_are_skipped_not_replayed() {
        // Previous run was hours ago; the next occurrence re-anchors on now.
        let next = next_occurrence("0 0 * * * *", at("2026-01-01T00:00:00Z"), at("2026-01-01T05:30:00Z"))
            .expect("valid rule")
            .expect("has occurrence");
        assert_eq!(next, at("2026-01-01T06:00:00Z"));
    }

    #[test]
    fn occurrence_is_strictly_after_previous() {
        let prev = at("2026-01-01T02:00:00Z");
        let next = next_occurrence("0 0 * * * *", prev, prev)
            .expect("valid rule")
            .expect("has occurrence");
        assert!(next > prev);
    }

    #[test]
    fn invalid_rule_is_rejected() {
        let err = next_occurrence("not a cron", Utc::now(), Utc::now()).expect_err("must fail");
        assert!(matches!(err, QueueError::InvalidCron(_)));
    }

    #[test]
    fn due_entries_order_by_time() {
        let mut heap = BinaryHeap::new();
        let early = DueEntry {
            due: at("2026-01-01T00:00:00Z"),
            id: JobId::new(),
        };
        let late = DueEntry {
            due: at("2026-01-01T01:00:00Z"),
            id: JobId::new(),
        };
        heap.push(Reverse(late.clone()));
        heap.push(Reverse(early.clone()));

        assert_eq!(heap.pop(), Some(Reverse(early)));
        assert_eq!(heap.pop(), Some(Reverse(late)));
    }
}
