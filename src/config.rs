use std::time::Duration;

use crate::dedup::DedupPolicy;

/// Engine tuning knobs. The defaults are reasonable for a small deployment;
/// tests shrink the intervals aggressively.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent worker execution slots.
    pub worker_count: usize,
    /// Cadence of the scheduler tick (due-job promotion and lease reaping).
    pub tick_interval: Duration,
    /// How long a worker may hold a job before the lease is treated as crashed.
    pub lease_duration: Duration,
    /// How long shutdown waits for in-flight jobs before force-expiring leases.
    pub drain_deadline: Duration,
    /// What happens when an enqueue collides with an active dedup key.
    pub dedup_policy: DedupPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            tick_interval: Duration::from_millis(250),
            lease_duration: Duration::from_secs(30),
            drain_deadline: Duration::from_secs(30),
            dedup_policy: DedupPolicy::Reject,
        }
    }
}

impl QueueConfig {
    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    pub fn with_dedup_policy(mut self, policy: DedupPolicy) -> Self {
        self.dedup_policy = policy;
        self
    }
}
