use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::QueueError;
use crate::job::{add_duration, BackoffPolicy, Job, JobId};
use crate::queue::QueueCore;
use crate::scheduler::next_occurrence;

/// Per-job-type execution policy.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Ceiling on execution attempts before dead-lettering.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Optional per-execution time limit enforced by the worker.
    pub timeout: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            timeout: None,
        }
    }
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Typed enqueue handle for one registered job type.
///
/// Obtained from [`crate::TaskQueue::register`]. The `_keyed` variants
/// constrain the job with a dedup key: while a job holding the key is pending,
/// leased, or retrying, a second enqueue either fails with
/// [`QueueError::Duplicate`] or returns the existing id, per the queue's
/// configured [`crate::DedupPolicy`].
pub struct JobHandle<T> {
    name: &'static str,
    opts: JobOptions,
    core: Arc<QueueCore>,
    _phantom: PhantomData<fn(T)>,
}

impl<T> JobHandle<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(name: &'static str, opts: JobOptions, core: Arc<QueueCore>) -> Self {
        Self {
            name,
            opts,
            core,
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue for execution as soon as a worker is free.
    pub async fn enqueue(&self, args: T) -> Result<JobId, QueueError> {
        let job = self.build(&args)?;
        self.core.submit(job).await
    }

    pub async fn enqueue_keyed<K: Into<String>>(
        &self,
        args: T,
        key: K,
    ) -> Result<JobId, QueueError> {
        let job = self.build(&args)?.with_dedup_key(key);
        self.core.submit(job).await
    }

    /// Enqueue for execution after `delay`.
    pub async fn enqueue_delayed(&self, args: T, delay: Duration) -> Result<JobId, QueueError> {
        let run_at = add_duration(Utc::now(), delay);
        let job = self.build(&args)?.delayed(run_at);
        self.core.submit(job).await
    }

    pub async fn enqueue_delayed_keyed<K: Into<String>>(
        &self,
        args: T,
        delay: Duration,
        key: K,
    ) -> Result<JobId, QueueError> {
        let run_at = add_duration(Utc::now(), delay);
        let job = self.build(&args)?.delayed(run_at).with_dedup_key(key);
        self.core.submit(job).await
    }

    /// Enqueue on a cron schedule. Each successful run chains the next
    /// occurrence; the rule is validated here, at the API boundary.
    pub async fn enqueue_recurring(&self, cron: &str, args: T) -> Result<JobId, QueueError> {
        let job = self.recurring_job(cron, &args)?;
        self.core.submit(job).await
    }

    pub async fn enqueue_recurring_keyed<K: Into<String>>(
        &self,
        cron: &str,
        args: T,
        key: K,
    ) -> Result<JobId, QueueError> {
        let job = self.recurring_job(cron, &args)?.with_dedup_key(key);
        self.core.submit(job).await
    }

    fn build(&self, args: &T) -> Result<Job, QueueError> {
        let payload = serde_json::to_vec(args)?;
        Ok(Job::new(self.name, payload)
            .with_max_attempts(self.opts.max_attempts)
            .with_backoff(self.opts.backoff.clone()))
    }

    fn recurring_job(&self, cron: &str, args: &T) -> Result<Job, QueueError> {
        let now = Utc::now();
        let first_run = next_occurrence(cron, now, now)?
            .ok_or_else(|| QueueError::InvalidCron("rule has no future occurrence".to_string()))?;
        Ok(self.build(args)?.recurring(cron, first_run))
    }
}
