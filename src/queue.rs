use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::deadletter::{DeadLetterSink, TracingSink};
use crate::dedup::{DedupIndex, DedupPolicy, Reservation};
use crate::error::QueueError;
use crate::handle::{JobHandle, JobOptions};
use crate::job::{far_future, Job, JobId, JobKind, JobState, StateKind};
use crate::ready::ReadyQueue;
use crate::registry::{BoxedHandler, HandlerRegistry};
use crate::retry::RetryManager;
use crate::scheduler::{reap_lease, Scheduler};
use crate::store::{JobStore, QueueStats, SqliteStore, StateUpdate, StorageError};
use crate::worker::Worker;

/// Enqueue-side internals shared between the queue facade and every
/// [`JobHandle`]. The intake gate lives here so handles observe shutdown
/// (and fatal-storage halts) the moment they happen.
pub(crate) struct QueueCore {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) dedup: DedupIndex,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) ready: ReadyQueue,
    pub(crate) accepting: AtomicBool,
}

impl QueueCore {
    /// The single intake path: dedup reservation, store insert, then handoff
    /// to either the ready queue or the time wheel.
    pub(crate) async fn submit(&self, job: Job) -> Result<JobId, QueueError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        // Reserve before insert; release on insert failure so a failed
        // enqueue cannot strand the key.
        if let Some(key) = &job.dedup_key {
            match self.dedup.reserve(key, &job.id).await? {
                Reservation::Reserved => {}
                Reservation::Held(existing) => {
                    return match self.dedup.policy() {
                        DedupPolicy::Reject => Err(QueueError::Duplicate { existing }),
                        DedupPolicy::Coalesce => Ok(existing),
                    };
                }
            }
        }

        let id = job.id.clone();
        let kind = job.kind.clone();
        let run_at = job.run_at;
        let key = job.dedup_key.clone();

        if let Err(e) = self.store.insert(job).await {
            if let Some(key) = key {
                if let Err(release_err) = self.dedup.release(&key, &id).await {
                    error!(job_id = %id, error = %release_err, "failed to release dedup key");
                }
            }
            return Err(e.into());
        }

        match kind {
            JobKind::Immediate => self.ready.push(id.clone()),
            JobKind::Delayed | JobKind::Recurring { .. } => {
                self.scheduler.schedule(id.clone(), run_at)
            }
        }

        Ok(id)
    }
}

/// The task-queue engine: one scheduler tick loop plus a bounded pool of
/// worker tasks over a durable job store.
///
/// Delivery is at-least-once: a crashed or hung worker forfeits its lease and
/// the job runs again, possibly on another worker. Handlers must therefore be
/// idempotent; the engine does not (and cannot) enforce this for them.
///
/// ```ignore
/// let mut queue = TaskQueue::open("sqlite://jobs.db?mode=rwc", QueueConfig::default()).await?;
///
/// let send_email = queue.register("send_email", send_email_handler, JobOptions::default());
///
/// queue.start().await?;
/// send_email.enqueue(SendEmailArgs { to: "user@example.com".into() }).await?;
/// ```
pub struct TaskQueue {
    core: Arc<QueueCore>,
    registry: Arc<HandlerRegistry>,
    sink: Arc<dyn DeadLetterSink>,
    config: QueueConfig,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Open a queue over the bundled SQLite store.
    pub async fn open(database_url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        let store: Arc<dyn JobStore> = Arc::new(SqliteStore::open(database_url).await?);
        Ok(Self::with_store(store, config))
    }

    /// Open a queue over any [`JobStore`] implementation.
    pub fn with_store(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        let ready = ReadyQueue::new();
        let dedup = DedupIndex::new(Arc::clone(&store), config.dedup_policy);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            ready.clone(),
            config.tick_interval,
        ));

        Self {
            core: Arc::new(QueueCore {
                store,
                dedup,
                scheduler,
                ready,
                accepting: AtomicBool::new(true),
            }),
            registry: Arc::new(HandlerRegistry::new()),
            sink: Arc::new(TracingSink),
            config,
            shutdown: CancellationToken::new(),
            worker_handles: Vec::new(),
            scheduler_handle: None,
        }
    }

    /// Route dead-lettered jobs somewhere other than the log. Call before
    /// `start()`.
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Register a handler for a job type and get back a typed enqueue handle.
    /// All registration happens before `start()`; the registry is immutable
    /// once workers are running.
    pub fn register<T, F, Fut>(&self, name: &'static str, handler: F, opts: JobOptions) -> JobHandle<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |payload: Vec<u8>| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: T = serde_json::from_slice(&payload)?;
                handler(args)
                    .await
                    .map_err(crate::registry::HandlerError::Failed)
            })
        });

        self.registry.register(name, boxed, opts.timeout);

        JobHandle::new(name, opts, Arc::clone(&self.core))
    }

    /// Start the scheduler tick loop and the worker pool, after rebuilding
    /// the time wheel from whatever the store still holds (crash recovery).
    pub async fn start(&mut self) -> Result<(), QueueError> {
        let schedulable = self.core.store.list_due(far_future()).await?;
        let recovered = schedulable.len();
        for (id, due) in schedulable {
            self.core.scheduler.schedule(id, due);
        }
        if recovered > 0 {
            info!(jobs = recovered, "recovered schedulable jobs from store");
        }

        let scheduler = Arc::clone(&self.core.scheduler);
        let token = self.shutdown.clone();
        let dedup = self.core.dedup.clone();
        let sink = Arc::clone(&self.sink);
        self.scheduler_handle = Some(tokio::spawn(scheduler.run(token, dedup, sink)));

        for n in 0..self.config.worker_count {
            let worker = Worker::new(
                format!("worker-{n}"),
                Arc::clone(&self.core.store),
                Arc::clone(&self.registry),
                self.core.ready.clone(),
                Arc::clone(&self.core.scheduler),
                self.core.dedup.clone(),
                RetryManager::new(
                    Arc::clone(&self.core.store),
                    Arc::clone(&self.core.scheduler),
                    self.core.dedup.clone(),
                    Arc::clone(&self.sink),
                ),
                self.config.lease_duration,
            );
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        info!(workers = self.config.worker_count, "task queue started");
        Ok(())
    }

    /// Cancel a schedulable job. Leased jobs cannot be interrupted (handlers
    /// are opaque); the engine only guarantees a cancelled job is never
    /// re-scheduled. Cancelling a finished job reports `NotFound`.
    pub async fn cancel(&self, id: &JobId) -> Result<(), QueueError> {
        let job = self
            .core
            .store
            .get(id)
            .await?
            .ok_or(QueueError::NotFound)?;

        match job.state.kind() {
            kind @ (StateKind::Pending | StateKind::Retrying) => {
                match self
                    .core
                    .store
                    .transition(id, kind, StateUpdate::to(JobState::Cancelled))
                    .await
                {
                    Ok(()) => {
                        if let Some(key) = &job.dedup_key {
                            if let Err(e) = self.core.dedup.release(key, id).await {
                                error!(job_id = %id, error = %e, "failed to release dedup key");
                            }
                        }
                        info!(job_id = %id, "job cancelled");
                        Ok(())
                    }
                    // Lost the race to a worker lease.
                    Err(StorageError::Conflict { .. }) => Err(QueueError::AlreadyRunning),
                    Err(e) => Err(e.into()),
                }
            }
            StateKind::Leased => Err(QueueError::AlreadyRunning),
            StateKind::Succeeded | StateKind::DeadLettered | StateKind::Cancelled => {
                Err(QueueError::NotFound)
            }
        }
    }

    /// Current state snapshot of a job.
    pub async fn status(&self, id: &JobId) -> Result<JobState, QueueError> {
        self.core
            .store
            .get(id)
            .await?
            .map(|job| job.state)
            .ok_or(QueueError::NotFound)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.core.store.stats().await?)
    }

    /// Token cancelled when shutdown begins; embedders can watch it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Graceful shutdown in three phases: stop intake, drain in-flight work
    /// up to the drain deadline, release the store. Jobs still leased when
    /// the deadline expires are force-expired so they are retried later
    /// rather than lost.
    pub async fn shutdown(&mut self) {
        info!("shutting down task queue");

        // Phase 1: stop accepting, stop promoting.
        self.core.accepting.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }

        // Phase 2: drain. Closing the ready queue lets workers finish what is
        // already queued and exit.
        self.core.ready.close();

        let mut handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let drained = tokio::time::timeout(self.config.drain_deadline, async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!("drain deadline expired, force-expiring outstanding leases");
            for handle in &handles {
                handle.abort();
            }
            // Treat whatever is still leased as crashed so it is retried on
            // the next start instead of staying leased forever.
            match self.core.store.list_expired_leases(far_future()).await {
                Ok(leased) => {
                    for id in leased {
                        reap_lease(
                            &self.core.store,
                            &self.core.dedup,
                            &self.sink,
                            &self.core.ready,
                            &id,
                        )
                        .await;
                    }
                }
                Err(e) => error!(error = %e, "failed to list outstanding leases"),
            }
        }

        // Phase 3: release.
        self.core.store.close().await;
        info!("shutdown complete");
    }

    /// Block until Ctrl+C / SIGTERM, then shut down gracefully.
    pub async fn wait_for_shutdown(&mut self) {
        crate::shutdown::shutdown_signal().cancelled().await;
        self.shutdown().await;
    }
}
