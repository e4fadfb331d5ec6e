use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskmill::{
    BackoffPolicy, DeadLetterSink, DedupPolicy, JobId, JobOptions, MemorySink, QueueConfig,
    QueueError, StateKind, TaskQueue,
};
use tempfile::TempDir;

fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_workers(2)
        .with_tick_interval(Duration::from_millis(50))
        .with_drain_deadline(Duration::from_secs(5))
}

async fn open_queue(config: QueueConfig) -> (TaskQueue, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display());
    let queue = TaskQueue::open(&url, config).await.expect("open queue");
    (queue, dir)
}

async fn wait_for_state(queue: &TaskQueue, id: &JobId, want: StateKind, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(state) = queue.status(id).await {
            if state.kind() == want {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_count(counter: &AtomicU32, want: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if counter.load(Ordering::SeqCst) >= want {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn immediate_job_runs_once() {
    let (mut queue, _dir) = open_queue(fast_config()).await;
    let counter = Arc::new(AtomicU32::new(0));

    let c = Arc::clone(&counter);
    let work = queue.register(
        "work",
        move |_: ()| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    let id = work.enqueue(()).await.expect("enqueue");

    assert!(wait_for_state(&queue, &id, StateKind::Succeeded, Duration::from_secs(3)).await);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delayed_job_stays_pending_until_due() {
    let (mut queue, _dir) = open_queue(fast_config()).await;
    let counter = Arc::new(AtomicU32::new(0));

    let c = Arc::clone(&counter);
    let work = queue.register(
        "work",
        move |_: ()| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    let id = work
        .enqueue_delayed((), Duration::from_millis(600))
        .await
        .expect("enqueue");

    // Still waiting out its delay.
    let state = queue.status(&id).await.expect("status");
    assert_eq!(state.kind(), StateKind::Pending);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    assert!(wait_for_state(&queue, &id, StateKind::Succeeded, Duration::from_secs(3)).await);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_job_dead_letters_after_max_attempts() {
    let sink = Arc::new(MemorySink::default());
    let (queue, _dir) = open_queue(fast_config()).await;
    let mut queue = queue.with_dead_letter_sink(Arc::clone(&sink) as Arc<dyn DeadLetterSink>);
    let counter = Arc::new(AtomicU32::new(0));

    let c = Arc::clone(&counter);
    let flaky = queue.register(
        "flaky",
        move |_: ()| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), String>("payment gateway unreachable".to_string())
            }
        },
        JobOptions::default()
            .with_max_attempts(3)
            .with_backoff(BackoffPolicy::Linear {
                base: Duration::from_millis(50),
                jitter: None,
            }),
    );
    queue.start().await.expect("start");

    let id = flaky.enqueue(()).await.expect("enqueue");

    assert!(wait_for_state(&queue, &id, StateKind::DeadLettered, Duration::from_secs(5)).await);
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    let letters = sink.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_id, id);
    assert_eq!(letters[0].attempts, 3);
    assert!(letters[0].error.contains("payment gateway unreachable"));

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn duplicate_key_is_rejected_while_active() {
    let (mut queue, _dir) = open_queue(fast_config()).await;

    let work = queue.register(
        "work",
        |_: ()| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<(), String>(())
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    let first = work.enqueue_keyed((), "order-42").await.expect("enqueue");
    let err = work
        .enqueue_keyed((), "order-42")
        .await
        .expect_err("second enqueue must be rejected");

    match err {
        QueueError::Duplicate { existing } => assert_eq!(existing, first),
        other => panic!("expected Duplicate, got {other:?}"),
    }

    // Once the first job is terminal the key is free again.
    assert!(wait_for_state(&queue, &first, StateKind::Succeeded, Duration::from_secs(3)).await);
    let second = work.enqueue_keyed((), "order-42").await.expect("re-enqueue");
    assert_ne!(second, first);
}

#[tokio::test]
async fn coalesce_policy_returns_existing_id() {
    let (mut queue, _dir) =
        open_queue(fast_config().with_dedup_policy(DedupPolicy::Coalesce)).await;

    let work = queue.register(
        "work",
        |_: ()| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<(), String>(())
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    let first = work.enqueue_keyed((), "order-42").await.expect("enqueue");
    let second = work.enqueue_keyed((), "order-42").await.expect("coalesce");
    assert_eq!(second, first);
}

#[tokio::test]
async fn cancel_pending_job_never_runs() {
    let (mut queue, _dir) = open_queue(fast_config()).await;
    let counter = Arc::new(AtomicU32::new(0));

    let c = Arc::clone(&counter);
    let work = queue.register(
        "work",
        move |_: ()| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    let id = work
        .enqueue_delayed((), Duration::from_secs(30))
        .await
        .expect("enqueue");

    queue.cancel(&id).await.expect("cancel");
    let state = queue.status(&id).await.expect("status");
    assert_eq!(state.kind(), StateKind::Cancelled);

    // Cancelling a finished job is a NotFound, not a corruption.
    assert!(matches!(queue.cancel(&id).await, Err(QueueError::NotFound)));
    assert!(matches!(
        queue.cancel(&JobId::new()).await,
        Err(QueueError::NotFound)
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn recurring_job_chains_occurrences() {
    let (mut queue, _dir) = open_queue(fast_config()).await;
    let counter = Arc::new(AtomicU32::new(0));

    let c = Arc::clone(&counter);
    let tick = queue.register(
        "tick",
        move |_: ()| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    let id = tick
        .enqueue_recurring_keyed("* * * * * *", (), "heartbeat")
        .await
        .expect("enqueue recurring");

    assert!(wait_for_count(&counter, 2, Duration::from_secs(6)).await);

    // The dedup reservation followed the chain: the key is still held by
    // whichever occurrence is currently active.
    let err = tick
        .enqueue_keyed((), "heartbeat")
        .await
        .expect_err("key must still be reserved");
    match err {
        QueueError::Duplicate { existing } => assert_ne!(existing, id),
        other => panic!("expected Duplicate, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_lease_requeues_job() {
    let config = fast_config().with_lease_duration(Duration::from_millis(300));
    let (mut queue, _dir) = open_queue(config).await;
    let counter = Arc::new(AtomicU32::new(0));

    // The first execution hangs well past the lease; the reaper charges the
    // attempt and hands the job to another worker.
    let c = Arc::clone(&counter);
    let stuck = queue.register(
        "stuck",
        move |_: ()| {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok::<(), String>(())
            }
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    let id = stuck.enqueue(()).await.expect("enqueue");

    assert!(wait_for_state(&queue, &id, StateKind::Succeeded, Duration::from_secs(5)).await);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_drains_in_flight_and_rejects_intake() {
    let (mut queue, _dir) = open_queue(fast_config()).await;
    let completed = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&completed);
    let slow = queue.register(
        "slow",
        move |_: ()| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    slow.enqueue(()).await.expect("enqueue");
    tokio::time::sleep(Duration::from_millis(150)).await;

    queue.shutdown().await;

    // The in-flight handler was allowed to finish before the store closed.
    assert!(completed.load(Ordering::SeqCst));

    // Intake is gated from the moment shutdown starts.
    assert!(matches!(
        slow.enqueue(()).await,
        Err(QueueError::ShuttingDown)
    ));
}

#[tokio::test]
async fn restart_recovers_pending_jobs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display());
    let counter = Arc::new(AtomicU32::new(0));

    // First process: enqueue without ever starting workers, then exit.
    {
        let mut queue = TaskQueue::open(&url, fast_config()).await.expect("open");
        let work = queue.register(
            "work",
            |_: ()| async { Ok::<(), String>(()) },
            JobOptions::default(),
        );
        work.enqueue(()).await.expect("enqueue");
        work.enqueue_delayed((), Duration::from_millis(100))
            .await
            .expect("enqueue delayed");
        queue.shutdown().await;
    }

    // Second process: the store still holds both jobs; startup recovery
    // rebuilds the time wheel and they run.
    let mut queue = TaskQueue::open(&url, fast_config()).await.expect("reopen");
    let c = Arc::clone(&counter);
    let _work = queue.register(
        "work",
        move |_: ()| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        },
        JobOptions::default(),
    );
    queue.start().await.expect("start");

    assert!(wait_for_count(&counter, 2, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn status_of_unknown_job_is_not_found() {
    let (queue, _dir) = open_queue(fast_config()).await;
    assert!(matches!(
        queue.status(&JobId::new()).await,
        Err(QueueError::NotFound)
    ));
}
