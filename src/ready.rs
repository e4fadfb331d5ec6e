use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::job::JobId;

struct Inner {
    queue: Mutex<VecDeque<JobId>>,
    closed: AtomicBool,
    notify: Notify,
}

/// FIFO handoff of due job ids between the scheduler (or immediate enqueues)
/// and the worker pool. Holds ids only, so draining it on shutdown is cheap.
#[derive(Clone)]
pub(crate) struct ReadyQueue {
    inner: Arc<Inner>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Hand a due job to the workers. A push after close is silently dropped;
    /// the job stays schedulable in the store and is recovered on next start.
    pub fn push(&self, id: JobId) {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!(job_id = %id, "ready queue closed, dropping push");
            return;
        }

        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(id);
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Next due job id, FIFO. Returns `None` once the queue is closed and
    /// every already-queued id has been handed out.
    pub async fn pop(&self) -> Option<JobId> {
        loop {
            // Register interest before checking so a push between the check
            // and the await still wakes us.
            let notified = self.inner.notify.notified();

            {
                let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(id) = queue.pop_front() {
                    return Some(id);
                }
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                // Pass the close permit along so every idle consumer wakes,
                // including ones that had not polled their wait yet.
                self.inner.notify.notify_one();
                return None;
            }

            notified.await;
        }
    }

    /// Stop accepting pushes. Workers keep draining what is already queued.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let queue = ReadyQueue::new();
        let a = JobId::new();
        let b = JobId::new();

        queue.push(a.clone());
        queue.push(b.clone());

        assert_eq!(queue.pop().await, Some(a));
        assert_eq!(queue.pop().await, Some(b));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = ReadyQueue::new();
        let a = JobId::new();

        queue.push(a.clone());
        queue.close();
        queue.push(JobId::new()); // dropped

        assert_eq!(queue.pop().await, Some(a));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn close_wakes_idle_consumer() {
        let queue = ReadyQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        let popped = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("consumer must wake on close")
            .expect("join");
        assert_eq!(popped, None);
    }
}
