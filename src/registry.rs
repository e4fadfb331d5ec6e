use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;

use crate::job::Job;

/// Error type for handler execution
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no handler registered for job type: {0}")]
    NotRegistered(String),

    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

pub(crate) type HandlerResult = Result<(), HandlerError>;
pub(crate) type BoxedHandler =
    Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

struct RegisteredHandler {
    handler: BoxedHandler,
    timeout: Option<Duration>,
}

/// Registry mapping a job type to its handler. Handlers are registered before
/// the queue starts and the mapping is not mutated afterwards.
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, handler: BoxedHandler, timeout: Option<Duration>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(name.to_string(), RegisteredHandler { handler, timeout });
    }

    /// Run the registered handler for the job's type against its payload.
    ///
    /// The handler runs on its own task so a panic is contained and reported
    /// as a failure rather than taking the worker down.
    pub async fn execute(&self, job: &Job) -> HandlerResult {
        let (handler, timeout) = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            let registered = handlers
                .get(&job.job_type)
                .ok_or_else(|| HandlerError::NotRegistered(job.job_type.clone()))?;
            (registered.handler.clone(), registered.timeout)
        };

        let future = handler(job.payload.clone());
        let mut handle = tokio::spawn(async move { future.await });

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                HandlerError::Failed("handler panicked".to_string())
            } else {
                HandlerError::Failed("handler cancelled".to_string())
            }
        };

        match timeout {
            Some(duration) => {
                tokio::select! {
                    res = &mut handle => res.map_err(join_to_error)?,
                    _ = tokio::time::sleep(duration) => {
                        handle.abort();
                        Err(HandlerError::Timeout(duration))
                    }
                }
            }
            None => handle.await.map_err(join_to_error)?,
        }
    }
}
