use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::store::{JobStore, StorageError};

/// What happens when an enqueue collides with an active dedup key.
///
/// The policy is fixed at queue construction; it is never inferred per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupPolicy {
    /// The new enqueue fails with a duplicate error naming the existing job.
    Reject,
    /// The new enqueue is dropped and the existing job id is returned.
    Coalesce,
}

pub(crate) enum Reservation {
    Reserved,
    Held(JobId),
}

/// Maps a dedup key to the one active job holding it. Reservations are taken
/// before the job-store insert and dropped when the job leaves the active set
/// (succeeded, dead-lettered, or cancelled); a recurring job's next occurrence
/// inherits the reservation via `transfer`.
#[derive(Clone)]
pub(crate) struct DedupIndex {
    store: Arc<dyn JobStore>,
    policy: DedupPolicy,
}

impl DedupIndex {
    pub fn new(store: Arc<dyn JobStore>, policy: DedupPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    pub async fn reserve(&self, key: &str, id: &JobId) -> Result<Reservation, StorageError> {
        match self.store.dedup_reserve(key, id).await? {
            None => Ok(Reservation::Reserved),
            Some(existing) => Ok(Reservation::Held(existing)),
        }
    }

    pub async fn release(&self, key: &str, id: &JobId) -> Result<(), StorageError> {
        self.store.dedup_release(key, id).await
    }

    pub async fn transfer(
        &self,
        key: &str,
        from: &JobId,
        to: &JobId,
    ) -> Result<bool, StorageError> {
        self.store.dedup_update(key, from, to).await
    }
}
