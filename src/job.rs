use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Bare state discriminant, used as the expected side of a compare-and-swap
/// transition and as the column encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateKind {
    Pending,
    Leased,
    Succeeded,
    Retrying,
    DeadLettered,
    Cancelled,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Pending => "pending",
            StateKind::Leased => "leased",
            StateKind::Succeeded => "succeeded",
            StateKind::Retrying => "retrying",
            StateKind::DeadLettered => "dead_lettered",
            StateKind::Cancelled => "cancelled",
        }
    }

    /// Whether a job in this state still holds its dedup reservation.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StateKind::Pending | StateKind::Leased | StateKind::Retrying
        )
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current state of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    /// Schedulable; `run_at` says when it becomes due.
    Pending,
    /// Checked out by a worker until `expires_at`.
    Leased {
        owner: String,
        expires_at: DateTime<Utc>,
    },
    Succeeded,
    /// Failed and waiting out its backoff delay; `run_at` holds the next attempt time.
    Retrying,
    /// Exhausted its retry budget. Terminal.
    DeadLettered { error: String },
    Cancelled,
}

impl JobState {
    pub fn kind(&self) -> StateKind {
        match self {
            JobState::Pending => StateKind::Pending,
            JobState::Leased { .. } => StateKind::Leased,
            JobState::Succeeded => StateKind::Succeeded,
            JobState::Retrying => StateKind::Retrying,
            JobState::DeadLettered { .. } => StateKind::DeadLettered,
            JobState::Cancelled => StateKind::Cancelled,
        }
    }

    pub fn from_columns(
        state: &str,
        lease_owner: Option<String>,
        lease_expires_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> Self {
        match state {
            "pending" => JobState::Pending,
            "leased" => JobState::Leased {
                owner: lease_owner.unwrap_or_default(),
                expires_at: lease_expires_at.unwrap_or_else(Utc::now),
            },
            "succeeded" => JobState::Succeeded,
            "retrying" => JobState::Retrying,
            "dead_lettered" => JobState::DeadLettered {
                error: last_error.unwrap_or_default(),
            },
            "cancelled" => JobState::Cancelled,
            _ => JobState::Pending,
        }
    }
}

/// How a job is scheduled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobKind {
    Immediate,
    Delayed,
    Recurring { cron: String },
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Immediate => "immediate",
            JobKind::Delayed => "delayed",
            JobKind::Recurring { .. } => "recurring",
        }
    }

    pub fn cron(&self) -> Option<&str> {
        match self {
            JobKind::Recurring { cron } => Some(cron),
            _ => None,
        }
    }

    pub fn from_columns(kind: &str, cron: Option<String>) -> Self {
        match (kind, cron) {
            ("recurring", Some(cron)) => JobKind::Recurring { cron },
            ("delayed", _) => JobKind::Delayed,
            _ => JobKind::Immediate,
        }
    }
}

/// Delay computation between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// `delay = base * (attempt + 1)`
    Linear {
        base: Duration,
        jitter: Option<Duration>,
    },
    /// `delay = min(base * 2^attempt, cap)`
    Exponential {
        base: Duration,
        cap: Duration,
        jitter: Option<Duration>,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: None,
        }
    }
}

/// A job record. The job store owns every field; other components read
/// through the store and mutate only via compare-and-swap transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub kind: JobKind,
    pub payload: Vec<u8>,
    pub dedup_key: Option<String>,
    pub state: JobState,
    /// Next time this job is due. Enqueue time for immediate jobs.
    pub run_at: DateTime<Utc>,
    /// Execution attempts so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new<S: Into<String>>(job_type: S, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            kind: JobKind::Immediate,
            payload,
            dedup_key: None,
            state: JobState::Pending,
            run_at: now,
            attempt: 0,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn delayed(mut self, run_at: DateTime<Utc>) -> Self {
        self.kind = JobKind::Delayed;
        self.run_at = run_at;
        self
    }

    pub fn recurring<S: Into<String>>(mut self, cron: S, first_run: DateTime<Utc>) -> Self {
        self.kind = JobKind::Recurring { cron: cron.into() };
        self.run_at = first_run;
        self
    }

    pub fn with_dedup_key<S: Into<String>>(mut self, key: S) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The next occurrence of a recurring job: same identity and policies,
    /// fresh id, fresh attempt counter, new due time.
    pub fn next_occurrence(&self, run_at: DateTime<Utc>) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            job_type: self.job_type.clone(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            dedup_key: self.dedup_key.clone(),
            state: JobState::Pending,
            run_at,
            attempt: 0,
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Add a std duration to a timestamp without panicking on overflow.
pub(crate) fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or_else(|| at + chrono::Duration::days(36500))
}

/// A timestamp far enough out to act as an upper bound in due-time scans.
///
/// Deliberately not `DateTime::MAX_UTC`: timestamps are persisted as RFC 3339
/// text and six-digit years do not compare lexicographically.
pub(crate) fn far_future() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::days(36500)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_kind_round_trip() {
        let states = [
            JobState::Pending,
            JobState::Leased {
                owner: "worker-1".to_string(),
                expires_at: Utc::now(),
            },
            JobState::Succeeded,
            JobState::Retrying,
            JobState::DeadLettered {
                error: "boom".to_string(),
            },
            JobState::Cancelled,
        ];

        for state in states {
            let kind = state.kind();
            let (owner, expires) = match &state {
                JobState::Leased { owner, expires_at } => (Some(owner.clone()), Some(*expires_at)),
                _ => (None, None),
            };
            let error = match &state {
                JobState::DeadLettered { error } => Some(error.clone()),
                _ => None,
            };
            let restored = JobState::from_columns(kind.as_str(), owner, expires, error);
            assert_eq!(restored, state);
        }
    }

    #[test]
    fn active_states() {
        assert!(StateKind::Pending.is_active());
        assert!(StateKind::Leased.is_active());
        assert!(StateKind::Retrying.is_active());
        assert!(!StateKind::Succeeded.is_active());
        assert!(!StateKind::DeadLettered.is_active());
        assert!(!StateKind::Cancelled.is_active());
    }

    #[test]
    fn kind_round_trip() {
        let recurring = JobKind::Recurring {
            cron: "0 0 * * * *".to_string(),
        };
        let restored = JobKind::from_columns(recurring.as_str(), recurring.cron().map(String::from));
        assert_eq!(restored, recurring);

        assert_eq!(JobKind::from_columns("delayed", None), JobKind::Delayed);
        assert_eq!(JobKind::from_columns("immediate", None), JobKind::Immediate);
        // A recurring row missing its rule degrades to immediate rather than panicking.
        assert_eq!(JobKind::from_columns("recurring", None), JobKind::Immediate);
    }

    #[test]
    fn next_occurrence_preserves_identity() {
        let job = Job::new("report", b"{}".to_vec())
            .recurring("0 0 * * * *", Utc::now())
            .with_dedup_key("nightly-report")
            .with_max_attempts(5);

        let run_at = Utc::now() + chrono::Duration::hours(1);
        let next = job.next_occurrence(run_at);

        assert_ne!(next.id, job.id);
        assert_eq!(next.job_type, job.job_type);
        assert_eq!(next.kind, job.kind);
        assert_eq!(next.payload, job.payload);
        assert_eq!(next.dedup_key, job.dedup_key);
        assert_eq!(next.max_attempts, job.max_attempts);
        assert_eq!(next.attempt, 0);
        assert_eq!(next.state, JobState::Pending);
        assert_eq!(next.run_at, run_at);
    }

    #[test]
    fn add_duration_saturates() {
        let now = Utc::now();
        let far = add_duration(now, Duration::from_secs(u64::MAX));
        assert!(far > now);
    }
}
