use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::job::{Job, JobId, JobKind, JobState, StateKind};

use super::{QueueStats, Result, StateUpdate, StorageError};

/// SQLite-backed job store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.configure().await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn configure(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                kind TEXT NOT NULL,
                cron TEXT,
                payload BLOB NOT NULL,
                dedup_key TEXT,
                state TEXT NOT NULL,
                run_at TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                backoff TEXT NOT NULL,
                lease_owner TEXT,
                lease_expires_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_state_run_at ON jobs(state, run_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_lease_expires ON jobs(lease_expires_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_keys (
                key TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                reserved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(&self, row: sqlx::sqlite::SqliteRow) -> Result<Job> {
        let id: String = row.get("id");
        let job_type: String = row.get("job_type");
        let kind_str: String = row.get("kind");
        let cron: Option<String> = row.get("cron");
        let payload: Vec<u8> = row.get("payload");
        let dedup_key: Option<String> = row.get("dedup_key");
        let state_str: String = row.get("state");
        let run_at_str: String = row.get("run_at");
        let attempt: i64 = row.get("attempt");
        let max_attempts: i64 = row.get("max_attempts");
        let backoff_str: String = row.get("backoff");
        let lease_owner: Option<String> = row.get("lease_owner");
        let lease_expires_str: Option<String> = row.get("lease_expires_at");
        let last_error: Option<String> = row.get("last_error");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        let run_at = parse_timestamp(&run_at_str);
        let created_at = parse_timestamp(&created_at_str);
        let updated_at = parse_timestamp(&updated_at_str);
        let lease_expires_at = lease_expires_str
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let state = JobState::from_columns(
            &state_str,
            lease_owner,
            lease_expires_at,
            last_error.clone(),
        );
        let backoff = serde_json::from_str(&backoff_str)?;

        Ok(Job {
            id: JobId(id),
            job_type,
            kind: JobKind::from_columns(&kind_str, cron),
            payload,
            dedup_key,
            state,
            run_at,
            attempt: attempt as u32,
            max_attempts: max_attempts as u32,
            backoff,
            last_error,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl super::JobStore for SqliteStore {
    async fn insert(&self, job: Job) -> Result<JobId> {
        let backoff = serde_json::to_string(&job.backoff)?;
        let (state_str, lease_owner, lease_expires) = encode_state(&job.state);

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, kind, cron, payload, dedup_key, state, run_at,
                              attempt, max_attempts, backoff, lease_owner, lease_expires_at,
                              last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id.0)
        .bind(&job.job_type)
        .bind(job.kind.as_str())
        .bind(job.kind.cron())
        .bind(&job.payload)
        .bind(&job.dedup_key)
        .bind(state_str)
        .bind(job.run_at.to_rfc3339())
        .bind(job.attempt as i64)
        .bind(job.max_attempts as i64)
        .bind(backoff)
        .bind(lease_owner)
        .bind(lease_expires)
        .bind(&job.last_error)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(job.id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn transition(&self, id: &JobId, expected: StateKind, update: StateUpdate) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let (state_str, lease_owner, lease_expires) = encode_state(&update.state);
        let error = match &update.state {
            JobState::DeadLettered { error } => Some(error.clone()),
            _ => update.error.clone(),
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, lease_owner = ?, lease_expires_at = ?,
                last_error = COALESCE(?, last_error),
                run_at = COALESCE(?, run_at),
                attempt = attempt + ?,
                updated_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(state_str)
        .bind(lease_owner)
        .bind(lease_expires)
        .bind(error)
        .bind(update.run_at.map(|t| t.to_rfc3339()))
        .bind(if update.bump_attempt { 1 } else { 0 })
        .bind(now)
        .bind(&id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE id = ?")
                .bind(&id.0)
                .fetch_one(&self.pool)
                .await?;
            if exists == 0 {
                return Err(StorageError::NotFound(id.clone()));
            }
            return Err(StorageError::Conflict {
                id: id.clone(),
                expected,
            });
        }

        Ok(())
    }

    async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<(JobId, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_at FROM jobs
            WHERE state IN ('pending', 'retrying') AND run_at <= ?
            ORDER BY run_at ASC
            "#,
        )
        .bind(before.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let run_at: String = row.get("run_at");
                (JobId(id), parse_timestamp(&run_at))
            })
            .collect())
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE state = 'leased' AND lease_expires_at < ?
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: String = row.get("id");
                JobId(id)
            })
            .collect())
    }

    async fn dedup_reserve(&self, key: &str, id: &JobId) -> Result<Option<JobId>> {
        loop {
            let inserted = sqlx::query(
                r#"
                INSERT INTO dedup_keys (key, job_id, reserved_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(&id.0)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() > 0 {
                return Ok(None);
            }

            let holder: Option<String> =
                sqlx::query_scalar("SELECT job_id FROM dedup_keys WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;

            // The holder released between the insert and the read; try again.
            match holder {
                Some(existing) => return Ok(Some(JobId(existing))),
                None => continue,
            }
        }
    }

    async fn dedup_release(&self, key: &str, id: &JobId) -> Result<()> {
        sqlx::query("DELETE FROM dedup_keys WHERE key = ? AND job_id = ?")
            .bind(key)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn dedup_update(&self, key: &str, from: &JobId, to: &JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_keys
            SET job_id = ?, reserved_at = ?
            WHERE key = ? AND job_id = ?
            "#,
        )
        .bind(&to.0)
        .bind(Utc::now().to_rfc3339())
        .bind(key)
        .bind(&from.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            let n = n as u64;
            match state.as_str() {
                "pending" => stats.pending = n,
                "leased" => stats.leased = n,
                "succeeded" => stats.succeeded = n,
                "retrying" => stats.retrying = n,
                "dead_lettered" => stats.dead_lettered = n,
                "cancelled" => stats.cancelled = n,
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn encode_state(state: &JobState) -> (&'static str, Option<String>, Option<String>) {
    match state {
        JobState::Leased { owner, expires_at } => (
            "leased",
            Some(owner.clone()),
            Some(expires_at.to_rfc3339()),
        ),
        other => (other.kind().as_str(), None, None),
    }
}
