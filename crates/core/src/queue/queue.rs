//! # Durable Job Queue
//!
//! Named jobs with JSON payloads, persisted in SQLite. Workers claim one
//! job at a time; retry with linear backoff is the queue's own policy and
//! stays out of the handlers.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::state::KeeperDb;
use crate::util::{Clock, SystemClock};

/// Delay between retries grows linearly by this much per attempt.
const RETRY_BACKOFF_MS: i64 = 5_000;

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly until `run_at`)
    Queued,
    /// Claimed by a worker
    Active,
    /// Handler finished successfully
    Completed,
    /// Retries exhausted
    Failed,
}

impl JobStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

/// One unit of queued work
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed queue.
pub struct JobQueue {
    conn: Arc<Mutex<rusqlite::Connection>>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(db: &KeeperDb) -> Self {
        Self {
            conn: db.connection(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Inject a clock for deterministic backoff tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn timestamp(t: DateTime<Utc>) -> String {
        // Fixed-width so string comparison in SQL matches time order
        t.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Enqueue a named job, runnable immediately. Duplicate enqueues are
    /// tolerated; downstream handlers are idempotent or self-guarding.
    pub fn enqueue(&self, name: &str, payload: serde_json::Value) -> Result<i64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Self::timestamp(self.clock.now());
        conn.execute(
            r#"
            INSERT INTO jobs (name, payload, status, attempts, max_attempts, run_at, created_at, updated_at)
            VALUES (?1, ?2, 'queued', 0, 3, ?3, ?3, ?3)
            "#,
            params![name, payload.to_string(), now],
        )
        .context("Failed to enqueue job")?;

        Ok(conn.last_insert_rowid())
    }

    /// Claim the oldest runnable job, marking it active. Claiming holds the
    /// connection lock, so concurrent workers never claim the same row.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Self::timestamp(self.clock.now());
        let job = conn
            .query_row(
                r#"
                SELECT id, name, payload, status, attempts, max_attempts, last_error, run_at, created_at
                FROM jobs
                WHERE status = 'queued' AND run_at <= ?1
                ORDER BY id ASC
                LIMIT 1
                "#,
                params![now],
                Self::row_to_job,
            )
            .ok();

        let Some(mut job) = job else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE jobs SET status = 'active', attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
            params![now, job.id],
        )?;
        job.status = JobStatus::Active;
        job.attempts += 1;

        Ok(Some(job))
    }

    /// Mark a job done.
    pub fn complete(&self, id: i64) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let now = Self::timestamp(self.clock.now());
        conn.execute(
            "UPDATE jobs SET status = 'completed', updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;

        Ok(())
    }

    /// Record a handler failure. Requeues with linear backoff until
    /// `max_attempts`, then the job is terminally failed.
    pub fn fail(&self, id: i64, error: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let (attempts, max_attempts): (i64, i64) = conn
            .query_row(
                "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .with_context(|| format!("Job not found: {}", id))?;

        let now = self.clock.now();
        if attempts >= max_attempts {
            conn.execute(
                "UPDATE jobs SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, Self::timestamp(now), id],
            )?;
        } else {
            let backoff = chrono::Duration::milliseconds(attempts * RETRY_BACKOFF_MS);
            conn.execute(
                "UPDATE jobs SET status = 'queued', last_error = ?1, run_at = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    error,
                    Self::timestamp(now + backoff),
                    Self::timestamp(now),
                    id
                ],
            )?;
        }

        Ok(())
    }

    /// Load one job.
    pub fn get(&self, id: i64) -> Result<Job> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.query_row(
            r#"
            SELECT id, name, payload, status, attempts, max_attempts, last_error, run_at, created_at
            FROM jobs WHERE id = ?1
            "#,
            params![id],
            Self::row_to_job,
        )
        .with_context(|| format!("Job not found: {}", id))
    }

    /// Number of jobs waiting to run.
    pub fn queued_count(&self) -> Result<i64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let count = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'queued'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let payload: String = row.get(2)?;
        let status: String = row.get(3)?;
        let run_at: String = row.get(7)?;
        let created_at: String = row.get(8)?;

        Ok(Job {
            id: row.get(0)?,
            name: row.get(1)?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            status: JobStatus::from_str(&status),
            attempts: row.get(4)?,
            max_attempts: row.get(5)?,
            last_error: row.get(6)?,
            run_at: parse_timestamp(&run_at),
            created_at: parse_timestamp(&created_at),
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
