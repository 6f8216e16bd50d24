//! Durable job queue in the `jobs` table.
//!
//! Workers claim jobs with a single `UPDATE ... RETURNING` so two workers
//! never receive the same job. A claimed job carries a lease token and an
//! expiry; a job whose lease ran out (its worker died) is claimable again.
//!
//! Job lifecycle:
//!
//! ```text
//! queued ──claim──→ running ──complete──→ done
//!    ↑                 │
//!    └──retry/requeue──┤
//!                      └──fail / attempts exhausted──→ failed
//! ```

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::WorkerConfig;
use crate::db::now_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ProcessDocument,
    BuildHierarchy,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessDocument => "process_document",
            JobKind::BuildHierarchy => "build_hierarchy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "process_document" => Some(JobKind::ProcessDocument),
            "build_hierarchy" => Some(JobKind::BuildHierarchy),
            _ => None,
        }
    }
}

/// A job held by a worker under `lease_token`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub document_id: String,
    /// Attempts so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_token: String,
}

impl Job {
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Queued again, runnable after this many seconds.
    Scheduled(u64),
    /// No attempts left; the job is failed.
    Exhausted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

/// `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_secs(base: u64, max: u64, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u64 << exp).min(max)
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    lease_secs: i64,
    max_attempts: u32,
    backoff_base_secs: u64,
    backoff_max_secs: u64,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: &WorkerConfig) -> Self {
        Self {
            pool,
            lease_secs: config.lease_secs as i64,
            max_attempts: config.max_attempts,
            backoff_base_secs: config.backoff_base_secs,
            backoff_max_secs: config.backoff_max_secs,
        }
    }

    /// Queues a job unless an equivalent one is already queued or running.
    /// Returns the id of the job that will do the work.
    pub async fn enqueue(&self, kind: JobKind, document_id: &str) -> Result<String> {
        let existing = sqlx::query(
            "SELECT id FROM jobs WHERE kind = ? AND document_id = ? AND status IN ('queued', 'running')
             ORDER BY created_at LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return Ok(row.get("id"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_secs();
        sqlx::query(
            "INSERT INTO jobs (id, kind, document_id, status, attempts, max_attempts, run_after, created_at, updated_at)
             VALUES (?, ?, ?, 'queued', 0, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(document_id)
        .bind(self.max_attempts as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %id, kind = kind.as_str(), document_id, "Enqueued job");
        Ok(id)
    }

    /// Claims the oldest runnable job, or a running job whose lease expired.
    pub async fn claim(&self) -> Result<Option<Job>> {
        let now = now_secs();
        let token = uuid::Uuid::new_v4().to_string();

        let row = sqlx::query(
            "UPDATE jobs
             SET status = 'running', lease_token = ?, lease_expires_at = ?,
                 attempts = attempts + 1, updated_at = ?
             WHERE id = (
                SELECT id FROM jobs
                WHERE (status = 'queued' AND run_after <= ?)
                   OR (status = 'running' AND lease_expires_at < ?)
                ORDER BY run_after ASC, created_at ASC
                LIMIT 1
             )
             RETURNING id, kind, document_id, attempts, max_attempts",
        )
        .bind(&token)
        .bind(now + self.lease_secs)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind_str: String = row.get("kind");
        let id: String = row.get("id");
        let Some(kind) = JobKind::parse(&kind_str) else {
            self.mark_failed(&id, &token, &format!("unknown job kind: {}", kind_str))
                .await?;
            return Ok(None);
        };

        Ok(Some(Job {
            id,
            kind,
            document_id: row.get("document_id"),
            attempts: row.get::<i64, _>("attempts") as u32,
            max_attempts: row.get::<i64, _>("max_attempts") as u32,
            lease_token: token,
        }))
    }

    pub async fn complete(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'done', lease_token = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE id = ? AND lease_token = ?",
        )
        .bind(now_secs())
        .bind(&job.id)
        .bind(&job.lease_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Schedules another attempt with exponential backoff, or fails the job
    /// once `max_attempts` is reached.
    pub async fn retry(&self, job: &Job, error: &str) -> Result<RetryOutcome> {
        if job.is_last_attempt() {
            self.fail(job, error).await?;
            return Ok(RetryOutcome::Exhausted);
        }
        let delay = backoff_secs(self.backoff_base_secs, self.backoff_max_secs, job.attempts);
        self.reschedule(job, delay, Some(error), false).await?;
        Ok(RetryOutcome::Scheduled(delay))
    }

    /// Puts the job back without consuming an attempt (lock contention).
    pub async fn requeue(&self, job: &Job, delay_secs: u64) -> Result<()> {
        self.reschedule(job, delay_secs, None, true).await
    }

    pub async fn fail(&self, job: &Job, error: &str) -> Result<()> {
        self.mark_failed(&job.id, &job.lease_token, error).await
    }

    async fn mark_failed(&self, id: &str, token: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = ?, lease_token = NULL, lease_expires_at = NULL,
                 updated_at = ?
             WHERE id = ? AND lease_token = ?",
        )
        .bind(error)
        .bind(now_secs())
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(&self, job: &Job, delay_secs: u64, error: Option<&str>, refund: bool) -> Result<()> {
        let now = now_secs();
        sqlx::query(
            "UPDATE jobs
             SET status = 'queued', run_after = ?, lease_token = NULL, lease_expires_at = NULL,
                 attempts = attempts - ?, last_error = COALESCE(?, last_error), updated_at = ?
             WHERE id = ? AND lease_token = ?",
        )
        .bind(now + delay_secs as i64)
        .bind(if refund { 1i64 } else { 0i64 })
        .bind(error)
        .bind(now)
        .bind(&job.id)
        .bind(&job.lease_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pushes a running job's lease forward.
    pub async fn extend_lease(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?, updated_at = ? WHERE id = ? AND lease_token = ?",
        )
        .bind(now_secs() + self.lease_secs)
        .bind(now_secs())
        .bind(&job.id)
        .bind(&job.lease_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Id of a queued or running job for the document, if any.
    pub async fn active_job(&self, document_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT id FROM jobs WHERE document_id = ? AND status IN ('queued', 'running')
             ORDER BY created_at LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Drops every job of a deleted document.
    pub async fn delete_for_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.as_str() {
                "queued" => stats.queued = n,
                "running" => stats.running = n,
                "done" => stats.done = n,
                "failed" => stats.failed = n,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn queue(tmp: &TempDir, config: WorkerConfig) -> JobQueue {
        let mut cfg = Config::minimal();
        cfg.db.path = tmp.path().join("queue.sqlite");
        let pool = crate::db::connect(&cfg).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        JobQueue::new(pool, &config)
    }

    fn fast() -> WorkerConfig {
        WorkerConfig {
            backoff_base_secs: 0,
            max_attempts: 2,
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(5, 300, 1), 5);
        assert_eq!(backoff_secs(5, 300, 2), 10);
        assert_eq!(backoff_secs(5, 300, 4), 40);
        assert_eq!(backoff_secs(5, 300, 10), 300);
        assert_eq!(backoff_secs(5, 300, 0), 5);
    }

    #[tokio::test]
    async fn enqueue_dedupes_active_jobs() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, fast()).await;
        let a = q.enqueue(JobKind::ProcessDocument, "d1").await.unwrap();
        let b = q.enqueue(JobKind::ProcessDocument, "d1").await.unwrap();
        let c = q.enqueue(JobKind::BuildHierarchy, "d1").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(q.stats().await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn claimed_job_is_not_claimed_twice() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, fast()).await;
        q.enqueue(JobKind::ProcessDocument, "d1").await.unwrap();

        let job = q.claim().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.kind, JobKind::ProcessDocument);
        assert!(q.claim().await.unwrap().is_none());

        q.complete(&job).await.unwrap();
        assert_eq!(q.stats().await.unwrap().done, 1);
        assert!(q.active_job("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_then_exhaust() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, fast()).await;
        q.enqueue(JobKind::ProcessDocument, "d1").await.unwrap();

        let job = q.claim().await.unwrap().unwrap();
        assert_eq!(q.retry(&job, "timeout").await.unwrap(), RetryOutcome::Scheduled(0));

        let job = q.claim().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(q.retry(&job, "timeout again").await.unwrap(), RetryOutcome::Exhausted);
        assert!(q.claim().await.unwrap().is_none());
        assert_eq!(q.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn requeue_refunds_the_attempt() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, fast()).await;
        q.enqueue(JobKind::ProcessDocument, "d1").await.unwrap();

        let job = q.claim().await.unwrap().unwrap();
        q.requeue(&job, 0).await.unwrap();
        let job = q.claim().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let tmp = TempDir::new().unwrap();
        let expired = WorkerConfig {
            lease_secs: 0,
            ..fast()
        };
        let q = queue(&tmp, expired).await;
        q.enqueue(JobKind::ProcessDocument, "d1").await.unwrap();

        let first = q.claim().await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let second = q.claim().await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.lease_token, second.lease_token);

        // The stale holder can no longer finish the job.
        q.complete(&first).await.unwrap();
        assert_eq!(q.stats().await.unwrap().running, 1);
    }

    #[tokio::test]
    async fn delete_for_document_drops_jobs() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, fast()).await;
        q.enqueue(JobKind::ProcessDocument, "d1").await.unwrap();
        q.enqueue(JobKind::ProcessDocument, "d2").await.unwrap();
        assert_eq!(q.delete_for_document("d1").await.unwrap(), 1);
        assert!(q.active_job("d2").await.unwrap().is_some());
    }
}
