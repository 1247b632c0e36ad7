//! Durable queue backend on PostgreSQL
//!
//! Jobs are rows in `queue_jobs`. Claiming uses `FOR UPDATE SKIP LOCKED` so
//! any number of workers, in any number of processes, can poll the same queue.
//! A worker that stops heartbeating for `stall_timeout` loses its job to the
//! next claimer, or the job fails once its attempts are used up.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    Backoff, BackoffKind, JobId, JobOptions, QueueBackend, QueueCounts, QueueError, QueueResult,
    RawJob,
};

/// Default time after which an active job without heartbeat is reclaimed
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    job_name: String,
    payload: serde_json::Value,
    attempts_made: i32,
    max_attempts: i32,
    backoff_kind: String,
    backoff_delay_ms: i64,
    remove_on_complete: bool,
    remove_on_fail: i32,
}

impl TryFrom<JobRow> for RawJob {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind: BackoffKind = row.backoff_kind.parse().map_err(QueueError::InvalidRow)?;

        Ok(RawJob {
            id: row.id,
            queue: row.queue_name,
            name: row.job_name,
            payload: row.payload,
            options: JobOptions {
                attempts: row.max_attempts.max(1) as u32,
                backoff: Backoff {
                    kind,
                    delay: Duration::from_millis(row.backoff_delay_ms.max(0) as u64),
                },
                remove_on_complete: row.remove_on_complete,
                remove_on_fail: row.remove_on_fail.max(0) as usize,
            },
            attempts_made: row.attempts_made.max(0) as u32,
        })
    }
}

/// Queue backend storing jobs in PostgreSQL
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    stall_timeout: Duration,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    fn ensure_active(job: &RawJob, rows_affected: u64) -> QueueResult<()> {
        if rows_affected == 0 {
            return Err(QueueError::NotActive(job.id));
        }
        Ok(())
    }

    /// Keep only the newest `keep` failed jobs of `queue`
    async fn trim_failed(
        conn: &mut sqlx::PgConnection,
        queue: &str,
        keep: usize,
    ) -> QueueResult<u64> {
        let trimmed = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id IN (
                SELECT id
                FROM queue_jobs
                WHERE queue_name = $1 AND status = 'failed'
                ORDER BY finished_at DESC, id
                OFFSET $2
            )
            "#,
        )
        .bind(queue)
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(conn)
        .await?;

        Ok(trimmed.rows_affected())
    }

    /// Fail stalled jobs that have no attempts left instead of reclaiming them
    async fn fail_exhausted_stalled(&self, queue: &str) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;

        let failed: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            UPDATE queue_jobs
            SET status = 'failed',
                last_error = 'stalled',
                heartbeat_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE queue_name = $1
              AND status = 'active'
              AND heartbeat_at < NOW() - make_interval(secs => $2)
              AND attempts_made >= max_attempts
            RETURNING id, remove_on_fail
            "#,
        )
        .bind(queue)
        .bind(self.stall_timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        if let Some(keep) = failed.iter().map(|(_, keep)| *keep).min() {
            Self::trim_failed(&mut *tx, queue, keep.max(0) as usize).await?;
        }

        tx.commit().await?;

        for (id, _) in &failed {
            tracing::error!(queue = %queue, job_id = %id, "Stalled job failed after max retries");
        }

        Ok(())
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    async fn push(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> QueueResult<JobId> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                id, queue_name, job_name, payload, max_attempts,
                backoff_kind, backoff_delay_ms, remove_on_complete, remove_on_fail
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(name)
        .bind(&payload)
        .bind(i32::try_from(options.attempts).unwrap_or(i32::MAX))
        .bind(options.backoff.kind.as_str())
        .bind(i64::try_from(options.backoff.delay.as_millis()).unwrap_or(i64::MAX))
        .bind(options.remove_on_complete)
        .bind(i32::try_from(options.remove_on_fail).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim(&self, queue: &str) -> QueueResult<Option<RawJob>> {
        self.fail_exhausted_stalled(queue).await?;

        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE queue_jobs
            SET status = 'active',
                attempts_made = attempts_made + 1,
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM queue_jobs
                WHERE queue_name = $1
                  AND (
                      (status = 'waiting' AND run_at <= NOW())
                      OR (status = 'active'
                          AND heartbeat_at < NOW() - make_interval(secs => $2)
                          AND attempts_made < max_attempts)
                  )
                ORDER BY run_at, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue_name, job_name, payload, attempts_made, max_attempts,
                      backoff_kind, backoff_delay_ms, remove_on_complete, remove_on_fail
            "#,
        )
        .bind(queue)
        .bind(self.stall_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(RawJob::try_from).transpose()
    }

    async fn complete(&self, job: &RawJob) -> QueueResult<()> {
        let result = if job.options.remove_on_complete {
            sqlx::query("DELETE FROM queue_jobs WHERE id = $1 AND status = 'active'")
                .bind(job.id)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET status = 'completed', heartbeat_at = NULL,
                    finished_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND status = 'active'
                "#,
            )
            .bind(job.id)
            .execute(&self.pool)
            .await?
        };

        Self::ensure_active(job, result.rows_affected())
    }

    async fn retry(&self, job: &RawJob, delay: Duration, error: &str) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'waiting',
                run_at = NOW() + make_interval(secs => $2),
                last_error = $3,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(job.id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Self::ensure_active(job, result.rows_affected())
    }

    async fn fail(&self, job: &RawJob, error: &str) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'failed',
                last_error = $2,
                heartbeat_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(job.id)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        Self::ensure_active(job, result.rows_affected())?;

        let trimmed = Self::trim_failed(&mut *tx, &job.queue, job.options.remove_on_fail).await?;

        tx.commit().await?;

        if trimmed > 0 {
            tracing::debug!(queue = %job.queue, removed = trimmed, "Trimmed old failed jobs");
        }

        Ok(())
    }

    async fn wait(&self, _queue: &str, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM queue_jobs
            WHERE queue_name = $1
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "waiting" => counts.waiting = count,
                "active" => counts.active = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {},
            }
        }

        Ok(counts)
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        Some(self.stall_timeout / 4)
    }

    async fn heartbeat(&self, job: &RawJob) -> QueueResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET heartbeat_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(kind: &str) -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            queue_name: "db-insertion".to_string(),
            job_name: "insert-batch".to_string(),
            payload: serde_json::json!({}),
            attempts_made: 2,
            max_attempts: 3,
            backoff_kind: kind.to_string(),
            backoff_delay_ms: 1000,
            remove_on_complete: true,
            remove_on_fail: 1000,
        }
    }

    #[test]
    fn test_row_converts_to_raw_job() {
        let raw = RawJob::try_from(row("exponential")).unwrap();
        assert_eq!(raw.attempts_made, 2);
        assert_eq!(raw.options, JobOptions::default());
    }

    #[test]
    fn test_row_with_unknown_backoff_is_rejected() {
        assert!(matches!(
            RawJob::try_from(row("linear")),
            Err(QueueError::InvalidRow(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_interval_follows_stall_timeout() {
        let pool = PgPool::connect_lazy("postgresql://localhost/test").unwrap();
        let backend = PostgresBackend::new(pool).with_stall_timeout(Duration::from_secs(40));
        assert_eq!(backend.heartbeat_interval(), Some(Duration::from_secs(10)));
    }
}
