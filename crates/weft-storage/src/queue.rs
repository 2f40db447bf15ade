// At-least-once task queue on Postgres. Work items carry the job UUID only;
// workers load the full job from the store. Claims use FOR UPDATE SKIP
// LOCKED; stale claims are re-queued by the periodic cleanup so a crashed
// worker's jobs are redelivered.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::JobRow;
use crate::repositories::Database;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct Queue {
    pool: PgPool,
}

impl Queue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("INSERT INTO job_queue (job_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Claim the oldest unclaimed item, if any.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Uuid>> {
        let claimed: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE job_queue SET claimed_at = NOW(), claimed_by = $1
            WHERE job_id = (
                SELECT job_id FROM job_queue
                WHERE claimed_at IS NULL
                ORDER BY queued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING job_id
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed)
    }

    /// Remove an item outright (accepted-state dismissal or completion).
    pub async fn remove(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_queue WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release claims older than `stale_after` whose jobs never reached a
    /// terminal state, making them eligible for redelivery.
    pub async fn requeue_stale(&self, stale_after: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::seconds(3600));
        let result = sqlx::query(
            r#"
            UPDATE job_queue SET claimed_at = NULL, claimed_by = NULL
            WHERE claimed_at < $1
              AND job_id IN (
                SELECT id FROM jobs
                WHERE status NOT IN ('successful', 'failed', 'dismissed')
              )
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop queue rows whose jobs are already terminal (synchronous results
    /// past their expiry, crashed deliveries). Run periodically.
    pub async fn cleanup_finished(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_queue
            WHERE job_id IN (
                SELECT id FROM jobs WHERE status IN ('successful', 'failed', 'dismissed')
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Synchronous-execution bridge: block until the job reaches a terminal
    /// state or the deadline passes, returning the last observed row.
    pub async fn wait_terminal(
        &self,
        db: &Database,
        job_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<JobRow>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let row = db.get_job(job_id).await?;
            match row {
                Some(row) if row.is_terminal() => return Ok(Some(row)),
                Some(row) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(None),
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}
