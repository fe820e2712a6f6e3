//! PostgreSQL-backed delayed queue
//!
//! Visibility semantics follow the embedded SQL queue pattern: polling stamps
//! a fresh receipt handle and pushes `visible_at` forward; a crashing worker
//! simply lets the visibility window lapse and the job is redelivered.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{DelayedQueue, QueueCounts, QueueError, QueueJob, Result};

const STATE_FAILED: &str = "failed";

pub struct PostgresQueue {
    pool: PgPool,
    queue_name: String,
    visibility_timeout: Duration,
    max_receives: u32,
}

impl PostgresQueue {
    pub fn new(
        pool: PgPool,
        queue_name: &str,
        visibility_timeout: Duration,
        max_receives: u32,
    ) -> Self {
        Self {
            pool,
            queue_name: queue_name.to_string(),
            visibility_timeout,
            max_receives,
        }
    }

    /// Create the queue schema (shared across queue names).
    pub async fn init_schema(pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                queue_name TEXT NOT NULL,
                job_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                state TEXT NOT NULL DEFAULT 'ready',
                visible_at BIGINT NOT NULL,
                receipt_handle TEXT,
                receive_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT,
                PRIMARY KEY (queue_name, job_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_visible
            ON queue_jobs (queue_name, state, visible_at)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_receipt
            ON queue_jobs (receipt_handle)
            "#,
        )
        .execute(pool)
        .await?;

        info!("Queue schema initialized");
        Ok(())
    }
}

#[async_trait]
impl DelayedQueue for PostgresQueue {
    fn name(&self) -> &str {
        &self.queue_name
    }

    async fn enqueue(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let visible_at = now + delay.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs (queue_name, job_id, payload, state, visible_at, created_at)
            VALUES ($1, $2, $3, 'ready', $4, $5)
            ON CONFLICT (queue_name, job_id) DO NOTHING
            "#,
        )
        .bind(&self.queue_name)
        .bind(job_id)
        .bind(&payload)
        .bind(visible_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            debug!(queue = %self.queue_name, job_id = %job_id, delay_ms = delay.as_millis() as u64, "Enqueued job");
        } else {
            debug!(queue = %self.queue_name, job_id = %job_id, "Duplicate job dropped");
        }
        Ok(inserted)
    }

    async fn poll(&self, max_jobs: u32) -> Result<Vec<QueueJob>> {
        let now = Utc::now().timestamp_millis();
        let new_visible_at = now + self.visibility_timeout.as_millis() as i64;

        let rows = sqlx::query(
            r#"
            SELECT job_id, payload
            FROM queue_jobs
            WHERE queue_name = $1 AND state = 'ready' AND visible_at <= $2
            ORDER BY visible_at ASC
            LIMIT $3
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_jobs as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());

        for row in rows {
            let job_id: String = row.get("job_id");
            let payload: serde_json::Value = row.get("payload");
            let receipt_handle = Uuid::new_v4().to_string();

            // Guarded claim: a concurrent poller loses the race here.
            let claimed = sqlx::query(
                r#"
                UPDATE queue_jobs
                SET receipt_handle = $1, visible_at = $2,
                    receive_count = receive_count + 1, updated_at = $3
                WHERE queue_name = $4 AND job_id = $5
                  AND state = 'ready' AND visible_at <= $3
                RETURNING receive_count
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(now)
            .bind(&self.queue_name)
            .bind(&job_id)
            .fetch_optional(&self.pool)
            .await?;

            let Some(claimed) = claimed else {
                continue;
            };
            let receive_count: i32 = claimed.get("receive_count");

            jobs.push(QueueJob {
                job_id,
                payload,
                receipt_handle,
                receive_count: receive_count as u32,
            });
        }

        if !jobs.is_empty() {
            debug!(queue = %self.queue_name, count = jobs.len(), "Polled jobs");
        }
        Ok(jobs)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'completed', receipt_handle = NULL, updated_at = $1
            WHERE queue_name = $2 AND receipt_handle = $3 AND state = 'ready'
            "#,
        )
        .bind(now)
        .bind(&self.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(queue = %self.queue_name, receipt = %receipt_handle, "ACK failed - receipt not found");
            return Err(QueueError::ReceiptNotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay: Duration) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let visible_at = now + delay.as_millis() as i64;

        // Exhausted jobs go to the failed bucket instead of another round.
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = CASE WHEN receive_count >= $1 THEN 'failed' ELSE 'ready' END,
                visible_at = $2,
                receipt_handle = NULL,
                updated_at = $3
            WHERE queue_name = $4 AND receipt_handle = $5 AND state = 'ready'
            RETURNING state
            "#,
        )
        .bind(self.max_receives as i32)
        .bind(visible_at)
        .bind(now)
        .bind(&self.queue_name)
        .bind(receipt_handle)
        .fetch_optional(&self.pool)
        .await?;

        match result {
            Some(row) => {
                let state: String = row.get("state");
                if state == STATE_FAILED {
                    warn!(queue = %self.queue_name, receipt = %receipt_handle, "Job exhausted retries, routed to failed bucket");
                }
                Ok(())
            }
            None => Err(QueueError::ReceiptNotFound(receipt_handle.to_string())),
        }
    }

    async fn fail(&self, receipt_handle: &str, reason: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'failed', last_error = $1, receipt_handle = NULL, updated_at = $2
            WHERE queue_name = $3 AND receipt_handle = $4 AND state = 'ready'
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(&self.queue_name)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::ReceiptNotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let now = Utc::now().timestamp_millis();
        let rows = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'ready' AND (receipt_handle IS NULL OR visible_at <= $1)) AS waiting,
                COUNT(*) FILTER (WHERE state = 'ready' AND receipt_handle IS NOT NULL AND visible_at > $1) AS active,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed
            FROM queue_jobs
            WHERE queue_name = $2
            "#,
        )
        .bind(now)
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueCounts {
            waiting: rows.get::<i64, _>("waiting") as u64,
            active: rows.get::<i64, _>("active") as u64,
            completed: rows.get::<i64, _>("completed") as u64,
            failed: rows.get::<i64, _>("failed") as u64,
        })
    }
}

