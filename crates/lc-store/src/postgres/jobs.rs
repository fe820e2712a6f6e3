//! Email job repository (PostgreSQL)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use lc_common::{EmailJob, JobStatus};

use super::{job_from_row, millis, opt_millis, PostgresStore};
use crate::repository::EmailJobRepository;
use crate::{Result, StoreError};

const JOB_COLUMNS: &str = "id, lead_id, email, email_type, category, template_id, scheduled_for, \
     status, retry_count, idempotency_key, brevo_message_id, sent_at, delivered_at, opened_at, \
     clicked_at, bounced_at, failed_at, deferred_at, last_error, metadata, created_at, updated_at";

#[async_trait]
impl EmailJobRepository for PostgresStore {
    async fn insert(&self, job: &EmailJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_jobs
                (id, lead_id, email, email_type, category, template_id, scheduled_for, status,
                 retry_count, idempotency_key, brevo_message_id, sent_at, delivered_at, opened_at,
                 clicked_at, bounced_at, failed_at, deferred_at, last_error, metadata,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22)
            "#,
        )
        .bind(job.id)
        .bind(job.lead_id)
        .bind(&job.email)
        .bind(&job.email_type)
        .bind(job.category.as_str())
        .bind(&job.template_id)
        .bind(millis(job.scheduled_for))
        .bind(job.status.as_str())
        .bind(job.retry_count)
        .bind(&job.idempotency_key)
        .bind(&job.brevo_message_id)
        .bind(opt_millis(job.sent_at))
        .bind(opt_millis(job.delivered_at))
        .bind(opt_millis(job.opened_at))
        .bind(opt_millis(job.clicked_at))
        .bind(opt_millis(job.bounced_at))
        .bind(opt_millis(job.failed_at))
        .bind(opt_millis(job.deferred_at))
        .bind(&job.last_error)
        .bind(serde_json::to_value(&job.metadata)?)
        .bind(millis(job.created_at))
        .bind(millis(job.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Conflict(
                format!("idempotency key {}", job.idempotency_key),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, job: &EmailJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE email_jobs
            SET email = $2, email_type = $3, category = $4, template_id = $5, scheduled_for = $6,
                status = $7, retry_count = $8, brevo_message_id = $9, sent_at = $10,
                delivered_at = $11, opened_at = $12, clicked_at = $13, bounced_at = $14,
                failed_at = $15, deferred_at = $16, last_error = $17, metadata = $18,
                updated_at = $19
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.email)
        .bind(&job.email_type)
        .bind(job.category.as_str())
        .bind(&job.template_id)
        .bind(millis(job.scheduled_for))
        .bind(job.status.as_str())
        .bind(job.retry_count)
        .bind(&job.brevo_message_id)
        .bind(opt_millis(job.sent_at))
        .bind(opt_millis(job.delivered_at))
        .bind(opt_millis(job.opened_at))
        .bind(opt_millis(job.clicked_at))
        .bind(opt_millis(job.bounced_at))
        .bind(opt_millis(job.failed_at))
        .bind(opt_millis(job.deferred_at))
        .bind(&job.last_error)
        .bind(serde_json::to_value(&job.metadata)?)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EmailJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM email_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<EmailJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM email_jobs WHERE lead_id = $1 ORDER BY created_at ASC"
        ))
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn find_active(&self, lead_id: Uuid, email_type: &str) -> Result<Option<EmailJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM email_jobs \
             WHERE lead_id = $1 AND email_type = $2 \
               AND status IN ('pending', 'queued', 'scheduled', 'sending') \
             LIMIT 1"
        ))
        .bind(lead_id)
        .bind(email_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_active_for_lead(
        &self,
        lead_id: Uuid,
        exclude_conditional: bool,
    ) -> Result<Vec<EmailJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM email_jobs \
             WHERE lead_id = $1 \
               AND status IN ('pending', 'queued', 'scheduled', 'sending') \
               AND ($2 = FALSE OR category <> 'conditional')"
        ))
        .bind(lead_id)
        .bind(exclude_conditional)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn has_been_sent(&self, lead_id: Uuid, email_type: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS ( \
                SELECT 1 FROM email_jobs \
                WHERE lead_id = $1 AND email_type = $2 \
                  AND status IN ('sending', 'sent', 'delivered', 'opened', 'clicked') \
             ) AS sent",
        )
        .bind(lead_id)
        .bind(email_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<bool, _>("sent"))
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<EmailJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM email_jobs WHERE brevo_message_id = $1 LIMIT 1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_latest_for_email(
        &self,
        email: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<EmailJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM email_jobs \
             WHERE email = $1 AND scheduled_for <= $2 \
             ORDER BY scheduled_for DESC LIMIT 1"
        ))
        .bind(email.trim().to_lowercase())
        .bind(millis(before))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_send_attempt(&self, job_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        // Single-winner claim: only a job still waiting in the active set
        // (and not already claimed) moves to `sending`.
        let result = sqlx::query(
            r#"
            UPDATE email_jobs
            SET status = 'sending',
                metadata = jsonb_set(metadata, '{send_attempted_at}', to_jsonb($2::text)),
                sent_at = COALESCE(sent_at, $3),
                updated_at = $3
            WHERE id = $1 AND status IN ('pending', 'queued', 'scheduled')
            "#,
        )
        .bind(job_id)
        .bind(at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .bind(millis(at))
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() > 0;
        if !claimed {
            debug!(job_id = %job_id, "Send attempt claim lost");
        }
        Ok(claimed)
    }

    async fn cancel_pending_for_lead(&self, lead_id: Uuid, reason: &str) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            UPDATE email_jobs
            SET status = 'cancelled',
                metadata = jsonb_set(metadata, '{cancel_reason}', to_jsonb($2::text)),
                updated_at = $3
            WHERE lead_id = $1
              AND status IN ('pending', 'queued', 'scheduled')
              AND category <> 'conditional'
            RETURNING id
            "#,
        )
        .bind(lead_id)
        .bind(reason)
        .bind(millis(Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get::<Uuid, _>("id")).collect())
    }

    async fn find_stale_sending(&self, cutoff: DateTime<Utc>) -> Result<Vec<EmailJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM email_jobs \
             WHERE status = 'sending' AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT 500"
        ))
        .bind(millis(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}
