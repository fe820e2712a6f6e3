//! Ledger, audit store and event history (PostgreSQL)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use lc_common::{EventKind, JobStatus, StoredEvent};

use super::{from_millis, millis, statuses_at_or_above, PostgresStore};
use crate::repository::{EventHistoryRepository, EventStore, ProcessedEventRepository};
use crate::Result;

#[async_trait]
impl ProcessedEventRepository for PostgresStore {
    async fn try_insert(
        &self,
        message_id: &str,
        event: EventKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (message_id, event_type, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, event_type) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(event.as_str())
        .bind(millis(at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, message_id: &str, event: EventKind) -> Result<()> {
        sqlx::query("DELETE FROM processed_events WHERE message_id = $1 AND event_type = $2")
            .bind(message_id)
            .bind(event.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn append(&self, record: &StoredEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_store (id, lead_id, email_job_id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.lead_id)
        .bind(record.email_job_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(millis(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            "SELECT id, lead_id, email_job_id, event_type, payload, created_at \
             FROM event_store WHERE lead_id = $1 ORDER BY created_at ASC",
        )
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StoredEvent {
                    id: row.get("id"),
                    lead_id: row.get("lead_id"),
                    email_job_id: row.get("email_job_id"),
                    event_type: row.get("event_type"),
                    payload: row.get("payload"),
                    created_at: from_millis(row.get("created_at"))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventHistoryRepository for PostgresStore {
    async fn record(
        &self,
        lead_id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        // The unique index handles exact duplicates; the NOT EXISTS clause
        // suppresses entries the job has already outranked.
        let blocked_by: Vec<String> = statuses_at_or_above(status)
            .into_iter()
            .map(String::from)
            .collect();

        let result = sqlx::query(
            r#"
            INSERT INTO event_history (id, lead_id, email_job_id, event, created_at)
            SELECT $1, $2, $3, $4, $5
            WHERE NOT EXISTS (
                SELECT 1 FROM event_history
                WHERE email_job_id = $3 AND event = ANY($6)
            )
            ON CONFLICT (lead_id, email_job_id, event) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(lead_id)
        .bind(job_id)
        .bind(status.as_str())
        .bind(millis(at))
        .bind(&blocked_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobStatus>> {
        let rows = sqlx::query(
            "SELECT event FROM event_history WHERE email_job_id = $1 ORDER BY created_at ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| super::parse_status(&row.get::<String, _>("event")))
            .collect()
    }
}
