//! PostgreSQL store
//!
//! Timestamps are stored as millisecond-epoch BIGINTs, enums as their snake
//! case strings, and the metadata/settings documents as JSONB. `init_schema`
//! creates all tables plus the indices the hot paths rely on, including the
//! `(message_id, event_type)` unique ledger index.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;

use lc_common::{EmailJob, JobCategory, JobMetadata, JobStatus, Lead, LeadStatus};

use crate::{Result, StoreError};

mod config;
mod events;
mod jobs;
mod leads;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indices if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS leads (
                id UUID PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                company TEXT,
                city TEXT,
                country TEXT,
                timezone TEXT,
                emails_sent BIGINT NOT NULL DEFAULT 0,
                emails_opened BIGINT NOT NULL DEFAULT 0,
                emails_clicked BIGINT NOT NULL DEFAULT 0,
                emails_bounced BIGINT NOT NULL DEFAULT 0,
                score INTEGER NOT NULL DEFAULT 0,
                tags JSONB NOT NULL DEFAULT '[]',
                status_step TEXT,
                status_state TEXT,
                frozen_until BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS email_jobs (
                id UUID PRIMARY KEY,
                lead_id UUID NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                email TEXT NOT NULL,
                email_type TEXT NOT NULL,
                category TEXT NOT NULL,
                template_id TEXT,
                scheduled_for BIGINT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                idempotency_key TEXT NOT NULL UNIQUE,
                brevo_message_id TEXT,
                sent_at BIGINT,
                delivered_at BIGINT,
                opened_at BIGINT,
                clicked_at BIGINT,
                bounced_at BIGINT,
                failed_at BIGINT,
                deferred_at BIGINT,
                last_error TEXT,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_email_jobs_lead_type ON email_jobs(lead_id, email_type)",
            "CREATE INDEX IF NOT EXISTS idx_email_jobs_status_scheduled ON email_jobs(status, scheduled_for)",
            "CREATE INDEX IF NOT EXISTS idx_email_jobs_message_id ON email_jobs(brevo_message_id)",
            "CREATE INDEX IF NOT EXISTS idx_email_jobs_email ON email_jobs(email, scheduled_for)",
            r#"
            CREATE TABLE IF NOT EXISTS email_schedules (
                lead_id UUID PRIMARY KEY REFERENCES leads(id) ON DELETE CASCADE,
                initial_status TEXT NOT NULL,
                followups JSONB NOT NULL DEFAULT '[]',
                conditionals JSONB NOT NULL DEFAULT '[]',
                updated_at BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS conditional_emails (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                trigger_event TEXT NOT NULL,
                trigger_step TEXT,
                delay_hours BIGINT NOT NULL,
                template_id TEXT,
                cancel_pending BOOLEAN NOT NULL DEFAULT FALSE,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS conditional_email_jobs (
                conditional_email_id UUID NOT NULL,
                lead_id UUID NOT NULL,
                email_job_id UUID NOT NULL,
                created_at BIGINT NOT NULL,
                PRIMARY KEY (conditional_email_id, lead_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                message_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                processed_at BIGINT NOT NULL,
                PRIMARY KEY (message_id, event_type)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS event_store (
                id UUID PRIMARY KEY,
                lead_id UUID,
                email_job_id UUID,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_event_store_lead ON event_store(lead_id)",
            r#"
            CREATE TABLE IF NOT EXISTS event_history (
                id UUID PRIMARY KEY,
                lead_id UUID NOT NULL,
                email_job_id UUID NOT NULL,
                event TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                UNIQUE (lead_id, email_job_id, event)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id TEXT PRIMARY KEY,
                document JSONB NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS email_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                subject TEXT NOT NULL,
                html_content TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS manual_mails (
                id UUID PRIMARY KEY,
                email_job_id UUID NOT NULL UNIQUE,
                lead_id UUID NOT NULL,
                email TEXT NOT NULL,
                template_id TEXT,
                status TEXT NOT NULL,
                sent_at BIGINT,
                error TEXT,
                created_at BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id UUID PRIMARY KEY,
                lead_id UUID NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("PostgreSQL schema initialized");
        Ok(())
    }
}

// ============================================================================
// Row mapping helpers
// ============================================================================

pub(crate) fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn opt_millis(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(millis)
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Conflict(format!("invalid timestamp {ms}")))
}

pub(crate) fn from_opt_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

pub(crate) fn parse_status(raw: &str) -> Result<JobStatus> {
    JobStatus::parse(raw).ok_or_else(|| StoreError::Conflict(format!("unknown status {raw}")))
}

pub(crate) fn job_from_row(row: &PgRow) -> Result<EmailJob> {
    let status: String = row.get("status");
    let category: String = row.get("category");
    let metadata: serde_json::Value = row.get("metadata");
    let metadata: JobMetadata = serde_json::from_value(metadata)?;

    Ok(EmailJob {
        id: row.get("id"),
        lead_id: row.get("lead_id"),
        email: row.get("email"),
        email_type: row.get("email_type"),
        category: JobCategory::parse(&category)
            .ok_or_else(|| StoreError::Conflict(format!("unknown category {category}")))?,
        template_id: row.get("template_id"),
        scheduled_for: from_millis(row.get("scheduled_for"))?,
        status: parse_status(&status)?,
        retry_count: row.get("retry_count"),
        idempotency_key: row.get("idempotency_key"),
        brevo_message_id: row.get("brevo_message_id"),
        sent_at: from_opt_millis(row.get("sent_at"))?,
        delivered_at: from_opt_millis(row.get("delivered_at"))?,
        opened_at: from_opt_millis(row.get("opened_at"))?,
        clicked_at: from_opt_millis(row.get("clicked_at"))?,
        bounced_at: from_opt_millis(row.get("bounced_at"))?,
        failed_at: from_opt_millis(row.get("failed_at"))?,
        deferred_at: from_opt_millis(row.get("deferred_at"))?,
        last_error: row.get("last_error"),
        metadata,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

pub(crate) fn lead_from_row(row: &PgRow) -> Result<Lead> {
    let tags: serde_json::Value = row.get("tags");
    let tags: Vec<String> = serde_json::from_value(tags)?;

    let status = match (
        row.get::<Option<String>, _>("status_step"),
        row.get::<Option<String>, _>("status_state"),
    ) {
        (Some(step), Some(state)) => Some(LeadStatus {
            step,
            state: parse_status(&state)?,
        }),
        _ => None,
    };

    Ok(Lead {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        company: row.get("company"),
        city: row.get("city"),
        country: row.get("country"),
        timezone: row.get("timezone"),
        emails_sent: row.get("emails_sent"),
        emails_opened: row.get("emails_opened"),
        emails_clicked: row.get("emails_clicked"),
        emails_bounced: row.get("emails_bounced"),
        score: row.get("score"),
        tags,
        status,
        frozen_until: from_opt_millis(row.get("frozen_until"))?,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

/// Statuses whose rank is at or above the given status's rank. Used by the
/// event-history suppression query.
pub(crate) fn statuses_at_or_above(status: JobStatus) -> Vec<&'static str> {
    let Some(rank) = status.rank() else {
        return Vec::new();
    };
    ALL_RANKED
        .iter()
        .filter(|s| s.rank().map(|r| r >= rank).unwrap_or(false))
        .map(|s| s.as_str())
        .collect()
}

const ALL_RANKED: &[JobStatus] = &[
    JobStatus::Pending,
    JobStatus::Scheduled,
    JobStatus::Queued,
    JobStatus::Sending,
    JobStatus::Sent,
    JobStatus::Delivered,
    JobStatus::Opened,
    JobStatus::Clicked,
    JobStatus::SoftBounce,
    JobStatus::HardBounce,
    JobStatus::Failed,
    JobStatus::Blocked,
    JobStatus::Spam,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_window_includes_peers_and_above() {
        let above = statuses_at_or_above(JobStatus::Delivered);
        assert!(above.contains(&"delivered"));
        assert!(above.contains(&"clicked"));
        assert!(above.contains(&"hard_bounce"));
        assert!(!above.contains(&"sent"));
    }

    #[test]
    fn unranked_statuses_have_empty_window() {
        assert!(statuses_at_or_above(JobStatus::Cancelled).is_empty());
    }
}
