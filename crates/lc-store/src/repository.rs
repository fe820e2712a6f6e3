//! Repository traits
//!
//! One trait per aggregate. Implementations must keep the three atomic
//! guarantees the lifecycle engine leans on:
//! - `EmailJobRepository::insert` rejects duplicate idempotency keys
//! - `EmailJobRepository::mark_send_attempt` is a conditional single-winner
//!   update out of the active set
//! - `ProcessedEventRepository::try_insert` is a unique-keyed claim

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use lc_common::{
    ConditionalEmail, EmailJob, EmailSchedule, EmailTemplate, EventKind, JobStatus, Lead,
    LeadCounter, LeadStatus, ManualMail, Notification, Settings, StoredEvent,
};

use crate::Result;

#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn insert(&self, lead: &Lead) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Lead>>;
    /// Lookup by case-folded email.
    async fn get_by_email(&self, email: &str) -> Result<Option<Lead>>;
    async fn update_status(&self, id: Uuid, status: &LeadStatus) -> Result<()>;
    async fn increment_counter(&self, id: Uuid, counter: LeadCounter) -> Result<()>;
    /// Deleting a lead cascades to its jobs and projections.
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait EmailJobRepository: Send + Sync {
    /// Insert a new job. Fails with `Conflict` on a duplicate idempotency
    /// key.
    async fn insert(&self, job: &EmailJob) -> Result<()>;

    /// Full-row update (bumps `updated_at`).
    async fn update(&self, job: &EmailJob) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<EmailJob>>;

    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<EmailJob>>;

    /// The at-most-one active job for this (lead, type), if any.
    async fn find_active(&self, lead_id: Uuid, email_type: &str) -> Result<Option<EmailJob>>;

    /// All active jobs of a lead, optionally ignoring conditional sends.
    async fn list_active_for_lead(
        &self,
        lead_id: Uuid,
        exclude_conditional: bool,
    ) -> Result<Vec<EmailJob>>;

    /// Whether any (lead, type) job currently sits in the successfully-sent
    /// set.
    async fn has_been_sent(&self, lead_id: Uuid, email_type: &str) -> Result<bool>;

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<EmailJob>>;

    /// Webhook fallback lookup: the most recently scheduled job for this
    /// recipient with `scheduled_for <= before`.
    async fn find_latest_for_email(
        &self,
        email: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<EmailJob>>;

    /// The worker's claim step: atomically move the job from the active set
    /// to `sending`, stamping `metadata.send_attempted_at`. Returns false
    /// when another worker already claimed it (or the job left the active
    /// set).
    async fn mark_send_attempt(&self, job_id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Cancel every active non-conditional job of the lead, recording the
    /// reason. Returns the cancelled ids.
    async fn cancel_pending_for_lead(&self, lead_id: Uuid, reason: &str) -> Result<Vec<Uuid>>;

    /// Jobs stuck in `sending` since before `cutoff`.
    async fn find_stale_sending(&self, cutoff: DateTime<Utc>) -> Result<Vec<EmailJob>>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn get(&self, lead_id: Uuid) -> Result<Option<EmailSchedule>>;
    async fn upsert(&self, schedule: &EmailSchedule) -> Result<()>;
}

#[async_trait]
pub trait ConditionalEmailRepository: Send + Sync {
    async fn insert(&self, conditional: &ConditionalEmail) -> Result<()>;

    /// Enabled configurations for a trigger, highest priority first.
    async fn find_enabled_for_trigger(&self, trigger: EventKind) -> Result<Vec<ConditionalEmail>>;

    /// Record the (conditional, lead) -> job link. Returns false when the
    /// pair was already materialised.
    async fn link_job(
        &self,
        conditional_id: Uuid,
        lead_id: Uuid,
        email_job_id: Uuid,
    ) -> Result<bool>;

    async fn is_linked(&self, conditional_id: Uuid, lead_id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait ProcessedEventRepository: Send + Sync {
    /// Claim a (message_id, event) pair in the dedup ledger. Returns false
    /// when already processed.
    async fn try_insert(
        &self,
        message_id: &str,
        event: EventKind,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Compensation: drop a claim after a hard processing error so a webhook
    /// retry can recover.
    async fn remove(&self, message_id: &str, event: EventKind) -> Result<()>;

    /// Prune ledger rows older than `cutoff`. Returns the number removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Append-only audit record for replay and forensics. Never pruned.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, record: &StoredEvent) -> Result<()>;
    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<StoredEvent>>;
}

#[async_trait]
pub trait EventHistoryRepository: Send + Sync {
    /// Record an engagement milestone for (lead, job). Deduplicated per
    /// (lead, job, status); additionally suppressed when the job already has
    /// a same-or-higher-ranked entry. Returns whether a row was written.
    async fn record(
        &self,
        lead_id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobStatus>>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// The singleton settings document; defaults when the row is missing.
    async fn get(&self) -> Result<Settings>;
    async fn update(&self, settings: &Settings) -> Result<()>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<EmailTemplate>>;
    async fn upsert(&self, template: &EmailTemplate) -> Result<()>;
}

#[async_trait]
pub trait ManualMailRepository: Send + Sync {
    /// Upsert keyed by `email_job_id`.
    async fn record(&self, mail: &ManualMail) -> Result<()>;
    async fn get_for_job(&self, email_job_id: Uuid) -> Result<Option<ManualMail>>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert(&self, notification: &Notification) -> Result<()>;
    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<Notification>>;
}
