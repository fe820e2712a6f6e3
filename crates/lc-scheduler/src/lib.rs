//! LeadCadence scheduling engine
//!
//! This crate decides when and whether an email is materialised for a lead:
//! - `Scheduler`: sequence progression and the low-level schedule primitive
//! - `JourneyGuard`: per-(lead, type) duplicate/concurrency prevention
//! - `ConditionalTriggerEngine`: event-triggered sends
//! - `RetryPolicy`: soft-bounce / deferred / failed recovery
//! - `next_business_hour_slot`: timezone-aware send-slot normalisation

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lc_common::{
    DomainEvent, EmailJob, EventBus, JobCategory, JobMetadata, JobStatus, Lead, ManualMail,
};
use lc_lock::LockError;
use lc_queue::{DelayedQueue, QueueError, SendJobPayload};
use lc_store::{
    EmailJobRepository, LeadRepository, ManualMailRepository, SettingsCache, StoreError,
};

pub mod business_hours;
pub mod conditional;
pub mod guard;
pub mod retry;

pub use business_hours::next_business_hour_slot;
pub use conditional::ConditionalTriggerEngine;
pub use guard::{Admission, DenyReason, JourneyGuard, ScheduleTicket};
pub use retry::{FailureKind, RetryOutcome, RetryPolicy};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lead not found: {0}")]
    LeadNotFound(Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler construction knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lock_ttl: Duration,
    pub lock_key_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_key_prefix: "lc".to_string(),
        }
    }
}

/// Parameters for the low-level schedule primitive.
#[derive(Debug, Clone)]
pub struct ScheduleJobRequest {
    pub lead_id: Uuid,
    pub email_type: String,
    pub category: JobCategory,
    pub scheduled_for: DateTime<Utc>,
    pub template_id: Option<String>,
    pub metadata: JobMetadata,
    pub retry_count: i32,
    pub base_status: JobStatus,
}

impl ScheduleJobRequest {
    pub fn new(
        lead_id: Uuid,
        email_type: impl Into<String>,
        category: JobCategory,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            lead_id,
            email_type: email_type.into(),
            category,
            scheduled_for,
            template_id: None,
            metadata: JobMetadata::default(),
            retry_count: 0,
            base_status: JobStatus::Pending,
        }
    }
}

/// Outcome of the schedule primitive.
#[derive(Debug)]
pub enum ScheduleOutcome {
    Scheduled(EmailJob),
    Denied(DenyReason),
}

pub struct Scheduler {
    leads: Arc<dyn LeadRepository>,
    jobs: Arc<dyn EmailJobRepository>,
    manual_mails: Arc<dyn ManualMailRepository>,
    settings: Arc<SettingsCache>,
    guard: JourneyGuard,
    send_queue: Arc<dyn DelayedQueue>,
    bus: EventBus,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        leads: Arc<dyn LeadRepository>,
        jobs: Arc<dyn EmailJobRepository>,
        manual_mails: Arc<dyn ManualMailRepository>,
        settings: Arc<SettingsCache>,
        locks: Arc<dyn lc_lock::LockManager>,
        send_queue: Arc<dyn DelayedQueue>,
        bus: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        let guard = JourneyGuard::new(
            jobs.clone(),
            locks,
            config.lock_ttl,
            &config.lock_key_prefix,
        );
        Self {
            leads,
            jobs,
            manual_mails,
            settings,
            guard,
            send_queue,
            bus,
        }
    }

    pub fn guard(&self) -> &JourneyGuard {
        &self.guard
    }

    /// Pick and materialise the next sequence step for a lead.
    ///
    /// Returns `None` when the lead is unknown, another step is still in
    /// flight, the sequence is exhausted, or a concurrent scheduler won the
    /// journey lock.
    pub async fn schedule_next_email(
        &self,
        lead_id: Uuid,
        base_status: JobStatus,
    ) -> Result<Option<EmailJob>> {
        let Some(lead) = self.leads.get(lead_id).await? else {
            warn!(lead_id = %lead_id, "Cannot schedule: lead not found");
            return Ok(None);
        };

        // Conditional sends run on their own track and do not block the
        // sequence.
        let active = self.jobs.list_active_for_lead(lead_id, true).await?;
        if !active.is_empty() {
            debug!(lead_id = %lead_id, active = active.len(), "Journey busy, nothing to schedule");
            return Ok(None);
        }

        let settings = self.settings.get().await?;
        let existing = self.jobs.list_for_lead(lead_id).await?;

        let steps = settings.active_sequence();
        let Some((index, step)) = steps
            .iter()
            .enumerate()
            .find(|(_, step)| !existing.iter().any(|j| j.email_type == step.name))
        else {
            debug!(lead_id = %lead_id, "Sequence complete");
            return Ok(None);
        };

        // Nth step anchors on the previous step's send slot; the first
        // materialised step anchors on now.
        let previous_job = index
            .checked_sub(1)
            .and_then(|i| steps.get(i))
            .and_then(|prev| {
                existing
                    .iter()
                    .filter(|j| j.email_type == prev.name)
                    .max_by_key(|j| j.scheduled_for)
            });

        let mut base = match previous_job {
            Some(prev) => prev.scheduled_for + chrono::Duration::days(step.delay_days),
            None => Utc::now(),
        };
        if let Some(frozen_until) = lead.frozen_until {
            base = base.max(frozen_until);
        }

        let scheduled_for = next_business_hour_slot(
            lead.timezone.as_deref(),
            base,
            &settings.business_hours,
            &settings.paused_dates,
        );

        let category = if step.order == 0 {
            JobCategory::Initial
        } else {
            JobCategory::Followup
        };

        let mut request =
            ScheduleJobRequest::new(lead_id, step.name.clone(), category, scheduled_for);
        request.template_id = step.template_id.clone();
        request.base_status = base_status;

        match self.schedule_email_job(request).await? {
            ScheduleOutcome::Scheduled(job) => Ok(Some(job)),
            ScheduleOutcome::Denied(reason) => {
                debug!(lead_id = %lead_id, step = %step.name, reason = reason.as_str(), "Schedule denied");
                Ok(None)
            }
        }
    }

    /// The low-level schedule primitive. Always routed through the journey
    /// guard; the lock is released after the job (and its queue entry) are
    /// persisted or the attempt is abandoned.
    pub async fn schedule_email_job(&self, request: ScheduleJobRequest) -> Result<ScheduleOutcome> {
        let lead = self
            .leads
            .get(request.lead_id)
            .await?
            .ok_or(SchedulerError::LeadNotFound(request.lead_id))?;

        let ticket = match self.guard.admit(request.lead_id, &request.email_type).await? {
            Admission::Granted(ticket) => ticket,
            Admission::Denied(reason) => {
                metrics::counter!("scheduler.jobs_denied_total", "reason" => reason.as_str())
                    .increment(1);
                return Ok(ScheduleOutcome::Denied(reason));
            }
        };

        let result = self.persist_and_enqueue(&lead, &request).await;
        self.guard.release(ticket).await;

        match result {
            Ok(job) => {
                metrics::counter!("scheduler.jobs_scheduled_total").increment(1);
                info!(
                    lead_id = %job.lead_id,
                    job_id = %job.id,
                    email_type = %job.email_type,
                    scheduled_for = %job.scheduled_for,
                    "Email job scheduled"
                );
                self.bus.publish(DomainEvent::JobScheduled {
                    lead_id: job.lead_id,
                    job_id: job.id,
                    email_type: job.email_type.clone(),
                });
                Ok(ScheduleOutcome::Scheduled(job))
            }
            Err(SchedulerError::Store(StoreError::Conflict(key))) => {
                // Same (lead, type, attempt) already persisted by a racing
                // replica that slipped between our guard predicates.
                debug!(key = %key, "Idempotency conflict treated as already-pending");
                Ok(ScheduleOutcome::Denied(DenyReason::AlreadyPending))
            }
            Err(e) => Err(e),
        }
    }

    async fn persist_and_enqueue(
        &self,
        lead: &Lead,
        request: &ScheduleJobRequest,
    ) -> Result<EmailJob> {
        let now = Utc::now();
        let idempotency_key = EmailJob::idempotency_key_for(
            request.lead_id,
            &request.email_type,
            request.retry_count,
        );

        let mut job = EmailJob {
            id: Uuid::new_v4(),
            lead_id: request.lead_id,
            email: lead.email.clone(),
            email_type: request.email_type.clone(),
            category: request.category,
            template_id: request.template_id.clone(),
            scheduled_for: request.scheduled_for,
            status: request.base_status,
            retry_count: request.retry_count,
            idempotency_key: idempotency_key.clone(),
            brevo_message_id: None,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            failed_at: None,
            deferred_at: None,
            last_error: None,
            metadata: request.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        if request.category == JobCategory::Manual {
            job.metadata.manual = true;
        }

        self.jobs.insert(&job).await?;

        let delay = (request.scheduled_for - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let payload = serde_json::to_value(SendJobPayload {
            email_job_id: job.id,
            lead_id: job.lead_id,
            lead_email: job.email.clone(),
            email_type: job.email_type.clone(),
        })?;
        self.send_queue
            .enqueue(&idempotency_key, payload, delay)
            .await?;

        job.status = if delay > Duration::ZERO {
            JobStatus::Scheduled
        } else {
            JobStatus::Queued
        };
        self.jobs.update(&job).await?;

        if job.category == JobCategory::Manual {
            self.manual_mails
                .record(&ManualMail {
                    id: Uuid::new_v4(),
                    email_job_id: job.id,
                    lead_id: job.lead_id,
                    email: job.email.clone(),
                    template_id: job.template_id.clone(),
                    status: job.status,
                    sent_at: None,
                    error: None,
                    created_at: now,
                })
                .await?;
        }

        Ok(job)
    }

    /// Cancel every pending (non-conditional) job of a lead. Used by the
    /// operator surface, e.g. on unsubscribe.
    pub async fn cancel_by_lead(&self, lead_id: Uuid, reason: &str) -> Result<Vec<Uuid>> {
        let cancelled = self.jobs.cancel_pending_for_lead(lead_id, reason).await?;
        if !cancelled.is_empty() {
            info!(lead_id = %lead_id, count = cancelled.len(), reason = %reason, "Cancelled pending jobs");
            self.bus.publish(DomainEvent::FollowupsCancelled {
                lead_id,
                job_ids: cancelled.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(cancelled)
    }

    /// Pull a waiting job forward to "now". Returns `None` when the job is
    /// past the point where fast-forwarding makes sense.
    pub async fn fast_forward(&self, job_id: Uuid) -> Result<Option<EmailJob>> {
        let mut job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))?;

        if !job.status.is_active() || job.status == JobStatus::Sending {
            return Ok(None);
        }

        let now = Utc::now();
        job.scheduled_for = now;
        job.status = JobStatus::Queued;
        self.jobs.update(&job).await?;

        // Fresh queue id: the original (possibly delayed) entry still exists
        // and would be dropped as a duplicate. The worker's claim step keeps
        // double delivery harmless.
        let queue_id = format!("{}:ff:{}", job.idempotency_key, Uuid::new_v4().simple());
        let payload = serde_json::to_value(SendJobPayload {
            email_job_id: job.id,
            lead_id: job.lead_id,
            lead_email: job.email.clone(),
            email_type: job.email_type.clone(),
        })?;
        self.send_queue
            .enqueue(&queue_id, payload, Duration::ZERO)
            .await?;

        info!(job_id = %job.id, "Job fast-forwarded");
        Ok(Some(job))
    }
}
