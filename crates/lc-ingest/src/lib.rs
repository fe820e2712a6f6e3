//! LeadCadence webhook ingestion
//!
//! Accepts raw gateway events, deduplicates them against the durable
//! processed-event ledger (with a best-effort local window in front),
//! locates the owning job, applies the rank-guarded status transition, keeps
//! the per-lead projections in sync, and hands engagement events to the
//! conditional trigger engine and soft failures to the retry policy.
//!
//! Per-event failures never poison a batch; a hard error rewinds the ledger
//! claim so the gateway's retry can recover.

use std::sync::Arc;

use dashmap::DashSet;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lc_common::{
    DomainEvent, EmailJob, EventBus, EventKind, JobCategory, Lead, LeadCounter, ManualMail,
    StoredEvent,
};
use lc_queue::{DelayedQueue, FollowupPayload, QueueError};
use lc_scheduler::{ConditionalTriggerEngine, FailureKind, RetryPolicy, SchedulerError};
use lc_store::{
    AnalyticsCache, EmailJobRepository, EventHistoryRepository, EventStore, LeadRepository,
    ManualMailRepository, ProcessedEventRepository, ScheduleRepository, StoreError,
};

pub mod event;
pub mod projection;

pub use event::{WebhookBody, WebhookEvent};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Why an event was dropped without touching any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownEvent,
    MissingMessageId,
    Duplicate,
    JobNotFound,
}

#[derive(Debug)]
pub enum Applied {
    Applied { job_id: Uuid },
    Skipped(SkipReason),
}

/// Batch outcome reported back to the webhook caller.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IngestSummary {
    pub processed: usize,
    pub skipped: usize,
}

/// Best-effort in-process dedup window in front of the DB ledger. The ledger
/// stays authoritative; this only absorbs rapid-fire duplicates cheaply.
struct LocalDedupWindow {
    seen: DashSet<(String, EventKind)>,
    capacity: usize,
}

impl LocalDedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: DashSet::new(),
            capacity: capacity.max(16),
        }
    }

    fn contains(&self, message_id: &str, kind: EventKind) -> bool {
        self.seen.contains(&(message_id.to_string(), kind))
    }

    fn note(&self, message_id: &str, kind: EventKind) {
        if self.seen.len() >= self.capacity {
            // Coarse eviction; correctness lives in the ledger.
            self.seen.clear();
        }
        self.seen.insert((message_id.to_string(), kind));
    }

    fn forget(&self, message_id: &str, kind: EventKind) {
        self.seen.remove(&(message_id.to_string(), kind));
    }
}

/// Injected collaborators for the ingestor.
pub struct IngestorParts {
    pub leads: Arc<dyn LeadRepository>,
    pub jobs: Arc<dyn EmailJobRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub manual_mails: Arc<dyn ManualMailRepository>,
    pub processed: Arc<dyn ProcessedEventRepository>,
    pub event_store: Arc<dyn EventStore>,
    pub history: Arc<dyn EventHistoryRepository>,
    pub conditionals: Arc<ConditionalTriggerEngine>,
    pub retry_policy: Arc<RetryPolicy>,
    pub followup_queue: Arc<dyn DelayedQueue>,
    pub analytics_cache: Arc<dyn AnalyticsCache>,
    pub bus: EventBus,
}

pub struct WebhookIngestor {
    parts: IngestorParts,
    local_dedup: LocalDedupWindow,
}

impl WebhookIngestor {
    pub fn new(parts: IngestorParts, local_dedup_capacity: usize) -> Self {
        Self {
            parts,
            local_dedup: LocalDedupWindow::new(local_dedup_capacity),
        }
    }

    /// Apply a batch. Individual failures are logged and counted as skipped;
    /// the caller always gets a summary (and answers the gateway with 200).
    pub async fn ingest_batch(&self, events: &[WebhookEvent]) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for event in events {
            match self.apply_event(event).await {
                Ok(Applied::Applied { .. }) => summary.processed += 1,
                Ok(Applied::Skipped(reason)) => {
                    debug!(event = %event.event, email = %event.email, reason = ?reason, "Webhook event skipped");
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(
                        event = %event.event,
                        email = %event.email,
                        error = %e,
                        "Webhook event failed; ledger rewound for retry"
                    );
                    summary.skipped += 1;
                }
            }
        }
        summary
    }

    /// Apply one event end to end.
    pub async fn apply_event(&self, event: &WebhookEvent) -> Result<Applied> {
        let Some(kind) = EventKind::from_gateway(&event.event) else {
            return Ok(Applied::Skipped(SkipReason::UnknownEvent));
        };
        let Some(message_id) = event.message_id.as_deref() else {
            return Ok(Applied::Skipped(SkipReason::MissingMessageId));
        };

        if self.local_dedup.contains(message_id, kind) {
            metrics::counter!("ingest.events_deduped_total", "layer" => "local").increment(1);
            return Ok(Applied::Skipped(SkipReason::Duplicate));
        }

        // Claim the (message, event) pair in the durable ledger.
        if !self
            .parts
            .processed
            .try_insert(message_id, kind, event.event_time())
            .await?
        {
            self.local_dedup.note(message_id, kind);
            metrics::counter!("ingest.events_deduped_total", "layer" => "ledger").increment(1);
            return Ok(Applied::Skipped(SkipReason::Duplicate));
        }

        let Some(job) = self.locate_job(message_id, &event.email).await? else {
            // Rewind so the event can land once the job exists.
            self.parts.processed.remove(message_id, kind).await?;
            warn!(message_id = %message_id, email = %event.email, "No job for webhook event");
            return Ok(Applied::Skipped(SkipReason::JobNotFound));
        };

        match self.process(job, kind, event).await {
            Ok(job_id) => {
                self.local_dedup.note(message_id, kind);
                metrics::counter!("ingest.events_applied_total", "event" => kind.as_str())
                    .increment(1);
                Ok(Applied::Applied { job_id })
            }
            Err(e) => {
                self.local_dedup.forget(message_id, kind);
                if let Err(rewind) = self.parts.processed.remove(message_id, kind).await {
                    error!(message_id = %message_id, error = %rewind, "Failed to rewind dedup ledger");
                }
                Err(e)
            }
        }
    }

    /// Owning-job lookup: primary by gateway message id, fallback by
    /// recipient (most recently scheduled job already due).
    async fn locate_job(&self, message_id: &str, email: &str) -> Result<Option<EmailJob>> {
        if let Some(job) = self.parts.jobs.find_by_message_id(message_id).await? {
            return Ok(Some(job));
        }
        Ok(self
            .parts
            .jobs
            .find_latest_for_email(email, chrono::Utc::now())
            .await?)
    }

    async fn process(
        &self,
        mut job: EmailJob,
        kind: EventKind,
        event: &WebhookEvent,
    ) -> Result<Uuid> {
        let at = event.event_time();
        let new_status = kind.job_status();

        let opened_before = job.opened_at.is_some();
        let clicked_before = job.clicked_at.is_some();
        let bounced_before = job.bounced_at.is_some();

        // Timestamps record observation; the status only ever moves up the
        // hierarchy (or out of it).
        job.stamp(new_status, at);

        let advanced = job.status.accepts(new_status) && job.status != new_status;
        if advanced {
            job.status = new_status;
        } else if job.status != new_status {
            debug!(
                job_id = %job.id,
                current = %job.status,
                event_status = %new_status,
                "Transition rejected by status hierarchy"
            );
        }

        match kind {
            EventKind::SoftBounce | EventKind::Deferred => {
                // Signals the retry policy that a reschedule is owed.
                job.metadata.rescheduled = true;
                job.last_error = event.reason.clone();
            }
            EventKind::HardBounce
            | EventKind::Blocked
            | EventKind::Spam
            | EventKind::Invalid
            | EventKind::Error => {
                job.last_error = event.reason.clone();
            }
            _ => {}
        }

        self.parts.jobs.update(&job).await?;

        let lead = self.parts.leads.get(job.lead_id).await?;
        if lead.is_none() {
            warn!(job_id = %job.id, lead_id = %job.lead_id, "Lead vanished; applying job-only updates");
        }

        if let Some(lead) = &lead {
            self.update_counters(lead, kind, opened_before, clicked_before, bounced_before)
                .await?;
        }

        self.update_projections(&job).await?;

        // A delivery chains the next sequence step asynchronously.
        if kind == EventKind::Delivered {
            let payload = serde_json::to_value(FollowupPayload {
                lead_id: job.lead_id,
                original_email_job_id: Some(job.id),
            })?;
            self.parts
                .followup_queue
                .enqueue(&format!("followup:{}", job.id), payload, std::time::Duration::ZERO)
                .await?;
        }

        // Conditionals fire before the aggregate recompute so freshly
        // materialised jobs participate in it.
        if kind.triggers_conditionals() {
            if let Some(lead) = &lead {
                self.parts
                    .conditionals
                    .on_event(lead, kind, &job.email_type, job.id)
                    .await?;
            }
        }

        // Only a soft failure that actually landed on the job is owed a
        // retry; one rejected by the hierarchy (the job already moved on)
        // must not resurrect the journey.
        if job.status == new_status {
            match kind {
                EventKind::SoftBounce => {
                    self.parts
                        .retry_policy
                        .on_soft_failure(&job, FailureKind::SoftBounce)
                        .await?;
                }
                EventKind::Deferred => {
                    self.parts
                        .retry_policy
                        .on_soft_failure(&job, FailureKind::Deferred)
                        .await?;
                }
                _ => {}
            }
        }

        self.parts
            .history
            .record(job.lead_id, job.id, new_status, at)
            .await?;

        self.parts
            .event_store
            .append(&StoredEvent {
                id: Uuid::new_v4(),
                lead_id: Some(job.lead_id),
                email_job_id: Some(job.id),
                event_type: kind.as_str().to_string(),
                payload: serde_json::to_value(event)?,
                created_at: at,
            })
            .await?;

        self.recompute_lead_status(job.lead_id).await?;

        // Cache invalidation is best-effort; a cold cache self-heals.
        if let Err(e) = self.parts.analytics_cache.invalidate_lead(job.lead_id).await {
            warn!(lead_id = %job.lead_id, error = %e, "Analytics cache invalidation failed");
        }
        if let Err(e) = self.parts.analytics_cache.invalidate_summary().await {
            warn!(error = %e, "Analytics summary invalidation failed");
        }

        self.parts.bus.publish(DomainEvent::JobStatusChanged {
            lead_id: job.lead_id,
            job_id: job.id,
            email_type: job.email_type.clone(),
            status: job.status,
        });

        info!(
            job_id = %job.id,
            lead_id = %job.lead_id,
            event = kind.as_str(),
            status = %job.status,
            "Webhook event applied"
        );
        Ok(job.id)
    }

    async fn update_counters(
        &self,
        lead: &Lead,
        kind: EventKind,
        opened_before: bool,
        clicked_before: bool,
        bounced_before: bool,
    ) -> Result<()> {
        let counter = match kind {
            EventKind::Opened | EventKind::UniqueOpened if !opened_before => {
                Some(LeadCounter::Opened)
            }
            EventKind::Clicked if !clicked_before => Some(LeadCounter::Clicked),
            EventKind::SoftBounce | EventKind::HardBounce if !bounced_before => {
                Some(LeadCounter::Bounced)
            }
            _ => None,
        };
        if let Some(counter) = counter {
            self.parts.leads.increment_counter(lead.id, counter).await?;
        }
        Ok(())
    }

    async fn update_projections(&self, job: &EmailJob) -> Result<()> {
        let mut schedule = self
            .parts
            .schedules
            .get(job.lead_id)
            .await?
            .unwrap_or_else(|| projection::empty_schedule(job.lead_id));
        projection::apply_to_schedule(&mut schedule, job);
        self.parts.schedules.upsert(&schedule).await?;

        if job.category == JobCategory::Manual {
            self.parts
                .manual_mails
                .record(&ManualMail {
                    id: Uuid::new_v4(),
                    email_job_id: job.id,
                    lead_id: job.lead_id,
                    email: job.email.clone(),
                    template_id: job.template_id.clone(),
                    status: job.status,
                    sent_at: job.sent_at,
                    error: job.last_error.clone(),
                    created_at: job.created_at,
                })
                .await?;
        }
        Ok(())
    }

    async fn recompute_lead_status(&self, lead_id: Uuid) -> Result<()> {
        let jobs = self.parts.jobs.list_for_lead(lead_id).await?;
        let Some(status) = projection::compute_lead_status(&jobs) else {
            return Ok(());
        };

        let current = self.parts.leads.get(lead_id).await?.and_then(|l| l.status);
        if current.as_ref() != Some(&status) {
            self.parts.leads.update_status(lead_id, &status).await?;
            self.parts.bus.publish(DomainEvent::LeadStatusChanged {
                lead_id,
                status,
            });
        }
        Ok(())
    }

    /// Dead-status propagation used by the stale-send recovery path, where a
    /// job fails without a webhook.
    pub async fn note_job_failure(&self, job: &EmailJob) -> Result<()> {
        self.update_projections(job).await?;
        self.recompute_lead_status(job.lead_id).await
    }
}
