//! Retry / reschedule policy for soft failures
//!
//! Soft bounces, deferred deliveries and gateway failures get a successor job
//! (same lead, same type, `retry_count + 1`); the original is parked as
//! `rescheduled` so it drops out of unique-journey analytics. Once the retry
//! budget is spent the job goes `dead`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use lc_common::{DomainEvent, EmailJob, EventBus, JobStatus};
use lc_store::{EmailJobRepository, LeadRepository, SettingsCache};

use crate::{ScheduleJobRequest, ScheduleOutcome, Scheduler, Result, SchedulerError};

/// Maximum backoff for repeated gateway failures.
const FAILED_DELAY_CAP_HOURS: i64 = 48;
/// Deferred deliveries retry quickly.
const DEFERRED_DELAY_HOURS: i64 = 1;

/// Which soft failure is being recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SoftBounce,
    Deferred,
    Failed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SoftBounce => "soft_bounce",
            FailureKind::Deferred => "deferred",
            FailureKind::Failed => "failed",
        }
    }
}

/// Outcome of a recovery attempt.
#[derive(Debug)]
pub enum RetryOutcome {
    /// A successor job was scheduled.
    Rescheduled(EmailJob),
    /// The retry budget is exhausted; the job is now `dead`.
    Dead,
    /// A concurrent replica already recovered this journey step.
    Superseded,
}

pub struct RetryPolicy {
    leads: Arc<dyn LeadRepository>,
    jobs: Arc<dyn EmailJobRepository>,
    scheduler: Arc<Scheduler>,
    settings: Arc<SettingsCache>,
    bus: EventBus,
}

impl RetryPolicy {
    pub fn new(
        leads: Arc<dyn LeadRepository>,
        jobs: Arc<dyn EmailJobRepository>,
        scheduler: Arc<Scheduler>,
        settings: Arc<SettingsCache>,
        bus: EventBus,
    ) -> Self {
        Self {
            leads,
            jobs,
            scheduler,
            settings,
            bus,
        }
    }

    /// Recover a soft failure by scheduling a successor, or park the job as
    /// `dead` when the budget is spent.
    pub async fn on_soft_failure(&self, job: &EmailJob, kind: FailureKind) -> Result<RetryOutcome> {
        let retry = self.settings.get().await?.retry;

        if job.retry_count >= retry.max_attempts {
            let mut dead = job.clone();
            dead.status = JobStatus::Dead;
            dead.last_error = Some("Max retries exceeded".to_string());
            self.jobs.update(&dead).await?;
            warn!(
                job_id = %job.id,
                email_type = %job.email_type,
                retry_count = job.retry_count,
                "Retry budget exhausted, job is dead"
            );
            metrics::counter!("scheduler.jobs_dead_total").increment(1);
            return Ok(RetryOutcome::Dead);
        }

        let delay_hours = match kind {
            FailureKind::SoftBounce => retry.soft_bounce_delay_hours,
            FailureKind::Deferred => DEFERRED_DELAY_HOURS,
            FailureKind::Failed => (retry.soft_bounce_delay_hours
                << job.retry_count.clamp(0, 16) as u32)
                .min(FAILED_DELAY_CAP_HOURS),
        };

        let lead = self
            .leads
            .get(job.lead_id)
            .await?
            .ok_or(SchedulerError::LeadNotFound(job.lead_id))?;

        // Park the original first so the journey guard admits the successor.
        let mut original = job.clone();
        original.status = JobStatus::Rescheduled;
        original.metadata.rescheduled = true;
        self.jobs.update(&original).await?;

        let mut request = ScheduleJobRequest::new(
            lead.id,
            job.email_type.clone(),
            job.category,
            Utc::now() + chrono::Duration::hours(delay_hours),
        );
        request.template_id = job.template_id.clone();
        request.retry_count = job.retry_count + 1;
        request.metadata.rescheduled = true;
        request.metadata.retry_reason = Some(kind.as_str().to_string());

        match self.scheduler.schedule_email_job(request).await? {
            ScheduleOutcome::Scheduled(successor) => {
                info!(
                    original = %job.id,
                    successor = %successor.id,
                    email_type = %job.email_type,
                    retry_count = successor.retry_count,
                    delay_hours = delay_hours,
                    reason = kind.as_str(),
                    "Scheduled retry successor"
                );
                metrics::counter!("scheduler.jobs_rescheduled_total", "reason" => kind.as_str())
                    .increment(1);
                self.bus.publish(DomainEvent::JobRescheduled {
                    lead_id: job.lead_id,
                    original_job_id: job.id,
                    successor_job_id: successor.id,
                    reason: kind.as_str().to_string(),
                });
                Ok(RetryOutcome::Rescheduled(successor))
            }
            ScheduleOutcome::Denied(reason) => {
                // Another replica raced us through the same recovery.
                info!(
                    original = %job.id,
                    reason = reason.as_str(),
                    "Retry successor already handled elsewhere"
                );
                Ok(RetryOutcome::Superseded)
            }
        }
    }
}
