//! Conditional trigger engine
//!
//! Turns an engagement event into event-triggered sends. This engine is the
//! only code path allowed to cancel pending followups; everything else treats
//! cancellations as read-only.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lc_common::{DomainEvent, EmailJob, EventBus, EventKind, JobCategory, Lead};
use lc_store::{ConditionalEmailRepository, EmailJobRepository, SettingsCache};

use crate::{
    next_business_hour_slot, ScheduleJobRequest, ScheduleOutcome, Scheduler, Result,
};

pub struct ConditionalTriggerEngine {
    conditionals: Arc<dyn ConditionalEmailRepository>,
    jobs: Arc<dyn EmailJobRepository>,
    scheduler: Arc<Scheduler>,
    settings: Arc<SettingsCache>,
    bus: EventBus,
}

impl ConditionalTriggerEngine {
    pub fn new(
        conditionals: Arc<dyn ConditionalEmailRepository>,
        jobs: Arc<dyn EmailJobRepository>,
        scheduler: Arc<Scheduler>,
        settings: Arc<SettingsCache>,
        bus: EventBus,
    ) -> Self {
        Self {
            conditionals,
            jobs,
            scheduler,
            settings,
            bus,
        }
    }

    /// Evaluate every enabled conditional for this event, highest priority
    /// first. Returns the jobs that were materialised.
    pub async fn on_event(
        &self,
        lead: &Lead,
        trigger: EventKind,
        source_email_type: &str,
        source_job_id: Uuid,
    ) -> Result<Vec<EmailJob>> {
        let candidates = self.conditionals.find_enabled_for_trigger(trigger).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let settings = self.settings.get().await?;
        let mut materialised = Vec::new();

        for conditional in candidates {
            if let Some(step) = &conditional.trigger_step {
                if step != source_email_type {
                    continue;
                }
            }

            // One materialisation per (conditional, lead), ever.
            if self.conditionals.is_linked(conditional.id, lead.id).await? {
                debug!(
                    lead_id = %lead.id,
                    conditional = %conditional.name,
                    "Conditional already materialised for lead"
                );
                continue;
            }

            let mut cancelled = Vec::new();
            if conditional.cancel_pending {
                cancelled = self
                    .jobs
                    .cancel_pending_for_lead(lead.id, "conditional trigger")
                    .await?;
                if !cancelled.is_empty() {
                    info!(
                        lead_id = %lead.id,
                        conditional = %conditional.name,
                        count = cancelled.len(),
                        "Cancelled pending followups for conditional send"
                    );
                    self.bus.publish(DomainEvent::FollowupsCancelled {
                        lead_id: lead.id,
                        job_ids: cancelled.clone(),
                        reason: format!("conditional:{}", conditional.name),
                    });
                }
            }

            let scheduled_for = next_business_hour_slot(
                lead.timezone.as_deref(),
                Utc::now() + chrono::Duration::hours(conditional.delay_hours),
                &settings.business_hours,
                &settings.paused_dates,
            );

            let mut request = ScheduleJobRequest::new(
                lead.id,
                conditional.job_type(),
                JobCategory::Conditional,
                scheduled_for,
            );
            request.template_id = conditional.template_id.clone();
            request.metadata.trigger_event = Some(trigger.as_str().to_string());
            request.metadata.conditional_job_id = Some(conditional.id);
            request.metadata.source_job_id = Some(source_job_id);
            request.metadata.cancelled_followups = cancelled;

            match self.scheduler.schedule_email_job(request).await? {
                ScheduleOutcome::Scheduled(job) => {
                    let linked = self
                        .conditionals
                        .link_job(conditional.id, lead.id, job.id)
                        .await?;
                    if !linked {
                        warn!(
                            lead_id = %lead.id,
                            conditional = %conditional.name,
                            "Conditional link already present after scheduling"
                        );
                    }
                    metrics::counter!("scheduler.conditionals_triggered_total").increment(1);
                    self.bus.publish(DomainEvent::ConditionalTriggered {
                        lead_id: lead.id,
                        name: conditional.name.clone(),
                        job_id: job.id,
                    });
                    materialised.push(job);
                }
                ScheduleOutcome::Denied(reason) => {
                    debug!(
                        lead_id = %lead.id,
                        conditional = %conditional.name,
                        reason = reason.as_str(),
                        "Conditional schedule denied"
                    );
                }
            }
        }

        Ok(materialised)
    }
}
