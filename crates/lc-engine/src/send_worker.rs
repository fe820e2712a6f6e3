//! Email send pipeline
//!
//! The worker side of at-most-once delivery. Ordering of the checks matters:
//! processed-set skip, race re-check, duplicate-journey cancellation, then
//! the atomic claim; only a claimed job reaches the gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use lc_common::{
    DomainEvent, EmailJob, EventBus, JobCategory, JobStatus, LeadCounter, LeadStatus, ManualMail,
};
use lc_queue::{QueueJob, SendJobPayload};
use lc_scheduler::{FailureKind, RetryPolicy};
use lc_store::{
    EmailJobRepository, EventHistoryRepository, LeadRepository, ManualMailRepository,
    SettingsCache, TemplateRepository,
};

use crate::gateway::{EmailGateway, GatewayError, SendEmailRequest};
use crate::pool::{Disposition, JobProcessor};

/// Base delay for queue-level redelivery after a gateway failure.
const NACK_BASE_DELAY: Duration = Duration::from_secs(30);
const NACK_MAX_DELAY: Duration = Duration::from_secs(600);

pub struct SendWorker {
    jobs: Arc<dyn EmailJobRepository>,
    leads: Arc<dyn LeadRepository>,
    templates: Arc<dyn TemplateRepository>,
    manual_mails: Arc<dyn ManualMailRepository>,
    history: Arc<dyn EventHistoryRepository>,
    settings: Arc<SettingsCache>,
    retry_policy: Arc<RetryPolicy>,
    gateway: Arc<dyn EmailGateway>,
    bus: EventBus,
}

impl SendWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn EmailJobRepository>,
        leads: Arc<dyn LeadRepository>,
        templates: Arc<dyn TemplateRepository>,
        manual_mails: Arc<dyn ManualMailRepository>,
        history: Arc<dyn EventHistoryRepository>,
        settings: Arc<SettingsCache>,
        retry_policy: Arc<RetryPolicy>,
        gateway: Arc<dyn EmailGateway>,
        bus: EventBus,
    ) -> Self {
        Self {
            jobs,
            leads,
            templates,
            manual_mails,
            history,
            settings,
            retry_policy,
            gateway,
            bus,
        }
    }

    async fn process(&self, payload: SendJobPayload) -> anyhow::Result<Disposition> {
        // 1. The job must still exist; a missing row is recorded and dropped.
        let Some(job) = self.jobs.get(payload.email_job_id).await? else {
            warn!(job_id = %payload.email_job_id, "Send job vanished");
            return Ok(Disposition::Fail {
                reason: "email job not found".to_string(),
            });
        };

        // 2. Jobs parked as `failed` by an earlier gateway error re-enter via
        // the retry policy, never via direct dispatch.
        if job.status == JobStatus::Failed {
            self.retry_policy
                .on_soft_failure(&job, FailureKind::Failed)
                .await?;
            return Ok(Disposition::Ack);
        }
        if job.status.is_processed() {
            debug!(job_id = %job.id, status = %job.status, "Job already processed, skipping");
            return Ok(Disposition::Ack);
        }

        // 3. Race re-check: a cancellation or a faster worker may have
        // landed between fetch and now.
        let Some(job) = self.jobs.get(job.id).await? else {
            return Ok(Disposition::Fail {
                reason: "email job not found".to_string(),
            });
        };
        if job.status.is_processed() {
            debug!(job_id = %job.id, status = %job.status, "Job processed during re-check, skipping");
            return Ok(Disposition::Ack);
        }

        // 4. Lead lookup is terminal on failure.
        let Some(lead) = self.leads.get(job.lead_id).await? else {
            let mut orphaned = job.clone();
            orphaned.status = JobStatus::Invalid;
            orphaned.last_error = Some("lead not found".to_string());
            self.jobs.update(&orphaned).await?;
            return Ok(Disposition::Fail {
                reason: "lead not found".to_string(),
            });
        };

        // 5. Duplicate journey: a sibling already went out.
        if self.jobs.has_been_sent(job.lead_id, &job.email_type).await? {
            let mut duplicate = job.clone();
            duplicate.status = JobStatus::Cancelled;
            duplicate.metadata.cancel_reason = Some("duplicate".to_string());
            self.jobs.update(&duplicate).await?;
            info!(job_id = %job.id, email_type = %job.email_type, "Duplicate journey send cancelled");
            return Ok(Disposition::Ack);
        }

        // 6. Atomic claim; exactly one worker wins.
        let now = Utc::now();
        if !self.jobs.mark_send_attempt(job.id, now).await? {
            debug!(job_id = %job.id, "Job already claimed by another worker");
            return Ok(Disposition::Ack);
        }
        let mut job = match self.jobs.get(job.id).await? {
            Some(job) => job,
            None => {
                return Ok(Disposition::Fail {
                    reason: "email job vanished after claim".to_string(),
                })
            }
        };

        // 7. Late binding: non-manual sends pick up the sequence step's
        // current template so edits apply to already-scheduled jobs.
        let template_id = self.resolve_template_id(&job).await?;
        if template_id != job.template_id {
            job.template_id = template_id;
        }

        let request = self.build_request(&job, lead.name.as_deref()).await?;

        // 8./9. Dispatch and record the outcome.
        match self.gateway.send(&request).await {
            Ok(result) => {
                self.record_success(&mut job, &result.message_id).await?;
                Ok(Disposition::Ack)
            }
            Err(e) => self.record_failure(&mut job, e).await,
        }
    }

    async fn resolve_template_id(&self, job: &EmailJob) -> anyhow::Result<Option<String>> {
        if job.metadata.manual || job.category == JobCategory::Manual {
            return Ok(job.template_id.clone());
        }
        let settings = self.settings.get().await?;
        let step_template = settings
            .sequence
            .iter()
            .find(|step| step.name == job.email_type)
            .and_then(|step| step.template_id.clone());
        Ok(step_template.or_else(|| job.template_id.clone()))
    }

    async fn build_request(
        &self,
        job: &EmailJob,
        lead_name: Option<&str>,
    ) -> anyhow::Result<SendEmailRequest> {
        let template = match &job.template_id {
            Some(id) => self.templates.get(id).await?,
            None => None,
        };

        let (subject, html_content) = match template {
            Some(template) => (template.subject, template.html_content),
            // Content authoring is external; an unresolved template still
            // produces a deliverable (if plain) message.
            None => (job.email_type.clone(), String::new()),
        };

        Ok(SendEmailRequest {
            to_email: job.email.clone(),
            to_name: lead_name.map(str::to_string),
            subject,
            html_content,
            idempotency_key: job.idempotency_key.clone(),
        })
    }

    async fn record_success(&self, job: &mut EmailJob, message_id: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        job.status = JobStatus::Sent;
        job.brevo_message_id = Some(message_id.to_string());
        job.stamp(JobStatus::Sent, now);
        self.jobs.update(job).await?;

        if job.metadata.manual || job.category == JobCategory::Manual {
            self.manual_mails
                .record(&ManualMail {
                    id: uuid::Uuid::new_v4(),
                    email_job_id: job.id,
                    lead_id: job.lead_id,
                    email: job.email.clone(),
                    template_id: job.template_id.clone(),
                    status: JobStatus::Sent,
                    sent_at: job.sent_at,
                    error: None,
                    created_at: job.created_at,
                })
                .await?;
        }

        self.leads
            .increment_counter(job.lead_id, LeadCounter::Sent)
            .await?;
        self.leads
            .update_status(
                job.lead_id,
                &LeadStatus::new(job.email_type.clone(), JobStatus::Sent),
            )
            .await?;
        // Deduplicated engagement milestone.
        self.history
            .record(job.lead_id, job.id, JobStatus::Sent, now)
            .await?;

        metrics::counter!("worker.emails_sent_total").increment(1);
        info!(
            job_id = %job.id,
            lead_id = %job.lead_id,
            email_type = %job.email_type,
            message_id = %message_id,
            "Email dispatched"
        );
        self.bus.publish(DomainEvent::EmailSent {
            lead_id: job.lead_id,
            job_id: job.id,
            email_type: job.email_type.clone(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    async fn record_failure(
        &self,
        job: &mut EmailJob,
        error: GatewayError,
    ) -> anyhow::Result<Disposition> {
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        job.stamp(JobStatus::Failed, now);
        self.jobs.update(job).await?;

        metrics::counter!("worker.emails_failed_total").increment(1);
        warn!(job_id = %job.id, error = %error, "Gateway dispatch failed");

        if error.is_retryable() {
            Ok(Disposition::Nack {
                delay: NACK_BASE_DELAY,
            })
        } else {
            Ok(Disposition::Fail {
                reason: error.to_string(),
            })
        }
    }
}

#[async_trait]
impl JobProcessor for SendWorker {
    async fn handle(&self, queue_job: &QueueJob) -> Disposition {
        let payload: SendJobPayload = match serde_json::from_value(queue_job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return Disposition::Fail {
                    reason: format!("unparseable send payload: {e}"),
                }
            }
        };

        match self.process(payload).await {
            Ok(disposition) => apply_backoff(disposition, queue_job.receive_count),
            Err(e) => {
                warn!(job_id = %queue_job.job_id, error = %e, "Send pipeline error, retrying");
                apply_backoff(
                    Disposition::Nack {
                        delay: NACK_BASE_DELAY,
                    },
                    queue_job.receive_count,
                )
            }
        }
    }
}

/// Exponential queue-level backoff keyed on the redelivery count.
fn apply_backoff(disposition: Disposition, receive_count: u32) -> Disposition {
    match disposition {
        Disposition::Nack { delay } => {
            let shift = receive_count.saturating_sub(1).min(5);
            let scaled = delay.saturating_mul(1 << shift).min(NACK_MAX_DELAY);
            Disposition::Nack { delay: scaled }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(30);
        let delays: Vec<u64> = (1..=6)
            .map(|receives| {
                match apply_backoff(Disposition::Nack { delay: base }, receives) {
                    Disposition::Nack { delay } => delay.as_secs(),
                    _ => unreachable!(),
                }
            })
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 480, 600]);
    }

    #[test]
    fn ack_and_fail_pass_through() {
        assert!(matches!(
            apply_backoff(Disposition::Ack, 3),
            Disposition::Ack
        ));
        assert!(matches!(
            apply_backoff(
                Disposition::Fail {
                    reason: "x".to_string()
                },
                3
            ),
            Disposition::Fail { .. }
        ));
    }
}
