//! In-memory store for dev mode and tests
//!
//! One struct implements every repository trait; a single jobs mutex keeps
//! the cross-row guards (idempotency uniqueness, send-attempt claim, bulk
//! cancellation) atomic exactly like their SQL counterparts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use lc_common::{
    ConditionalEmail, EmailJob, EmailSchedule, EmailTemplate, EventKind, JobCategory, JobStatus,
    Lead, LeadCounter, LeadStatus, ManualMail, Notification, Settings, StoredEvent,
};

use crate::repository::*;
use crate::{Result, StoreError};

#[derive(Default)]
pub struct InMemoryStore {
    leads: DashMap<Uuid, Lead>,
    jobs: Mutex<HashMap<Uuid, EmailJob>>,
    schedules: DashMap<Uuid, EmailSchedule>,
    conditionals: Mutex<Vec<ConditionalEmail>>,
    conditional_links: Mutex<HashMap<(Uuid, Uuid), Uuid>>,
    processed: Mutex<HashMap<(String, EventKind), DateTime<Utc>>>,
    events: Mutex<Vec<StoredEvent>>,
    history: Mutex<Vec<HistoryRow>>,
    settings: RwLock<Settings>,
    templates: DashMap<String, EmailTemplate>,
    manual_mails: DashMap<Uuid, ManualMail>,
    notifications: Mutex<Vec<Notification>>,
}

#[derive(Debug, Clone)]
struct HistoryRow {
    lead_id: Uuid,
    job_id: Uuid,
    status: JobStatus,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// Leads
// ============================================================================

#[async_trait]
impl LeadRepository for InMemoryStore {
    async fn insert(&self, lead: &Lead) -> Result<()> {
        let email = lead.email.clone();
        if self.leads.iter().any(|l| l.email == email) {
            return Err(StoreError::Conflict(format!("lead email {email}")));
        }
        self.leads.insert(lead.id, lead.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Lead>> {
        Ok(self.leads.get(&id).map(|l| l.clone()))
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Lead>> {
        let folded = email.trim().to_lowercase();
        Ok(self
            .leads
            .iter()
            .find(|l| l.email == folded)
            .map(|l| l.clone()))
    }

    async fn update_status(&self, id: Uuid, status: &LeadStatus) -> Result<()> {
        let mut lead = self
            .leads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("lead {id}")))?;
        lead.status = Some(status.clone());
        lead.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_counter(&self, id: Uuid, counter: LeadCounter) -> Result<()> {
        let mut lead = self
            .leads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("lead {id}")))?;
        match counter {
            LeadCounter::Sent => lead.emails_sent += 1,
            LeadCounter::Opened => lead.emails_opened += 1,
            LeadCounter::Clicked => lead.emails_clicked += 1,
            LeadCounter::Bounced => lead.emails_bounced += 1,
        }
        lead.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.leads.remove(&id);
        self.jobs.lock().retain(|_, job| job.lead_id != id);
        self.schedules.remove(&id);
        Ok(())
    }
}

// ============================================================================
// Email jobs
// ============================================================================

#[async_trait]
impl EmailJobRepository for InMemoryStore {
    async fn insert(&self, job: &EmailJob) -> Result<()> {
        let mut jobs = self.jobs.lock();
        if jobs
            .values()
            .any(|j| j.idempotency_key == job.idempotency_key)
        {
            return Err(StoreError::Conflict(format!(
                "idempotency key {}",
                job.idempotency_key
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, job: &EmailJob) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let existing = jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
        let mut updated = job.clone();
        updated.updated_at = Utc::now();
        *existing = updated;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EmailJob>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<EmailJob>> {
        let mut jobs: Vec<EmailJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.lead_id == lead_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn find_active(&self, lead_id: Uuid, email_type: &str) -> Result<Option<EmailJob>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .find(|j| j.lead_id == lead_id && j.email_type == email_type && j.status.is_active())
            .cloned())
    }

    async fn list_active_for_lead(
        &self,
        lead_id: Uuid,
        exclude_conditional: bool,
    ) -> Result<Vec<EmailJob>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| {
                j.lead_id == lead_id
                    && j.status.is_active()
                    && !(exclude_conditional && j.category == JobCategory::Conditional)
            })
            .cloned()
            .collect())
    }

    async fn has_been_sent(&self, lead_id: Uuid, email_type: &str) -> Result<bool> {
        Ok(self
            .jobs
            .lock()
            .values()
            .any(|j| j.lead_id == lead_id && j.email_type == email_type && j.status.is_sent()))
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<EmailJob>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .find(|j| j.brevo_message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn find_latest_for_email(
        &self,
        email: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<EmailJob>> {
        let folded = email.trim().to_lowercase();
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| j.email == folded && j.scheduled_for <= before)
            .max_by_key(|j| j.scheduled_for)
            .cloned())
    }

    async fn mark_send_attempt(&self, job_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !job.status.is_active() || job.status == JobStatus::Sending {
            return Ok(false);
        }
        job.status = JobStatus::Sending;
        job.metadata.send_attempted_at = Some(at);
        job.stamp(JobStatus::Sending, at);
        job.updated_at = at;
        Ok(true)
    }

    async fn cancel_pending_for_lead(&self, lead_id: Uuid, reason: &str) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        let mut jobs = self.jobs.lock();
        for job in jobs.values_mut() {
            // In-flight (`sending`) jobs are past the point of no return.
            if job.lead_id == lead_id
                && job.status.is_active()
                && job.status != JobStatus::Sending
                && job.category != JobCategory::Conditional
            {
                job.status = JobStatus::Cancelled;
                job.metadata.cancel_reason = Some(reason.to_string());
                job.updated_at = now;
                cancelled.push(job.id);
            }
        }
        Ok(cancelled)
    }

    async fn find_stale_sending(&self, cutoff: DateTime<Utc>) -> Result<Vec<EmailJob>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| {
                j.status == JobStatus::Sending
                    && j.metadata
                        .send_attempted_at
                        .map(|at| at < cutoff)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

// ============================================================================
// Projections
// ============================================================================

#[async_trait]
impl ScheduleRepository for InMemoryStore {
    async fn get(&self, lead_id: Uuid) -> Result<Option<EmailSchedule>> {
        Ok(self.schedules.get(&lead_id).map(|s| s.clone()))
    }

    async fn upsert(&self, schedule: &EmailSchedule) -> Result<()> {
        self.schedules.insert(schedule.lead_id, schedule.clone());
        Ok(())
    }
}

#[async_trait]
impl ManualMailRepository for InMemoryStore {
    async fn record(&self, mail: &ManualMail) -> Result<()> {
        // Upsert keyed by job: later calls only refresh the mutable fields.
        match self.manual_mails.get_mut(&mail.email_job_id) {
            Some(mut existing) => {
                existing.status = mail.status;
                existing.sent_at = mail.sent_at;
                existing.error = mail.error.clone();
            }
            None => {
                self.manual_mails.insert(mail.email_job_id, mail.clone());
            }
        }
        Ok(())
    }

    async fn get_for_job(&self, email_job_id: Uuid) -> Result<Option<ManualMail>> {
        Ok(self.manual_mails.get(&email_job_id).map(|m| m.clone()))
    }
}

// ============================================================================
// Conditional emails
// ============================================================================

#[async_trait]
impl ConditionalEmailRepository for InMemoryStore {
    async fn insert(&self, conditional: &ConditionalEmail) -> Result<()> {
        self.conditionals.lock().push(conditional.clone());
        Ok(())
    }

    async fn find_enabled_for_trigger(&self, trigger: EventKind) -> Result<Vec<ConditionalEmail>> {
        let mut matching: Vec<ConditionalEmail> = self
            .conditionals
            .lock()
            .iter()
            .filter(|c| c.enabled && c.trigger_event == trigger)
            .cloned()
            .collect();
        matching.sort_by_key(|c| std::cmp::Reverse(c.priority));
        Ok(matching)
    }

    async fn link_job(
        &self,
        conditional_id: Uuid,
        lead_id: Uuid,
        email_job_id: Uuid,
    ) -> Result<bool> {
        let mut links = self.conditional_links.lock();
        if links.contains_key(&(conditional_id, lead_id)) {
            return Ok(false);
        }
        links.insert((conditional_id, lead_id), email_job_id);
        Ok(true)
    }

    async fn is_linked(&self, conditional_id: Uuid, lead_id: Uuid) -> Result<bool> {
        Ok(self
            .conditional_links
            .lock()
            .contains_key(&(conditional_id, lead_id)))
    }
}

// ============================================================================
// Event ledger / audit
// ============================================================================

#[async_trait]
impl ProcessedEventRepository for InMemoryStore {
    async fn try_insert(
        &self,
        message_id: &str,
        event: EventKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut processed = self.processed.lock();
        let key = (message_id.to_string(), event);
        if processed.contains_key(&key) {
            return Ok(false);
        }
        processed.insert(key, at);
        Ok(true)
    }

    async fn remove(&self, message_id: &str, event: EventKind) -> Result<()> {
        self.processed
            .lock()
            .remove(&(message_id.to_string(), event));
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut processed = self.processed.lock();
        let before = processed.len();
        processed.retain(|_, at| *at >= cutoff);
        Ok((before - processed.len()) as u64)
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append(&self, record: &StoredEvent) -> Result<()> {
        self.events.lock().push(record.clone());
        Ok(())
    }

    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<StoredEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.lead_id == Some(lead_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventHistoryRepository for InMemoryStore {
    async fn record(
        &self,
        lead_id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut history = self.history.lock();

        let duplicate = history
            .iter()
            .any(|row| row.lead_id == lead_id && row.job_id == job_id && row.status == status);
        if duplicate {
            return Ok(false);
        }

        if let Some(new_rank) = status.rank() {
            let outranked = history.iter().any(|row| {
                row.job_id == job_id
                    && row.status.rank().map(|r| r >= new_rank).unwrap_or(false)
            });
            if outranked {
                return Ok(false);
            }
        }

        history.push(HistoryRow {
            lead_id,
            job_id,
            status,
            created_at: at,
        });
        Ok(true)
    }

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobStatus>> {
        Ok(self
            .history
            .lock()
            .iter()
            .filter(|row| row.job_id == job_id)
            .map(|row| row.status)
            .collect())
    }
}

// ============================================================================
// Configuration documents
// ============================================================================

#[async_trait]
impl SettingsRepository for InMemoryStore {
    async fn get(&self) -> Result<Settings> {
        Ok(self.settings.read().clone())
    }

    async fn update(&self, settings: &Settings) -> Result<()> {
        *self.settings.write() = settings.clone();
        Ok(())
    }
}

#[async_trait]
impl TemplateRepository for InMemoryStore {
    async fn get(&self, id: &str) -> Result<Option<EmailTemplate>> {
        Ok(self.templates.get(id).map(|t| t.clone()))
    }

    async fn upsert(&self, template: &EmailTemplate) -> Result<()> {
        self.templates.insert(template.id.clone(), template.clone());
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for InMemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        self.notifications.lock().push(notification.clone());
        Ok(())
    }

    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<Notification>> {
        Ok(self
            .notifications
            .lock()
            .iter()
            .filter(|n| n.lead_id == lead_id)
            .cloned()
            .collect())
    }
}
