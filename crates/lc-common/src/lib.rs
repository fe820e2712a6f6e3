use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;
pub mod logging;
pub mod status;

pub use bus::{DomainEvent, EventBus};
pub use status::{EventKind, JobStatus};

// ============================================================================
// Leads
// ============================================================================

/// A lead being nurtured. Created externally; the engine only mutates the
/// engagement counters and the aggregate status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    /// Unique, stored case-folded.
    pub email: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    /// IANA timezone name, e.g. `Europe/Berlin`. Defaults to UTC when unset.
    pub timezone: Option<String>,
    pub emails_sent: i64,
    pub emails_opened: i64,
    pub emails_clicked: i64,
    pub emails_bounced: i64,
    pub score: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Aggregate journey status, recomputed after each applied event.
    pub status: Option<LeadStatus>,
    pub frozen_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(email: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.trim().to_lowercase(),
            name: None,
            company: None,
            city: None,
            country: None,
            timezone: None,
            emails_sent: 0,
            emails_opened: 0,
            emails_clicked: 0,
            emails_bounced: 0,
            score: 0,
            tags: Vec::new(),
            status: None,
            frozen_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Engagement counter selector for atomic increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadCounter {
    Sent,
    Opened,
    Clicked,
    Bounced,
}

/// Structured lead aggregate status.
///
/// Stored and transported as a `{step, state}` pair; the legacy
/// `"<step>:<state>"` string exists only at the API boundary via `Display`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadStatus {
    /// Journey step name, e.g. `Initial Email` or `conditional:pricing-nudge`.
    pub step: String,
    pub state: JobStatus,
}

impl LeadStatus {
    pub fn new(step: impl Into<String>, state: JobStatus) -> Self {
        Self {
            step: step.into(),
            state,
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.step, self.state)
    }
}

// ============================================================================
// Email jobs
// ============================================================================

/// Journey step category an [`EmailJob`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    Initial,
    Followup,
    Manual,
    Conditional,
}

impl JobCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::Initial => "initial",
            JobCategory::Followup => "followup",
            JobCategory::Manual => "manual",
            JobCategory::Conditional => "conditional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(JobCategory::Initial),
            "followup" => Some(JobCategory::Followup),
            "manual" => Some(JobCategory::Manual),
            "conditional" => Some(JobCategory::Conditional),
            _ => None,
        }
    }
}

/// Tagged metadata bag carried by every job.
///
/// Known keys are typed fields; anything else the callers attach survives in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    pub manual: bool,
    pub rescheduled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,
    /// Id of the `ConditionalEmail` configuration that materialised this job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditional_job_id: Option<Uuid>,
    /// Job whose engagement event triggered this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_attempted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Pending followup jobs cancelled when this conditional fired.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cancelled_followups: Vec<Uuid>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The central entity: one scheduled (or historical) email for one lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub email: String,
    /// Journey step discriminator: `Initial Email`, `First Followup`,
    /// `manual`, `conditional:<name>`.
    pub email_type: String,
    pub category: JobCategory,
    pub template_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub retry_count: i32,
    /// Unique per send attempt; doubles as the queue deduplication id and the
    /// gateway `X-Idempotency-Key`.
    pub idempotency_key: String,
    /// Message id assigned by the gateway on accept.
    pub brevo_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub deferred_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailJob {
    /// Stable idempotency key for a (lead, type, attempt) triple.
    pub fn idempotency_key_for(lead_id: Uuid, email_type: &str, retry_count: i32) -> String {
        let slug = email_type.to_lowercase().replace([' ', ':'], "-");
        format!("{lead_id}:{slug}:{retry_count}")
    }

    /// Set the timestamp slot for `status` only if currently null, returning
    /// whether anything changed. Failure timestamps back-fill `sent_at`
    /// because the gateway accepted the message before it failed.
    pub fn stamp(&mut self, status: JobStatus, at: DateTime<Utc>) {
        match status {
            JobStatus::Sent | JobStatus::Sending => {
                self.sent_at.get_or_insert(at);
            }
            JobStatus::Delivered => {
                self.delivered_at.get_or_insert(at);
            }
            JobStatus::Opened => {
                self.opened_at.get_or_insert(at);
            }
            JobStatus::Clicked => {
                self.clicked_at.get_or_insert(at);
            }
            JobStatus::SoftBounce | JobStatus::HardBounce => {
                self.bounced_at.get_or_insert(at);
                self.sent_at.get_or_insert(at);
            }
            JobStatus::Deferred => {
                self.deferred_at.get_or_insert(at);
                self.sent_at.get_or_insert(at);
            }
            JobStatus::Failed | JobStatus::Blocked | JobStatus::Spam | JobStatus::Error => {
                self.failed_at.get_or_insert(at);
                self.sent_at.get_or_insert(at);
            }
            _ => {}
        }
    }
}

// ============================================================================
// Schedule projection
// ============================================================================

/// Per-lead journey snapshot kept in sync by the ingest pipeline for UI use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSchedule {
    pub lead_id: Uuid,
    pub initial_status: JobStatus,
    #[serde(default)]
    pub followups: Vec<StepSnapshot>,
    #[serde(default)]
    pub conditionals: Vec<StepSnapshot>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub name: String,
    pub status: JobStatus,
    pub template_id: Option<String>,
}

// ============================================================================
// Conditional email configuration
// ============================================================================

/// Configuration row for an event-triggered send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalEmail {
    pub id: Uuid,
    pub name: String,
    pub trigger_event: EventKind,
    /// Restrict to events originating from this journey step, if set.
    pub trigger_step: Option<String>,
    pub delay_hours: i64,
    pub template_id: Option<String>,
    /// Cancel all pending followups of the lead when firing.
    pub cancel_pending: bool,
    pub priority: i32,
    pub enabled: bool,
}

impl ConditionalEmail {
    /// Job type string for jobs materialised from this configuration.
    pub fn job_type(&self) -> String {
        format!("conditional:{}", self.name)
    }
}

// ============================================================================
// Runtime settings (singleton document)
// ============================================================================

/// One step of the nurture sequence. `order` 0 is the initial email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: i32,
    pub name: String,
    pub delay_days: i64,
    pub template_id: Option<String>,
    pub enabled: bool,
    pub order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
    /// `chrono::Weekday::num_days_from_monday` values, e.g. `[5, 6]`.
    pub weekend_days: Vec<u32>,
    /// Send slots are rounded forward to this boundary.
    pub window_minutes: u32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            weekend_days: vec![5, 6],
            window_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: i32,
    pub soft_bounce_delay_hours: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            soft_bounce_delay_hours: 2,
        }
    }
}

/// Gateway credentials sourced from settings; cached in-process by the
/// gateway client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayCredentials {
    pub api_key: String,
    pub sender_name: String,
    pub sender_email: String,
}

/// Runtime-editable settings singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Global dispatch rate limit, messages per second.
    pub send_rate_per_second: u32,
    pub business_hours: BusinessHours,
    pub sequence: Vec<SequenceStep>,
    /// Step names excluded from scheduling without editing the sequence.
    pub skipped_steps: Vec<String>,
    pub paused_dates: Vec<NaiveDate>,
    pub retry: RetryConfig,
    pub gateway: GatewayCredentials,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            send_rate_per_second: 10,
            business_hours: BusinessHours::default(),
            sequence: vec![
                SequenceStep {
                    id: 1,
                    name: "Initial Email".to_string(),
                    delay_days: 0,
                    template_id: None,
                    enabled: true,
                    order: 0,
                },
                SequenceStep {
                    id: 2,
                    name: "First Followup".to_string(),
                    delay_days: 3,
                    template_id: None,
                    enabled: true,
                    order: 1,
                },
                SequenceStep {
                    id: 3,
                    name: "Second Followup".to_string(),
                    delay_days: 5,
                    template_id: None,
                    enabled: true,
                    order: 2,
                },
            ],
            skipped_steps: Vec::new(),
            paused_dates: Vec::new(),
            retry: RetryConfig::default(),
            gateway: GatewayCredentials::default(),
        }
    }
}

impl Settings {
    /// Enabled, non-skipped steps sorted by `(order, id)` — the tie-break on
    /// equal `order` is the lower id.
    pub fn active_sequence(&self) -> Vec<&SequenceStep> {
        let mut steps: Vec<&SequenceStep> = self
            .sequence
            .iter()
            .filter(|s| s.enabled && !self.skipped_steps.contains(&s.name))
            .collect();
        steps.sort_by_key(|s| (s.order, s.id));
        steps
    }
}

// ============================================================================
// Auxiliary records
// ============================================================================

/// Idempotency ledger row for webhook ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub message_id: String,
    pub event_type: EventKind,
    pub processed_at: DateTime<Utc>,
}

/// Append-only audit record of an applied domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: Uuid,
    pub lead_id: Option<Uuid>,
    pub email_job_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Projection row mirroring a manual send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualMail {
    pub id: Uuid,
    pub email_job_id: Uuid,
    pub lead_id: Uuid,
    pub email: String,
    pub template_id: Option<String>,
    pub status: JobStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable feed row for the (external) notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Email template fetched by id at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub html_content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lead_email_is_case_folded() {
        let lead = Lead::new("  Jane.Doe@Example.COM ");
        assert_eq!(lead.email, "jane.doe@example.com");
    }

    #[test]
    fn lead_status_display_is_legacy_string() {
        let status = LeadStatus::new("First Followup", JobStatus::Delivered);
        assert_eq!(status.to_string(), "First Followup:delivered");
    }

    #[test]
    fn idempotency_key_is_stable_and_attempt_scoped() {
        let lead = Uuid::new_v4();
        let a = EmailJob::idempotency_key_for(lead, "First Followup", 0);
        let b = EmailJob::idempotency_key_for(lead, "First Followup", 0);
        let c = EmailJob::idempotency_key_for(lead, "First Followup", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with("first-followup:0"));
    }

    #[test]
    fn stamp_sets_timestamp_once() {
        let mut job = test_job();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::hours(1);
        job.stamp(JobStatus::Delivered, t1);
        job.stamp(JobStatus::Delivered, t2);
        assert_eq!(job.delivered_at, Some(t1));
    }

    #[test]
    fn failure_backfills_sent_at() {
        let mut job = test_job();
        assert!(job.sent_at.is_none());
        let at = Utc::now();
        job.stamp(JobStatus::HardBounce, at);
        assert_eq!(job.sent_at, Some(at));
        assert_eq!(job.bounced_at, Some(at));
    }

    #[test]
    fn active_sequence_sorts_and_filters() {
        let mut settings = Settings::default();
        settings.sequence.push(SequenceStep {
            id: 9,
            name: "Disabled".to_string(),
            delay_days: 1,
            template_id: None,
            enabled: false,
            order: 1,
        });
        settings.sequence.push(SequenceStep {
            id: 0,
            name: "Tie".to_string(),
            delay_days: 1,
            template_id: None,
            enabled: true,
            order: 1,
        });
        settings.skipped_steps.push("Second Followup".to_string());

        let names: Vec<&str> = settings
            .active_sequence()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        // Tie (id 0) sorts before First Followup (id 2) on equal order.
        assert_eq!(names, vec!["Initial Email", "Tie", "First Followup"]);
    }

    #[test]
    fn metadata_round_trips_extra_fields() {
        let mut meta = JobMetadata::default();
        meta.manual = true;
        meta.extra
            .insert("campaign".to_string(), serde_json::json!("q3-launch"));
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["campaign"], "q3-launch");
        let back: JobMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    fn test_job() -> EmailJob {
        let now = Utc::now();
        EmailJob {
            id: Uuid::new_v4(),
            lead_id: Uuid::new_v4(),
            email: "a@x".to_string(),
            email_type: "Initial Email".to_string(),
            category: JobCategory::Initial,
            template_id: None,
            scheduled_for: now,
            status: JobStatus::Pending,
            retry_count: 0,
            idempotency_key: "k".to_string(),
            brevo_message_id: None,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            failed_at: None,
            deferred_at: None,
            last_error: None,
            metadata: JobMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
