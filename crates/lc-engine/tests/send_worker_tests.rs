//! Send pipeline tests
//!
//! Exercise the worker's dispatch checks end to end against the in-memory
//! backends and a scripted gateway double.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use lc_common::{
    BusinessHours, EmailTemplate, EventBus, JobCategory, JobStatus, Lead, SequenceStep, Settings,
};
use lc_engine::{
    Disposition, EmailGateway, GatewayError, GatewaySendResult, JobProcessor, SendEmailRequest,
    SendWorker,
};
use lc_lock::InMemoryLockManager;
use lc_queue::{DelayedQueue, InMemoryQueue, QueueJob, EMAIL_SEND_QUEUE};
use lc_scheduler::{
    RetryPolicy, ScheduleJobRequest, ScheduleOutcome, Scheduler, SchedulerConfig,
};
use lc_store::{
    EmailJobRepository, LeadRepository, ManualMailRepository, SettingsCache, SettingsRepository,
    TemplateRepository, InMemoryStore,
};

/// Gateway double: scripted responses, captured requests.
struct ScriptedGateway {
    requests: Mutex<Vec<SendEmailRequest>>,
    responses: Mutex<VecDeque<Result<GatewaySendResult, GatewayError>>>,
}

impl ScriptedGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
        })
    }

    fn push(&self, response: Result<GatewaySendResult, GatewayError>) {
        self.responses.lock().push_back(response);
    }

    fn requests(&self) -> Vec<SendEmailRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl EmailGateway for ScriptedGateway {
    async fn send(
        &self,
        request: &SendEmailRequest,
    ) -> Result<GatewaySendResult, GatewayError> {
        self.requests.lock().push(request.clone());
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(GatewaySendResult {
                message_id: format!("msg-{}", Uuid::new_v4().simple()),
            })
        })
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    jobs: Arc<dyn EmailJobRepository>,
    leads: Arc<dyn LeadRepository>,
    queue: Arc<InMemoryQueue>,
    scheduler: Arc<Scheduler>,
    settings: Arc<SettingsCache>,
    gateway: Arc<ScriptedGateway>,
    worker: SendWorker,
}

fn open_settings() -> Settings {
    Settings {
        business_hours: BusinessHours {
            start_hour: 0,
            end_hour: 24,
            weekend_days: vec![],
            window_minutes: 1,
        },
        ..Settings::default()
    }
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    SettingsRepository::update(store.as_ref(), &open_settings())
        .await
        .unwrap();

    let settings = Arc::new(SettingsCache::with_default_ttl(store.clone()));
    let locks = Arc::new(InMemoryLockManager::new());
    let queue = Arc::new(InMemoryQueue::new(
        EMAIL_SEND_QUEUE,
        Duration::from_secs(60),
        5,
    ));
    let bus = EventBus::default();

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        settings.clone(),
        locks,
        queue.clone(),
        bus.clone(),
        SchedulerConfig::default(),
    ));
    let retry_policy = Arc::new(RetryPolicy::new(
        store.clone(),
        store.clone(),
        scheduler.clone(),
        settings.clone(),
        bus.clone(),
    ));

    let gateway = ScriptedGateway::new();
    let worker = SendWorker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        settings.clone(),
        retry_policy,
        gateway.clone(),
        bus,
    );

    Harness {
        jobs: store.clone(),
        leads: store.clone(),
        store,
        queue,
        scheduler,
        settings,
        gateway,
        worker,
    }
}

async fn seed_lead(h: &Harness) -> Lead {
    let mut lead = Lead::new(&format!("{}@example.com", Uuid::new_v4().simple()));
    lead.name = Some("Jane".to_string());
    lead.timezone = Some("UTC".to_string());
    LeadRepository::insert(h.store.as_ref(), &lead).await.unwrap();
    lead
}

async fn schedule_now(h: &Harness, lead: &Lead, email_type: &str) -> lc_common::EmailJob {
    let category = if email_type == "Initial Email" {
        JobCategory::Initial
    } else {
        JobCategory::Followup
    };
    match h
        .scheduler
        .schedule_email_job(ScheduleJobRequest::new(
            lead.id,
            email_type,
            category,
            Utc::now(),
        ))
        .await
        .unwrap()
    {
        ScheduleOutcome::Scheduled(job) => job,
        ScheduleOutcome::Denied(r) => panic!("denied: {r:?}"),
    }
}

async fn next_queue_job(h: &Harness) -> QueueJob {
    h.queue
        .poll(1)
        .await
        .unwrap()
        .into_iter()
        .next()
        .expect("queue job available")
}

#[tokio::test]
async fn happy_path_dispatches_and_records() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job = schedule_now(&h, &lead, "Initial Email").await;

    let queue_job = next_queue_job(&h).await;
    let disposition = h.worker.handle(&queue_job).await;
    assert!(matches!(disposition, Disposition::Ack));

    let sent = h.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(sent.status, JobStatus::Sent);
    assert!(sent.brevo_message_id.is_some());
    assert!(sent.sent_at.is_some());
    assert!(sent.metadata.send_attempted_at.is_some());

    let lead = h.leads.get(lead.id).await.unwrap().unwrap();
    assert_eq!(lead.emails_sent, 1);
    assert_eq!(lead.status.unwrap().to_string(), "Initial Email:sent");

    // The gateway saw the idempotency key.
    let requests = h.gateway.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].idempotency_key, sent.idempotency_key);
    assert_eq!(requests[0].to_name.as_deref(), Some("Jane"));
}

#[tokio::test]
async fn duplicate_journey_is_cancelled_not_sent() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job = schedule_now(&h, &lead, "Initial Email").await;

    // A sibling of the same type already went out.
    let mut sibling = job.clone();
    sibling.id = Uuid::new_v4();
    sibling.idempotency_key = format!("{}-sibling", job.idempotency_key);
    sibling.status = JobStatus::Sent;
    EmailJobRepository::insert(h.store.as_ref(), &sibling)
        .await
        .unwrap();

    let queue_job = next_queue_job(&h).await;
    let disposition = h.worker.handle(&queue_job).await;
    assert!(matches!(disposition, Disposition::Ack));

    let cancelled = h.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.metadata.cancel_reason.as_deref(), Some("duplicate"));
    assert!(h.gateway.requests().is_empty());
}

#[tokio::test]
async fn claimed_jobs_are_skipped() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job = schedule_now(&h, &lead, "Initial Email").await;

    // Another worker claimed it a moment ago.
    assert!(h.jobs.mark_send_attempt(job.id, Utc::now()).await.unwrap());

    let queue_job = next_queue_job(&h).await;
    let disposition = h.worker.handle(&queue_job).await;
    assert!(matches!(disposition, Disposition::Ack));
    assert!(h.gateway.requests().is_empty());
}

#[tokio::test]
async fn transient_gateway_failure_nacks_then_reschedules() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job = schedule_now(&h, &lead, "Initial Email").await;

    h.gateway
        .push(Err(GatewayError::Transient("503 upstream".to_string())));

    let queue_job = next_queue_job(&h).await;
    let disposition = h.worker.handle(&queue_job).await;
    assert!(matches!(disposition, Disposition::Nack { .. }));

    let failed = h.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.failed_at.is_some());
    assert!(failed.last_error.unwrap().contains("503"));

    // Redelivery routes through the retry policy instead of dispatching.
    h.queue.nack(&queue_job.receipt_handle, Duration::ZERO)
        .await
        .unwrap();
    let redelivered = next_queue_job(&h).await;
    let disposition = h.worker.handle(&redelivered).await;
    assert!(matches!(disposition, Disposition::Ack));

    let original = h.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(original.status, JobStatus::Rescheduled);

    let jobs = h.jobs.list_for_lead(lead.id).await.unwrap();
    let successor = jobs
        .iter()
        .find(|j| j.id != job.id)
        .expect("retry successor");
    assert_eq!(successor.retry_count, 1);
    assert_eq!(successor.metadata.retry_reason.as_deref(), Some("failed"));

    // Only the first attempt reached the gateway.
    assert_eq!(h.gateway.requests().len(), 1);
}

#[tokio::test]
async fn config_gateway_failure_goes_to_failed_bucket() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job = schedule_now(&h, &lead, "Initial Email").await;

    h.gateway
        .push(Err(GatewayError::Config("401 bad api key".to_string())));

    let queue_job = next_queue_job(&h).await;
    let disposition = h.worker.handle(&queue_job).await;
    assert!(matches!(disposition, Disposition::Fail { .. }));

    let failed = h.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
}

#[tokio::test]
async fn missing_lead_fails_terminally() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job = schedule_now(&h, &lead, "Initial Email").await;
    LeadRepository::delete(h.store.as_ref(), lead.id)
        .await
        .unwrap();

    // Deleting the lead cascaded the job; re-insert it orphaned to hit the
    // lead lookup step.
    EmailJobRepository::insert(h.store.as_ref(), &job)
        .await
        .unwrap();

    let queue_job = next_queue_job(&h).await;
    let disposition = h.worker.handle(&queue_job).await;
    assert!(matches!(disposition, Disposition::Fail { .. }));

    let orphaned = h.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(orphaned.status, JobStatus::Invalid);
}

#[tokio::test]
async fn template_binding_is_late() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job = schedule_now(&h, &lead, "Initial Email").await;
    assert!(job.template_id.is_none());

    // The template is edited after the job was scheduled.
    TemplateRepository::upsert(
        h.store.as_ref(),
        &EmailTemplate {
            id: "tpl-fresh".to_string(),
            name: "fresh".to_string(),
            subject: "Fresh subject".to_string(),
            html_content: "<p>hi</p>".to_string(),
        },
    )
    .await
    .unwrap();
    let mut settings = open_settings();
    settings.sequence[0] = SequenceStep {
        template_id: Some("tpl-fresh".to_string()),
        ..settings.sequence[0].clone()
    };
    h.settings.update(&settings).await.unwrap();

    let queue_job = next_queue_job(&h).await;
    h.worker.handle(&queue_job).await;

    let requests = h.gateway.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].subject, "Fresh subject");
    assert_eq!(requests[0].html_content, "<p>hi</p>");

    let sent = h.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(sent.template_id.as_deref(), Some("tpl-fresh"));
}

#[tokio::test]
async fn manual_jobs_keep_their_stored_template_and_update_projection() {
    let h = harness().await;
    let lead = seed_lead(&h).await;

    TemplateRepository::upsert(
        h.store.as_ref(),
        &EmailTemplate {
            id: "tpl-manual".to_string(),
            name: "manual".to_string(),
            subject: "Manual subject".to_string(),
            html_content: "<p>manual</p>".to_string(),
        },
    )
    .await
    .unwrap();

    let mut request =
        ScheduleJobRequest::new(lead.id, "manual", JobCategory::Manual, Utc::now());
    request.template_id = Some("tpl-manual".to_string());
    let job = match h.scheduler.schedule_email_job(request).await.unwrap() {
        ScheduleOutcome::Scheduled(job) => job,
        other => panic!("unexpected: {other:?}"),
    };

    let queue_job = next_queue_job(&h).await;
    let disposition = h.worker.handle(&queue_job).await;
    assert!(matches!(disposition, Disposition::Ack));

    let requests = h.gateway.requests();
    assert_eq!(requests[0].subject, "Manual subject");

    let projection = ManualMailRepository::get_for_job(h.store.as_ref(), job.id)
        .await
        .unwrap()
        .expect("manual mail projection");
    assert_eq!(projection.status, JobStatus::Sent);
    assert!(projection.sent_at.is_some());
}

#[tokio::test]
async fn poison_payload_fails_fast() {
    let h = harness().await;
    let queue_job = QueueJob {
        job_id: "poison".to_string(),
        payload: serde_json::json!({"nope": true}),
        receipt_handle: "r".to_string(),
        receive_count: 1,
    };
    let disposition = h.worker.handle(&queue_job).await;
    assert!(matches!(disposition, Disposition::Fail { .. }));
}
