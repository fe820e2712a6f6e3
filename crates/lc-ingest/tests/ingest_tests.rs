//! Webhook ingestion end-to-end tests
//!
//! Full pipeline over the in-memory backends: dedup ledger, status
//! hierarchy, followup chaining, conditional triggers, retry policy and the
//! lead aggregate recompute.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use lc_common::{
    BusinessHours, ConditionalEmail, EventBus, EventKind, JobCategory, JobStatus, Lead, Settings,
};
use lc_ingest::{Applied, IngestorParts, SkipReason, WebhookEvent, WebhookIngestor};
use lc_lock::InMemoryLockManager;
use lc_queue::{DelayedQueue, InMemoryQueue, EMAIL_SEND_QUEUE, FOLLOWUP_QUEUE};
use lc_scheduler::{
    ConditionalTriggerEngine, RetryPolicy, ScheduleJobRequest, ScheduleOutcome, Scheduler,
    SchedulerConfig,
};
use lc_store::{
    ConditionalEmailRepository, EmailJobRepository, LeadRepository, NoopAnalyticsCache,
    SettingsCache, SettingsRepository, InMemoryStore,
};

struct Harness {
    store: Arc<InMemoryStore>,
    jobs: Arc<dyn EmailJobRepository>,
    leads: Arc<dyn LeadRepository>,
    followup_queue: Arc<InMemoryQueue>,
    cache: Arc<NoopAnalyticsCache>,
    scheduler: Arc<Scheduler>,
    ingestor: WebhookIngestor,
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
    let send_queue = Arc::new(InMemoryQueue::new(
        EMAIL_SEND_QUEUE,
        Duration::from_secs(60),
        5,
    ));
    let followup_queue = Arc::new(InMemoryQueue::new(
        FOLLOWUP_QUEUE,
        Duration::from_secs(60),
        5,
    ));
    let bus = EventBus::default();
    let cache = Arc::new(NoopAnalyticsCache::new());

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        settings.clone(),
        locks,
        send_queue,
        bus.clone(),
        SchedulerConfig::default(),
    ));
    let conditionals = Arc::new(ConditionalTriggerEngine::new(
        store.clone(),
        store.clone(),
        scheduler.clone(),
        settings.clone(),
        bus.clone(),
    ));
    let retry_policy = Arc::new(RetryPolicy::new(
        store.clone(),
        store.clone(),
        scheduler.clone(),
        settings.clone(),
        bus.clone(),
    ));

    let ingestor = WebhookIngestor::new(
        IngestorParts {
            leads: store.clone(),
            jobs: store.clone(),
            schedules: store.clone(),
            manual_mails: store.clone(),
            processed: store.clone(),
            event_store: store.clone(),
            history: store.clone(),
            conditionals,
            retry_policy,
            followup_queue: followup_queue.clone(),
            analytics_cache: cache.clone(),
            bus,
        },
        1024,
    );

    Harness {
        jobs: store.clone(),
        leads: store.clone(),
        store,
        followup_queue,
        cache,
        scheduler,
        ingestor,
    }
}

async fn seed_lead(h: &Harness) -> Lead {
    let mut lead = Lead::new(&format!("{}@example.com", Uuid::new_v4().simple()));
    lead.timezone = Some("UTC".to_string());
    LeadRepository::insert(h.store.as_ref(), &lead).await.unwrap();
    lead
}

/// Schedule a journey step and move it to `sent` with a gateway message id,
/// as the send worker would leave it.
async fn sent_job(h: &Harness, lead: &Lead, email_type: &str, message_id: &str) -> Uuid {
    let mut request =
        ScheduleJobRequest::new(lead.id, email_type, JobCategory::Initial, Utc::now());
    if email_type != "Initial Email" {
        request.category = JobCategory::Followup;
    }
    let job = match h.scheduler.schedule_email_job(request).await.unwrap() {
        ScheduleOutcome::Scheduled(job) => job,
        ScheduleOutcome::Denied(r) => panic!("denied: {r:?}"),
    };

    let mut sent = h.jobs.get(job.id).await.unwrap().unwrap();
    sent.status = JobStatus::Sent;
    sent.sent_at = Some(Utc::now());
    sent.brevo_message_id = Some(message_id.to_string());
    h.jobs.update(&sent).await.unwrap();
    job.id
}

fn webhook(event: &str, email: &str, message_id: &str) -> WebhookEvent {
    WebhookEvent {
        event: event.to_string(),
        email: email.to_string(),
        message_id: Some(message_id.to_string()),
        date: None,
        ts_event: Some(Utc::now().timestamp()),
        reason: None,
        tag: None,
    }
}

#[tokio::test]
async fn delivered_event_advances_job_and_chains_followup() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job_id = sent_job(&h, &lead, "Initial Email", "m1").await;

    let applied = h
        .ingestor
        .apply_event(&webhook("delivered", &lead.email, "m1"))
        .await
        .unwrap();
    assert!(matches!(applied, Applied::Applied { .. }));

    let job = h.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delivered);
    assert!(job.delivered_at.is_some());

    // Followup scheduling was queued for the async chain.
    let followups = h.followup_queue.poll(10).await.unwrap();
    assert_eq!(followups.len(), 1);

    // Lead aggregate reflects the delivery.
    let lead = h.leads.get(lead.id).await.unwrap().unwrap();
    assert_eq!(lead.status.unwrap().to_string(), "Initial Email:delivered");

    // Analytics cache was invalidated for the lead.
    assert_eq!(h.cache.invalidated_leads(), vec![job.lead_id]);
}

#[tokio::test]
async fn duplicate_webhook_is_dropped() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job_id = sent_job(&h, &lead, "Initial Email", "m1").await;

    let event = webhook("delivered", &lead.email, "m1");
    let summary = h
        .ingestor
        .ingest_batch(&[event.clone(), event.clone()])
        .await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.skipped, 1);

    let job = h.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delivered);

    // No duplicate followup chain either.
    let followups = h.followup_queue.poll(10).await.unwrap();
    assert_eq!(followups.len(), 1);

    // Replaying later is still a no-op: the ledger is durable.
    let replay = h.ingestor.apply_event(&event).await.unwrap();
    assert!(matches!(replay, Applied::Skipped(SkipReason::Duplicate)));
}

#[tokio::test]
async fn status_never_downgrades() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job_id = sent_job(&h, &lead, "Initial Email", "m1").await;

    h.ingestor
        .apply_event(&webhook("click", &lead.email, "m1"))
        .await
        .unwrap();
    // A late `opened` still lands (timestamp) but cannot pull the status
    // back down the hierarchy.
    h.ingestor
        .apply_event(&webhook("opened", &lead.email, "m1"))
        .await
        .unwrap();

    let job = h.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Clicked);
    assert!(job.opened_at.is_some());
    assert!(job.clicked_at.is_some());
}

#[tokio::test]
async fn engagement_counters_increment_once() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    sent_job(&h, &lead, "Initial Email", "m1").await;

    h.ingestor
        .apply_event(&webhook("unique_opened", &lead.email, "m1"))
        .await
        .unwrap();
    // A second (non-unique) open of the same message does not re-count.
    h.ingestor
        .apply_event(&webhook("opened", &lead.email, "m1"))
        .await
        .unwrap();

    let lead = h.leads.get(lead.id).await.unwrap().unwrap();
    assert_eq!(lead.emails_opened, 1);
}

#[tokio::test]
async fn soft_bounce_triggers_retry_with_successor() {
    let h = harness().await;
    let lead = seed_lead(&h).await;
    let job_id = sent_job(&h, &lead, "Initial Email", "m1").await;

    h.ingestor
        .apply_event(&webhook("soft_bounce", &lead.email, "m1"))
        .await
        .unwrap();

    let original = h.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(original.status, JobStatus::Rescheduled);
    assert!(original.metadata.rescheduled);
    assert!(original.bounced_at.is_some());

    let jobs = h.jobs.list_for_lead(lead.id).await.unwrap();
    let successor = jobs
        .iter()
        .find(|j| j.id != job_id && j.email_type == "Initial Email")
        .expect("successor scheduled");
    assert_eq!(successor.retry_count, 1);
    assert_eq!(
        successor.metadata.retry_reason.as_deref(),
        Some("soft_bounce")
    );
    let expected = Utc::now() + chrono::Duration::hours(2);
    assert!((successor.scheduled_for - expected).num_minutes().abs() <= 2);
}

#[tokio::test]
async fn hard_bounce_is_terminal() {
    let h = harness().await;
    let lead = seed_lead(&h).await;

    // A conditional that must NOT fire on a bounce.
    ConditionalEmailRepository::insert(
        h.store.as_ref(),
        &ConditionalEmail {
            id: Uuid::new_v4(),
            name: "never".to_string(),
            trigger_event: EventKind::Clicked,
            trigger_step: None,
            delay_hours: 1,
            template_id: None,
            cancel_pending: false,
            priority: 0,
            enabled: true,
        },
    )
    .await
    .unwrap();

    let job_id = sent_job(&h, &lead, "Initial Email", "m1").await;
    // Clear sent_at to verify the failure back-fill.
    let mut job = h.jobs.get(job_id).await.unwrap().unwrap();
    job.sent_at = None;
    h.jobs.update(&job).await.unwrap();

    h.ingestor
        .apply_event(&webhook("hard_bounce", &lead.email, "m1"))
        .await
        .unwrap();

    let job = h.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::HardBounce);
    // Gateway accepted before failing: sent_at is back-filled.
    assert!(job.sent_at.is_some());
    assert!(job.bounced_at.is_some());

    // Terminal: no successor.
    let jobs = h.jobs.list_for_lead(lead.id).await.unwrap();
    assert_eq!(jobs.len(), 1);

    let lead = h.leads.get(lead.id).await.unwrap().unwrap();
    assert_eq!(lead.status.unwrap().to_string(), "Initial Email:hard_bounce");
    assert_eq!(lead.emails_bounced, 1);
}

#[tokio::test]
async fn clicked_event_fires_conditional_and_cancels_followups() {
    let h = harness().await;
    let lead = seed_lead(&h).await;

    let conditional = ConditionalEmail {
        id: Uuid::new_v4(),
        name: "hot-lead".to_string(),
        trigger_event: EventKind::Clicked,
        trigger_step: None,
        delay_hours: 1,
        template_id: None,
        cancel_pending: true,
        priority: 0,
        enabled: true,
    };
    ConditionalEmailRepository::insert(h.store.as_ref(), &conditional)
        .await
        .unwrap();

    let initial_id = sent_job(&h, &lead, "Initial Email", "m1").await;

    // Pending followup in flight.
    let pending = match h
        .scheduler
        .schedule_email_job(ScheduleJobRequest::new(
            lead.id,
            "First Followup",
            JobCategory::Followup,
            Utc::now() + chrono::Duration::days(2),
        ))
        .await
        .unwrap()
    {
        ScheduleOutcome::Scheduled(job) => job,
        other => panic!("unexpected: {other:?}"),
    };

    h.ingestor
        .apply_event(&webhook("click", &lead.email, "m1"))
        .await
        .unwrap();

    let cancelled = h.jobs.get(pending.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let jobs = h.jobs.list_for_lead(lead.id).await.unwrap();
    let conditional_job = jobs
        .iter()
        .find(|j| j.email_type == "conditional:hot-lead")
        .expect("conditional scheduled");
    assert_eq!(conditional_job.metadata.source_job_id, Some(initial_id));
    assert_eq!(
        conditional_job.metadata.cancelled_followups,
        vec![pending.id]
    );

    // The aggregate reflects the conditional step, which participates in
    // the recompute because the trigger ran first.
    let lead = h.leads.get(lead.id).await.unwrap().unwrap();
    let status = lead.status.unwrap();
    assert_eq!(status.step, "conditional:hot-lead");
    assert!(matches!(
        status.state,
        JobStatus::Scheduled | JobStatus::Queued
    ));
}

#[tokio::test]
async fn unknown_events_and_missing_ids_are_skipped() {
    let h = harness().await;

    let unknown = h
        .ingestor
        .apply_event(&webhook("proxy_open_v2", "a@x", "m1"))
        .await
        .unwrap();
    assert!(matches!(
        unknown,
        Applied::Skipped(SkipReason::UnknownEvent)
    ));

    let mut event = webhook("delivered", "a@x", "m1");
    event.message_id = None;
    let missing = h.ingestor.apply_event(&event).await.unwrap();
    assert!(matches!(
        missing,
        Applied::Skipped(SkipReason::MissingMessageId)
    ));
}

#[tokio::test]
async fn unmatched_event_does_not_burn_the_ledger() {
    let h = harness().await;
    let lead = seed_lead(&h).await;

    // Event arrives before any job exists for this recipient.
    let early = h
        .ingestor
        .apply_event(&webhook("delivered", &lead.email, "m9"))
        .await
        .unwrap();
    assert!(matches!(early, Applied::Skipped(SkipReason::JobNotFound)));

    // Once the job exists, the gateway's retry of the same event lands.
    let job_id = sent_job(&h, &lead, "Initial Email", "m9").await;
    let retry = h
        .ingestor
        .apply_event(&webhook("delivered", &lead.email, "m9"))
        .await
        .unwrap();
    assert!(matches!(retry, Applied::Applied { .. }));

    let job = h.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delivered);
}

#[tokio::test]
async fn fallback_lookup_matches_by_recipient() {
    let h = harness().await;
    let lead = seed_lead(&h).await;

    // Job was sent but the gateway message id never landed on it.
    let job_id = sent_job(&h, &lead, "Initial Email", "m1").await;
    let mut job = h.jobs.get(job_id).await.unwrap().unwrap();
    job.brevo_message_id = None;
    h.jobs.update(&job).await.unwrap();

    h.ingestor
        .apply_event(&webhook("delivered", &lead.email, "m-unknown"))
        .await
        .unwrap();

    let job = h.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delivered);
}

#[tokio::test]
async fn spam_and_complaint_map_to_distinct_states() {
    let h = harness().await;
    let lead_a = seed_lead(&h).await;
    let lead_b = seed_lead(&h).await;
    let spam_job = sent_job(&h, &lead_a, "Initial Email", "m-spam").await;
    let complaint_job = sent_job(&h, &lead_b, "Initial Email", "m-complaint").await;

    h.ingestor
        .apply_event(&webhook("spam", &lead_a.email, "m-spam"))
        .await
        .unwrap();
    h.ingestor
        .apply_event(&webhook("complaint", &lead_b.email, "m-complaint"))
        .await
        .unwrap();

    assert_eq!(
        h.jobs.get(spam_job).await.unwrap().unwrap().status,
        JobStatus::Spam
    );
    assert_eq!(
        h.jobs.get(complaint_job).await.unwrap().unwrap().status,
        JobStatus::Complaint
    );
}
