//! LeadCadence all-in-one server
//!
//! Hosts the webhook endpoint, the three worker pools (send, followup,
//! analytics), the recovery pollers and the notification recorder in a
//! single process. `dev_mode = true` swaps PostgreSQL/Redis for the
//! in-memory backends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use lc_common::{DomainEvent, EventBus, Notification};
use lc_config::AppConfig;
use lc_engine::{
    AnalyticsWorker, FollowupWorker, HttpEmailGateway, HttpGatewayConfig, PoolConfig,
    RecoveryConfig, RecoveryPoller, SendWorker, WorkerPool,
};
use lc_ingest::{IngestorParts, WebhookBody, WebhookIngestor};
use lc_lock::{InMemoryLockManager, LockManager, RedisLockManager};
use lc_queue::{
    AnalyticsPayload, DelayedQueue, InMemoryQueue, PostgresQueue, QueueCounts, ANALYTICS_QUEUE,
    EMAIL_SEND_QUEUE, FOLLOWUP_QUEUE,
};
use lc_scheduler::{
    ConditionalTriggerEngine, RetryPolicy, Scheduler, SchedulerConfig,
};
use lc_store::{
    AnalyticsCache, InMemoryStore, NoopAnalyticsCache, NotificationRepository, PostgresStore,
    RedisAnalyticsCache, SettingsCache,
};

/// Every persistence/coordination seam the engine needs, backend-agnostic.
struct Backends {
    leads: Arc<dyn lc_store::LeadRepository>,
    jobs: Arc<dyn lc_store::EmailJobRepository>,
    schedules: Arc<dyn lc_store::ScheduleRepository>,
    manual_mails: Arc<dyn lc_store::ManualMailRepository>,
    processed: Arc<dyn lc_store::ProcessedEventRepository>,
    event_store: Arc<dyn lc_store::EventStore>,
    history: Arc<dyn lc_store::EventHistoryRepository>,
    conditionals: Arc<dyn lc_store::ConditionalEmailRepository>,
    templates: Arc<dyn lc_store::TemplateRepository>,
    notifications: Arc<dyn lc_store::NotificationRepository>,
    settings: Arc<SettingsCache>,
    locks: Arc<dyn LockManager>,
    send_queue: Arc<dyn DelayedQueue>,
    followup_queue: Arc<dyn DelayedQueue>,
    analytics_queue: Arc<dyn DelayedQueue>,
    analytics_cache: Arc<dyn AnalyticsCache>,
}

async fn postgres_backends(config: &AppConfig) -> anyhow::Result<Backends> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .connect(&config.postgres.url)
        .await?;
    info!("Connected to PostgreSQL");

    let store = Arc::new(PostgresStore::new(pool.clone()));
    store.init_schema().await?;
    PostgresQueue::init_schema(&pool).await?;

    let visibility = Duration::from_secs(config.queue.visibility_timeout_secs);
    let max_receives = config.queue.max_receives;
    let queue = |name: &str| -> Arc<dyn DelayedQueue> {
        Arc::new(PostgresQueue::new(pool.clone(), name, visibility, max_receives))
    };

    let locks = Arc::new(RedisLockManager::connect(&config.redis.url).await?);
    let analytics_cache = Arc::new(
        RedisAnalyticsCache::connect(&config.redis.url, &config.redis.key_prefix).await?,
    );
    info!("Connected to Redis");

    Ok(Backends {
        leads: store.clone(),
        jobs: store.clone(),
        schedules: store.clone(),
        manual_mails: store.clone(),
        processed: store.clone(),
        event_store: store.clone(),
        history: store.clone(),
        conditionals: store.clone(),
        templates: store.clone(),
        notifications: store.clone(),
        settings: Arc::new(SettingsCache::with_default_ttl(store)),
        locks,
        send_queue: queue(EMAIL_SEND_QUEUE),
        followup_queue: queue(FOLLOWUP_QUEUE),
        analytics_queue: queue(ANALYTICS_QUEUE),
        analytics_cache,
    })
}

fn memory_backends(config: &AppConfig) -> Backends {
    warn!("Dev mode: in-memory store, queues and locks (single replica only)");
    let store = Arc::new(InMemoryStore::new());
    let visibility = Duration::from_secs(config.queue.visibility_timeout_secs);
    let max_receives = config.queue.max_receives;
    let queue = |name: &str| -> Arc<dyn DelayedQueue> {
        Arc::new(InMemoryQueue::new(name, visibility, max_receives))
    };

    Backends {
        leads: store.clone(),
        jobs: store.clone(),
        schedules: store.clone(),
        manual_mails: store.clone(),
        processed: store.clone(),
        event_store: store.clone(),
        history: store.clone(),
        conditionals: store.clone(),
        templates: store.clone(),
        notifications: store.clone(),
        settings: Arc::new(SettingsCache::with_default_ttl(store)),
        locks: Arc::new(InMemoryLockManager::new()),
        send_queue: queue(EMAIL_SEND_QUEUE),
        followup_queue: queue(FOLLOWUP_QUEUE),
        analytics_queue: queue(ANALYTICS_QUEUE),
        analytics_cache: Arc::new(NoopAnalyticsCache::new()),
    }
}

struct AppState {
    ingest_queue: Arc<dyn DelayedQueue>,
    send_queue: Arc<dyn DelayedQueue>,
    followup_queue: Arc<dyn DelayedQueue>,
}

#[derive(Serialize)]
struct WebhookResponse {
    processed: usize,
    skipped: usize,
}

/// Webhook intake: normalise to the analytics queue and always answer 200 so
/// the gateway never amplifies retries.
async fn brevo_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebhookBody>,
) -> Json<WebhookResponse> {
    let events = body.into_events();
    let mut processed = 0usize;
    let mut skipped = 0usize;

    for event in events {
        // Queue-level dedup keys on (message-id, event); events without a
        // message id get a one-off key and are filtered by the ingestor.
        let job_id = match &event.message_id {
            Some(message_id) => format!("{}:{}", message_id, event.event),
            None => format!("anon:{}", Uuid::new_v4().simple()),
        };
        let payload = AnalyticsPayload {
            event_type: event.event.clone(),
            event_data: match serde_json::to_value(&event) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "Dropping unserialisable webhook event");
                    skipped += 1;
                    continue;
                }
            },
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Dropping unserialisable analytics payload");
                skipped += 1;
                continue;
            }
        };

        match state
            .ingest_queue
            .enqueue(&job_id, payload, Duration::ZERO)
            .await
        {
            Ok(true) => processed += 1,
            Ok(false) => skipped += 1,
            Err(e) => {
                error!(error = %e, "Failed to enqueue webhook event");
                skipped += 1;
            }
        }
    }

    Json(WebhookResponse { processed, skipped })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    queues: HealthQueues,
}

#[derive(Serialize)]
struct HealthQueues {
    send: QueueCounts,
    followup: QueueCounts,
    analytics: QueueCounts,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let send = state.send_queue.counts().await.unwrap_or_default();
    let followup = state.followup_queue.counts().await.unwrap_or_default();
    let analytics = state.ingest_queue.counts().await.unwrap_or_default();

    Json(HealthResponse {
        status: "UP".to_string(),
        queues: HealthQueues {
            send,
            followup,
            analytics,
        },
    })
}

/// Bus subscriber feeding the notifications table on terminal failures.
fn start_notification_recorder(
    bus: &EventBus,
    notifications: Arc<dyn NotificationRepository>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Ok(event) = event else { break };
                    if let DomainEvent::JobStatusChanged { lead_id, email_type, status, .. } = event {
                        if status.is_terminal_failure() {
                            let notification = Notification {
                                id: Uuid::new_v4(),
                                lead_id,
                                kind: status.to_string(),
                                message: format!("{email_type} ended with {status}"),
                                created_at: Utc::now(),
                            };
                            if let Err(e) = notifications.insert(&notification).await {
                                error!(error = %e, "Failed to record notification");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lc_common::logging::init_logging("lc-server");
    info!("Starting LeadCadence server");

    let config = AppConfig::load()?;
    let backends = if config.dev_mode {
        memory_backends(&config)
    } else {
        postgres_backends(&config).await?
    };

    let bus = EventBus::default();

    let scheduler = Arc::new(Scheduler::new(
        backends.leads.clone(),
        backends.jobs.clone(),
        backends.manual_mails.clone(),
        backends.settings.clone(),
        backends.locks.clone(),
        backends.send_queue.clone(),
        bus.clone(),
        SchedulerConfig {
            lock_ttl: Duration::from_secs(config.scheduler.lock_ttl_secs),
            lock_key_prefix: config.redis.key_prefix.clone(),
        },
    ));
    let conditionals = Arc::new(ConditionalTriggerEngine::new(
        backends.conditionals.clone(),
        backends.jobs.clone(),
        scheduler.clone(),
        backends.settings.clone(),
        bus.clone(),
    ));
    let retry_policy = Arc::new(RetryPolicy::new(
        backends.leads.clone(),
        backends.jobs.clone(),
        scheduler.clone(),
        backends.settings.clone(),
        bus.clone(),
    ));

    let ingestor = Arc::new(WebhookIngestor::new(
        IngestorParts {
            leads: backends.leads.clone(),
            jobs: backends.jobs.clone(),
            schedules: backends.schedules.clone(),
            manual_mails: backends.manual_mails.clone(),
            processed: backends.processed.clone(),
            event_store: backends.event_store.clone(),
            history: backends.history.clone(),
            conditionals,
            retry_policy: retry_policy.clone(),
            followup_queue: backends.followup_queue.clone(),
            analytics_cache: backends.analytics_cache.clone(),
            bus: bus.clone(),
        },
        config.ingest.local_dedup_capacity,
    ));

    let gateway = Arc::new(HttpEmailGateway::new(
        HttpGatewayConfig {
            base_url: config.gateway.base_url.clone(),
            connect_timeout: Duration::from_secs(config.gateway.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.gateway.request_timeout_secs),
            credential_cache_ttl: Duration::from_secs(config.gateway.credential_cache_secs),
        },
        backends.settings.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_interval = Duration::from_millis(config.queue.poll_interval_ms);
    let mut worker_handles = Vec::new();

    // Send pool.
    let send_worker = Arc::new(SendWorker::new(
        backends.jobs.clone(),
        backends.leads.clone(),
        backends.templates.clone(),
        backends.manual_mails.clone(),
        backends.history.clone(),
        backends.settings.clone(),
        retry_policy.clone(),
        gateway,
        bus.clone(),
    ));
    worker_handles.extend(
        WorkerPool::new(
            backends.send_queue.clone(),
            send_worker,
            PoolConfig {
                name: EMAIL_SEND_QUEUE.to_string(),
                concurrency: config.worker.send_concurrency,
                rate_per_second: config.worker.send_rate_per_second,
                poll_interval,
            },
        )
        .start(shutdown_rx.clone()),
    );

    // Followup pool.
    worker_handles.extend(
        WorkerPool::new(
            backends.followup_queue.clone(),
            Arc::new(FollowupWorker::new(scheduler.clone())),
            PoolConfig {
                name: FOLLOWUP_QUEUE.to_string(),
                concurrency: config.worker.followup_concurrency,
                rate_per_second: config.worker.followup_rate_per_second,
                poll_interval,
            },
        )
        .start(shutdown_rx.clone()),
    );

    // Analytics pool.
    worker_handles.extend(
        WorkerPool::new(
            backends.analytics_queue.clone(),
            Arc::new(AnalyticsWorker::new(ingestor)),
            PoolConfig {
                name: ANALYTICS_QUEUE.to_string(),
                concurrency: config.worker.analytics_concurrency,
                rate_per_second: config.worker.analytics_rate_per_second,
                poll_interval,
            },
        )
        .start(shutdown_rx.clone()),
    );

    // Recovery sweeps.
    let recovery = Arc::new(RecoveryPoller::new(
        backends.jobs.clone(),
        backends.processed.clone(),
        retry_policy,
        backends.locks.clone(),
        RecoveryConfig {
            stale_send_threshold: Duration::from_secs(
                config.worker.stale_send_threshold_mins * 60,
            ),
            ledger_retention: chrono::Duration::days(config.ingest.ledger_retention_days),
            interval: Duration::from_secs(60),
            lock_key_prefix: config.redis.key_prefix.clone(),
        },
    ));
    worker_handles.push(recovery.start(shutdown_rx.clone()));

    worker_handles.push(start_notification_recorder(
        &bus,
        backends.notifications.clone(),
        shutdown_rx.clone(),
    ));

    // HTTP surface.
    let state = Arc::new(AppState {
        ingest_queue: backends.analytics_queue.clone(),
        send_queue: backends.send_queue.clone(),
        followup_queue: backends.followup_queue.clone(),
    });
    let app = Router::new()
        .route("/webhooks/brevo", post(brevo_webhook))
        .route("/q/health", get(health))
        .route(
            "/q/health/live",
            get(|| async { Json(serde_json::json!({"status": "UP"})) }),
        )
        .route(
            "/q/health/ready",
            get(|| async { Json(serde_json::json!({"status": "UP"})) }),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    info!(%addr, "HTTP server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    info!("Draining workers");
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("LeadCadence server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
}
