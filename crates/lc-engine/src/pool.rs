//! Worker pool runner
//!
//! N workers per queue, each processing one job at a time, with a shared
//! per-second rate limiter gating dispatch across the pool. Rate waits poll
//! rather than block so shutdown stays responsive.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lc_queue::{DelayedQueue, QueueJob};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// What to do with a queue job after handling it.
#[derive(Debug)]
pub enum Disposition {
    /// Done (successfully or decidedly): remove from the queue.
    Ack,
    /// Transient trouble: redeliver after the delay.
    Nack { delay: Duration },
    /// Poison or terminal: route to the failed bucket.
    Fail { reason: String },
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Handle one queue job. Must not panic; errors are expressed through
    /// the returned disposition.
    async fn handle(&self, job: &QueueJob) -> Disposition;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub concurrency: u32,
    pub rate_per_second: u32,
    pub poll_interval: Duration,
}

pub struct WorkerPool {
    queue: Arc<dyn DelayedQueue>,
    processor: Arc<dyn JobProcessor>,
    config: PoolConfig,
    limiter: Arc<DirectLimiter>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn DelayedQueue>,
        processor: Arc<dyn JobProcessor>,
        config: PoolConfig,
    ) -> Self {
        let quota = NonZeroU32::new(config.rate_per_second.max(1)).expect("non-zero rate");
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(quota)));
        Self {
            queue,
            processor,
            config,
            limiter,
        }
    }

    /// Spawn the worker tasks. They drain until `shutdown` flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            pool = %self.config.name,
            concurrency = self.config.concurrency,
            rate_per_second = self.config.rate_per_second,
            "Starting worker pool"
        );

        (0..self.config.concurrency)
            .map(|worker_index| {
                let queue = self.queue.clone();
                let processor = self.processor.clone();
                let limiter = self.limiter.clone();
                let config = self.config.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    run_worker(worker_index, queue, processor, limiter, config, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_worker(
    worker_index: u32,
    queue: Arc<dyn DelayedQueue>,
    processor: Arc<dyn JobProcessor>,
    limiter: Arc<DirectLimiter>,
    config: PoolConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(pool = %config.name, worker = worker_index, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        if !wait_for_rate_permit(&limiter, &mut shutdown).await {
            break;
        }

        let jobs = match queue.poll(1).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(pool = %config.name, error = %e, "Queue poll failed");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        let Some(job) = jobs.into_iter().next() else {
            tokio::time::sleep(config.poll_interval).await;
            continue;
        };

        let disposition = processor.handle(&job).await;
        let outcome = match &disposition {
            Disposition::Ack => queue.ack(&job.receipt_handle).await,
            Disposition::Nack { delay } => queue.nack(&job.receipt_handle, *delay).await,
            Disposition::Fail { reason } => queue.fail(&job.receipt_handle, reason).await,
        };

        match &disposition {
            Disposition::Ack => {
                metrics::counter!("worker.jobs_completed_total", "pool" => config.name.clone())
                    .increment(1);
            }
            Disposition::Nack { .. } => {
                metrics::counter!("worker.jobs_retried_total", "pool" => config.name.clone())
                    .increment(1);
            }
            Disposition::Fail { reason } => {
                warn!(pool = %config.name, job_id = %job.job_id, reason = %reason, "Job routed to failed bucket");
                metrics::counter!("worker.jobs_failed_total", "pool" => config.name.clone())
                    .increment(1);
            }
        }

        if let Err(e) = outcome {
            // Receipt raced the visibility timeout; the job redelivers on
            // its own.
            warn!(pool = %config.name, job_id = %job.job_id, error = %e, "Queue settle failed");
        }
    }

    debug!(pool = %config.name, worker = worker_index, "Worker stopped");
}

/// Poll the shared limiter, staying responsive to shutdown. Returns false
/// when the pool is shutting down.
async fn wait_for_rate_permit(
    limiter: &Arc<DirectLimiter>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *shutdown.borrow() {
            return false;
        }
        if limiter.check().is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lc_queue::InMemoryQueue;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProcessor {
        handled: AtomicU32,
    }

    #[async_trait]
    impl JobProcessor for CountingProcessor {
        async fn handle(&self, _job: &QueueJob) -> Disposition {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Disposition::Ack
        }
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new("t", Duration::from_secs(30), 3));
        for i in 0..5 {
            queue
                .enqueue(&format!("job-{i}"), serde_json::json!({}), Duration::ZERO)
                .await
                .unwrap();
        }

        let processor = Arc::new(CountingProcessor {
            handled: AtomicU32::new(0),
        });
        let pool = WorkerPool::new(
            queue.clone(),
            processor.clone(),
            PoolConfig {
                name: "test".to_string(),
                concurrency: 2,
                rate_per_second: 1000,
                poll_interval: Duration::from_millis(5),
            },
        );

        let (tx, rx) = watch::channel(false);
        let handles = pool.start(rx);

        // Let the pool drain.
        for _ in 0..100 {
            if queue.counts().await.unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(processor.handled.load(Ordering::SeqCst), 5);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl JobProcessor for FailingProcessor {
        async fn handle(&self, _job: &QueueJob) -> Disposition {
            Disposition::Fail {
                reason: "poison".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn failed_dispositions_land_in_failed_bucket() {
        let queue = Arc::new(InMemoryQueue::new("t", Duration::from_secs(30), 3));
        queue
            .enqueue("bad", serde_json::json!({}), Duration::ZERO)
            .await
            .unwrap();

        let pool = WorkerPool::new(
            queue.clone(),
            Arc::new(FailingProcessor),
            PoolConfig {
                name: "test".to_string(),
                concurrency: 1,
                rate_per_second: 1000,
                poll_interval: Duration::from_millis(5),
            },
        );

        let (tx, rx) = watch::channel(false);
        let handles = pool.start(rx);

        for _ in 0..100 {
            if queue.counts().await.unwrap().failed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.counts().await.unwrap().failed, 1);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
