//! Background recovery pollers
//!
//! - `StaleSendRecovery`: jobs stuck in `sending` past the threshold (worker
//!   died between claim and gateway settle) are failed and routed through
//!   the retry policy.
//! - `LedgerPruner`: drops processed-event ledger rows older than the
//!   retention window. The audit event store is never pruned.
//!
//! Both sweeps serialise cluster-wide under a coordination-store lock so
//! only one replica runs them at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use lc_common::JobStatus;
use lc_lock::{with_lock, LockManager, WithLockOptions, WithLockOutcome};
use lc_scheduler::{FailureKind, RetryPolicy};
use lc_store::{EmailJobRepository, ProcessedEventRepository};

pub struct RecoveryConfig {
    /// Jobs in `sending` older than this are recovered.
    pub stale_send_threshold: Duration,
    /// Processed-event ledger retention.
    pub ledger_retention: chrono::Duration,
    /// Sweep cadence.
    pub interval: Duration,
    pub lock_key_prefix: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_send_threshold: Duration::from_secs(15 * 60),
            ledger_retention: chrono::Duration::days(7),
            interval: Duration::from_secs(60),
            lock_key_prefix: "lc".to_string(),
        }
    }
}

pub struct RecoveryPoller {
    jobs: Arc<dyn EmailJobRepository>,
    processed: Arc<dyn ProcessedEventRepository>,
    retry_policy: Arc<RetryPolicy>,
    locks: Arc<dyn LockManager>,
    config: RecoveryConfig,
}

impl RecoveryPoller {
    pub fn new(
        jobs: Arc<dyn EmailJobRepository>,
        processed: Arc<dyn ProcessedEventRepository>,
        retry_policy: Arc<RetryPolicy>,
        locks: Arc<dyn LockManager>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            jobs,
            processed,
            retry_policy,
            locks,
            config,
        }
    }

    /// Spawn the periodic sweep task.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.sweep().await {
                    error!(error = %e, "Recovery sweep failed");
                }
            }
            debug!("Recovery poller stopped");
        })
    }

    /// One full sweep: stale sends, then ledger pruning.
    pub async fn sweep(&self) -> anyhow::Result<()> {
        self.recover_stale_sends().await?;
        self.prune_ledger().await?;
        Ok(())
    }

    /// Recover jobs stuck in `sending` beyond the threshold.
    pub async fn recover_stale_sends(&self) -> anyhow::Result<usize> {
        let key = format!("{}:recovery:stale-send", self.config.lock_key_prefix);
        let jobs = self.jobs.clone();
        let retry_policy = self.retry_policy.clone();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_send_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));

        let outcome = with_lock(&self.locks, &key, WithLockOptions::default(), || async move {
            let stale = jobs.find_stale_sending(cutoff).await?;
            let mut recovered = 0usize;

            for job in stale {
                let mut failed = job.clone();
                failed.status = JobStatus::Failed;
                failed.last_error = Some("send attempt timed out".to_string());
                failed.stamp(JobStatus::Failed, Utc::now());
                jobs.update(&failed).await?;

                retry_policy
                    .on_soft_failure(&failed, FailureKind::Failed)
                    .await?;
                recovered += 1;
            }
            anyhow::Ok(recovered)
        })
        .await?;

        match outcome {
            WithLockOutcome::Completed(result) => {
                let recovered = result?;
                if recovered > 0 {
                    info!(count = recovered, "Recovered stale sending jobs");
                    metrics::counter!("recovery.stale_sends_recovered_total")
                        .increment(recovered as u64);
                }
                Ok(recovered)
            }
            WithLockOutcome::Contended => {
                debug!("Stale-send recovery running on another replica");
                Ok(0)
            }
        }
    }

    /// Prune dedup-ledger rows past the retention window.
    pub async fn prune_ledger(&self) -> anyhow::Result<u64> {
        let key = format!("{}:recovery:ledger-prune", self.config.lock_key_prefix);
        let processed = self.processed.clone();
        let cutoff = Utc::now() - self.config.ledger_retention;

        let outcome = with_lock(&self.locks, &key, WithLockOptions::default(), || async move {
            processed.prune_older_than(cutoff).await
        })
        .await?;

        match outcome {
            WithLockOutcome::Completed(result) => {
                let pruned = result?;
                if pruned > 0 {
                    info!(count = pruned, "Pruned processed-event ledger");
                }
                Ok(pruned)
            }
            WithLockOutcome::Contended => Ok(0),
        }
    }
}
