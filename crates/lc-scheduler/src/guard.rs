//! Journey guard - duplicate and concurrency prevention per (lead, type)
//!
//! Three predicates compose the admission check, in order:
//! 1. the distributed lock (losing it means another scheduler is evaluating
//!    this journey step right now),
//! 2. has-been-sent (any sibling currently in the successfully-sent set),
//! 3. is-pending (any sibling in the active set).
//!
//! On admission the lock stays held; the caller must release the ticket after
//! persisting (or abandoning) the new job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use lc_lock::{schedule_lock_key, LockManager, LockToken};
use lc_store::EmailJobRepository;

use crate::{Result, SchedulerError};

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Another scheduler holds the (lead, type) lock.
    Concurrent,
    /// A sibling job already reached the successfully-sent set.
    AlreadySent,
    /// A sibling job is still in the active set.
    AlreadyPending,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Concurrent => "concurrent",
            DenyReason::AlreadySent => "already-sent",
            DenyReason::AlreadyPending => "already-pending",
        }
    }
}

/// Held admission: carries the lock until the caller releases it.
#[derive(Debug)]
pub struct ScheduleTicket {
    token: LockToken,
}

#[derive(Debug)]
pub enum Admission {
    Granted(ScheduleTicket),
    Denied(DenyReason),
}

pub struct JourneyGuard {
    jobs: Arc<dyn EmailJobRepository>,
    locks: Arc<dyn LockManager>,
    lock_ttl: Duration,
    key_prefix: String,
}

impl JourneyGuard {
    pub fn new(
        jobs: Arc<dyn EmailJobRepository>,
        locks: Arc<dyn LockManager>,
        lock_ttl: Duration,
        key_prefix: &str,
    ) -> Self {
        Self {
            jobs,
            locks,
            lock_ttl,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// Run the admission check for (lead, type).
    pub async fn admit(&self, lead_id: Uuid, email_type: &str) -> Result<Admission> {
        let key = schedule_lock_key(&self.key_prefix, lead_id, email_type);
        let Some(token) = self.locks.acquire(&key, self.lock_ttl).await? else {
            debug!(lead_id = %lead_id, email_type = %email_type, "Journey locked by another scheduler");
            return Ok(Admission::Denied(DenyReason::Concurrent));
        };

        match self.evaluate(lead_id, email_type).await {
            Ok(None) => Ok(Admission::Granted(ScheduleTicket { token })),
            Ok(Some(reason)) => {
                self.release_token(&token).await;
                Ok(Admission::Denied(reason))
            }
            Err(e) => {
                self.release_token(&token).await;
                Err(e)
            }
        }
    }

    async fn evaluate(&self, lead_id: Uuid, email_type: &str) -> Result<Option<DenyReason>> {
        if self.jobs.has_been_sent(lead_id, email_type).await? {
            return Ok(Some(DenyReason::AlreadySent));
        }
        if self.jobs.find_active(lead_id, email_type).await?.is_some() {
            return Ok(Some(DenyReason::AlreadyPending));
        }
        Ok(None)
    }

    /// Release an admission ticket. Safe to call after any outcome.
    pub async fn release(&self, ticket: ScheduleTicket) {
        self.release_token(&ticket.token).await;
    }

    async fn release_token(&self, token: &LockToken) {
        match self.locks.release(token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %token.key, "Schedule lock already expired at release");
            }
            Err(e) => {
                tracing::warn!(key = %token.key, error = %e, "Failed to release schedule lock");
            }
        }
    }

    /// The worker's claim step: atomically move the job out of the waiting
    /// states into `sending`. Returns false when another worker won.
    pub async fn mark_send_attempt(&self, job_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        self.jobs
            .mark_send_attempt(job_id, at)
            .await
            .map_err(SchedulerError::from)
    }
}
