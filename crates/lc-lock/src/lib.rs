//! Distributed scheduling locks
//!
//! A process-wide mutex keyed `schedule:<leadId>:<type>` held in the
//! coordination store:
//! - Acquire is atomic set-if-absent with a PX TTL, returning a unique token
//! - Release is an atomic compare-and-delete: only the holding token deletes
//! - Extend is an atomic compare-and-pexpire
//!
//! The TTL is a safety fence: if a holder crashes the lock self-expires. It
//! must exceed the worst-case scheduling path (DB round-trips plus the queue
//! enqueue).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

mod memory;
mod redis_lock;

pub use memory::InMemoryLockManager;
pub use redis_lock::RedisLockManager;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        LockError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Token for a held lock. Dropping it does NOT release the lock; callers go
/// through [`LockManager::release`] (or [`with_lock`]) so release stays an
/// explicit, awaited store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub lock_id: String,
}

/// Mutual-exclusion seam over the coordination store.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to acquire `key` once. Returns `None` when held elsewhere.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Compare-and-delete: returns true only when `token` still held the key.
    async fn release(&self, token: &LockToken) -> Result<bool>;

    /// Compare-and-pexpire: returns true when the lease was extended.
    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<bool>;
}

/// Options for [`with_lock`].
#[derive(Debug, Clone)]
pub struct WithLockOptions {
    pub ttl: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for WithLockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
        }
    }
}

/// Outcome of [`with_lock`].
#[derive(Debug)]
pub enum WithLockOutcome<T> {
    Completed(T),
    /// All acquisition attempts found the key held elsewhere.
    Contended,
}

/// Acquire `key` with linear-per-attempt backoff, run `f`, then release in a
/// guaranteed-exit path even when `f` fails.
pub async fn with_lock<M, F, Fut, T, E>(
    manager: &Arc<M>,
    key: &str,
    options: WithLockOptions,
    f: F,
) -> Result<WithLockOutcome<std::result::Result<T, E>>>
where
    M: LockManager + ?Sized,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
{
    let mut token = None;
    for attempt in 0..=options.max_retries {
        match manager.acquire(key, options.ttl).await? {
            Some(t) => {
                token = Some(t);
                break;
            }
            None if attempt < options.max_retries => {
                let backoff = options.base_backoff * (attempt + 1);
                let jitter = Duration::from_millis(rand::random_range(0..=10));
                debug!(key = %key, attempt = attempt + 1, backoff_ms = backoff.as_millis() as u64, "Lock held, backing off");
                tokio::time::sleep(backoff + jitter).await;
            }
            None => {}
        }
    }

    let Some(token) = token else {
        return Ok(WithLockOutcome::Contended);
    };

    let result = f().await;

    match manager.release(&token).await {
        Ok(true) => {}
        Ok(false) => {
            // Lease expired under us; the work may have raced another holder.
            warn!(key = %key, "Lock expired before release");
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to release lock (TTL will reclaim it)");
        }
    }

    Ok(WithLockOutcome::Completed(result))
}

/// Canonical lock key for a (lead, email-type) scheduling decision.
pub fn schedule_lock_key(prefix: &str, lead_id: uuid::Uuid, email_type: &str) -> String {
    format!("{prefix}:schedule:{lead_id}:{email_type}")
}
