//! In-process lock manager for dev mode and tests
//!
//! Same semantics as the Redis manager (TTL expiry, owner-checked release)
//! but scoped to one process. Correct only for single-replica deployments.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{LockManager, LockToken, Result};

#[derive(Clone)]
struct Held {
    lock_id: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryLockManager {
    locks: DashMap<String, Held>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let lock_id = Uuid::new_v4().to_string();
        let now = Instant::now();

        // entry() keeps check-and-set atomic across tasks.
        let mut acquired = false;
        self.locks
            .entry(key.to_string())
            .and_modify(|held| {
                if held.expires_at <= now {
                    held.lock_id = lock_id.clone();
                    held.expires_at = now + ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                Held {
                    lock_id: lock_id.clone(),
                    expires_at: now + ttl,
                }
            });

        Ok(acquired.then(|| LockToken {
            key: key.to_string(),
            lock_id,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<bool> {
        let removed = self
            .locks
            .remove_if(&token.key, |_, held| held.lock_id == token.lock_id);
        Ok(removed.is_some())
    }

    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<bool> {
        let mut extended = false;
        if let Some(mut held) = self.locks.get_mut(&token.key) {
            if held.lock_id == token.lock_id {
                held.expires_at = Instant::now() + ttl;
                extended = true;
            }
        }
        Ok(extended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let locks = InMemoryLockManager::new();
        let token = locks
            .acquire("a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(locks.acquire("a", Duration::from_secs(30)).await.unwrap().is_none());
        assert!(locks.release(&token).await.unwrap());
        assert!(locks.acquire("a", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn foreign_release_is_rejected() {
        let locks = InMemoryLockManager::new();
        let token = locks
            .acquire("a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let forged = LockToken {
            key: "a".to_string(),
            lock_id: "someone-else".to_string(),
        };
        assert!(!locks.release(&forged).await.unwrap());
        // Real owner still holds the key.
        assert!(locks.release(&token).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable() {
        let locks = InMemoryLockManager::new();
        let stale = locks
            .acquire("a", Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = locks.acquire("a", Duration::from_secs(30)).await.unwrap();
        assert!(fresh.is_some());
        // The stale token no longer owns the key.
        assert!(!locks.release(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn extend_requires_ownership() {
        let locks = InMemoryLockManager::new();
        let token = locks
            .acquire("a", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        assert!(locks.extend(&token, Duration::from_secs(60)).await.unwrap());

        let forged = LockToken {
            key: "a".to_string(),
            lock_id: "other".to_string(),
        };
        assert!(!locks.extend(&forged, Duration::from_secs(60)).await.unwrap());
    }
}
