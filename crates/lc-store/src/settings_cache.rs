//! In-process settings cache
//!
//! Settings are runtime-editable but read on every scheduling decision, so
//! reads go through a TTL cache (default 1 h). Writes flow through the cache
//! and invalidate it immediately; cross-replica staleness is bounded by the
//! TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use lc_common::Settings;

use crate::repository::SettingsRepository;
use crate::Result;

pub struct SettingsCache {
    repo: Arc<dyn SettingsRepository>,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Settings)>>,
}

impl SettingsCache {
    pub fn new(repo: Arc<dyn SettingsRepository>, ttl: Duration) -> Self {
        Self {
            repo,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Default 1 h TTL.
    pub fn with_default_ttl(repo: Arc<dyn SettingsRepository>) -> Self {
        Self::new(repo, Duration::from_secs(3600))
    }

    pub async fn get(&self) -> Result<Settings> {
        if let Some((loaded_at, settings)) = self.cached.read().as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(settings.clone());
            }
        }

        let settings = self.repo.get().await?;
        *self.cached.write() = Some((Instant::now(), settings.clone()));
        debug!("Settings cache refreshed");
        Ok(settings)
    }

    pub async fn update(&self, settings: &Settings) -> Result<()> {
        self.repo.update(settings).await?;
        *self.cached.write() = Some((Instant::now(), settings.clone()));
        Ok(())
    }

    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        let store = Arc::new(InMemoryStore::new());
        let cache = SettingsCache::with_default_ttl(store.clone());

        let initial = cache.get().await.unwrap();
        assert_eq!(initial.retry.max_attempts, 5);

        // A write behind the cache's back is invisible until invalidation.
        let mut edited = initial.clone();
        edited.retry.max_attempts = 9;
        SettingsRepository::update(store.as_ref(), &edited)
            .await
            .unwrap();
        assert_eq!(cache.get().await.unwrap().retry.max_attempts, 5);

        cache.invalidate();
        assert_eq!(cache.get().await.unwrap().retry.max_attempts, 9);
    }

    #[tokio::test]
    async fn update_through_cache_is_immediately_visible() {
        let store = Arc::new(InMemoryStore::new());
        let cache = SettingsCache::with_default_ttl(store);

        let mut settings = cache.get().await.unwrap();
        settings.send_rate_per_second = 3;
        cache.update(&settings).await.unwrap();

        assert_eq!(cache.get().await.unwrap().send_rate_per_second, 3);
    }

    #[tokio::test]
    async fn expired_cache_refreshes() {
        let store = Arc::new(InMemoryStore::new());
        let cache = SettingsCache::new(store.clone(), Duration::from_millis(1));

        let _ = cache.get().await.unwrap();
        let mut edited = Settings::default();
        edited.retry.max_attempts = 2;
        SettingsRepository::update(store.as_ref(), &edited)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get().await.unwrap().retry.max_attempts, 2);
    }
}
