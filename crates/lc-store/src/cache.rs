//! Analytics cache invalidation
//!
//! Dashboards read pre-aggregated views cached in the coordination store
//! (5 min TTL); the ingest pipeline invalidates the affected keys after each
//! applied event. The cache is an optimisation only — it never feeds back
//! into scheduling decisions.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

use crate::{Result, StoreError};

#[async_trait]
pub trait AnalyticsCache: Send + Sync {
    async fn invalidate_lead(&self, lead_id: Uuid) -> Result<()>;
    async fn invalidate_summary(&self) -> Result<()>;
}

pub struct RedisAnalyticsCache {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisAnalyticsCache {
    pub fn new(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.to_string(),
        }
    }

    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Cache(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Cache(e.to_string()))?;
        Ok(Self::new(conn, key_prefix))
    }
}

#[async_trait]
impl AnalyticsCache for RedisAnalyticsCache {
    async fn invalidate_lead(&self, lead_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = format!("{}:analytics:lead:{}", self.key_prefix, lead_id);
        let _: () = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Cache(e.to_string()))?;
        debug!(key = %key, "Invalidated analytics cache entry");
        Ok(())
    }

    async fn invalidate_summary(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = format!("{}:analytics:summary", self.key_prefix);
        let _: () = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Cache(e.to_string()))?;
        Ok(())
    }
}

/// No-op cache for dev mode; counts invalidations so tests can assert the
/// ingest pipeline touched it.
#[derive(Default)]
pub struct NoopAnalyticsCache {
    invalidations: Mutex<Vec<Uuid>>,
}

impl NoopAnalyticsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidated_leads(&self) -> Vec<Uuid> {
        self.invalidations.lock().clone()
    }
}

#[async_trait]
impl AnalyticsCache for NoopAnalyticsCache {
    async fn invalidate_lead(&self, lead_id: Uuid) -> Result<()> {
        self.invalidations.lock().push(lead_id);
        Ok(())
    }

    async fn invalidate_summary(&self) -> Result<()> {
        Ok(())
    }
}
