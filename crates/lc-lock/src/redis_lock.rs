//! Redis lock manager
//!
//! SET NX PX for acquisition; Lua scripts for compare-and-delete release and
//! compare-and-pexpire extension so a lock is never released or extended by a
//! foreign owner.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

use crate::{LockError, LockManager, LockToken, Result};

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

const EXTEND_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

pub struct RedisLockManager {
    conn: ConnectionManager,
}

impl RedisLockManager {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LockError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let lock_id = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        // SET key value NX PX millis
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&lock_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if result.is_some() {
            debug!(key = %key, "Acquired scheduling lock");
            Ok(Some(LockToken {
                key: key.to_string(),
                lock_id,
            }))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, token: &LockToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&token.key)
            .arg(&token.lock_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(&token.key)
            .arg(&token.lock_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}
