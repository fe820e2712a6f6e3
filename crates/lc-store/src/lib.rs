//! LeadCadence persistence layer
//!
//! Repository traits over the source-of-truth database with two backends:
//! PostgreSQL (production) and in-memory (dev mode and tests). The in-memory
//! backend implements the same atomic guards (conditional send-attempt claim,
//! unique idempotency keys, the processed-event ledger) so concurrency
//! behaviour is exercised without a database.

use thiserror::Error;

pub mod cache;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod settings_cache;

pub use cache::{AnalyticsCache, NoopAnalyticsCache, RedisAnalyticsCache};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use repository::{
    ConditionalEmailRepository, EmailJobRepository, EventHistoryRepository, EventStore,
    LeadRepository, ManualMailRepository, NotificationRepository, ProcessedEventRepository,
    ScheduleRepository, SettingsRepository, TemplateRepository,
};
pub use settings_cache::SettingsCache;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
