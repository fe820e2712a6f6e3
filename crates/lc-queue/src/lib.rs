//! Delayed durable job queues
//!
//! Every queue job carries a stable id (the email job's idempotency key, or a
//! derived key for followup/analytics work); enqueueing a duplicate id is
//! dropped by the queue. Polled jobs become invisible for a visibility
//! timeout and are redelivered unless acked; after `max_receives` attempts a
//! job is routed to the failed bucket.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryQueue;
pub use postgres::PostgresQueue;

/// Queue handling scheduled email dispatches.
pub const EMAIL_SEND_QUEUE: &str = "email-send-queue";
/// Lower-rate queue chaining the next sequence step after a delivery.
pub const FOLLOWUP_QUEUE: &str = "followup-queue";
/// Queue feeding webhook envelopes to the ingestor.
pub const ANALYTICS_QUEUE: &str = "analytics-queue";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Receipt not found: {0}")]
    ReceiptNotFound(String),

    #[error("Queue stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A job handed to a worker. The receipt handle is single-use and scoped to
/// the current visibility window.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub job_id: String,
    pub payload: serde_json::Value,
    pub receipt_handle: String,
    pub receive_count: u32,
}

/// State counts for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable delayed queue seam.
#[async_trait]
pub trait DelayedQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a payload visible after `delay`. Returns false when a job with
    /// the same id already exists (duplicate dropped).
    async fn enqueue(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<bool>;

    /// Claim up to `max_jobs` visible jobs, making them invisible for the
    /// queue's visibility timeout.
    async fn poll(&self, max_jobs: u32) -> Result<Vec<QueueJob>>;

    /// Complete a job.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Return a job to the queue, visible after `delay`. Routes the job to
    /// the failed bucket once `max_receives` is exhausted.
    async fn nack(&self, receipt_handle: &str, delay: Duration) -> Result<()>;

    /// Route a job straight to the failed bucket (poison payloads, terminal
    /// lookups).
    async fn fail(&self, receipt_handle: &str, reason: &str) -> Result<()>;

    async fn counts(&self) -> Result<QueueCounts>;
}

// ============================================================================
// Typed payloads
// ============================================================================

/// `email-send-queue` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendJobPayload {
    pub email_job_id: Uuid,
    pub lead_id: Uuid,
    pub lead_email: String,
    pub email_type: String,
}

/// `followup-queue` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowupPayload {
    pub lead_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_email_job_id: Option<Uuid>,
}

/// `analytics-queue` payload: one raw webhook envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsPayload {
    pub event_type: String,
    pub event_data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_use_wire_field_names() {
        let payload = SendJobPayload {
            email_job_id: Uuid::nil(),
            lead_id: Uuid::nil(),
            lead_email: "a@x".to_string(),
            email_type: "Initial Email".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("emailJobId").is_some());
        assert!(json.get("leadEmail").is_some());

        let followup = FollowupPayload {
            lead_id: Uuid::nil(),
            original_email_job_id: None,
        };
        let json = serde_json::to_value(&followup).unwrap();
        assert!(json.get("originalEmailJobId").is_none());
    }
}
