//! In-memory delayed queue for dev mode and tests
//!
//! Mirrors the PostgreSQL queue's visibility semantics exactly, so worker
//! code is exercised unchanged.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{DelayedQueue, QueueCounts, QueueError, QueueJob, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Ready,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct Entry {
    job_id: String,
    payload: serde_json::Value,
    state: State,
    visible_at: DateTime<Utc>,
    receipt_handle: Option<String>,
    receive_count: u32,
    last_error: Option<String>,
}

pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    max_receives: u32,
    entries: Mutex<Vec<Entry>>,
}

impl InMemoryQueue {
    pub fn new(name: &str, visibility_timeout: Duration, max_receives: u32) -> Self {
        Self {
            name: name.to_string(),
            visibility_timeout,
            max_receives,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Test hook: make every delayed job immediately visible.
    pub fn make_all_visible(&self) {
        let now = Utc::now();
        for entry in self.entries.lock().iter_mut() {
            if entry.state == State::Ready && entry.receipt_handle.is_none() {
                entry.visible_at = now;
            }
        }
    }

    /// Test hook: scheduled visibility of a job, if present.
    pub fn visible_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.job_id == job_id)
            .map(|e| e.visible_at)
    }
}

#[async_trait]
impl DelayedQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.job_id == job_id) {
            return Ok(false);
        }
        entries.push(Entry {
            job_id: job_id.to_string(),
            payload,
            state: State::Ready,
            visible_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            receipt_handle: None,
            receive_count: 0,
            last_error: None,
        });
        Ok(true)
    }

    async fn poll(&self, max_jobs: u32) -> Result<Vec<QueueJob>> {
        let now = Utc::now();
        let new_visible_at =
            now + chrono::Duration::from_std(self.visibility_timeout).unwrap_or_else(|_| chrono::Duration::zero());

        let mut entries = self.entries.lock();
        let mut jobs = Vec::new();

        for entry in entries.iter_mut() {
            if jobs.len() >= max_jobs as usize {
                break;
            }
            if entry.state != State::Ready || entry.visible_at > now {
                continue;
            }
            let receipt_handle = Uuid::new_v4().to_string();
            entry.receipt_handle = Some(receipt_handle.clone());
            entry.visible_at = new_visible_at;
            entry.receive_count += 1;

            jobs.push(QueueJob {
                job_id: entry.job_id.clone(),
                payload: entry.payload.clone(),
                receipt_handle,
                receive_count: entry.receive_count,
            });
        }

        Ok(jobs)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::ReceiptNotFound(receipt_handle.to_string()))?;
        entry.state = State::Completed;
        entry.receipt_handle = None;
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay: Duration) -> Result<()> {
        let mut entries = self.entries.lock();
        let max_receives = self.max_receives;
        let entry = entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::ReceiptNotFound(receipt_handle.to_string()))?;

        entry.receipt_handle = None;
        if entry.receive_count >= max_receives {
            entry.state = State::Failed;
        } else {
            entry.visible_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        }
        Ok(())
    }

    async fn fail(&self, receipt_handle: &str, reason: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::ReceiptNotFound(receipt_handle.to_string()))?;
        entry.state = State::Failed;
        entry.last_error = Some(reason.to_string());
        entry.receipt_handle = None;
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let now = Utc::now();
        let entries = self.entries.lock();
        let mut counts = QueueCounts::default();
        for entry in entries.iter() {
            match entry.state {
                State::Ready => {
                    if entry.receipt_handle.is_some() && entry.visible_at > now {
                        counts.active += 1;
                    } else {
                        counts.waiting += 1;
                    }
                }
                State::Completed => counts.completed += 1,
                State::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InMemoryQueue {
        InMemoryQueue::new("test-queue", Duration::from_secs(60), 3)
    }

    #[tokio::test]
    async fn duplicate_job_ids_are_dropped() {
        let q = queue();
        assert!(q
            .enqueue("job-1", serde_json::json!({}), Duration::ZERO)
            .await
            .unwrap());
        assert!(!q
            .enqueue("job-1", serde_json::json!({}), Duration::ZERO)
            .await
            .unwrap());

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn delayed_jobs_are_invisible_until_due() {
        let q = queue();
        q.enqueue("later", serde_json::json!({}), Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(q.poll(10).await.unwrap().is_empty());
        q.make_all_visible();
        assert_eq!(q.poll(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn polled_jobs_are_invisible_until_nack() {
        let q = queue();
        q.enqueue("j", serde_json::json!({}), Duration::ZERO)
            .await
            .unwrap();

        let jobs = q.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(q.poll(10).await.unwrap().is_empty());

        q.nack(&jobs[0].receipt_handle, Duration::ZERO)
            .await
            .unwrap();
        let redelivered = q.poll(10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test]
    async fn ack_completes_a_job() {
        let q = queue();
        q.enqueue("j", serde_json::json!({}), Duration::ZERO)
            .await
            .unwrap();
        let jobs = q.poll(10).await.unwrap();
        q.ack(&jobs[0].receipt_handle).await.unwrap();

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.waiting, 0);
        assert!(q.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_jobs_land_in_failed_bucket() {
        let q = queue();
        q.enqueue("j", serde_json::json!({}), Duration::ZERO)
            .await
            .unwrap();

        for _ in 0..3 {
            let jobs = q.poll(10).await.unwrap();
            assert_eq!(jobs.len(), 1);
            q.nack(&jobs[0].receipt_handle, Duration::ZERO)
                .await
                .unwrap();
        }

        assert!(q.poll(10).await.unwrap().is_empty());
        let counts = q.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn fail_routes_directly_to_failed() {
        let q = queue();
        q.enqueue("poison", serde_json::json!({}), Duration::ZERO)
            .await
            .unwrap();
        let jobs = q.poll(10).await.unwrap();
        q.fail(&jobs[0].receipt_handle, "unparseable payload")
            .await
            .unwrap();

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn stale_receipt_is_rejected() {
        let q = queue();
        let err = q.ack("no-such-receipt").await.unwrap_err();
        assert!(matches!(err, QueueError::ReceiptNotFound(_)));
    }
}
