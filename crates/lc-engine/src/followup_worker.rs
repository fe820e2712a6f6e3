//! Followup worker
//!
//! Consumes the followup queue so delivery events can chain the next
//! sequence step without blocking webhook ingestion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use lc_common::JobStatus;
use lc_queue::{FollowupPayload, QueueJob};
use lc_scheduler::Scheduler;

use crate::pool::{Disposition, JobProcessor};

pub struct FollowupWorker {
    scheduler: Arc<Scheduler>,
}

impl FollowupWorker {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl JobProcessor for FollowupWorker {
    async fn handle(&self, queue_job: &QueueJob) -> Disposition {
        let payload: FollowupPayload = match serde_json::from_value(queue_job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return Disposition::Fail {
                    reason: format!("unparseable followup payload: {e}"),
                }
            }
        };

        match self
            .scheduler
            .schedule_next_email(payload.lead_id, JobStatus::Pending)
            .await
        {
            Ok(Some(job)) => {
                debug!(lead_id = %payload.lead_id, job_id = %job.id, email_type = %job.email_type, "Followup chained");
                Disposition::Ack
            }
            // Nothing to do (journey busy, exhausted, or lost the lock race):
            // the next delivery event re-evaluates.
            Ok(None) => Disposition::Ack,
            Err(e) => {
                warn!(lead_id = %payload.lead_id, error = %e, "Followup scheduling failed, retrying");
                Disposition::Nack {
                    delay: Duration::from_secs(30),
                }
            }
        }
    }
}
