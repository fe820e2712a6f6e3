//! Analytics worker
//!
//! Drains webhook envelopes off the analytics queue and feeds them to the
//! ingestor. Hard ingest errors rewound the dedup ledger, so a NACK retry is
//! safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use lc_ingest::{WebhookEvent, WebhookIngestor};
use lc_queue::{AnalyticsPayload, QueueJob};

use crate::pool::{Disposition, JobProcessor};

pub struct AnalyticsWorker {
    ingestor: Arc<WebhookIngestor>,
}

impl AnalyticsWorker {
    pub fn new(ingestor: Arc<WebhookIngestor>) -> Self {
        Self { ingestor }
    }
}

#[async_trait]
impl JobProcessor for AnalyticsWorker {
    async fn handle(&self, queue_job: &QueueJob) -> Disposition {
        let payload: AnalyticsPayload = match serde_json::from_value(queue_job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return Disposition::Fail {
                    reason: format!("unparseable analytics payload: {e}"),
                }
            }
        };

        let event: WebhookEvent = match serde_json::from_value(payload.event_data) {
            Ok(event) => event,
            Err(e) => {
                return Disposition::Fail {
                    reason: format!("unparseable webhook event: {e}"),
                }
            }
        };

        match self.ingestor.apply_event(&event).await {
            Ok(_) => Disposition::Ack,
            Err(e) => {
                warn!(event = %event.event, email = %event.email, error = %e, "Ingest failed, retrying");
                Disposition::Nack {
                    delay: Duration::from_secs(15),
                }
            }
        }
    }
}
