//! In-process domain event bus
//!
//! The scheduler and ingest pipeline publish here; analytics, notifications
//! and other observers subscribe without referencing each other. Publishing
//! never blocks and never fails: with no subscribers events are simply
//! dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{JobStatus, LeadStatus};

/// Events published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    JobScheduled {
        lead_id: Uuid,
        job_id: Uuid,
        email_type: String,
    },
    EmailSent {
        lead_id: Uuid,
        job_id: Uuid,
        email_type: String,
        message_id: String,
    },
    JobStatusChanged {
        lead_id: Uuid,
        job_id: Uuid,
        email_type: String,
        status: JobStatus,
    },
    LeadStatusChanged {
        lead_id: Uuid,
        status: LeadStatus,
    },
    FollowupsCancelled {
        lead_id: Uuid,
        job_ids: Vec<Uuid>,
        reason: String,
    },
    ConditionalTriggered {
        lead_id: Uuid,
        name: String,
        job_id: Uuid,
    },
    JobRescheduled {
        lead_id: Uuid,
        original_job_id: Uuid,
        successor_job_id: Uuid,
        reason: String,
    },
}

/// Broadcast hub for [`DomainEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: DomainEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let lead_id = Uuid::new_v4();
        bus.publish(DomainEvent::LeadStatusChanged {
            lead_id,
            status: LeadStatus::new("Initial Email", JobStatus::Delivered),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                DomainEvent::LeadStatusChanged { lead_id: got, .. } => {
                    assert_eq!(got, lead_id);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new(8);
        bus.publish(DomainEvent::FollowupsCancelled {
            lead_id: Uuid::new_v4(),
            job_ids: vec![],
            reason: "test".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
