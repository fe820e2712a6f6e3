//! Raw gateway webhook envelopes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw event as posted by the gateway. The webhook endpoint accepts a
/// single object or an array of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub email: String,
    #[serde(rename = "message-id", default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    /// Event time as a unix timestamp (seconds).
    #[serde(default)]
    pub ts_event: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Single-or-array webhook body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WebhookBody {
    Single(WebhookEvent),
    Batch(Vec<WebhookEvent>),
}

impl WebhookBody {
    pub fn into_events(self) -> Vec<WebhookEvent> {
        match self {
            WebhookBody::Single(event) => vec![event],
            WebhookBody::Batch(events) => events,
        }
    }
}

impl WebhookEvent {
    /// Event time from `ts_event`, falling back to now.
    pub fn event_time(&self) -> DateTime<Utc> {
        self.ts_event
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_batch_bodies_parse() {
        let single: WebhookBody = serde_json::from_str(
            r#"{"event":"delivered","email":"a@x","message-id":"m1","ts_event":1700000000}"#,
        )
        .unwrap();
        assert_eq!(single.into_events().len(), 1);

        let batch: WebhookBody = serde_json::from_str(
            r#"[{"event":"delivered","email":"a@x","message-id":"m1"},
                {"event":"click","email":"a@x","message-id":"m1"}]"#,
        )
        .unwrap();
        assert_eq!(batch.into_events().len(), 2);
    }

    #[test]
    fn event_time_uses_ts_event() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"event":"delivered","email":"a@x","message-id":"m1","ts_event":1700000000}"#,
        )
        .unwrap();
        assert_eq!(event.event_time().timestamp(), 1_700_000_000);
    }

    #[test]
    fn missing_ts_event_falls_back_to_now() {
        let event: WebhookEvent =
            serde_json::from_str(r#"{"event":"delivered","email":"a@x"}"#).unwrap();
        let now = Utc::now();
        assert!((event.event_time() - now).num_seconds().abs() < 5);
    }
}
