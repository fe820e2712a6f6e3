//! Job status hierarchy and gateway event kinds
//!
//! The status hierarchy is the backbone of the lifecycle engine: a job may
//! only move to a status of equal or higher rank, or to a status outside the
//! hierarchy (errors and terminal states). The same ranks order lead event
//! history and decide which webhook events are worth recording.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an [`EmailJob`](crate::EmailJob).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Scheduled,
    Sending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    SoftBounce,
    HardBounce,
    Deferred,
    Blocked,
    Spam,
    Error,
    Invalid,
    Failed,
    Unsubscribed,
    Complaint,
    Dead,
    Rescheduled,
    Cancelled,
    Skipped,
}

impl JobStatus {
    /// Position in the delivery hierarchy. `None` means the status sits
    /// outside the hierarchy (errors, cancellations, terminal lead states)
    /// and is always accepted as a transition target.
    pub fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::Scheduled => Some(1),
            JobStatus::Queued => Some(2),
            JobStatus::Sending => Some(2),
            JobStatus::Sent => Some(3),
            JobStatus::Delivered => Some(4),
            JobStatus::Opened => Some(5),
            JobStatus::Clicked => Some(6),
            JobStatus::SoftBounce => Some(7),
            JobStatus::HardBounce
            | JobStatus::Failed
            | JobStatus::Blocked
            | JobStatus::Spam => Some(8),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// Accepted when the new rank is >= the current rank, or when the new
    /// status is outside the hierarchy. Downgrades are rejected.
    pub fn accepts(&self, next: JobStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(new)) => new >= current,
            // Target outside the hierarchy: always accepted.
            (_, None) => true,
            // Current outside the hierarchy (terminal/cancelled): frozen.
            (None, Some(_)) => false,
        }
    }

    /// The "active set": jobs still owned by the scheduler/queue and not yet
    /// handed to the gateway.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Queued | JobStatus::Scheduled | JobStatus::Sending
        )
    }

    /// The "successfully sent" set used by the journey guard: once any job of
    /// a (lead, type) pair is in this set, no sibling may be dispatched.
    pub fn is_sent(&self) -> bool {
        matches!(
            self,
            JobStatus::Sending
                | JobStatus::Sent
                | JobStatus::Delivered
                | JobStatus::Opened
                | JobStatus::Clicked
        )
    }

    /// The "processed set": statuses from which a worker must not dispatch.
    pub fn is_processed(&self) -> bool {
        matches!(
            self,
            JobStatus::Sending
                | JobStatus::Sent
                | JobStatus::Delivered
                | JobStatus::Opened
                | JobStatus::Clicked
                | JobStatus::HardBounce
                | JobStatus::Blocked
                | JobStatus::Spam
                | JobStatus::Cancelled
                | JobStatus::Dead
                | JobStatus::Unsubscribed
                | JobStatus::Complaint
                | JobStatus::Failed
        )
    }

    /// Hard failures: non-retriable, propagate to the lead-terminal state.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            JobStatus::HardBounce
                | JobStatus::Blocked
                | JobStatus::Spam
                | JobStatus::Unsubscribed
                | JobStatus::Complaint
                | JobStatus::Invalid
                | JobStatus::Dead
        )
    }

    /// Soft failures handled by the retry/reschedule policy.
    pub fn is_retryable_failure(&self) -> bool {
        matches!(
            self,
            JobStatus::SoftBounce | JobStatus::Deferred | JobStatus::Failed
        )
    }

    /// Whether this job participates in unique per-(lead, type) journey
    /// analytics. Rescheduled jobs are superseded and excluded.
    pub fn counts_for_journey(&self) -> bool {
        !matches!(self, JobStatus::Rescheduled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Sending => "sending",
            JobStatus::Sent => "sent",
            JobStatus::Delivered => "delivered",
            JobStatus::Opened => "opened",
            JobStatus::Clicked => "clicked",
            JobStatus::SoftBounce => "soft_bounce",
            JobStatus::HardBounce => "hard_bounce",
            JobStatus::Deferred => "deferred",
            JobStatus::Blocked => "blocked",
            JobStatus::Spam => "spam",
            JobStatus::Error => "error",
            JobStatus::Invalid => "invalid",
            JobStatus::Failed => "failed",
            JobStatus::Unsubscribed => "unsubscribed",
            JobStatus::Complaint => "complaint",
            JobStatus::Dead => "dead",
            JobStatus::Rescheduled => "rescheduled",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "pending" => JobStatus::Pending,
            "queued" => JobStatus::Queued,
            "scheduled" => JobStatus::Scheduled,
            "sending" => JobStatus::Sending,
            "sent" => JobStatus::Sent,
            "delivered" => JobStatus::Delivered,
            "opened" => JobStatus::Opened,
            "clicked" => JobStatus::Clicked,
            "soft_bounce" => JobStatus::SoftBounce,
            "hard_bounce" => JobStatus::HardBounce,
            "deferred" => JobStatus::Deferred,
            "blocked" => JobStatus::Blocked,
            "spam" => JobStatus::Spam,
            "error" => JobStatus::Error,
            "invalid" => JobStatus::Invalid,
            "failed" => JobStatus::Failed,
            "unsubscribed" => JobStatus::Unsubscribed,
            "complaint" => JobStatus::Complaint,
            "dead" => JobStatus::Dead,
            "rescheduled" => JobStatus::Rescheduled,
            "cancelled" => JobStatus::Cancelled,
            "skipped" => JobStatus::Skipped,
            _ => return None,
        };
        Some(status)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised gateway engagement/delivery event.
///
/// The webhook mapping layer is the single place that chooses a status for an
/// ambiguous gateway event. In particular `spam` and `complaint` stay
/// distinct terminal states here; nothing downstream re-maps one to the
/// other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Sent,
    Delivered,
    Opened,
    UniqueOpened,
    Clicked,
    SoftBounce,
    HardBounce,
    Deferred,
    Blocked,
    Spam,
    Complaint,
    Unsubscribed,
    Invalid,
    Error,
}

impl EventKind {
    /// Normalise a raw gateway event name. Returns `None` for events the
    /// engine does not track.
    pub fn from_gateway(raw: &str) -> Option<Self> {
        let kind = match raw.trim().to_ascii_lowercase().as_str() {
            "request" | "requests" | "sent" => EventKind::Sent,
            "delivered" => EventKind::Delivered,
            "open" | "opened" => EventKind::Opened,
            "unique_opened" | "first_opening" => EventKind::UniqueOpened,
            "click" | "clicked" => EventKind::Clicked,
            "softbounce" | "soft_bounce" => EventKind::SoftBounce,
            "hardbounce" | "hard_bounce" => EventKind::HardBounce,
            "deferred" => EventKind::Deferred,
            "blocked" => EventKind::Blocked,
            "spam" => EventKind::Spam,
            "complaint" => EventKind::Complaint,
            "unsubscribe" | "unsubscribed" => EventKind::Unsubscribed,
            "invalid" | "invalid_email" => EventKind::Invalid,
            "error" => EventKind::Error,
            _ => return None,
        };
        Some(kind)
    }

    /// Job status this event drives the job towards.
    pub fn job_status(&self) -> JobStatus {
        match self {
            EventKind::Sent => JobStatus::Sent,
            EventKind::Delivered => JobStatus::Delivered,
            EventKind::Opened | EventKind::UniqueOpened => JobStatus::Opened,
            EventKind::Clicked => JobStatus::Clicked,
            EventKind::SoftBounce => JobStatus::SoftBounce,
            EventKind::HardBounce => JobStatus::HardBounce,
            EventKind::Deferred => JobStatus::Deferred,
            EventKind::Blocked => JobStatus::Blocked,
            EventKind::Spam => JobStatus::Spam,
            EventKind::Complaint => JobStatus::Complaint,
            EventKind::Unsubscribed => JobStatus::Unsubscribed,
            EventKind::Invalid => JobStatus::Invalid,
            EventKind::Error => JobStatus::Failed,
        }
    }

    /// Events that fire the conditional trigger engine.
    pub fn triggers_conditionals(&self) -> bool {
        matches!(
            self,
            EventKind::Delivered
                | EventKind::Opened
                | EventKind::UniqueOpened
                | EventKind::Clicked
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Sent => "sent",
            EventKind::Delivered => "delivered",
            EventKind::Opened => "opened",
            EventKind::UniqueOpened => "unique_opened",
            EventKind::Clicked => "clicked",
            EventKind::SoftBounce => "soft_bounce",
            EventKind::HardBounce => "hard_bounce",
            EventKind::Deferred => "deferred",
            EventKind::Blocked => "blocked",
            EventKind::Spam => "spam",
            EventKind::Complaint => "complaint",
            EventKind::Unsubscribed => "unsubscribed",
            EventKind::Invalid => "invalid",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_ordering_matches_hierarchy() {
        assert!(JobStatus::Scheduled.rank() < JobStatus::Queued.rank());
        assert!(JobStatus::Queued.rank() <= JobStatus::Sending.rank());
        assert!(JobStatus::Sending.rank() < JobStatus::Sent.rank());
        assert!(JobStatus::Sent.rank() < JobStatus::Delivered.rank());
        assert!(JobStatus::Delivered.rank() < JobStatus::Opened.rank());
        assert!(JobStatus::Opened.rank() < JobStatus::Clicked.rank());
        assert!(JobStatus::Clicked.rank() < JobStatus::SoftBounce.rank());
        assert!(JobStatus::SoftBounce.rank() < JobStatus::HardBounce.rank());
        assert_eq!(JobStatus::HardBounce.rank(), JobStatus::Failed.rank());
    }

    #[test]
    fn no_downgrade() {
        assert!(!JobStatus::Delivered.accepts(JobStatus::Sent));
        assert!(!JobStatus::Clicked.accepts(JobStatus::Opened));
        assert!(JobStatus::Delivered.accepts(JobStatus::Delivered));
        assert!(JobStatus::Sent.accepts(JobStatus::Opened));
    }

    #[test]
    fn out_of_hierarchy_always_accepted() {
        assert!(JobStatus::Delivered.accepts(JobStatus::Cancelled));
        assert!(JobStatus::Clicked.accepts(JobStatus::Unsubscribed));
        assert!(JobStatus::Sent.accepts(JobStatus::Rescheduled));
    }

    #[test]
    fn cancelled_is_frozen() {
        assert!(!JobStatus::Cancelled.accepts(JobStatus::Sent));
        assert!(!JobStatus::Rescheduled.accepts(JobStatus::Delivered));
    }

    #[test]
    fn processed_set_matches_glossary() {
        for status in [
            JobStatus::Sending,
            JobStatus::Sent,
            JobStatus::Delivered,
            JobStatus::Opened,
            JobStatus::Clicked,
            JobStatus::HardBounce,
            JobStatus::Blocked,
            JobStatus::Spam,
            JobStatus::Cancelled,
            JobStatus::Dead,
            JobStatus::Unsubscribed,
            JobStatus::Complaint,
            JobStatus::Failed,
        ] {
            assert!(status.is_processed(), "{status} should be processed");
        }
        assert!(!JobStatus::Pending.is_processed());
        assert!(!JobStatus::SoftBounce.is_processed());
        assert!(!JobStatus::Rescheduled.is_processed());
    }

    #[test]
    fn gateway_normalisation() {
        assert_eq!(EventKind::from_gateway("requests"), Some(EventKind::Sent));
        assert_eq!(EventKind::from_gateway("click"), Some(EventKind::Clicked));
        assert_eq!(
            EventKind::from_gateway("softbounce"),
            Some(EventKind::SoftBounce)
        );
        assert_eq!(
            EventKind::from_gateway("unique_opened"),
            Some(EventKind::UniqueOpened)
        );
        assert_eq!(EventKind::from_gateway("no_such_event"), None);
    }

    #[test]
    fn spam_and_complaint_stay_distinct() {
        assert_eq!(
            EventKind::from_gateway("spam").unwrap().job_status(),
            JobStatus::Spam
        );
        assert_eq!(
            EventKind::from_gateway("complaint").unwrap().job_status(),
            JobStatus::Complaint
        );
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::SoftBounce,
            JobStatus::Rescheduled,
            JobStatus::Skipped,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }
}
