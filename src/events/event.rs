//! # The persisted event record.
//!
//! An [`Event`] is the unit of work: a typed payload plus the lifecycle
//! bookkeeping the dispatch pipeline maintains (status, attempt counters,
//! error history, DLQ timestamp).
//!
//! ## Lifecycle
//! ```text
//! pending ──► processing ──► done
//!                 │
//!                 └────────► dlq ──(administrative retry)──► pending
//! ```
//!
//! Two additional edges exist operationally: `pending → done` when a
//! dispatch admits no handlers, and `processing → pending` when crash
//! recovery resets an in-flight survivor.
//!
//! ## Rules
//! - `retry_count` equals the number of failed attempts recorded so far
//! - `last_error` holds one message per failed attempt, oldest first
//! - `dlq_at` is set exactly when `status = dlq`
//! - `created_at` never changes; `updated_at` follows every state change

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype for event identifiers (version-4 UUID, assigned at publish).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Persisted, waiting for dispatch.
    Pending,
    /// The attempt loop is running.
    Processing,
    /// Delivered (or matched nothing). Terminal unless administratively reset.
    Done,
    /// Retry budget exhausted; preserved with full error history.
    Dlq,
}

impl EventStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Done)        // no admitted handlers
                | (Processing, Done)
                | (Processing, Dlq)
                | (Processing, Pending)  // crash recovery reset
                | (Dlq, Pending) // administrative retry
        )
    }

    /// Is this a terminal state for the dispatch pipeline?
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Done | EventStatus::Dlq)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Done => "done",
            EventStatus::Dlq => "dlq",
        };
        write!(f, "{s}")
    }
}

/// A unit of work tracked by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier.
    pub id: EventId,

    /// Dotted, segmented name (e.g. `order.created`). Non-empty.
    pub event_type: String,

    /// Arbitrary structured value; persisted as JSON text.
    pub payload: serde_json::Value,

    /// Optional short string annotations.
    pub metadata: Option<HashMap<String, String>>,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// Number of failed attempts so far. Zero at publish.
    pub retry_count: u32,

    /// One message per failed attempt, oldest first. `None` until the first
    /// failure; cleared by a DLQ retry.
    pub last_error: Option<Vec<String>>,

    /// Instant of publish. Immutable; retention is computed against this.
    pub created_at: DateTime<Utc>,

    /// Instant of the last state change.
    pub updated_at: DateTime<Utc>,

    /// Instant of entry into the DLQ; `None` otherwise. Informational only.
    pub dlq_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Creates a fresh `pending` event with a new id and current timestamps.
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        metadata: Option<HashMap<String, String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            payload,
            metadata,
            status: EventStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            dlq_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use EventStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Done));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Dlq));
        assert!(Processing.can_transition_to(Pending));
        assert!(Dlq.can_transition_to(Pending));

        assert!(!Done.can_transition_to(Pending));
        assert!(!Done.can_transition_to(Processing));
        assert!(!Dlq.can_transition_to(Done));
        assert!(!Pending.can_transition_to(Dlq));
    }

    #[test]
    fn terminal_states() {
        assert!(EventStatus::Done.is_terminal());
        assert!(EventStatus::Dlq.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
    }

    #[test]
    fn new_event_starts_pending() {
        let ev = Event::new("order.created", serde_json::json!({"id": 1}), None);
        assert_eq!(ev.status, EventStatus::Pending);
        assert_eq!(ev.retry_count, 0);
        assert!(ev.last_error.is_none());
        assert!(ev.dlq_at.is_none());
        assert_eq!(ev.created_at, ev.updated_at);
    }
}
