//! # Error types used by the bus runtime and handlers.
//!
//! This module defines two main error enums:
//!
//! - [`BusError`] errors surfaced at the bus boundary (publish, subscribe,
//!   DLQ administration, storage).
//! - [`HandlerError`] failures reported by individual handler invocations.
//!
//! Both types provide helper methods `as_label` for metrics.
//! [`HandlerError`] additionally exposes `is_timeout()`.

use std::time::Duration;

use thiserror::Error;

use crate::events::{EventId, EventStatus};

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, BusError>;

/// # Errors surfaced at the bus boundary.
///
/// These represent failures in the bus itself or in its durable store,
/// never failures of user handlers (those are retried and land in the
/// event's error history instead).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// The bus has been drained; new publishes and subscriptions are rejected.
    #[error("bus is shutting down")]
    ShuttingDown,

    /// The payload could not be serialized to JSON. The event was never persisted.
    #[error("payload is not JSON-serializable: {0}")]
    InvalidPayload(String),

    /// The event type was empty at publish.
    #[error("event type must be a non-empty dotted name")]
    InvalidEventType,

    /// No event with this id exists in the store.
    #[error("event not found: {0}")]
    NotFound(EventId),

    /// A DLQ retry was requested for an event that is not in the dead-letter queue.
    #[error("event {id} is not in the dead-letter queue (status: {status})")]
    NotInDlq {
        /// The requested event.
        id: EventId,
        /// The status the event actually has.
        status: EventStatus,
    },

    /// An event status update would violate the lifecycle state machine.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: EventStatus,
        /// Requested status.
        to: EventStatus,
    },

    /// The underlying SQLite store failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::ShuttingDown => "bus_shutting_down",
            BusError::InvalidPayload(_) => "bus_invalid_payload",
            BusError::InvalidEventType => "bus_invalid_event_type",
            BusError::NotFound(_) => "bus_event_not_found",
            BusError::NotInDlq { .. } => "bus_not_in_dlq",
            BusError::InvalidTransition { .. } => "bus_invalid_transition",
            BusError::Storage(_) => "bus_storage",
        }
    }
}

/// # Failures reported by handler invocations.
///
/// A handler either succeeds or fails with a message; the dispatcher stamps
/// the message into the event's error history verbatim, so [`Fail`] renders
/// the bare reason with no prefix.
///
/// [`Fail`]: HandlerError::Fail
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler did not complete within its per-subscription timeout.
    ///
    /// Synthesized by the dispatcher; the losing handler is not cancelled
    /// and may still run to completion in the background.
    #[error("handler timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The handler reported a failure.
    #[error("{reason}")]
    Fail { reason: String },
}

impl HandlerError {
    /// Creates a failure with the given message.
    pub fn fail(reason: impl Into<String>) -> Self {
        HandlerError::Fail {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Timeout { .. } => "handler_timeout",
            HandlerError::Fail { .. } => "handler_failed",
        }
    }

    /// True if this failure was synthesized from a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HandlerError::Timeout { .. })
    }
}
