//! Durable storage: the persistence contract and its SQLite engine.
//!
//! The dispatch pipeline depends only on [`EventStore`], a narrow operation
//! set over the event and subscription tables. [`SqliteStore`] is the
//! shipped implementation; alternative backends implement the same trait.

mod sqlite;

use chrono::{DateTime, Utc};

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::events::{Event, EventId, EventStatus};
use crate::handlers::{SubscriptionId, SubscriptionRecord};

/// The persistence contract the core consumes.
///
/// ## Rules
/// - Implementations sharing one underlying connection must synchronize
///   internally; the bus calls these methods from any dispatch.
/// - After [`close`](EventStore::close), writes become silent no-ops and
///   reads report not-found/empty. Abandoned post-shutdown handler work must
///   never surface a closed-store error.
/// - `update_status` enforces the event lifecycle and fails with
///   `InvalidTransition` on a forbidden edge.
pub trait EventStore: Send + Sync + 'static {
    /// Persists a new event exactly as given (status included).
    fn insert_event(&self, event: &Event) -> Result<()>;

    /// Fetches an event by id.
    fn get_event(&self, id: EventId) -> Result<Event>;

    /// Moves an event to `status`, stamping `updated_at`.
    fn update_status(&self, id: EventId, status: EventStatus) -> Result<()>;

    /// Writes the failed-attempt counter and error history through.
    ///
    /// An empty history is stored as NULL.
    fn update_retry(&self, id: EventId, retry_count: u32, errors: &[String]) -> Result<()>;

    /// Moves an event to the DLQ: status, `dlq_at`, `last_error` and
    /// `updated_at` change atomically.
    fn move_to_dlq(&self, id: EventId, errors: &[String]) -> Result<()>;

    /// All events currently in `status`, oldest first. Used by crash recovery.
    fn events_by_status(&self, status: EventStatus) -> Result<Vec<Event>>;

    /// Writes a subscription traceability row.
    fn insert_subscription(&self, record: &SubscriptionRecord) -> Result<()>;

    /// Deletes a subscription row. Idempotent.
    fn delete_subscription(&self, id: SubscriptionId) -> Result<()>;

    /// All subscription rows, oldest first.
    fn list_subscriptions(&self) -> Result<Vec<SubscriptionRecord>>;

    /// DLQ page, newest `created_at` first.
    fn list_dlq(&self, offset: usize, limit: usize) -> Result<Vec<Event>>;

    /// Number of events in the DLQ.
    fn count_dlq(&self) -> Result<usize>;

    /// Administrative retry: resets a DLQ event to
    /// `{pending, retry_count: 0, last_error: null, dlq_at: null}`.
    ///
    /// Fails with `NotFound` for unknown ids and `NotInDlq` for events in
    /// any other status.
    fn reset_dlq_event(&self, id: EventId) -> Result<()>;

    /// Deletes DLQ events whose `created_at` is at or before `cutoff`.
    /// Returns the number deleted. Retention never consults `dlq_at`.
    fn purge_dlq(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Closes the store. Later writes are tolerated as no-ops.
    fn close(&self);
}
