//! # Dead-letter queue administration.
//!
//! [`DlqReader`] is a thin reader over the same durable store the dispatch
//! pipeline writes to. It lists dead-lettered events, resets them for
//! another delivery attempt, and purges old ones.
//!
//! ## Rules
//! - Retention (`purge`) is computed against `created_at`, never `dlq_at`.
//! - `retry` resets the row to `{pending, retry_count: 0, last_error: null,
//!   dlq_at: null}`; it does not dispatch. Unknown ids surface `NotFound`,
//!   wrong statuses surface `NotInDlq`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::events::{Event, EventId};
use crate::storage::EventStore;

/// Administrative reader over the dead-letter queue.
#[derive(Clone)]
pub struct DlqReader {
    store: Arc<dyn EventStore>,
    page: usize,
}

impl DlqReader {
    pub(crate) fn new(store: Arc<dyn EventStore>, page: usize) -> Self {
        Self { store, page }
    }

    /// One page of dead-lettered events, newest `created_at` first.
    ///
    /// `limit = None` uses the configured default page size.
    pub fn list(&self, offset: usize, limit: Option<usize>) -> Result<Vec<Event>> {
        self.store.list_dlq(offset, limit.unwrap_or(self.page))
    }

    /// Number of events currently dead-lettered.
    pub fn count(&self) -> Result<usize> {
        self.store.count_dlq()
    }

    /// Resets a dead-lettered event for a fresh delivery attempt.
    pub fn retry(&self, id: EventId) -> Result<()> {
        self.store.reset_dlq_event(id)
    }

    /// Deletes dead-lettered events created at or before `cutoff`.
    /// Returns the number deleted.
    pub fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.store.purge_dlq(cutoff)
    }

    /// Convenience: purge everything older than `age`.
    pub fn purge_older_than(&self, age: chrono::Duration) -> Result<usize> {
        self.purge(Utc::now() - age)
    }
}
