//! # Structured retry log.
//!
//! Every failed attempt (including the final one that dead-letters an
//! event) produces one [`RetryLogEntry`]. Entries flow through an
//! injectable [`RetryLogSink`]; the default [`TracingSink`] emits them as
//! `tracing` warn records with one field per entry key, which a JSON
//! subscriber renders as the documented wire shape.

use serde::Serialize;

use crate::events::EventId;
use crate::handlers::SubscriptionId;

/// One failed attempt, as logged.
#[derive(Debug, Clone, Serialize)]
pub struct RetryLogEntry {
    /// Always `"warn"`.
    pub level: &'static str,
    pub event_id: EventId,
    pub event_type: String,
    /// The subscription whose handler failed this attempt.
    pub subscription_id: SubscriptionId,
    /// 1-indexed attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay before the next attempt; zero on the final one.
    pub delay_ms: u64,
    /// The failure message, verbatim.
    pub error: String,
}

/// Destination for retry log entries.
///
/// Implementations must be cheap and non-blocking; the dispatcher calls
/// `emit` inline between attempts.
pub trait RetryLogSink: Send + Sync + 'static {
    fn emit(&self, entry: &RetryLogEntry);
}

/// Default sink: one `tracing` warn record per failed attempt.
pub struct TracingSink;

impl RetryLogSink for TracingSink {
    fn emit(&self, entry: &RetryLogEntry) {
        tracing::warn!(
            event_id = %entry.event_id,
            event_type = %entry.event_type,
            subscription_id = %entry.subscription_id,
            attempt = entry.attempt,
            max_attempts = entry.max_attempts,
            delay_ms = entry.delay_ms,
            error = %entry.error,
            "dispatch attempt failed"
        );
    }
}
