//! # Per-type retry metrics.
//!
//! One [`RetryMetrics`] entry per event type, kept in a concurrent map so
//! overlapping dispatches update their own entries without a global lock.
//! All operations are O(1).

use std::collections::HashMap;

use dashmap::DashMap;

/// Running totals for one event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    /// Failed attempts that were followed by another attempt, plus the full
    /// budget of every dead-lettered event.
    pub total_retries: u64,
    /// Events that reached `done` after at least one failed attempt.
    pub success_after_retry: u64,
    /// Events that exhausted their budget and entered the DLQ.
    pub dlq_count: u64,
    /// Dispatches observed for this type, terminal outcome regardless.
    pub events_observed: u64,
}

/// Concurrent per-type metrics map, owned by the dispatcher.
pub(crate) struct MetricsMap {
    types: DashMap<String, RetryMetrics>,
}

impl MetricsMap {
    pub(crate) fn new() -> Self {
        Self {
            types: DashMap::new(),
        }
    }

    /// Counts one dispatched event of this type.
    pub(crate) fn observe(&self, event_type: &str) {
        self.types
            .entry(event_type.to_string())
            .or_default()
            .events_observed += 1;
    }

    /// Records a terminal `done`, crediting retries if prior attempts existed.
    pub(crate) fn record_success(&self, event_type: &str, attempt: u32) {
        if attempt <= 1 {
            return;
        }
        let mut m = self.types.entry(event_type.to_string()).or_default();
        m.total_retries += u64::from(attempt - 1);
        m.success_after_retry += 1;
    }

    /// Records a terminal `dlq` after the full retry budget was spent.
    pub(crate) fn record_dlq(&self, event_type: &str, max_retries: u32) {
        let mut m = self.types.entry(event_type.to_string()).or_default();
        m.dlq_count += 1;
        m.total_retries += u64::from(max_retries);
    }

    /// Totals for one event type, if any dispatch has been observed.
    pub(crate) fn get(&self, event_type: &str) -> Option<RetryMetrics> {
        self.types.get(event_type).map(|m| *m)
    }

    /// Snapshot of all per-type totals.
    pub(crate) fn snapshot(&self) -> HashMap<String, RetryMetrics> {
        self.types
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}
