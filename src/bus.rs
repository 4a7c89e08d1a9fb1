//! # Bus façade: publish, subscribe, recover, shut down.
//!
//! [`Bus`] owns the runtime components (durable store, handler registry,
//! dispatcher, in-flight dispatch set) and orchestrates the event lifecycle
//! from publish to graceful termination.
//!
//! ## Architecture
//! ```text
//! publish() ──► persist pending ──► spawn dispatch (tracked)
//!                                        │
//!                                        └──► Dispatcher::dispatch()
//!                                               match → admit → attempts
//!                                               → done | dlq
//!
//! start() ──► sweep status=processing ──► +1 retry_count, reset pending
//!                                     └──► re-dispatch concurrently
//!
//! shutdown() ──► set drained flag (publish/subscribe reject)
//!            ├──► race in-flight set against drain budget
//!            └──► close store (later writes are no-ops)
//! ```
//!
//! ## Rules
//! - `publish` resolves when its event reaches a terminal state (`done` or
//!   `dlq`), not merely when persistence completes.
//! - Whether the terminal state was `dlq` is inspectable via
//!   [`Bus::store`]; handler failures never surface through `publish`.
//! - Registration order is dispatch order for handlers matching one event.
//! - `shutdown` is idempotent; dispatches exceeding the drain budget are
//!   abandoned, not cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::time;
use tokio_util::task::TaskTracker;

use crate::circuit::CircuitState;
use crate::config::Config;
use crate::dispatch::{Dispatcher, RetryLogSink, RetryMetrics, TracingSink};
use crate::dlq::DlqReader;
use crate::error::{BusError, Result};
use crate::events::{Event, EventId, EventStatus};
use crate::handlers::{HandlerRegistry, SubscriptionId, SubscriptionRecord, SubscriptionSpec};
use crate::storage::{EventStore, SqliteStore};

/// Durable in-process event bus.
///
/// Wrap it in an `Arc` to publish from several tasks; every method takes
/// `&self`.
pub struct Bus {
    cfg: Config,
    store: Arc<dyn EventStore>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    in_flight: TaskTracker,
    drained: AtomicBool,
}

impl Bus {
    /// Creates a bus over an existing store with the default retry-log sink.
    pub fn new(store: Arc<dyn EventStore>, cfg: Config) -> Self {
        Self::with_sink(store, cfg, Arc::new(TracingSink))
    }

    /// Creates a bus with an injected retry-log sink.
    pub fn with_sink(
        store: Arc<dyn EventStore>,
        cfg: Config,
        sink: Arc<dyn RetryLogSink>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            sink,
            cfg,
        ));

        Self {
            cfg,
            store,
            registry,
            dispatcher,
            in_flight: TaskTracker::new(),
            drained: AtomicBool::new(false),
        }
    }

    /// Creates a bus over a file-backed SQLite store.
    pub fn open(path: impl AsRef<std::path::Path>, cfg: Config) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteStore::open(path)?), cfg))
    }

    /// Creates a bus over an in-memory SQLite store (for testing).
    pub fn in_memory(cfg: Config) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteStore::in_memory()?), cfg))
    }

    /// Publishes an event and drives it to a terminal state.
    ///
    /// Persists the event as `pending`, dispatches it, and resolves with the
    /// assigned id once the dispatch reached `done` or `dlq`. Query the
    /// store to learn which.
    ///
    /// ### Errors
    /// - `ShuttingDown` after the bus has been drained
    /// - `InvalidEventType` for an empty type
    /// - `InvalidPayload` when the payload is not JSON-serializable (the
    ///   event is never persisted)
    pub async fn publish<P: Serialize>(
        &self,
        event_type: &str,
        payload: P,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<EventId> {
        if self.drained.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }
        if event_type.is_empty() {
            return Err(BusError::InvalidEventType);
        }

        let payload = serde_json::to_value(payload)
            .map_err(|e| BusError::InvalidPayload(e.to_string()))?;
        let event = Event::new(event_type, payload, metadata);
        let id = event.id;

        self.store.insert_event(&event)?;
        tracing::debug!(event_id = %id, event_type, "event accepted");

        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = self
            .in_flight
            .spawn(async move { dispatcher.dispatch(event).await });

        // Resolves at terminal state; a panicking dispatch is isolated here.
        let _ = handle.await;
        Ok(id)
    }

    /// Registers a handler. Returns the new subscription id.
    ///
    /// Writes the durable traceability row, then installs the handler at
    /// the end of the dispatch order.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<SubscriptionId> {
        if self.drained.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }

        let sub = spec.into_subscription(&self.cfg);
        let id = sub.id;
        self.store.insert_subscription(&SubscriptionRecord::from(&sub))?;
        self.registry.insert(sub).await;
        tracing::debug!(subscription_id = %id, "handler registered");
        Ok(id)
    }

    /// Removes a subscription from the registry and the durable record.
    /// Idempotent.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let removed = self.registry.remove(id).await;
        self.dispatcher.forget_subscription(id);
        self.store.delete_subscription(id)?;
        if removed {
            tracing::debug!(subscription_id = %id, "handler removed");
        }
        Ok(())
    }

    /// Crash recovery: re-dispatches events stranded in `processing`.
    ///
    /// The crashed attempt counts as one failure, so each survivor's
    /// `retry_count` is incremented before it re-enters the pipeline. The
    /// re-dispatches run concurrently; `start` resolves when all of them
    /// reached a terminal state. Returns the number recovered.
    pub async fn start(&self) -> Result<usize> {
        let stranded = self.store.events_by_status(EventStatus::Processing)?;
        let count = stranded.len();
        if count > 0 {
            tracing::info!(count, "recovering in-flight events");
        }

        let mut handles = Vec::with_capacity(count);
        for mut event in stranded {
            event.retry_count += 1;
            let errors = event.last_error.clone().unwrap_or_default();
            self.store.update_retry(event.id, event.retry_count, &errors)?;
            self.store.update_status(event.id, EventStatus::Pending)?;
            event.status = EventStatus::Pending;

            let dispatcher = Arc::clone(&self.dispatcher);
            handles.push(
                self.in_flight
                    .spawn(async move { dispatcher.dispatch(event).await }),
            );
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(count)
    }

    /// Drains the bus and closes the store.
    ///
    /// Sets the drained flag (new `publish`/`subscribe` reject with
    /// `ShuttingDown`), then races the in-flight dispatch set against the
    /// configured drain budget. On timeout the remaining dispatches are
    /// abandoned; the store closes regardless, and their late writes become
    /// no-ops. A second call resolves immediately.
    pub async fn shutdown(&self) {
        if self.drained.swap(true, Ordering::SeqCst) {
            return;
        }

        self.in_flight.close();
        let drained = time::timeout(self.cfg.drain, self.in_flight.wait())
            .await
            .is_ok();
        if drained {
            tracing::info!("all in-flight dispatches drained");
        } else {
            tracing::warn!(
                budget = ?self.cfg.drain,
                "drain budget exceeded; abandoning in-flight dispatches"
            );
        }

        self.store.close();
    }

    /// The administrative dead-letter queue reader.
    pub fn dlq(&self) -> DlqReader {
        DlqReader::new(Arc::clone(&self.store), self.cfg.dlq_page)
    }

    /// The durable store, for inspecting event state.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Retry metrics for one event type, if any dispatch was observed.
    pub fn metrics_for(&self, event_type: &str) -> Option<RetryMetrics> {
        self.dispatcher.metrics().get(event_type)
    }

    /// Snapshot of the per-type retry metrics.
    pub fn metrics(&self) -> HashMap<String, RetryMetrics> {
        self.dispatcher.metrics().snapshot()
    }

    /// Current circuit state for a subscription (closed if never tripped).
    pub fn circuit_state(&self, id: SubscriptionId) -> CircuitState {
        self.dispatcher.circuit_state(id)
    }
}
