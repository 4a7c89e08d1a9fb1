//! # durabus
//!
//! **Durabus** is a durable in-process event bus for small services and
//! command-line tools that need reliable event processing without an
//! external broker.
//!
//! Publishers submit typed events; subscribers register handlers keyed by
//! glob patterns; every accepted event is either delivered successfully or
//! preserved in a dead-letter queue with its full error history, surviving
//! process crashes via SQLite persistence.
//!
//! ## Features
//!
//! | Area                 | Description                                                        | Key types / traits                       |
//! |----------------------|--------------------------------------------------------------------|------------------------------------------|
//! | **Publishing**       | Persist-then-dispatch; `publish` resolves at a terminal state.     | [`Bus`]                                  |
//! | **Subscriptions**    | Glob-pattern handler bindings with per-handler timeouts.           | [`SubscriptionSpec`], [`Handler`], [`HandlerFn`] |
//! | **Retries**          | Exponential backoff with jitter, merged across subscriptions.      | [`RetryPolicy`], [`RetryOverride`]       |
//! | **Circuit breaking** | Per-subscription rolling-window breaker with half-open probes.     | [`CircuitState`]                         |
//! | **Dead letters**     | Exhausted events preserved with error history; list/retry/purge.   | [`DlqReader`]                            |
//! | **Persistence**      | Narrow store contract over SQLite (WAL).                           | [`EventStore`], [`SqliteStore`]          |
//! | **Observability**    | Structured retry log via an injectable sink; per-type metrics.     | [`RetryLogSink`], [`RetryMetrics`]       |
//! | **Errors**           | Typed boundary and handler errors.                                 | [`BusError`], [`HandlerError`]           |
//!
//! ```no_run
//! use durabus::{Bus, Config, Event, HandlerError, HandlerFn, SubscriptionSpec};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Bus::open("events.db", Config::default())?;
//!
//!     // Recover events stranded mid-dispatch by a previous crash.
//!     bus.start().await?;
//!
//!     bus.subscribe(SubscriptionSpec::new(
//!         "order.*",
//!         HandlerFn::arc(|event: Event| async move {
//!             println!("handling {}", event.event_type);
//!             Ok::<_, HandlerError>(())
//!         }),
//!     ))
//!     .await?;
//!
//!     let id = bus
//!         .publish("order.created", serde_json::json!({ "id": 42 }), None)
//!         .await?;
//!     println!("event {id} reached a terminal state");
//!
//!     bus.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod bus;
mod circuit;
mod config;
mod dispatch;
mod dlq;
mod error;
mod events;
mod handlers;
mod pattern;
mod policies;
mod storage;

// ---- Public re-exports ----

pub use bus::Bus;
pub use circuit::{Admission, CircuitBreaker, CircuitState};
pub use config::{CircuitConfig, Config};
pub use dispatch::{RetryLogEntry, RetryLogSink, RetryMetrics, TracingSink};
pub use dlq::DlqReader;
pub use error::{BusError, HandlerError, Result};
pub use events::{Event, EventId, EventStatus};
pub use handlers::{
    BoxHandlerFuture, Handler, HandlerFn, HandlerRef, Subscription, SubscriptionId,
    SubscriptionRecord, SubscriptionSpec,
};
pub use pattern::matches;
pub use policies::{RetryOverride, RetryPolicy};
pub use storage::{EventStore, SqliteStore};
