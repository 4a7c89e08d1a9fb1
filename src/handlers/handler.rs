//! # Handler abstraction for event delivery.
//!
//! Defines the core [`Handler`] trait for async units of work invoked with
//! an [`Event`].
//!
//! - **[`Handler`]**: trait implemented by event handlers
//! - **[`HandlerRef`]**: shared handle (`Arc<dyn Handler>`) installed in the registry
//! - **[`BoxHandlerFuture`]**: type alias for boxed handler futures
//!
//! ## Rules
//! - The crate provides [`HandlerFn`](crate::HandlerFn), a function-backed
//!   implementation that wraps closures as handlers.
//! - Handlers are not persistable: the in-memory registry is the sole source
//!   of truth for invocability. The durable subscription row is a
//!   traceability record only.
//! - A handler that outlives its timeout is not cancelled; it keeps running
//!   detached while the dispatcher records a timeout failure.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::error::HandlerError;
use crate::events::Event;

/// Boxed future returned by [`Handler::call`].
///
/// - **Boxed**: required for trait objects (dynamic dispatch)
/// - **Pinned**: required for async futures
/// - **Send**: handler futures run on the runtime's workers
pub type BoxHandlerFuture =
    Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>>;

/// Shared handle to a handler object.
pub type HandlerRef = Arc<dyn Handler>;

/// Asynchronous unit of work invoked once per delivery attempt.
///
/// ## Rules
/// - **Stateless invocation**: `call(&self)` is `Fn`, not `FnMut`; shared
///   state goes through an explicit `Arc` inside the implementation.
/// - **Fresh futures**: each `call()` creates a new independent future. On
///   retry the same handler is invoked again with the same event.
/// - **Failure reporting**: return `Err(HandlerError::fail(..))` with a
///   message; the message is appended verbatim to the event's error history.
pub trait Handler: Send + Sync + 'static {
    /// Creates a new future that processes one delivery of `event`.
    ///
    /// The event is a snapshot of the persisted row; during the attempt loop
    /// its status reads `processing`.
    fn call(&self, event: Event) -> BoxHandlerFuture;
}
