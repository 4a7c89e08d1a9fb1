//! # Function-backed handler (`HandlerFn`)
//!
//! [`HandlerFn`] wraps a closure `F: Fn(Event) -> Fut`, producing a fresh
//! future per invocation. This avoids shared mutable state; if a handler
//! needs shared state, move an explicit `Arc<...>` into the closure.
//!
//! ## Example
//! ```rust
//! use durabus::{Event, HandlerError, HandlerFn, HandlerRef};
//!
//! let h: HandlerRef = HandlerFn::arc(|event: Event| async move {
//!     if event.payload.get("id").is_none() {
//!         return Err(HandlerError::fail("payload missing id"));
//!     }
//!     Ok(())
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::events::Event;
use crate::handlers::handler::{BoxHandlerFuture, Handler};

/// Function-backed handler implementation.
///
/// Wraps a closure that *creates* a new future per invocation.
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    /// Creates a new function-backed handler.
    ///
    /// Prefer [`HandlerFn::arc`] when you immediately need a [`HandlerRef`].
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Creates the handler and returns it as a shared handle.
    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static, // Fn, not FnMut
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, event: Event) -> BoxHandlerFuture {
        Box::pin((self.f)(event))
    }
}
