//! Handlers and subscriptions: who receives events, and how.
//!
//! ## Contents
//! - [`Handler`], [`HandlerRef`], [`BoxHandlerFuture`] the handler abstraction
//! - [`HandlerFn`] closure adapter
//! - [`SubscriptionSpec`], [`Subscription`], [`SubscriptionRecord`] the binding
//!   and its durable projection
//! - [`HandlerRegistry`] the insertion-ordered in-memory map

mod handler;
mod handler_fn;
mod registry;
mod subscription;

pub use handler::{BoxHandlerFuture, Handler, HandlerRef};
pub use handler_fn::HandlerFn;
pub use registry::HandlerRegistry;
pub use subscription::{Subscription, SubscriptionId, SubscriptionRecord, SubscriptionSpec};
