//! Durable events: the unit of work carried by the bus.
//!
//! This module groups the event **data model**:
//! - [`Event`] the persisted record driven through the dispatch pipeline
//! - [`EventId`] opaque v4-UUID identifier assigned at publish
//! - [`EventStatus`] the four-state lifecycle with its transition rules

mod event;

pub use event::{Event, EventId, EventStatus};
