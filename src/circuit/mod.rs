//! Per-subscription circuit breaking.
//!
//! - [`CircuitBreaker`] rolling-window failure tracker with half-open
//!   single-probe recovery
//! - [`CircuitState`], [`Admission`] the observable machine

mod breaker;

pub use breaker::{Admission, CircuitBreaker, CircuitState};
