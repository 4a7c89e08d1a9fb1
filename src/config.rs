//! # Global bus configuration.
//!
//! Provides [`Config`] centralized settings for the bus runtime, and
//! [`CircuitConfig`] the per-subscription circuit breaker parameters.
//!
//! Config is used in two ways:
//! 1. **Bus creation**: `Bus::new(store, config)`
//! 2. **Subscription defaults**: `SubscriptionSpec` fills its timeout and
//!    retry policy from the config when not set explicitly.

use std::time::Duration;

use crate::policies::RetryPolicy;

/// Global configuration for the bus runtime.
///
/// Defines:
/// - **Handler execution**: default per-handler timeout
/// - **Shutdown behavior**: drain budget for in-flight dispatches
/// - **Retry behavior**: default retry policy (overridable per subscription)
/// - **Circuit breaking**: window, sample floor, trip threshold, pause
/// - **DLQ administration**: default list page size
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Maximum duration a single handler invocation may take before the
    /// dispatcher synthesizes a timeout failure.
    ///
    /// The losing handler is not cancelled; it may run to completion in the
    /// background. Can be overridden per subscription.
    pub handler_timeout: Duration,

    /// Maximum time `shutdown()` waits for in-flight dispatches to reach a
    /// terminal state before abandoning them and closing the store.
    pub drain: Duration,

    /// Default retry policy applied when no matching subscription carries
    /// an override.
    pub retry: RetryPolicy,

    /// Circuit breaker parameters shared by all subscriptions.
    pub circuit: CircuitConfig,

    /// Default page size for DLQ listing.
    pub dlq_page: usize,
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `handler_timeout = 30s`
    /// - `drain = 30s`
    /// - `retry = RetryPolicy::default()` (3 retries, 1s..30s, x2)
    /// - `circuit = CircuitConfig::default()`
    /// - `dlq_page = 100`
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
            drain: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            dlq_page: 100,
        }
    }
}

/// Parameters of the per-subscription circuit breaker.
///
/// A subscription trips open when, within `window`, at least `min_samples`
/// outcomes were recorded and the failure fraction exceeds
/// `failure_threshold`. After `pause` the next admission check moves the
/// circuit to half-open and admits a single probe.
#[derive(Clone, Copy, Debug)]
pub struct CircuitConfig {
    /// Rolling window over which outcomes are counted.
    pub window: Duration,

    /// Minimum number of outcomes in the window before the circuit may trip.
    pub min_samples: usize,

    /// Failure fraction above which (strictly) the circuit trips open.
    pub failure_threshold: f64,

    /// How long an open circuit denies admission before allowing a probe.
    pub pause: Duration,
}

impl Default for CircuitConfig {
    /// Default parameters:
    ///
    /// - `window = 60s`
    /// - `min_samples = 4`
    /// - `failure_threshold = 0.5` (strictly greater trips)
    /// - `pause = 30s`
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_samples: 4,
            failure_threshold: 0.5,
            pause: Duration::from_secs(30),
        }
    }
}
