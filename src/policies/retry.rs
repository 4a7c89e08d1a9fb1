//! # Retry policy for failed dispatch attempts.
//!
//! [`RetryPolicy`] controls how many attempts an event gets and how the
//! delays between them grow. It is parameterized by:
//! - [`RetryPolicy::max_retries`] failed attempts allowed beyond the first try;
//! - [`RetryPolicy::base_delay`] the delay before the second attempt;
//! - [`RetryPolicy::max_delay`] the delay cap;
//! - [`RetryPolicy::backoff_multiplier`] the multiplicative growth factor.
//!
//! [`RetryOverride`] is the partial form carried by a subscription. When an
//! event matches several subscriptions the dispatcher computes **one**
//! effective policy for the whole dispatch via [`RetryPolicy::effective`]:
//! each override is overlaid onto the defaults, then the full policies are
//! combined field-wise with the most-permissive operator (`max` retries,
//! `min` base delay, `max` cap, `max` multiplier). No subscription has its
//! retry budget cut short by another on the same event.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use durabus::{RetryOverride, RetryPolicy};
//!
//! let defaults = RetryPolicy::default();
//! let eager = RetryOverride { max_retries: Some(5), ..Default::default() };
//! let quick = RetryOverride { base_delay: Some(Duration::from_millis(100)), ..Default::default() };
//!
//! let merged = RetryPolicy::effective(defaults, &[&eager, &quick]);
//! assert_eq!(merged.max_retries, 5);
//! assert_eq!(merged.base_delay, Duration::from_millis(100));
//! assert_eq!(merged.max_delay, defaults.max_delay);
//! ```

use std::time::Duration;

use rand::Rng;

/// Retry policy applied to one dispatch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts allowed beyond the first try (`>= 0`).
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    /// Multiplicative growth factor (`>= 1.0` expected).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    /// Returns the stock policy: 3 retries, 1s base, 30s cap, x2 growth.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Partial retry policy carried by a subscription.
///
/// Unset fields fall through to the bus defaults when the override is
/// overlaid at dispatch time.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RetryOverride {
    pub max_retries: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
}

impl RetryOverride {
    /// Produces a full policy by overlaying this partial onto `defaults`.
    pub fn overlay(&self, defaults: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            backoff_multiplier: self
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
        }
    }
}

impl RetryPolicy {
    /// Computes the single effective policy for a dispatch.
    ///
    /// - No overrides: the defaults apply verbatim.
    /// - Otherwise every override is overlaid onto the defaults and the
    ///   resulting full policies are merged field-wise, most permissive
    ///   field winning.
    pub fn effective(defaults: RetryPolicy, overrides: &[&RetryOverride]) -> RetryPolicy {
        let mut full = overrides.iter().map(|o| o.overlay(defaults));

        let Some(first) = full.next() else {
            return defaults;
        };

        full.fold(first, |acc, p| RetryPolicy {
            max_retries: acc.max_retries.max(p.max_retries),
            base_delay: acc.base_delay.min(p.base_delay),
            max_delay: acc.max_delay.max(p.max_delay),
            backoff_multiplier: acc.backoff_multiplier.max(p.backoff_multiplier),
        })
    }

    /// Delay to wait before the given 1-indexed attempt.
    ///
    /// Attempt 1 runs immediately. For later attempts the raw delay is
    /// `base_delay * multiplier^(attempt - 2)` capped at `max_delay`, with
    /// ±10% uniform jitter applied so lockstepped retries spread out.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let cap_ms = self.max_delay.as_secs_f64() * 1000.0;
        let raw_ms = base_ms * self.backoff_multiplier.powi((attempt - 2) as i32);
        let capped_ms = if raw_ms.is_finite() {
            raw_ms.min(cap_ms)
        } else {
            cap_ms
        };

        if capped_ms <= 0.0 {
            return Duration::ZERO;
        }

        let spread = capped_ms * 0.1;
        let jittered = capped_ms + rand::rng().random_range(-spread..=spread);
        Duration::from_millis(jittered.round().max(0.0) as u64)
    }
}
