//! # Subscription: a named handler binding.
//!
//! Defines [`SubscriptionSpec`] the configuration bundle handed to
//! [`Bus::subscribe`](crate::Bus::subscribe), and [`Subscription`] the
//! installed binding living in the in-memory registry.
//!
//! The durable side is [`SubscriptionRecord`]: the non-handler fields
//! persisted purely for traceability. On process restart only subscriptions
//! re-registered in memory can receive events.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::handlers::handler::HandlerRef;
use crate::policies::RetryOverride;

/// Newtype for subscription identifiers, assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// # Specification for registering a handler.
///
/// Bundles together:
/// - The glob pattern over event types (defaults to `*`)
/// - The handler itself ([`HandlerRef`])
/// - Optional per-handler timeout (defaults to [`Config::handler_timeout`])
/// - Optional partial retry policy
///
/// ## Example
/// ```rust
/// use std::time::Duration;
/// use durabus::{Event, HandlerError, HandlerFn, RetryOverride, SubscriptionSpec};
///
/// let spec = SubscriptionSpec::new(
///     "order.*",
///     HandlerFn::arc(|_event: Event| async move { Ok::<_, HandlerError>(()) }),
/// )
/// .timeout(Duration::from_secs(5))
/// .retry(RetryOverride { max_retries: Some(1), ..Default::default() });
/// # let _ = spec;
/// ```
pub struct SubscriptionSpec {
    pattern: String,
    handler: HandlerRef,
    timeout: Option<Duration>,
    retry: Option<RetryOverride>,
}

impl SubscriptionSpec {
    /// Creates a spec matching the given pattern.
    pub fn new(pattern: impl Into<String>, handler: HandlerRef) -> Self {
        Self {
            pattern: pattern.into(),
            handler,
            timeout: None,
            retry: None,
        }
    }

    /// Creates a spec matching every event type (bare `*`).
    pub fn any(handler: HandlerRef) -> Self {
        Self::new("*", handler)
    }

    /// Sets the per-handler timeout for this subscription.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the partial retry policy for this subscription.
    pub fn retry(mut self, retry: RetryOverride) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Materializes the spec, assigning an id and filling defaults from config.
    pub(crate) fn into_subscription(self, cfg: &Config) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            pattern: self.pattern,
            handler: self.handler,
            timeout: self.timeout.unwrap_or(cfg.handler_timeout),
            retry: self.retry,
            created_at: Utc::now(),
        }
    }
}

/// An installed handler binding.
///
/// Lives in the in-memory registry; the handler is deliberately absent from
/// the durable record.
#[derive(Clone)]
pub struct Subscription {
    /// Unique identifier assigned at registration.
    pub id: SubscriptionId,
    /// Glob pattern over segmented event types.
    pub pattern: String,
    /// The handler invoked with matching events.
    pub handler: HandlerRef,
    /// Per-handler maximum duration for one invocation.
    pub timeout: Duration,
    /// Optional partial retry policy merged into the dispatch's effective policy.
    pub retry: Option<RetryOverride>,
    /// Registration instant.
    pub created_at: DateTime<Utc>,
}

// HandlerRef carries no useful Debug surface; keep the rest readable.
impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// The durable projection of a subscription: everything but the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    /// The glob pattern, stored under the schema's `event_type` column.
    pub event_type: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Subscription> for SubscriptionRecord {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id,
            event_type: sub.pattern.clone(),
            created_at: sub.created_at,
        }
    }
}
