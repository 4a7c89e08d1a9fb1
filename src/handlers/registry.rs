//! # Handler registry: the in-memory subscription map.
//!
//! The registry owns the installed [`Subscription`]s and is the sole source
//! of truth for which handlers can be invoked. The durable subscription rows
//! are a traceability record; after a process restart only handlers
//! re-registered here receive events.
//!
//! ## Rules
//! - Registration order is preserved; dispatch invokes matching handlers in
//!   that order.
//! - Reads take a snapshot: late-arriving subscriptions need not observe
//!   in-flight dispatches.
//! - `remove` is idempotent.

use tokio::sync::RwLock;

use crate::handlers::subscription::{Subscription, SubscriptionId};
use crate::pattern;

/// Insertion-ordered registry of installed subscriptions.
pub struct HandlerRegistry {
    subs: RwLock<Vec<Subscription>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(Vec::new()),
        }
    }

    /// Installs a subscription at the end of the dispatch order.
    pub async fn insert(&self, sub: Subscription) {
        self.subs.write().await.push(sub);
    }

    /// Removes a subscription. Returns true if it was present.
    pub async fn remove(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Returns a snapshot of the subscriptions matching `event_type`,
    /// in registration order.
    pub async fn matching(&self, event_type: &str) -> Vec<Subscription> {
        self.subs
            .read()
            .await
            .iter()
            .filter(|s| pattern::matches(&s.pattern, event_type))
            .cloned()
            .collect()
    }

    /// Number of installed subscriptions.
    pub async fn len(&self) -> usize {
        self.subs.read().await.len()
    }

    /// True if nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.subs.read().await.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
