//! # Per-subscription circuit breaker.
//!
//! Tracks recent handler outcomes per subscription in a rolling window and
//! denies admission to subscriptions that keep failing, so one broken
//! handler does not burn the retry budget of every event it matches.
//!
//! ## State machine
//! ```text
//! closed ──(>50% failures over >=4 samples in window)──► open
//! open ──(pause elapsed, checked on next admission)──► half_open
//! half_open ──(single probe succeeds)──► closed (outcomes reset)
//! half_open ──(single probe fails)──► open (pause restarts)
//! ```
//!
//! ## Rules
//! - The probe slot is claimed at **admission** time, not at handler entry.
//!   A dispatch that admits a probe but never runs its handler (an earlier
//!   handler aborted the attempt) must call [`CircuitBreaker::release_probe`],
//!   otherwise the subscription deadlocks in half-open forever.
//! - Each entry mutates under its own map lock: concurrent dispatches see
//!   atomic admit/record/release transitions per subscription.
//! - State is process-local and non-persistent; a restart starts closed.

use std::collections::VecDeque;
use std::fmt;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::CircuitConfig;
use crate::handlers::SubscriptionId;

/// Circuit breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, dispatches admitted.
    Closed,
    /// Subscription is failing, dispatches denied until the pause elapses.
    Open,
    /// Testing recovery: a single probe dispatch may be admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The dispatch may invoke this subscription's handler.
    ///
    /// `probe: true` marks the single half-open probe; its slot must be
    /// released exactly once, by outcome recording or leak clearance.
    Admitted { probe: bool },
    /// The circuit is open (or the probe slot is taken); skip this handler.
    Denied,
}

impl Admission {
    /// True for either admission flavor.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Per-subscription breaker state.
#[derive(Debug)]
struct Entry {
    state: CircuitState,
    /// `(instant, success)` pairs inside the rolling window.
    outcomes: VecDeque<(Instant, bool)>,
    /// Instant the state most recently became open.
    opened_at: Option<Instant>,
    /// A half-open probe has been admitted and its outcome is pending.
    probe_in_flight: bool,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            outcomes: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

impl Entry {
    fn prune(&mut self, now: Instant, cfg: &CircuitConfig) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > cfg.window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn should_trip(&self, cfg: &CircuitConfig) -> bool {
        let total = self.outcomes.len();
        if total < cfg.min_samples {
            return false;
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / total as f64 > cfg.failure_threshold
    }
}

/// Rolling-window failure tracker, one entry per subscription.
pub struct CircuitBreaker {
    cfg: CircuitConfig,
    entries: DashMap<SubscriptionId, Entry>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given parameters.
    pub fn new(cfg: CircuitConfig) -> Self {
        Self {
            cfg,
            entries: DashMap::new(),
        }
    }

    /// Decides whether a dispatch may invoke this subscription's handler.
    ///
    /// An open circuit whose pause has elapsed transitions to half-open and
    /// claims the probe slot in the same entry lock, so two concurrent
    /// dispatches can never both probe.
    pub fn admit(&self, id: SubscriptionId) -> Admission {
        let now = Instant::now();
        let mut entry = self.entries.entry(id).or_default();

        match entry.state {
            CircuitState::Closed => Admission::Admitted { probe: false },
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.cfg.pause)
                    .unwrap_or(true);
                if elapsed {
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    Admission::Admitted { probe: true }
                } else {
                    Admission::Denied
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    Admission::Denied
                } else {
                    entry.probe_in_flight = true;
                    Admission::Admitted { probe: true }
                }
            }
        }
    }

    /// Records a handler outcome for this subscription.
    ///
    /// In half-open the outcome resolves the probe: success closes the
    /// circuit and clears the window, failure reopens it and restarts the
    /// pause. Otherwise the outcome joins the rolling window and may trip
    /// the circuit open.
    pub fn record(&self, id: SubscriptionId, success: bool) {
        let now = Instant::now();
        let mut entry = self.entries.entry(id).or_default();

        if entry.state == CircuitState::HalfOpen {
            entry.probe_in_flight = false;
            if success {
                entry.state = CircuitState::Closed;
                entry.outcomes.clear();
                entry.opened_at = None;
            } else {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
            }
            return;
        }

        entry.outcomes.push_back((now, success));
        entry.prune(now, &self.cfg);
        if entry.state == CircuitState::Closed && entry.should_trip(&self.cfg) {
            entry.state = CircuitState::Open;
            entry.opened_at = Some(now);
        }
    }

    /// Releases an admitted probe whose handler never ran.
    ///
    /// Must be called for every `Admitted { probe: true }` subscription that
    /// was skipped because an earlier handler aborted the attempt.
    pub fn release_probe(&self, id: SubscriptionId) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.probe_in_flight = false;
        }
    }

    /// Current state of a subscription's circuit (closed if never seen).
    pub fn state(&self, id: SubscriptionId) -> CircuitState {
        self.entries
            .get(&id)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Drops all breaker state for a subscription (on unsubscribe).
    pub fn forget(&self, id: SubscriptionId) {
        self.entries.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn cfg() -> CircuitConfig {
        CircuitConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_subscription_is_closed_and_admitted() {
        let breaker = CircuitBreaker::new(cfg());
        let id = SubscriptionId::new();

        assert_eq!(breaker.state(id), CircuitState::Closed);
        assert_eq!(breaker.admit(id), Admission::Admitted { probe: false });
    }

    #[tokio::test(start_paused = true)]
    async fn trips_open_after_enough_failures() {
        let breaker = CircuitBreaker::new(cfg());
        let id = SubscriptionId::new();

        for _ in 0..3 {
            breaker.record(id, false);
            assert_eq!(breaker.state(id), CircuitState::Closed);
        }
        breaker.record(id, false);
        assert_eq!(breaker.state(id), CircuitState::Open);
        assert_eq!(breaker.admit(id), Admission::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn needs_majority_failures_to_trip() {
        let breaker = CircuitBreaker::new(cfg());
        let id = SubscriptionId::new();

        // 2 of 4 failing is exactly 0.5, not strictly greater.
        breaker.record(id, false);
        breaker.record(id, true);
        breaker.record(id, false);
        breaker.record(id, true);
        assert_eq!(breaker.state(id), CircuitState::Closed);

        breaker.record(id, false);
        assert_eq!(breaker.state(id), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_outside_window_are_pruned() {
        let breaker = CircuitBreaker::new(cfg());
        let id = SubscriptionId::new();

        breaker.record(id, false);
        breaker.record(id, false);
        breaker.record(id, false);

        tokio::time::advance(Duration::from_secs(61)).await;

        // Only this one remains in the window: below the sample floor.
        breaker.record(id, false);
        assert_eq!(breaker.state(id), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_elapsed_admits_a_single_probe() {
        let breaker = CircuitBreaker::new(cfg());
        let id = SubscriptionId::new();

        for _ in 0..4 {
            breaker.record(id, false);
        }
        assert_eq!(breaker.admit(id), Admission::Denied);

        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(breaker.admit(id), Admission::Admitted { probe: true });
        assert_eq!(breaker.state(id), CircuitState::HalfOpen);
        // The probe slot is taken; a concurrent dispatch is denied.
        assert_eq!(breaker.admit(id), Admission::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_and_resets_window() {
        let breaker = CircuitBreaker::new(cfg());
        let id = SubscriptionId::new();

        for _ in 0..4 {
            breaker.record(id, false);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.admit(id).is_admitted());

        breaker.record(id, true);
        assert_eq!(breaker.state(id), CircuitState::Closed);

        // The old failures are gone: one more failure must not trip it.
        breaker.record(id, false);
        assert_eq!(breaker.state(id), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_and_restarts_pause() {
        let breaker = CircuitBreaker::new(cfg());
        let id = SubscriptionId::new();

        for _ in 0..4 {
            breaker.record(id, false);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.admit(id).is_admitted());

        breaker.record(id, false);
        assert_eq!(breaker.state(id), CircuitState::Open);
        assert_eq!(breaker.admit(id), Admission::Denied);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.admit(id).is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn released_probe_frees_the_slot() {
        let breaker = CircuitBreaker::new(cfg());
        let id = SubscriptionId::new();

        for _ in 0..4 {
            breaker.record(id, false);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.admit(id), Admission::Admitted { probe: true });
        assert_eq!(breaker.admit(id), Admission::Denied);

        breaker.release_probe(id);
        assert_eq!(breaker.admit(id), Admission::Admitted { probe: true });
    }
}
