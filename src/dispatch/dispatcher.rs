//! # Dispatcher: drives one persisted event to a terminal status.
//!
//! ## Flow
//! ```text
//! dispatch(event)
//!   ├─► resolve matching subscriptions (registration order)
//!   ├─► partition by circuit admission
//!   │     └─► none admitted → status done, return
//!   ├─► status processing, compute effective retry policy
//!   └─► attempt loop (1..=max_retries+1):
//!         ├─► invoke admitted handlers sequentially,
//!         │   each raced against its timeout
//!         ├─► all succeeded → record outcomes, status done, return
//!         └─► first failure → record outcomes, release leaked probes,
//!             append error, write retry state through, emit retry log,
//!             sleep backoff delay (or dead-letter on exhaustion)
//! ```
//!
//! ## Rules
//! - Handlers run **sequentially** in registration order; the first failure
//!   aborts the rest of the attempt, and earlier successes re-run on retry.
//! - The admitted set is fixed for the whole dispatch; circuit outcomes are
//!   recorded per attempt.
//! - A probe admitted but never executed has its slot released at the end
//!   of the attempt, exactly once.
//! - The timeout race never cancels the losing handler; it is detached and
//!   may finish in the background. Post-shutdown store writes it performs
//!   are no-ops.
//! - Handler failures never escape `dispatch`; the publisher only observes
//!   that the event reached `done` or `dlq`.
//! - Storage write failures never abort a dispatch either, but they are
//!   not silent: each one is logged at error level, and a rejected status
//!   transition is flagged as a lifecycle bug rather than an I/O problem.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::circuit::{Admission, CircuitBreaker, CircuitState};
use crate::config::Config;
use crate::dispatch::metrics::MetricsMap;
use crate::dispatch::retry_log::{RetryLogEntry, RetryLogSink};
use crate::error::{BusError, HandlerError};
use crate::events::{Event, EventId, EventStatus};
use crate::handlers::{HandlerRegistry, Subscription, SubscriptionId};
use crate::policies::{RetryOverride, RetryPolicy};
use crate::storage::EventStore;

/// One subscription admitted into a dispatch, with its probe claim.
struct AdmittedSub {
    sub: Subscription,
    /// Still holding this dispatch's half-open probe slot.
    probe: bool,
}

/// The dispatch engine. Owns circuit state and metrics.
pub(crate) struct Dispatcher {
    store: Arc<dyn EventStore>,
    registry: Arc<HandlerRegistry>,
    circuit: CircuitBreaker,
    metrics: MetricsMap,
    sink: Arc<dyn RetryLogSink>,
    cfg: Config,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<HandlerRegistry>,
        sink: Arc<dyn RetryLogSink>,
        cfg: Config,
    ) -> Self {
        Self {
            store,
            registry,
            circuit: CircuitBreaker::new(cfg.circuit),
            metrics: MetricsMap::new(),
            sink,
            cfg,
        }
    }

    pub(crate) fn metrics(&self) -> &MetricsMap {
        &self.metrics
    }

    pub(crate) fn circuit_state(&self, id: SubscriptionId) -> CircuitState {
        self.circuit.state(id)
    }

    pub(crate) fn forget_subscription(&self, id: SubscriptionId) {
        self.circuit.forget(id);
    }

    /// Drives one persisted event to `done` or `dlq`.
    pub(crate) async fn dispatch(&self, mut event: Event) {
        self.metrics.observe(&event.event_type);

        let matched = self.registry.matching(&event.event_type).await;
        let mut admitted: Vec<AdmittedSub> = Vec::with_capacity(matched.len());
        for sub in matched {
            match self.circuit.admit(sub.id) {
                Admission::Admitted { probe } => admitted.push(AdmittedSub { sub, probe }),
                Admission::Denied => {}
            }
        }

        // Unmatched or fully circuit-broken events count as handled.
        if admitted.is_empty() {
            self.report_write(
                event.id,
                "mark done",
                self.store.update_status(event.id, EventStatus::Done),
            );
            return;
        }

        self.report_write(
            event.id,
            "mark processing",
            self.store.update_status(event.id, EventStatus::Processing),
        );
        event.status = EventStatus::Processing;

        let overrides: Vec<&RetryOverride> = admitted
            .iter()
            .filter_map(|a| a.sub.retry.as_ref())
            .collect();
        let policy = RetryPolicy::effective(self.cfg.retry, &overrides);
        let max_attempts = policy.max_retries + 1;

        // A recovered event carries its pre-crash history forward.
        let mut errors = event.last_error.clone().unwrap_or_default();
        let mut retry_count = event.retry_count;
        let mut attempt: u32 = 1;

        loop {
            match self.run_attempt(&event, &mut admitted).await {
                Ok(()) => {
                    if !errors.is_empty() {
                        self.report_write(
                            event.id,
                            "write retry state",
                            self.store.update_retry(event.id, retry_count, &errors),
                        );
                    }
                    self.report_write(
                        event.id,
                        "mark done",
                        self.store.update_status(event.id, EventStatus::Done),
                    );
                    self.metrics.record_success(&event.event_type, attempt);
                    return;
                }
                Err((failed_id, message)) => {
                    errors.push(message.clone());
                    retry_count += 1;
                    self.report_write(
                        event.id,
                        "write retry state",
                        self.store.update_retry(event.id, retry_count, &errors),
                    );

                    let exhausted = attempt >= max_attempts;
                    let next_delay = if exhausted {
                        Duration::ZERO
                    } else {
                        policy.delay_for(attempt + 1)
                    };

                    self.sink.emit(&RetryLogEntry {
                        level: "warn",
                        event_id: event.id,
                        event_type: event.event_type.clone(),
                        subscription_id: failed_id,
                        attempt,
                        max_attempts,
                        delay_ms: next_delay.as_millis() as u64,
                        error: message,
                    });

                    if exhausted {
                        self.report_write(
                            event.id,
                            "move to dlq",
                            self.store.move_to_dlq(event.id, &errors),
                        );
                        self.metrics.record_dlq(&event.event_type, policy.max_retries);
                        return;
                    }

                    time::sleep(next_delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Runs one sequential pass over the admitted handlers.
    ///
    /// Returns the failing subscription and its message, or `Ok` when every
    /// handler succeeded. Circuit outcomes are recorded here, and probe
    /// slots held by skipped subscriptions are released.
    async fn run_attempt(
        &self,
        event: &Event,
        admitted: &mut [AdmittedSub],
    ) -> std::result::Result<(), (SubscriptionId, String)> {
        let mut failed: Option<(usize, SubscriptionId, String)> = None;

        for (i, a) in admitted.iter().enumerate() {
            match self.invoke(&a.sub, event.clone()).await {
                Ok(()) => {}
                Err(err) => {
                    failed = Some((i, a.sub.id, err.to_string()));
                    break;
                }
            }
        }

        let failed_idx = failed.as_ref().map(|(i, _, _)| *i).unwrap_or(admitted.len());

        for (i, a) in admitted.iter_mut().enumerate() {
            if i < failed_idx {
                self.circuit.record(a.sub.id, true);
            } else if i == failed_idx {
                self.circuit.record(a.sub.id, false);
            } else if a.probe {
                // Admitted as probe, never executed: free the slot or the
                // subscription deadlocks in half-open.
                self.circuit.release_probe(a.sub.id);
            }
            // Either way this dispatch no longer holds the probe.
            a.probe = false;
        }

        match failed {
            None => Ok(()),
            Some((_, id, message)) => Err((id, message)),
        }
    }

    /// Reports a failed storage write without letting it escape the dispatch.
    ///
    /// A closed store answers writes with `Ok`, so anything arriving here is
    /// a real failure: the durable row has diverged from the in-memory
    /// lifecycle and operators need the trace. A rejected status transition
    /// means the dispatcher itself drove an illegal edge, which is a bug in
    /// this crate, not an I/O condition.
    fn report_write(&self, event_id: EventId, op: &'static str, result: Result<(), BusError>) {
        match result {
            Ok(()) => {}
            Err(err @ BusError::InvalidTransition { .. }) => {
                tracing::error!(
                    event_id = %event_id,
                    op,
                    error = %err,
                    "event lifecycle violation during dispatch"
                );
            }
            Err(err) => {
                tracing::error!(
                    event_id = %event_id,
                    op,
                    error = %err,
                    "storage write failed during dispatch"
                );
            }
        }
    }

    /// Invokes one handler raced against its per-subscription timeout.
    ///
    /// The handler runs as its own task: when the timeout wins, the handler
    /// is abandoned rather than cancelled. A panicking handler is reported
    /// as a plain failure.
    async fn invoke(&self, sub: &Subscription, event: Event) -> Result<(), HandlerError> {
        let handle = tokio::spawn(sub.handler.call(event));
        match time::timeout(sub.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HandlerError::fail(format!("handler panicked: {join_err}"))),
            Err(_elapsed) => Err(HandlerError::Timeout {
                timeout: sub.timeout,
            }),
        }
    }
}
