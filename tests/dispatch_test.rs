//! Integration tests for the dispatch pipeline: retries, backoff, timeouts,
//! policy merging, metrics, and the structured retry log.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use durabus::{
    Bus, Config, Event, EventStatus, EventStore, HandlerError, HandlerFn, HandlerRef,
    RetryLogEntry, RetryLogSink, RetryOverride, SqliteStore, SubscriptionSpec,
};

/// Installs a test-writer subscriber so bus tracing shows up in failed runs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_bus() -> Bus {
    init_tracing();
    Bus::in_memory(Config::default()).expect("failed to create in-memory bus")
}

/// Handler that fails every invocation with `boom-<n>`, recording call instants.
fn failing_handler() -> (HandlerRef, Arc<AtomicU32>, Arc<Mutex<Vec<Instant>>>) {
    let calls = Arc::new(AtomicU32::new(0));
    let instants = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::clone(&calls);
    let stamps = Arc::clone(&instants);

    let handler = HandlerFn::arc(move |_event: Event| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        stamps.lock().unwrap().push(Instant::now());
        async move { Err::<(), _>(HandlerError::fail(format!("boom-{n}"))) }
    });
    (handler, calls, instants)
}

/// Handler that counts invocations and succeeds.
fn ok_handler() -> (HandlerRef, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handler = HandlerFn::arc(move |_event: Event| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>(())
        }
    });
    (handler, calls)
}

/// Retry-log sink that captures entries for assertions.
#[derive(Default)]
struct CapturingSink(Mutex<Vec<RetryLogEntry>>);

impl RetryLogSink for CapturingSink {
    fn emit(&self, entry: &RetryLogEntry) {
        self.0.lock().unwrap().push(entry.clone());
    }
}

// ---------------------------------------------------------------------------
// Exponential backoff to DLQ
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn exhausted_retries_dead_letter_with_full_history() {
    let bus = test_bus();
    let (handler, calls, instants) = failing_handler();

    bus.subscribe(
        SubscriptionSpec::any(handler).retry(RetryOverride {
            max_retries: Some(3),
            base_delay: Some(Duration::from_millis(10)),
            max_delay: Some(Duration::from_millis(1000)),
            backoff_multiplier: Some(2.0),
        }),
    )
    .await
    .unwrap();

    let id = bus.publish("flaky.job", json!({"n": 1}), None).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let stored = bus.store().get_event(id).unwrap();
    assert_eq!(stored.status, EventStatus::Dlq);
    assert_eq!(stored.retry_count, 4);
    assert_eq!(
        stored.last_error.as_deref(),
        Some(["boom-1", "boom-2", "boom-3", "boom-4"].map(String::from).as_slice())
    );
    assert!(stored.dlq_at.is_some());

    // Gaps between invocations follow 10, 20, 40ms within ±10% jitter.
    let stamps = instants.lock().unwrap();
    assert_eq!(stamps.len(), 4);
    for (i, expected_ms) in [(1usize, 10u64), (2, 20), (3, 40)] {
        let gap = stamps[i].duration_since(stamps[i - 1]);
        let lo = Duration::from_millis(expected_ms * 9 / 10);
        let hi = Duration::from_millis(expected_ms * 11 / 10);
        assert!(
            gap >= lo && gap <= hi,
            "gap {i}: {gap:?} outside [{lo:?}, {hi:?}]"
        );
    }
}

// ---------------------------------------------------------------------------
// Policy merging and sequential semantics
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn effective_policy_merges_most_permissive_across_subscriptions() {
    let bus = test_bus();

    let a_calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&a_calls);
    let a = HandlerFn::arc(move |_event: Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<(), _>(HandlerError::fail("a-fail")) }
    });

    let b_calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&b_calls);
    let b = HandlerFn::arc(move |_event: Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<(), _>(HandlerError::fail("b-fail")) }
    });

    bus.subscribe(SubscriptionSpec::new("order.*", a).retry(RetryOverride {
        max_retries: Some(1),
        base_delay: Some(Duration::from_millis(1)),
        ..Default::default()
    }))
    .await
    .unwrap();
    bus.subscribe(SubscriptionSpec::new("order.created", b).retry(RetryOverride {
        max_retries: Some(4),
        base_delay: Some(Duration::from_millis(1)),
        ..Default::default()
    }))
    .await
    .unwrap();

    let id = bus.publish("order.created", json!({}), None).await.unwrap();

    // Merged budget is max(1, 4) = 4 retries: five attempts ran.
    assert_eq!(a_calls.load(Ordering::SeqCst), 5);
    // The first failure aborts each attempt before the second handler.
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);

    let stored = bus.store().get_event(id).unwrap();
    assert_eq!(stored.status, EventStatus::Dlq);
    assert_eq!(stored.retry_count, 5);
    assert_eq!(stored.last_error.as_ref().map(Vec::len), Some(5));
}

#[tokio::test(start_paused = true)]
async fn earlier_successes_rerun_when_later_handler_fails() {
    let bus = test_bus();
    let (first, first_calls) = ok_handler();

    let second_calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&second_calls);
    let second = HandlerFn::arc(move |_event: Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<(), _>(HandlerError::fail("late-fail")) }
    });

    bus.subscribe(SubscriptionSpec::any(first)).await.unwrap();
    bus.subscribe(SubscriptionSpec::any(second).retry(RetryOverride {
        max_retries: Some(2),
        base_delay: Some(Duration::from_millis(1)),
        ..Default::default()
    }))
    .await
    .unwrap();

    let id = bus.publish("pair.job", json!({}), None).await.unwrap();

    // Event-level retry tracking: the succeeding handler runs on every attempt.
    assert_eq!(first_calls.load(Ordering::SeqCst), 3);
    assert_eq!(second_calls.load(Ordering::SeqCst), 3);
    assert_eq!(bus.store().get_event(id).unwrap().status, EventStatus::Dlq);
}

#[tokio::test(start_paused = true)]
async fn handlers_run_in_registration_order() {
    let bus = test_bus();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        bus.subscribe(SubscriptionSpec::any(HandlerFn::arc(move |_event: Event| {
            order.lock().unwrap().push(tag);
            async move { Ok::<_, HandlerError>(()) }
        })))
        .await
        .unwrap();
    }

    bus.publish("ordered.job", json!({}), None).await.unwrap();
    assert_eq!(order.lock().unwrap().as_slice(), &["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn handler_observes_processing_status() {
    let bus = test_bus();
    let seen: Arc<Mutex<Option<EventStatus>>> = Arc::new(Mutex::new(None));
    let probe = Arc::clone(&seen);

    bus.subscribe(SubscriptionSpec::any(HandlerFn::arc(move |event: Event| {
        *probe.lock().unwrap() = Some(event.status);
        async move { Ok::<_, HandlerError>(()) }
    })))
    .await
    .unwrap();

    bus.publish("status.check", json!({}), None).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(EventStatus::Processing));
}

// ---------------------------------------------------------------------------
// Timeouts and panics
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn slow_handler_fails_with_synthesized_timeout() {
    let bus = test_bus();

    bus.subscribe(
        SubscriptionSpec::any(HandlerFn::arc(|_event: Event| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, HandlerError>(())
        }))
        .timeout(Duration::from_millis(50))
        .retry(RetryOverride {
            max_retries: Some(0),
            ..Default::default()
        }),
    )
    .await
    .unwrap();

    let id = bus.publish("slow.job", json!({}), None).await.unwrap();

    let stored = bus.store().get_event(id).unwrap();
    assert_eq!(stored.status, EventStatus::Dlq);
    let history = stored.last_error.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].contains("timed out after"), "got: {}", history[0]);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_is_recorded_as_failure() {
    let bus = test_bus();

    bus.subscribe(
        SubscriptionSpec::any(HandlerFn::arc(|_event: Event| async move {
            if std::hint::black_box(true) {
                panic!("handler exploded");
            }
            Ok::<_, HandlerError>(())
        }))
        .retry(RetryOverride {
            max_retries: Some(0),
            ..Default::default()
        }),
    )
    .await
    .unwrap();

    let id = bus.publish("panicky.job", json!({}), None).await.unwrap();

    let stored = bus.store().get_event(id).unwrap();
    assert_eq!(stored.status, EventStatus::Dlq);
    let history = stored.last_error.unwrap();
    assert!(history[0].contains("handler panicked"), "got: {}", history[0]);
}

// ---------------------------------------------------------------------------
// Retry log
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retry_log_names_the_failed_subscription_per_attempt() {
    init_tracing();
    let sink = Arc::new(CapturingSink::default());
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let bus = Bus::with_sink(store, Config::default(), Arc::clone(&sink) as Arc<dyn RetryLogSink>);

    let (handler, _, _) = failing_handler();
    let sub_id = bus
        .subscribe(SubscriptionSpec::any(handler).retry(RetryOverride {
            max_retries: Some(1),
            base_delay: Some(Duration::from_millis(10)),
            ..Default::default()
        }))
        .await
        .unwrap();

    let id = bus.publish("logged.job", json!({}), None).await.unwrap();

    let entries = sink.0.lock().unwrap();
    assert_eq!(entries.len(), 2);

    let first = &entries[0];
    assert_eq!(first.level, "warn");
    assert_eq!(first.event_id, id);
    assert_eq!(first.event_type, "logged.job");
    assert_eq!(first.subscription_id, sub_id);
    assert_eq!(first.attempt, 1);
    assert_eq!(first.max_attempts, 2);
    assert!((9..=11).contains(&first.delay_ms), "delay {}", first.delay_ms);
    assert_eq!(first.error, "boom-1");

    let last = &entries[1];
    assert_eq!(last.attempt, 2);
    assert_eq!(last.delay_ms, 0, "final attempt logs no upcoming delay");
    assert_eq!(last.error, "boom-2");
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn metrics_track_success_after_retry() {
    let bus = test_bus();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    // Fails twice, then succeeds.
    let handler = HandlerFn::arc(move |_event: Event| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= 2 {
                Err(HandlerError::fail(format!("warmup-{n}")))
            } else {
                Ok(())
            }
        }
    });

    bus.subscribe(SubscriptionSpec::any(handler).retry(RetryOverride {
        base_delay: Some(Duration::from_millis(1)),
        ..Default::default()
    }))
    .await
    .unwrap();

    let id = bus.publish("warmup.job", json!({}), None).await.unwrap();

    let stored = bus.store().get_event(id).unwrap();
    assert_eq!(stored.status, EventStatus::Done);
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.last_error.as_ref().map(Vec::len), Some(2));

    let m = bus.metrics_for("warmup.job").unwrap();
    assert_eq!(m.events_observed, 1);
    assert_eq!(m.success_after_retry, 1);
    assert_eq!(m.total_retries, 2);
    assert_eq!(m.dlq_count, 0);
}

#[tokio::test(start_paused = true)]
async fn metrics_track_dlq_and_observed_counts() {
    let bus = test_bus();
    let (handler, _, _) = failing_handler();

    bus.subscribe(SubscriptionSpec::new("doomed.*", handler).retry(RetryOverride {
        max_retries: Some(2),
        base_delay: Some(Duration::from_millis(1)),
        ..Default::default()
    }))
    .await
    .unwrap();

    bus.publish("doomed.job", json!({}), None).await.unwrap();
    // An unmatched type is still observed.
    bus.publish("fine.job", json!({}), None).await.unwrap();

    let doomed = bus.metrics_for("doomed.job").unwrap();
    assert_eq!(doomed.dlq_count, 1);
    assert_eq!(doomed.total_retries, 2);
    assert_eq!(doomed.events_observed, 1);

    let fine = bus.metrics_for("fine.job").unwrap();
    assert_eq!(fine.events_observed, 1);
    assert_eq!(fine.dlq_count, 0);

    assert_eq!(bus.metrics().len(), 2);
}
