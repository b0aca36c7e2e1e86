//! Circuit breaker integration tests - state machine driven through the executor

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use circuit_breakers::config::BreakerConfig;
use circuit_breakers::failsafe::{
    Admission, BreakerState, CircuitBreaker, FallbackStrategy, Outcome, RetryExecutor,
};
use circuit_breakers::{CallError, ErrorKind};
use serde_json::{Value, json};
use tokio::time::{Instant, advance, sleep};

#[derive(Debug, PartialEq)]
struct DbError(&'static str);

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "db error: {}", self.0)
    }
}

fn config(name: &str) -> BreakerConfig {
    BreakerConfig {
        failure_rate_threshold: 0.5,
        minimum_throughput: 5,
        open_state_duration: Duration::from_secs(30),
        half_open_max_in_flight: 2,
        success_quorum_percent: 80.0,
        max_retries: 0,
        call_timeout: Duration::from_secs(2),
        jitter_ratio: 0.0,
        ..BreakerConfig::default()
    }
    .named(name)
}

async fn fail(executor: &RetryExecutor, breaker: &CircuitBreaker) -> Result<Value, CallError<DbError>> {
    executor
        .execute(breaker, || async { Err(DbError("down")) }, None)
        .await
}

async fn succeed(executor: &RetryExecutor, breaker: &CircuitBreaker) -> Result<Value, CallError<DbError>> {
    executor
        .execute(breaker, || async { Ok(json!({"rows": 1})) }, None)
        .await
}

#[tokio::test(start_paused = true)]
async fn all_success_traffic_stays_closed() {
    let breaker = CircuitBreaker::new(config("database")).unwrap();
    let executor = RetryExecutor::new();

    for _ in 0..100 {
        succeed(&executor, &breaker).await.unwrap();
        advance(Duration::from_secs(1)).await;
    }

    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.snapshot(Instant::now()).successes_total, 100);
}

#[tokio::test(start_paused = true)]
async fn full_cycle_open_half_open_closed() {
    let breaker = CircuitBreaker::new(config("database")).unwrap();
    let executor = RetryExecutor::new();

    // 3 failures of 5 trips on the fifth outcome
    fail(&executor, &breaker).await.unwrap_err();
    succeed(&executor, &breaker).await.unwrap();
    fail(&executor, &breaker).await.unwrap_err();
    succeed(&executor, &breaker).await.unwrap();
    let err = fail(&executor, &breaker).await.unwrap_err();
    assert_eq!(err.state(), Some(BreakerState::Open));
    assert_eq!(breaker.state(), BreakerState::Open);

    // Fail fast without running the operation
    let invoked = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&invoked);
    let rejected: Result<Value, CallError<DbError>> = executor
        .execute(
            &breaker,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            },
            None,
        )
        .await;
    assert_eq!(rejected.unwrap_err().kind(), ErrorKind::BreakerOpenRejection);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    advance(Duration::from_secs(30)).await;

    // Probation: 4 of 5 successes meets an 80% quorum
    for _ in 0..4 {
        succeed(&executor, &breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }
    fail(&executor, &breaker).await.unwrap_err();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_and_restarts_timer() {
    let breaker = CircuitBreaker::new(config("database")).unwrap();
    let executor = RetryExecutor::new();

    for _ in 0..5 {
        let _ = fail(&executor, &breaker).await;
    }
    advance(Duration::from_secs(30)).await;

    succeed(&executor, &breaker).await.unwrap();
    fail(&executor, &breaker).await.unwrap_err();
    assert_eq!(breaker.state(), BreakerState::Open);

    advance(Duration::from_secs(29)).await;
    assert_eq!(
        fail(&executor, &breaker).await.unwrap_err().kind(),
        ErrorKind::BreakerOpenRejection
    );
    advance(Duration::from_secs(1)).await;
    succeed(&executor, &breaker).await.unwrap();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn concurrent_probes_are_bounded() {
    let breaker = Arc::new(CircuitBreaker::new(config("external_api")).unwrap());
    let now = Instant::now();
    for _ in 0..5 {
        if let Admission::Allowed(permit) = breaker.allow(now) {
            breaker.record(permit, Outcome::Failure, now);
        }
    }
    advance(Duration::from_secs(30)).await;

    let executor = RetryExecutor::new();
    let slow = move |b: Arc<CircuitBreaker>| async move {
        executor
            .execute(
                &b,
                || async {
                    sleep(Duration::from_millis(500)).await;
                    Ok::<_, DbError>(json!("ok"))
                },
                None,
            )
            .await
    };

    let first = tokio::spawn(slow(Arc::clone(&breaker)));
    let second = tokio::spawn(slow(Arc::clone(&breaker)));
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(breaker.in_flight_probes(), 2);

    let third = fail(&executor, &breaker).await.unwrap_err();
    assert_eq!(third.kind(), ErrorKind::BreakerOpenRejection);
    assert_eq!(third.state(), Some(BreakerState::HalfOpen));
    assert_eq!(breaker.in_flight_probes(), 2);

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(breaker.in_flight_probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_half_open_call_frees_its_slot() {
    let breaker = Arc::new(
        CircuitBreaker::new(BreakerConfig {
            half_open_max_in_flight: 1,
            call_timeout: Duration::from_secs(60),
            ..config("external_api")
        })
        .unwrap(),
    );
    let now = Instant::now();
    for _ in 0..5 {
        if let Admission::Allowed(permit) = breaker.allow(now) {
            breaker.record(permit, Outcome::Failure, now);
        }
    }
    advance(Duration::from_secs(30)).await;

    let executor = RetryExecutor::new();
    let b = Arc::clone(&breaker);
    let hung = tokio::spawn(async move {
        executor
            .execute(
                &b,
                || async {
                    sleep(Duration::from_secs(30)).await;
                    Ok::<_, DbError>(json!("late"))
                },
                None,
            )
            .await
    });
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    assert_eq!(breaker.in_flight_probes(), 1);

    hung.abort();
    assert!(hung.await.unwrap_err().is_cancelled());
    assert_eq!(breaker.in_flight_probes(), 0);

    // The freed slot admits the next caller
    succeed(&executor, &breaker).await.unwrap();
    let snap = breaker.snapshot(Instant::now());
    assert_eq!(snap.state, BreakerState::HalfOpen);
    assert_eq!(snap.successes_total, 1);
    assert_eq!(snap.rejections_total, 0);
}

#[tokio::test(start_paused = true)]
async fn breaker_opened_during_backoff_stops_the_retry() {
    let breaker = Arc::new(
        CircuitBreaker::new(BreakerConfig {
            minimum_throughput: 2,
            max_retries: 1,
            backoff_base: Duration::from_secs(1),
            ..config("database")
        })
        .unwrap(),
    );
    let invoked = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&invoked);

    let executor = RetryExecutor::new();
    let b = Arc::clone(&breaker);
    let caller = tokio::spawn(async move {
        executor
            .execute(
                &b,
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<Value, _>(DbError("down")) }
                },
                None,
            )
            .await
    });
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), BreakerState::Closed);

    // Another caller's failure trips the breaker while the first one sleeps
    let now = Instant::now();
    let Admission::Allowed(permit) = breaker.allow(now) else {
        panic!("closed breaker rejected a call");
    };
    assert_eq!(breaker.record(permit, Outcome::Failure, now), BreakerState::Open);

    let err = caller.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailure);
    assert_eq!(err.into_operation_error(), Some(DbError("down")));
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    let snap = breaker.snapshot(Instant::now());
    assert_eq!(snap.state, BreakerState::Open);
    assert_eq!(snap.failures_total, 2);
    assert_eq!(snap.rejections_total, 1);
}

#[tokio::test(start_paused = true)]
async fn cached_fallback_serves_last_success_while_open() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        fallback_strategy: FallbackStrategy::Cached,
        ..config("external_api")
    })
    .unwrap();
    let executor = RetryExecutor::new();

    succeed(&executor, &breaker).await.unwrap();
    for _ in 0..4 {
        assert_eq!(fail(&executor, &breaker).await.unwrap(), json!({"rows": 1}));
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let served = fail(&executor, &breaker).await.unwrap();
    assert_eq!(served, json!({"rows": 1}));
    assert_eq!(breaker.snapshot(Instant::now()).rejections_total, 1);
}

#[tokio::test(start_paused = true)]
async fn timeouts_feed_the_failure_rate() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        call_timeout: Duration::from_millis(100),
        ..config("rag_service")
    })
    .unwrap();
    let executor = RetryExecutor::new();

    for _ in 0..5 {
        let result: Result<Value, CallError<DbError>> = executor
            .execute(
                &breaker,
                || async {
                    sleep(Duration::from_secs(10)).await;
                    Ok(json!(null))
                },
                None,
            )
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::OperationTimeout);
    }

    let snap = breaker.snapshot(Instant::now());
    assert_eq!(snap.state, BreakerState::Open);
    assert_eq!(snap.timeouts_total, 5);
    assert_eq!(snap.failures_total, 0);
}

#[test]
fn status_message_format() {
    let breaker = CircuitBreaker::new(config("cache")).unwrap();
    assert_eq!(
        breaker.status_message(Instant::now()),
        "Circuit breaker 'cache' is closed"
    );
}
