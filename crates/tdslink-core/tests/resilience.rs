use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use asupersync::runtime::RuntimeBuilder;
use asupersync::{CancelReason, Cx, Outcome};

use tdslink_core::error::{ConnectionError, ConnectionErrorKind, ThrottledError};
use tdslink_core::{
    ConcurrencyLimiter, Error, ExecutionMode, PassThroughLimiter, RateLimiterChain,
    RetryDecision, RetryPolicy, RetryStrategy, Sleeper, TokenBucketLimiter,
};

fn refused() -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Refused,
        message: "connection refused".to_string(),
        source: None,
    })
}

/// Records requested delays without sleeping.
#[derive(Debug, Default)]
struct RecordingSleeper {
    delays: std::sync::Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, _cx: &Cx, delay: Duration) -> Result<(), CancelReason> {
        self.delays.lock().unwrap().push(delay);
        Ok(())
    }
}

#[test]
fn retry_count_bounds_invocations() {
    for retry_count in [0u32, 1, 4] {
        let sleeper = Arc::new(RecordingSleeper::default());
        let strategy = RetryStrategy::new(RetryPolicy::fixed(retry_count, Duration::from_millis(5)))
            .sleeper(sleeper.clone());
        let calls = AtomicU32::new(0);
        let cx = Cx::for_testing();

        let outcome: Outcome<(), Error> = strategy.execute_blocking(&cx, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Outcome::Err(refused())
        });

        assert!(matches!(outcome, Outcome::Err(Error::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), retry_count + 1);
        assert_eq!(sleeper.delays.lock().unwrap().len(), retry_count as usize);
    }
}

#[test]
fn first_fast_retry_only_zeroes_the_first_delay() {
    let interval = Duration::from_millis(250);
    let fast = RetryPolicy::fixed(3, interval);
    let slow = RetryPolicy::fixed(3, interval).first_fast_retry(false);
    let err = refused();

    assert_eq!(
        fast.should_retry(0, &err),
        RetryDecision::Retry {
            delay: Duration::ZERO
        }
    );
    assert_eq!(fast.should_retry(1, &err), RetryDecision::Retry { delay: interval });
    assert_eq!(slow.should_retry(0, &err), RetryDecision::Retry { delay: interval });
    assert_eq!(fast.should_retry(3, &err), RetryDecision::Stop);
}

#[test]
fn async_and_blocking_retry_agree() {
    let strategy = RetryStrategy::new(RetryPolicy::fixed(2, Duration::ZERO));
    let cx = Cx::for_testing();

    let blocking_calls = AtomicU32::new(0);
    let blocking: Outcome<u32, Error> = strategy.execute_blocking(&cx, || {
        let n = blocking_calls.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Outcome::Err(refused())
        } else {
            Outcome::Ok(n)
        }
    });

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let async_calls = AtomicU32::new(0);
    let asynchronous: Outcome<u32, Error> = rt.block_on(strategy.execute(&cx, || {
        let n = async_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Outcome::Err(refused())
            } else {
                Outcome::Ok(n)
            }
        }
    }));

    assert!(matches!(blocking, Outcome::Ok(2)));
    assert!(matches!(asynchronous, Outcome::Ok(2)));
}

/// Flip the context's cancel flag from another thread after `after`.
fn cancel_later(cx: &Cx, after: Duration) -> std::thread::JoinHandle<()> {
    let cx = cx.clone();
    std::thread::spawn(move || {
        std::thread::sleep(after);
        cx.set_cancel_requested(true);
    })
}

#[test]
fn blocking_retry_wait_observes_cancellation() {
    let strategy = RetryStrategy::new(
        RetryPolicy::fixed(3, Duration::from_secs(10)).first_fast_retry(false),
    );
    let cx = Cx::for_testing();
    let calls = AtomicU32::new(0);
    let canceller = cancel_later(&cx, Duration::from_millis(100));

    let start = Instant::now();
    let outcome: Outcome<(), Error> = strategy.execute_blocking(&cx, || {
        calls.fetch_add(1, Ordering::SeqCst);
        Outcome::Err(refused())
    });
    canceller.join().unwrap();

    assert!(matches!(outcome, Outcome::Cancelled(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn async_retry_wait_observes_cancellation() {
    let strategy = RetryStrategy::new(
        RetryPolicy::fixed(3, Duration::from_secs(10)).first_fast_retry(false),
    );
    let cx = Cx::for_testing();
    let calls = AtomicU32::new(0);
    let canceller = cancel_later(&cx, Duration::from_millis(100));

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let start = Instant::now();
    let outcome: Outcome<(), Error> = rt.block_on(strategy.execute(&cx, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Outcome::Err(refused()) }
    }));
    canceller.join().unwrap();

    assert!(matches!(outcome, Outcome::Cancelled(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn retry_policy_from_json() {
    let policy: RetryPolicy = serde_json::from_str(
        r#"{"kind": "fixed_interval", "retry_count": 3, "interval": 500}"#,
    )
    .expect("parse policy");
    assert_eq!(policy, RetryPolicy::fixed(3, Duration::from_millis(500)));
}

#[test]
fn pass_through_chain_runs_callback_once() {
    let chain = RateLimiterChain::new().with(PassThroughLimiter::shared());
    let cx = Cx::for_testing();
    let calls = AtomicU32::new(0);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let outcome: Outcome<String, Error> = rt.block_on(chain.execute(
        &cx,
        ExecutionMode::Async,
        "state".to_string(),
        |state, mode| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                assert!(mode.is_async());
                Outcome::Ok(format!("{state}!"))
            }
        },
    ));

    assert!(matches!(outcome, Outcome::Ok(ref s) if s == "state!"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn chained_limiters_reject_in_order() {
    let concurrency = Arc::new(ConcurrencyLimiter::new(4));
    let bucket = Arc::new(TokenBucketLimiter::new(1, Duration::from_secs(60)));
    let chain = RateLimiterChain::new()
        .with(concurrency.clone())
        .with(bucket.clone());
    let cx = Cx::for_testing();

    let first: Outcome<(), Error> = chain.execute_blocking(&cx, (), |()| Outcome::Ok(()));
    assert!(matches!(first, Outcome::Ok(())));

    let calls = AtomicU32::new(0);
    let second: Outcome<(), Error> = chain.execute_blocking(&cx, (), |()| {
        calls.fetch_add(1, Ordering::SeqCst);
        Outcome::Ok(())
    });
    match second {
        Outcome::Err(Error::Throttled(ThrottledError { retry_after, .. })) => {
            assert!(retry_after.is_some());
        }
        _ => panic!("token bucket should reject the second request"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // the concurrency permit taken before the rejection was released
    assert_eq!(concurrency.in_flight(), 0);

    chain.dispose();
}
