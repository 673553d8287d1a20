//! Admission control for server operations.
//!
//! A [`RateLimiterChain`] holds an ordered list of limiters. Before the
//! wrapped callback runs, every limiter in the chain hands out a [`Permit`];
//! permits are released when the callback finishes, whatever its outcome.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, ThrottledError};
use crate::{Cx, ExecutionMode, Outcome, cancel_requested};

/// Admission token. Dropping it gives the capacity back to its limiter.
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Permit {
    /// A permit that holds nothing.
    pub fn empty() -> Self {
        Self { release: None }
    }

    /// A permit that runs `release` when dropped.
    pub fn on_release(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("holds_capacity", &self.release.is_some())
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// One node of a rate limiter chain.
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Short name used in logs and throttling errors.
    fn name(&self) -> &'static str;

    /// Admit one operation or refuse it.
    fn acquire(&self, cx: &Cx) -> Outcome<Permit, Error>;

    /// Release any resources. Later acquisitions are refused.
    fn dispose(&self) {}
}

/// Admits everything immediately. Stateless, so one instance serves every chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughLimiter;

static PASS_THROUGH: LazyLock<Arc<PassThroughLimiter>> =
    LazyLock::new(|| Arc::new(PassThroughLimiter));

impl PassThroughLimiter {
    /// The process-wide instance.
    pub fn shared() -> Arc<PassThroughLimiter> {
        Arc::clone(&PASS_THROUGH)
    }
}

impl RateLimiter for PassThroughLimiter {
    fn name(&self) -> &'static str {
        "pass_through"
    }

    fn acquire(&self, _cx: &Cx) -> Outcome<Permit, Error> {
        Outcome::Ok(Permit::empty())
    }
}

fn disposed_error(name: &'static str) -> Error {
    Error::Throttled(ThrottledError {
        limiter: name,
        message: "rate limiter has been disposed".to_string(),
        retry_after: None,
    })
}

/// Caps the number of operations in flight at once.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
    disposed: AtomicBool,
}

impl ConcurrencyLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            in_flight: Arc::new(AtomicUsize::new(0)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl RateLimiter for ConcurrencyLimiter {
    fn name(&self) -> &'static str {
        "concurrency"
    }

    fn acquire(&self, _cx: &Cx) -> Outcome<Permit, Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Outcome::Err(disposed_error(self.name()));
        }
        let max = self.max_in_flight;
        let admitted = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            });
        match admitted {
            Ok(_) => {
                let counter = Arc::clone(&self.in_flight);
                Outcome::Ok(Permit::on_release(move || {
                    counter.fetch_sub(1, Ordering::AcqRel);
                }))
            }
            Err(current) => {
                tracing::debug!(in_flight = current, max, "concurrency limit reached");
                Outcome::Err(Error::Throttled(ThrottledError {
                    limiter: self.name(),
                    message: format!("{current} operations already in flight (max {max})"),
                    retry_after: None,
                }))
            }
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket: `capacity` tokens, one token restored every `refill_every`.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: u32,
    refill_every: Duration,
    bucket: Mutex<Bucket>,
    disposed: AtomicBool,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Tokens available right now.
    pub fn available(&self) -> u32 {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if self.refill_every.is_zero() {
            bucket.tokens = self.capacity;
            bucket.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let earned = elapsed.as_nanos() / self.refill_every.as_nanos();
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        bucket.tokens = bucket.tokens.saturating_add(earned).min(self.capacity);
        bucket.last_refill += self.refill_every.saturating_mul(earned);
        if bucket.tokens == self.capacity {
            bucket.last_refill = now;
        }
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn acquire(&self, _cx: &Cx) -> Outcome<Permit, Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Outcome::Err(disposed_error(self.name()));
        }
        let now = Instant::now();
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.refill(&mut bucket, now);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            return Outcome::Ok(Permit::empty());
        }
        let retry_after = (bucket.last_refill + self.refill_every).saturating_duration_since(now);
        tracing::debug!(?retry_after, "token bucket empty");
        Outcome::Err(Error::Throttled(ThrottledError {
            limiter: self.name(),
            message: "no tokens available".to_string(),
            retry_after: Some(retry_after),
        }))
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

/// Ordered chain of limiters wrapping an operation.
#[derive(Debug, Clone)]
pub struct RateLimiterChain {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl Default for RateLimiterChain {
    fn default() -> Self {
        Self::pass_through()
    }
}

impl RateLimiterChain {
    /// A chain with no nodes at all.
    pub fn new() -> Self {
        Self {
            limiters: Vec::new(),
        }
    }

    /// A chain holding only the shared pass-through limiter.
    pub fn pass_through() -> Self {
        Self::new().with(PassThroughLimiter::shared())
    }

    /// Append a limiter at the end of the chain.
    pub fn with(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiters.push(limiter);
        self
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    fn acquire_all(&self, cx: &Cx) -> Outcome<Vec<Permit>, Error> {
        let mut permits = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            if let Some(reason) = cancel_requested(cx) {
                return Outcome::Cancelled(reason);
            }
            match limiter.acquire(cx) {
                Outcome::Ok(permit) => permits.push(permit),
                Outcome::Err(e) => {
                    tracing::debug!(limiter = limiter.name(), error = %e, "admission refused");
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(permits)
    }

    /// Acquire every permit in chain order, then run `callback` once with `state`.
    pub async fn execute<S, T, F, Fut>(
        &self,
        cx: &Cx,
        mode: ExecutionMode,
        state: S,
        callback: F,
    ) -> Outcome<T, Error>
    where
        F: FnOnce(S, ExecutionMode) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        let permits = match self.acquire_all(cx) {
            Outcome::Ok(p) => p,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = callback(state, mode).await;
        drop(permits);
        result
    }

    /// Blocking counterpart of [`execute`](Self::execute).
    pub fn execute_blocking<S, T, F>(&self, cx: &Cx, state: S, callback: F) -> Outcome<T, Error>
    where
        F: FnOnce(S) -> Outcome<T, Error>,
    {
        let permits = match self.acquire_all(cx) {
            Outcome::Ok(p) => p,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = callback(state);
        drop(permits);
        result
    }

    /// Dispose every node in the chain.
    pub fn dispose(&self) {
        for limiter in &self.limiters {
            limiter.dispose();
        }
    }
}
