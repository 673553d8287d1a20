//! Retry strategies for operations that may fail transiently.
//!
//! A [`RetryPolicy`] is plain data: given how many retries already happened
//! and the last error, [`RetryPolicy::should_retry`] answers whether to go
//! again and after which delay. [`RetryStrategy`] drives an operation with a
//! policy, emitting a notification before every wait and honoring
//! cancellation while waiting. Async execution suspends the task between
//! attempts; blocking execution parks the calling thread.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::{CancelReason, Cx, Outcome, cancel_requested};

/// Retry count used by [`RetryPolicy::default`].
pub const DEFAULT_RETRY_COUNT: u32 = 10;
/// Interval used by [`RetryPolicy::default`].
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Whether the first retry skips its delay by default.
pub const DEFAULT_FIRST_FAST_RETRY: bool = true;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then invoke the operation again
    Retry { delay: Duration },
    /// Give up and surface the last error
    Stop,
}

/// Shape of the delay sequence between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Never retry.
    None,
    /// Constant delay between attempts.
    FixedInterval {
        retry_count: u32,
        #[serde(with = "crate::duration_ms")]
        interval: Duration,
        #[serde(default = "default_first_fast_retry")]
        first_fast_retry: bool,
    },
    /// Delay grows as `min + delta * (2^n - 1)`, capped at `max`.
    ExponentialBackoff {
        retry_count: u32,
        #[serde(with = "crate::duration_ms")]
        min_interval: Duration,
        #[serde(with = "crate::duration_ms")]
        max_interval: Duration,
        #[serde(with = "crate::duration_ms")]
        delta_backoff: Duration,
        #[serde(default = "default_first_fast_retry")]
        first_fast_retry: bool,
    },
}

fn default_first_fast_retry() -> bool {
    DEFAULT_FIRST_FAST_RETRY
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::FixedInterval {
            retry_count: DEFAULT_RETRY_COUNT,
            interval: DEFAULT_RETRY_INTERVAL,
            first_fast_retry: DEFAULT_FIRST_FAST_RETRY,
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval policy with the default fast-first behavior.
    pub fn fixed(retry_count: u32, interval: Duration) -> Self {
        RetryPolicy::FixedInterval {
            retry_count,
            interval,
            first_fast_retry: DEFAULT_FIRST_FAST_RETRY,
        }
    }

    /// Exponential policy with the default fast-first behavior.
    pub fn exponential(
        retry_count: u32,
        min_interval: Duration,
        max_interval: Duration,
        delta_backoff: Duration,
    ) -> Self {
        RetryPolicy::ExponentialBackoff {
            retry_count,
            min_interval,
            max_interval,
            delta_backoff,
            first_fast_retry: DEFAULT_FIRST_FAST_RETRY,
        }
    }

    /// Toggle the zero-delay first retry.
    pub fn first_fast_retry(mut self, enabled: bool) -> Self {
        match &mut self {
            RetryPolicy::None => {}
            RetryPolicy::FixedInterval {
                first_fast_retry, ..
            }
            | RetryPolicy::ExponentialBackoff {
                first_fast_retry, ..
            } => *first_fast_retry = enabled,
        }
        self
    }

    /// Maximum number of retries (not counting the initial attempt).
    pub fn retry_count(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::FixedInterval { retry_count, .. }
            | RetryPolicy::ExponentialBackoff { retry_count, .. } => *retry_count,
        }
    }

    /// Decide whether to retry after `retries_done` retries have already run.
    ///
    /// The decision depends only on the counter and the policy; the error is
    /// accepted so callers can thread it through policy wrappers.
    pub fn should_retry(&self, retries_done: u32, _last_error: &Error) -> RetryDecision {
        let (retry_count, fast_first) = match self {
            RetryPolicy::None => return RetryDecision::Stop,
            RetryPolicy::FixedInterval {
                retry_count,
                first_fast_retry,
                ..
            }
            | RetryPolicy::ExponentialBackoff {
                retry_count,
                first_fast_retry,
                ..
            } => (*retry_count, *first_fast_retry),
        };

        if retry_count == 0 || retries_done >= retry_count {
            return RetryDecision::Stop;
        }
        if fast_first && retries_done == 0 {
            return RetryDecision::Retry {
                delay: Duration::ZERO,
            };
        }

        let delay = match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::FixedInterval { interval, .. } => *interval,
            RetryPolicy::ExponentialBackoff {
                min_interval,
                max_interval,
                delta_backoff,
                ..
            } => {
                // With fast-first the exponent restarts at the second retry.
                let step = if fast_first {
                    retries_done
                } else {
                    retries_done + 1
                };
                let factor = 2u32.checked_pow(step).map_or(u32::MAX, |p| p - 1);
                min_interval
                    .saturating_add(delta_backoff.saturating_mul(factor))
                    .min(*max_interval)
            }
        };
        RetryDecision::Retry { delay }
    }
}

/// Notification emitted right before the strategy waits for the next attempt.
#[derive(Debug)]
pub struct RetryingEvent<'a> {
    /// 1-based number of the retry about to happen
    pub attempt: u32,
    pub delay: Duration,
    /// Failure that triggered the retry
    pub error: &'a Error,
}

/// Future returned by [`Sleeper::sleep_async`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CancelReason>> + Send + 'a>>;

/// Waits between attempts.
pub trait Sleeper: Send + Sync {
    /// Block the calling thread for `delay`, returning early with the reason
    /// if `cx` is cancelled. Used by [`RetryStrategy::execute_blocking`].
    fn sleep(&self, cx: &Cx, delay: Duration) -> Result<(), CancelReason>;

    /// Suspend the calling task for `delay`. Used by [`RetryStrategy::execute`].
    fn sleep_async<'a>(&'a self, cx: &'a Cx, delay: Duration) -> SleepFuture<'a> {
        Box::pin(crate::cancel::sleep(cx, delay))
    }
}

/// Sleeps on the current thread in short slices, checking for cancellation
/// between slices. Its async wait is the default timer-backed one.
#[derive(Debug, Clone, Copy)]
pub struct ThreadSleeper {
    slice: Duration,
}

impl ThreadSleeper {
    pub const fn new(slice: Duration) -> Self {
        Self { slice }
    }
}

impl Default for ThreadSleeper {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl Sleeper for ThreadSleeper {
    fn sleep(&self, cx: &Cx, delay: Duration) -> Result<(), CancelReason> {
        let deadline = Instant::now() + delay;
        loop {
            if let Some(reason) = cancel_requested(cx) {
                return Err(reason);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(self.slice));
        }
    }
}

type RetryListener = Arc<dyn Fn(&RetryingEvent<'_>) + Send + Sync>;

/// Runs an operation under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryStrategy {
    policy: RetryPolicy,
    retry_if: fn(&Error) -> bool,
    sleeper: Arc<dyn Sleeper>,
    listener: Option<RetryListener>,
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryStrategy")
            .field("policy", &self.policy)
            .field("has_listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

fn retry_all(_: &Error) -> bool {
    true
}

enum Step {
    Wait(Duration),
    Stop(Error),
}

impl RetryStrategy {
    /// Create a strategy that retries every error according to `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_if: retry_all,
            sleeper: Arc::new(ThreadSleeper::default()),
            listener: None,
        }
    }

    /// Only retry errors for which `predicate` returns true.
    pub fn retry_if(mut self, predicate: fn(&Error) -> bool) -> Self {
        self.retry_if = predicate;
        self
    }

    /// Replace the wait primitive.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Register a callback invoked before every wait.
    pub fn on_retrying(
        mut self,
        listener: impl Fn(&RetryingEvent<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, the policy gives up, or `cx` is cancelled.
    ///
    /// Cancelled and panicked outcomes from `op` are returned as-is.
    pub async fn execute<T, F, Fut>(&self, cx: &Cx, mut op: F) -> Outcome<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        let mut retries_done = 0u32;
        loop {
            if let Some(reason) = cancel_requested(cx) {
                return Outcome::Cancelled(reason);
            }
            match op().await {
                Outcome::Err(err) => match self.after_failure(retries_done, err) {
                    Step::Wait(delay) => {
                        if let Err(reason) = self.sleeper.sleep_async(cx, delay).await {
                            return wait_cancelled(retries_done, reason);
                        }
                        retries_done += 1;
                    }
                    Step::Stop(err) => return Outcome::Err(err),
                },
                other => return other,
            }
        }
    }

    /// Blocking counterpart of [`execute`](Self::execute).
    pub fn execute_blocking<T, F>(&self, cx: &Cx, mut op: F) -> Outcome<T, Error>
    where
        F: FnMut() -> Outcome<T, Error>,
    {
        let mut retries_done = 0u32;
        loop {
            if let Some(reason) = cancel_requested(cx) {
                return Outcome::Cancelled(reason);
            }
            match op() {
                Outcome::Err(err) => match self.after_failure(retries_done, err) {
                    Step::Wait(delay) => {
                        if let Err(reason) = self.sleeper.sleep(cx, delay) {
                            return wait_cancelled(retries_done, reason);
                        }
                        retries_done += 1;
                    }
                    Step::Stop(err) => return Outcome::Err(err),
                },
                other => return other,
            }
        }
    }

    fn after_failure(&self, retries_done: u32, err: Error) -> Step {
        if !(self.retry_if)(&err) {
            tracing::debug!(error = %err, "error is not transient, giving up");
            return Step::Stop(err);
        }

        let delay = match self.policy.should_retry(retries_done, &err) {
            RetryDecision::Stop => {
                tracing::debug!(retries = retries_done, error = %err, "retry budget exhausted");
                return Step::Stop(err);
            }
            RetryDecision::Retry { delay } => delay,
        };

        let event = RetryingEvent {
            attempt: retries_done + 1,
            delay,
            error: &err,
        };
        tracing::info!(
            attempt = event.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "retrying operation"
        );
        if let Some(listener) = &self.listener {
            listener(&event);
        }
        Step::Wait(delay)
    }
}

fn wait_cancelled<T>(retries_done: u32, reason: CancelReason) -> Outcome<T, Error> {
    tracing::debug!(attempt = retries_done + 1, "retry wait cancelled");
    Outcome::Cancelled(reason)
}
