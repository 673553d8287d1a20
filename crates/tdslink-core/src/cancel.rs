//! Cancellation-aware waiting.
//!
//! A cancel request on a [`Cx`] does not wake the task that owns it, so every
//! wait here races its own readiness against a short re-arming tick and checks
//! the context between polls.

use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use asupersync::time::{Sleep, sleep as sleep_for};
use asupersync::types::Time;

use crate::{CancelReason, Cx};

/// How often a pending wait re-checks its context for cancellation.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Returns the cancellation reason if `cx` has been asked to stop.
///
/// Every suspension point calls this before touching the transport.
pub fn cancel_requested(cx: &Cx) -> Option<CancelReason> {
    if cx.is_cancel_requested() {
        Some(
            cx.cancel_reason()
                .unwrap_or_else(|| CancelReason::user("cancelled")),
        )
    } else {
        None
    }
}

// `Sleep` reads its clock from the task currently being polled, so deadlines
// are computed against the same clock.
fn clock_now(cx: &Cx) -> Time {
    Cx::current().map_or_else(|| cx.now(), |current| current.now())
}

/// Drive `poll` until it is ready, giving up as soon as `cx` is cancelled.
pub async fn race_cancel<T, F>(cx: &Cx, mut poll: F) -> Result<T, CancelReason>
where
    F: FnMut(&mut Context<'_>) -> Poll<T>,
{
    let mut tick: Option<Sleep> = None;
    poll_fn(move |task_cx| {
        loop {
            if let Some(reason) = cancel_requested(cx) {
                return Poll::Ready(Err(reason));
            }
            if let Poll::Ready(value) = poll(task_cx) {
                return Poll::Ready(Ok(value));
            }
            let timer =
                tick.get_or_insert_with(|| sleep_for(clock_now(cx), CANCEL_POLL_INTERVAL));
            match Pin::new(&mut *timer).poll(task_cx) {
                Poll::Ready(()) => timer.reset_after(clock_now(cx), CANCEL_POLL_INTERVAL),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await
}

/// Run `future` to completion unless `cx` is cancelled first.
pub async fn with_cancel<F>(cx: &Cx, future: F) -> Result<F::Output, CancelReason>
where
    F: Future,
{
    let mut future = std::pin::pin!(future);
    race_cancel(cx, |task_cx| future.as_mut().poll(task_cx)).await
}

/// Suspend the task for `delay`, returning early if `cx` is cancelled.
///
/// A zero delay still yields once so other tasks get a turn.
pub async fn sleep(cx: &Cx, delay: Duration) -> Result<(), CancelReason> {
    if let Some(reason) = cancel_requested(cx) {
        return Err(reason);
    }
    if delay.is_zero() {
        asupersync::runtime::yield_now().await;
        return cancel_requested(cx).map_or(Ok(()), Err);
    }
    let mut timer = sleep_for(clock_now(cx), delay);
    race_cancel(cx, |task_cx| Pin::new(&mut timer).poll(task_cx)).await
}
