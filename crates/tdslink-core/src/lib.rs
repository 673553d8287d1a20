//! Core types for tdslink.
//!
//! This crate holds the pieces that are independent of the TDS wire format:
//!
//! - `Error` taxonomy shared by every negotiation stage
//! - `Outcome` / `Cx` re-exports from asupersync for cancel-correct operations
//! - `ExecutionMode` selecting blocking or async transports
//! - Retry strategies (`retry`) and admission limiters (`rate_limit`)
//! - Cancellation-aware waits (`cancel`)

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{CancelReason, Cx, Outcome};

pub mod cancel;
pub mod duration_ms;
pub mod error;
pub mod rate_limit;
pub mod retry;

pub use cancel::cancel_requested;
pub use error::{Error, Result};
pub use rate_limit::{
    ConcurrencyLimiter, PassThroughLimiter, Permit, RateLimiter, RateLimiterChain,
    TokenBucketLimiter,
};
pub use retry::{
    RetryDecision, RetryPolicy, RetryStrategy, RetryingEvent, SleepFuture, Sleeper,
    ThreadSleeper,
};

/// How a negotiation is being driven.
///
/// Both modes run the same state machine and emit the same bytes. The mode
/// only picks which transport flavor gets opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    /// Caller thread blocks on I/O (std sockets)
    Blocking,
    /// Non-blocking sockets driven by the asupersync reactor
    #[default]
    Async,
}

impl ExecutionMode {
    pub const fn is_async(self) -> bool {
        matches!(self, ExecutionMode::Async)
    }
}
