//! Ordered negotiation stages and the loop that drives them.
//!
//! Stages do not know their successor. [`Pipeline::run`] walks the list,
//! skipping stages already completed for the context and stopping as soon
//! as the context reaches a terminal status.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tdslink_core::error::Error;
use tdslink_core::{Cx, ExecutionMode, Outcome, cancel_requested};

use crate::context::{HandshakeStatus, NegotiationContext};
use crate::handshake::PreloginHandler;
use crate::sspi::{SspiContextProvider, SspiHandler};
use crate::transport::TransportResolver;

/// Future returned by [`Handler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Outcome<(), Error>> + Send + 'a>>;

/// One negotiation stage.
///
/// `Outcome::Ok` means "continue" unless the stage left a terminal status on
/// the context. Stages may either return `Outcome::Err` or record the failure
/// with [`NegotiationContext::fail`]; the driver treats both the same way.
pub trait Handler: Send + Sync {
    /// Stable stage name, used to detect re-entry.
    fn name(&self) -> &'static str;

    fn handle<'a>(
        &'a self,
        cx: &'a Cx,
        ctx: &'a mut NegotiationContext,
        mode: ExecutionMode,
    ) -> HandlerFuture<'a>;
}

/// Ordered list of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Handler>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

impl Pipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport resolution, prelogin and SSPI, in that order.
    pub fn standard(sspi_provider: Option<Arc<dyn SspiContextProvider>>) -> Self {
        Self::new()
            .with_stage(TransportResolver::new())
            .with_stage(PreloginHandler::new())
            .with_stage(SspiHandler::new(sspi_provider))
    }

    /// Append a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Handler + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Drive every stage against `ctx`.
    ///
    /// A fatal failure is returned as `Outcome::Err` and stays recorded on
    /// `ctx.error` with `ctx.handshake_status` at `FatalError`. An instance
    /// failure stops
    /// the run with `Outcome::Ok` and leaves the status for the caller.
    #[tracing::instrument(level = "debug", skip_all, fields(endpoint = %ctx.endpoint, ?mode))]
    pub async fn run(
        &self,
        cx: &Cx,
        ctx: &mut NegotiationContext,
        mode: ExecutionMode,
    ) -> Outcome<(), Error> {
        for stage in &self.stages {
            if ctx.is_terminal() {
                break;
            }
            let name = stage.name();
            if ctx.has_completed(name) {
                tracing::trace!(stage = name, "stage already completed, skipping");
                continue;
            }
            if let Some(reason) = cancel_requested(cx) {
                return Outcome::Cancelled(reason);
            }

            tracing::debug!(stage = name, "running stage");
            match stage.handle(cx, ctx, mode).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => ctx.fail(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }

            if ctx.handshake_status == HandshakeStatus::FatalError {
                let err = ctx
                    .error
                    .get_or_insert_with(|| Error::Custom(format!("stage '{name}' failed")))
                    .clone();
                tracing::debug!(stage = name, error = %err, "pipeline stopped");
                return Outcome::Err(err);
            }
            ctx.mark_completed(name);
            if ctx.is_terminal() {
                tracing::debug!(stage = name, status = ?ctx.handshake_status, "pipeline stopped");
            }
        }
        Outcome::Ok(())
    }

    /// Blocking adapter: drives [`run`](Self::run) on a current-thread
    /// runtime with [`ExecutionMode::Blocking`].
    pub fn run_blocking(&self, cx: &Cx, ctx: &mut NegotiationContext) -> Outcome<(), Error> {
        block_on(self.run(cx, ctx, ExecutionMode::Blocking))
    }
}

/// Run a future to completion on a fresh current-thread runtime.
pub(crate) fn block_on<T>(future: impl Future<Output = Outcome<T, Error>>) -> Outcome<T, Error> {
    match asupersync::runtime::RuntimeBuilder::current_thread().build() {
        Ok(rt) => rt.block_on(future),
        Err(e) => Outcome::Err(Error::Custom(format!(
            "failed to create blocking runtime: {e}"
        ))),
    }
}
