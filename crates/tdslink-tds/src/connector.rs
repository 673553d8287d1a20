//! Connection entry points.
//!
//! [`Connector`] wraps the negotiation pipeline with the resilience layer:
//! the rate limiter chain admits the request, the retry strategy repeats
//! failed attempts, and every attempt starts from a fresh context.

use std::sync::Arc;

use tdslink_core::error::Error;
use tdslink_core::{Cx, ExecutionMode, Outcome, RateLimiterChain, RetryStrategy};

use crate::config::ConnectionConfig;
use crate::context::{HandshakeStatus, NegotiationContext};
use crate::endpoint::{Endpoint, Protocol};
use crate::pipeline::{Pipeline, block_on};
use crate::protocol::EncryptionOption;
use crate::sspi::{SspiContextProvider, SspiNegotiator};
use crate::stream::TdsStream;

/// A transport that went through the bootstrap stages.
#[derive(Debug)]
pub struct NegotiatedChannel {
    pub stream: TdsStream,
    pub endpoint: Endpoint,
    pub protocol: Option<Protocol>,
    /// `Success`, or `InstanceFailure` when the server did not know the instance
    pub status: HandshakeStatus,
    pub encryption: EncryptionOption,
    pub server_supports_encryption: bool,
    pub mars_capable: bool,
    pub fed_auth_required: bool,
    /// Negotiator for the remaining SSPI round trips, if integrated security is used
    pub sspi: Option<SspiNegotiator>,
    /// First SSPI token for the login record
    pub sspi_blob: Option<Vec<u8>>,
}

impl NegotiatedChannel {
    fn from_context(mut ctx: NegotiationContext) -> Result<Self, Error> {
        let stream = ctx
            .transport
            .take()
            .ok_or_else(|| Error::Custom("pipeline finished without a transport".to_string()))?;
        Ok(Self {
            stream,
            endpoint: ctx.endpoint,
            protocol: ctx.resolved_protocol,
            status: ctx.handshake_status,
            encryption: ctx.client_encryption,
            server_supports_encryption: ctx.server_supports_encryption,
            mars_capable: ctx.mars_capable,
            fed_auth_required: ctx.fed_auth_required,
            sspi: ctx.sspi,
            sspi_blob: ctx.sspi_blob,
        })
    }

    pub fn instance_failed(&self) -> bool {
        self.status == HandshakeStatus::InstanceFailure
    }

    pub fn into_stream(self) -> TdsStream {
        self.stream
    }
}

/// Connect with the standard stages and no retries.
pub async fn connect(cx: &Cx, config: ConnectionConfig) -> Outcome<NegotiatedChannel, Error> {
    Connector::new(config).open(cx).await
}

/// Blocking counterpart of [`connect`].
pub fn connect_blocking(cx: &Cx, config: ConnectionConfig) -> Outcome<NegotiatedChannel, Error> {
    Connector::new(config).open_blocking(cx)
}

/// Pipeline plus resilience policy.
#[derive(Debug)]
pub struct Connector {
    config: Arc<ConnectionConfig>,
    pipeline: Pipeline,
    retry: Option<RetryStrategy>,
    limiters: RateLimiterChain,
}

impl Connector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Pipeline::standard(None),
            retry: None,
            limiters: RateLimiterChain::pass_through(),
        }
    }

    /// Use a security package for integrated authentication.
    #[must_use]
    pub fn sspi_provider(mut self, provider: Arc<dyn SspiContextProvider>) -> Self {
        self.pipeline = Pipeline::standard(Some(provider));
        self
    }

    /// Replace the stage list.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    #[must_use]
    pub fn retry(mut self, strategy: RetryStrategy) -> Self {
        self.retry = Some(strategy);
        self
    }

    #[must_use]
    pub fn limiters(mut self, chain: RateLimiterChain) -> Self {
        self.limiters = chain;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Run the pipeline once against a caller-built context.
    ///
    /// No limiter or retry is involved; the context is consumed either way.
    pub async fn negotiate(
        &self,
        cx: &Cx,
        mut ctx: NegotiationContext,
        mode: ExecutionMode,
    ) -> Outcome<NegotiatedChannel, Error> {
        match self.pipeline.run(cx, &mut ctx, mode).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if ctx.handshake_status == HandshakeStatus::InstanceFailure {
            tracing::warn!(endpoint = %ctx.endpoint, "server reported instance failure");
        }
        match NegotiatedChannel::from_context(ctx) {
            Ok(channel) => Outcome::Ok(channel),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Blocking counterpart of [`negotiate`](Self::negotiate).
    pub fn negotiate_blocking(
        &self,
        cx: &Cx,
        ctx: NegotiationContext,
    ) -> Outcome<NegotiatedChannel, Error> {
        block_on(self.negotiate(cx, ctx, ExecutionMode::Blocking))
    }

    async fn attempt(&self, cx: &Cx, mode: ExecutionMode) -> Outcome<NegotiatedChannel, Error> {
        let ctx = match NegotiationContext::new(Arc::clone(&self.config)) {
            Ok(ctx) => ctx,
            Err(e) => return Outcome::Err(e),
        };
        self.negotiate(cx, ctx, mode).await
    }

    /// Open a negotiated channel over non-blocking sockets.
    #[tracing::instrument(level = "debug", skip_all, fields(data_source = %self.config.data_source))]
    pub async fn open(&self, cx: &Cx) -> Outcome<NegotiatedChannel, Error> {
        self.limiters
            .execute(cx, ExecutionMode::Async, self, |this, mode| async move {
                match &this.retry {
                    Some(retry) => retry.execute(cx, || this.attempt(cx, mode)).await,
                    None => this.attempt(cx, mode).await,
                }
            })
            .await
    }

    /// Open a negotiated channel over blocking sockets.
    ///
    /// Retry waits park the calling thread; each attempt runs on its own
    /// current-thread runtime.
    #[tracing::instrument(level = "debug", skip_all, fields(data_source = %self.config.data_source))]
    pub fn open_blocking(&self, cx: &Cx) -> Outcome<NegotiatedChannel, Error> {
        self.limiters.execute_blocking(cx, self, |this| {
            let attempt = || block_on(this.attempt(cx, ExecutionMode::Blocking));
            match &this.retry {
                Some(retry) => retry.execute_blocking(cx, attempt),
                None => attempt(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptMode;
    use crate::protocol::PreloginMessage;
    use crate::stream::ConnectionStream;
    use crate::test_support::{ScriptedStream, server_packet, unwrap_outcome};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tdslink_core::error::{ConnectionError, ConnectionErrorKind};
    use tdslink_core::{ConcurrencyLimiter, RateLimiter, RetryPolicy};

    fn server_reply(encryption: u8, instance: u8) -> Vec<u8> {
        let msg = PreloginMessage {
            encryption: Some(encryption),
            instance: Some(vec![instance]),
            ..PreloginMessage::default()
        };
        server_packet(&msg.encode().unwrap(), true)
    }

    fn scripted_context(config: ConnectionConfig, reply: Vec<u8>) -> NegotiationContext {
        let (stream, _) = ScriptedStream::new(reply);
        NegotiationContext::new(Arc::new(config))
            .unwrap()
            .with_transport(ConnectionStream::Custom(Box::new(stream)))
    }

    #[test]
    fn test_negotiate_over_supplied_stream() {
        let config = ConnectionConfig::new().encrypt(EncryptMode::Optional);
        let connector = Connector::new(config.clone());
        let cx = Cx::for_testing();

        let ctx = scripted_context(config, server_reply(0, 0));
        let channel = unwrap_outcome(connector.negotiate_blocking(&cx, ctx));
        assert_eq!(channel.status, HandshakeStatus::Success);
        assert_eq!(channel.encryption, EncryptionOption::LoginOnly);
        assert!(!channel.instance_failed());
        assert!(channel.sspi_blob.is_none());
    }

    #[test]
    fn test_instance_failure_is_returned_to_caller() {
        let config = ConnectionConfig::new();
        let connector = Connector::new(config.clone());
        let cx = Cx::for_testing();

        let ctx = scripted_context(config, server_reply(1, 1));
        let channel = unwrap_outcome(connector.negotiate_blocking(&cx, ctx));
        assert!(channel.instance_failed());
        assert_eq!(channel.protocol, None);
    }

    #[test]
    fn test_open_retries_refused_connections() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let strategy = RetryStrategy::new(RetryPolicy::fixed(2, std::time::Duration::ZERO))
            .on_retrying(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        let connector = Connector::new(
            ConnectionConfig::new().data_source(format!("tcp:127.0.0.1,{port}")),
        )
        .retry(strategy);
        let cx = Cx::for_testing();

        let outcome = connector.open_blocking(&cx);
        assert!(matches!(
            outcome,
            Outcome::Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Refused,
                ..
            }))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_limiter_rejection_skips_attempt() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let held = match limiter.acquire(&Cx::for_testing()) {
            Outcome::Ok(permit) => permit,
            _ => panic!("first permit should be granted"),
        };
        let connector = Connector::new(ConnectionConfig::new().data_source("tcp:127.0.0.1,1"))
            .limiters(RateLimiterChain::new().with(limiter.clone()));
        let cx = Cx::for_testing();

        assert!(matches!(
            connector.open_blocking(&cx),
            Outcome::Err(Error::Throttled(_))
        ));
        drop(held);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_invalid_config_is_not_retried() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let connector = Connector::new(ConnectionConfig::new().data_source("host,notaport")).retry(
            RetryStrategy::new(RetryPolicy::fixed(3, std::time::Duration::ZERO))
                .retry_if(Error::is_retryable)
                .on_retrying(move |_| *counter.lock().unwrap() += 1),
        );
        let cx = Cx::for_testing();

        assert!(matches!(
            connector.open_blocking(&cx),
            Outcome::Err(Error::Config(_))
        ));
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
