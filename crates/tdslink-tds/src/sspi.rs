//! Integrated authentication (SSPI / GSSAPI) negotiation.
//!
//! The security package itself lives behind [`SspiContextProvider`]. The
//! negotiator creates one context lazily, feeds it the server's tokens and
//! walks the candidate SPNs when more than one is known.

use std::fmt;
use std::sync::Arc;

use tdslink_core::error::{AuthenticationError, AuthenticationErrorCode, BoxError, Error, Result};
use tdslink_core::{Cx, ExecutionMode, Outcome, cancel_requested};

use crate::config::AuthenticationMethod;
use crate::context::NegotiationContext;
use crate::pipeline::{Handler, HandlerFuture};

/// One security context, kept for all round trips of an attempt.
pub trait SspiContext: Send + fmt::Debug {
    /// Produce the next token for `spn`.
    ///
    /// `incoming` is empty on the first call. `Ok(None)` means the package
    /// rejected this SPN; an `Err` aborts the negotiation.
    fn generate(
        &mut self,
        incoming: &[u8],
        spn: &str,
    ) -> std::result::Result<Option<Vec<u8>>, BoxError>;
}

/// Factory for security contexts.
pub trait SspiContextProvider: Send + Sync + fmt::Debug {
    fn create_context(&self) -> std::result::Result<Box<dyn SspiContext>, BoxError>;
}

fn generate_failed(
    message: impl Into<String>,
    spn: Option<&str>,
    source: Option<BoxError>,
) -> Error {
    Error::Authentication(AuthenticationError {
        code: AuthenticationErrorCode::GenerateContextFailed,
        message: message.into(),
        spn: spn.map(str::to_string),
        source: source.map(Arc::from),
    })
}

/// Drives a security context through the token exchange.
#[derive(Debug)]
pub struct SspiNegotiator {
    provider: Arc<dyn SspiContextProvider>,
    context: Option<Box<dyn SspiContext>>,
    target_spn: Option<String>,
}

impl SspiNegotiator {
    pub fn new(provider: Arc<dyn SspiContextProvider>) -> Self {
        Self {
            provider,
            context: None,
            target_spn: None,
        }
    }

    /// SPN the last successful step used.
    pub fn target_spn(&self) -> Option<&str> {
        self.target_spn.as_deref()
    }

    fn context(&mut self) -> Result<&mut Box<dyn SspiContext>> {
        if self.context.is_none() {
            let created = self.provider.create_context().map_err(|e| {
                generate_failed("failed to create security context", None, Some(e))
            })?;
            self.context = Some(created);
        }
        self.context
            .as_mut()
            .ok_or_else(|| generate_failed("security context unavailable", None, None))
    }

    /// Returns `Ok(None)` when the package rejects `spn`.
    fn step(&mut self, incoming: &[u8], spn: &str) -> Result<Option<Vec<u8>>> {
        tracing::debug!(spn, incoming = incoming.len(), "generating security token");
        let token = self
            .context()?
            .generate(incoming, spn)
            .map_err(|e| {
                generate_failed(
                    format!("cannot generate SSPI context: {e}"),
                    Some(spn),
                    Some(e),
                )
            })?;
        if token.is_some() {
            self.target_spn = Some(spn.to_string());
        }
        Ok(token)
    }

    /// Produce the next token for a single SPN.
    pub fn negotiate(&mut self, incoming: &[u8], spn: &str) -> Result<Vec<u8>> {
        self.step(incoming, spn)?.ok_or_else(|| {
            generate_failed("cannot generate SSPI context", Some(spn), None)
        })
    }

    /// Try each SPN in order and return the first token produced.
    pub fn negotiate_any<S: AsRef<str>>(
        &mut self,
        incoming: &[u8],
        spns: &[S],
    ) -> Result<Vec<u8>> {
        for spn in spns {
            let spn = spn.as_ref();
            if let Some(token) = self.step(incoming, spn)? {
                return Ok(token);
            }
            tracing::debug!(spn, "security package rejected SPN");
        }
        Err(generate_failed(
            format!("cannot generate SSPI context for any of {} SPNs", spns.len()),
            spns.last().map(|s| s.as_ref()),
            None,
        ))
    }
}

/// Pipeline stage producing the first integrated-authentication token.
#[derive(Debug, Default)]
pub struct SspiHandler {
    provider: Option<Arc<dyn SspiContextProvider>>,
}

impl SspiHandler {
    pub fn new(provider: Option<Arc<dyn SspiContextProvider>>) -> Self {
        Self { provider }
    }

    /// Integrated security is in effect for this attempt.
    pub fn applies(ctx: &NegotiationContext) -> bool {
        ctx.config.integrated_security
            || (ctx.config.authentication == AuthenticationMethod::ActiveDirectoryIntegrated
                && !ctx.fed_auth_required)
    }

    fn run(&self, ctx: &mut NegotiationContext) -> Result<()> {
        if !Self::applies(ctx) {
            tracing::trace!("integrated security not requested");
            return Ok(());
        }
        let provider = self.provider.clone().ok_or_else(|| {
            Error::Authentication(AuthenticationError {
                code: AuthenticationErrorCode::ProviderUnavailable,
                message: "integrated security requested but no security package is configured"
                    .to_string(),
                spn: None,
                source: None,
            })
        })?;

        let mut negotiator = SspiNegotiator::new(provider);
        let token = match &ctx.config.server_spn {
            Some(spn) => negotiator.negotiate(&[], spn)?,
            None => {
                let spns = ctx.endpoint.spn_candidates(ctx.resolved_port);
                negotiator.negotiate_any(&[], &spns)?
            }
        };
        tracing::debug!(
            spn = negotiator.target_spn(),
            len = token.len(),
            "initial security token ready"
        );
        ctx.sspi_blob = Some(token);
        ctx.sspi = Some(negotiator);
        Ok(())
    }
}

impl Handler for SspiHandler {
    fn name(&self) -> &'static str {
        "sspi"
    }

    fn handle<'a>(
        &'a self,
        cx: &'a Cx,
        ctx: &'a mut NegotiationContext,
        _mode: ExecutionMode,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Some(reason) = cancel_requested(cx) {
                return Outcome::Cancelled(reason);
            }
            match self.run(ctx) {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::pipeline::block_on;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts one SPN; records every SPN it was asked about.
    #[derive(Debug, Default)]
    struct FakeProvider {
        accept: Option<String>,
        fail: bool,
        created: AtomicUsize,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[derive(Debug)]
    struct FakeContext {
        accept: Option<String>,
        fail: bool,
        round: u8,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl SspiContext for FakeContext {
        fn generate(
            &mut self,
            incoming: &[u8],
            spn: &str,
        ) -> std::result::Result<Option<Vec<u8>>, BoxError> {
            self.seen.lock().unwrap().push(spn.to_string());
            if self.fail {
                return Err("package exploded".into());
            }
            if self.accept.as_deref() != Some(spn) {
                return Ok(None);
            }
            self.round += 1;
            let mut token = vec![self.round];
            token.extend_from_slice(incoming);
            Ok(Some(token))
        }
    }

    impl SspiContextProvider for FakeProvider {
        fn create_context(&self) -> std::result::Result<Box<dyn SspiContext>, BoxError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeContext {
                accept: self.accept.clone(),
                fail: self.fail,
                round: 0,
                seen: Arc::clone(&self.seen),
            }))
        }
    }

    fn provider(accept: &str) -> Arc<FakeProvider> {
        Arc::new(FakeProvider {
            accept: Some(accept.to_string()),
            ..FakeProvider::default()
        })
    }

    #[test]
    fn test_negotiate_any_uses_first_accepted() {
        let p = provider("spn-c");
        let mut negotiator = SspiNegotiator::new(p.clone());

        let token = negotiator
            .negotiate_any(&[], &["spn-a", "spn-b", "spn-c"])
            .unwrap();
        assert_eq!(token, vec![1]);
        assert_eq!(negotiator.target_spn(), Some("spn-c"));
        assert_eq!(*p.seen.lock().unwrap(), vec!["spn-a", "spn-b", "spn-c"]);
    }

    #[test]
    fn test_negotiate_any_exhausted() {
        let p = provider("other");
        let mut negotiator = SspiNegotiator::new(p.clone());
        let err = negotiator.negotiate_any(&[], &["spn-a", "spn-b"]).unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(AuthenticationError {
                code: AuthenticationErrorCode::GenerateContextFailed,
                ..
            })
        ));
        assert_eq!(p.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_single_spn_fails_immediately() {
        let p = provider("other");
        let mut negotiator = SspiNegotiator::new(p.clone());
        let err = negotiator.negotiate(&[], "spn-a").unwrap_err();
        assert!(err.to_string().contains("spn-a"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provider_error_stops_walk() {
        let p = Arc::new(FakeProvider {
            fail: true,
            ..FakeProvider::default()
        });
        let mut negotiator = SspiNegotiator::new(p.clone());
        assert!(negotiator.negotiate_any(&[], &["a", "b", "c"]).is_err());
        assert_eq!(p.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_context_reused_across_round_trips() {
        let p = provider("spn");
        let mut negotiator = SspiNegotiator::new(p.clone());
        assert_eq!(negotiator.negotiate(&[], "spn").unwrap(), vec![1]);
        assert_eq!(negotiator.negotiate(&[0xAB], "spn").unwrap(), vec![2, 0xAB]);
        assert_eq!(p.created.load(Ordering::SeqCst), 1);
    }

    fn context(config: ConnectionConfig) -> NegotiationContext {
        NegotiationContext::new(Arc::new(config)).unwrap()
    }

    fn run(handler: &SspiHandler, ctx: &mut NegotiationContext) -> Outcome<(), Error> {
        let cx = Cx::for_testing();
        block_on(handler.handle(&cx, ctx, ExecutionMode::Blocking))
    }

    #[test]
    fn test_handler_skipped_without_integrated_security() {
        let handler = SspiHandler::new(None);
        let mut ctx = context(ConnectionConfig::new());
        assert!(matches!(run(&handler, &mut ctx), Outcome::Ok(())));
        assert!(ctx.sspi_blob.is_none());
    }

    #[test]
    fn test_handler_without_provider() {
        let handler = SspiHandler::new(None);
        let mut ctx = context(ConnectionConfig::new().integrated_security(true));
        assert!(matches!(
            run(&handler, &mut ctx),
            Outcome::Err(Error::Authentication(AuthenticationError {
                code: AuthenticationErrorCode::ProviderUnavailable,
                ..
            }))
        ));
    }

    #[test]
    fn test_handler_walks_spn_candidates() {
        let p = provider("MSSQLSvc/db01");
        let handler = SspiHandler::new(Some(p.clone() as Arc<dyn SspiContextProvider>));
        let mut ctx = context(
            ConnectionConfig::new()
                .data_source(r"db01\SALES")
                .integrated_security(true),
        );
        assert!(matches!(run(&handler, &mut ctx), Outcome::Ok(())));
        assert_eq!(ctx.sspi_blob, Some(vec![1]));
        assert_eq!(
            ctx.sspi.as_ref().and_then(SspiNegotiator::target_spn),
            Some("MSSQLSvc/db01")
        );
        assert_eq!(
            *p.seen.lock().unwrap(),
            vec!["MSSQLSvc/db01:SALES", "MSSQLSvc/db01"]
        );
    }

    #[test]
    fn test_handler_uses_configured_spn_only() {
        let p = provider("custom/spn");
        let handler = SspiHandler::new(Some(p.clone() as Arc<dyn SspiContextProvider>));
        let mut ctx = context(
            ConnectionConfig::new()
                .authentication(AuthenticationMethod::ActiveDirectoryIntegrated)
                .server_spn("custom/spn"),
        );
        assert!(matches!(run(&handler, &mut ctx), Outcome::Ok(())));
        assert_eq!(*p.seen.lock().unwrap(), vec!["custom/spn"]);

        // federated auth required by the server takes AD integrated off SSPI
        let mut federated = context(
            ConnectionConfig::new().authentication(AuthenticationMethod::ActiveDirectoryIntegrated),
        );
        federated.fed_auth_required = true;
        assert!(!SspiHandler::applies(&federated));
    }
}
