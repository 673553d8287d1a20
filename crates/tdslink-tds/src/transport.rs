//! Transport resolution stage.
//!
//! Turns the parsed endpoint into an open byte stream. Without a protocol
//! prefix the viable transports are tried in a fixed order and the first
//! one that opens wins. With a prefix exactly that transport is used.
//!
//! In async mode host names resolve on asupersync's blocking pool and the
//! connect races cancellation. SQL Browser lookups and named pipe opens stay
//! blocking in both modes; each is a single short exchange bounded by the
//! connect timeout. A blocking-mode TCP connect is likewise only bounded by
//! the connect timeout.

use std::io;
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use asupersync::net::{TcpStream, lookup_all};
use tdslink_core::cancel::with_cancel;
use tdslink_core::error::{ConnectionError, ConnectionErrorKind, Error};
use tdslink_core::{Cx, ExecutionMode, Outcome, cancel_requested};

use crate::context::NegotiationContext;
use crate::endpoint::{DEFAULT_TCP_PORT, Endpoint, Protocol};
use crate::pipeline::{Handler, HandlerFuture};
use crate::ssrp::{DEFAULT_INSTANCE, SsrpClient};
use crate::stream::{ConnectionStream, TdsStream};

/// Port of the dedicated admin connection when SQL Browser cannot be asked.
pub const DEFAULT_ADMIN_PORT: u16 = 1434;

fn unsupported(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::UnsupportedProtocol,
        message: message.into(),
        source: None,
    })
}

fn is_unsupported(err: &Error) -> bool {
    matches!(
        err,
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::UnsupportedProtocol,
            ..
        })
    )
}

/// Transports to try for an endpoint, in order.
pub fn candidate_protocols(endpoint: &Endpoint) -> Vec<Protocol> {
    match endpoint.protocol {
        Protocol::Auto if endpoint.is_local => vec![
            Protocol::SharedMemory,
            Protocol::Tcp,
            Protocol::NamedPipe,
        ],
        Protocol::Auto => vec![Protocol::Tcp, Protocol::NamedPipe],
        explicit => vec![explicit],
    }
}

/// First pipeline stage: opens the transport.
#[derive(Debug, Default)]
pub struct TransportResolver;

impl TransportResolver {
    pub fn new() -> Self {
        Self
    }

    async fn resolve(
        &self,
        cx: &Cx,
        ctx: &mut NegotiationContext,
        mode: ExecutionMode,
    ) -> Outcome<(), Error> {
        if let Some(stream) = &ctx.transport {
            tracing::debug!(transport = ?stream.transport_kind(), "keeping supplied transport");
            return Outcome::Ok(());
        }

        let candidates = candidate_protocols(&ctx.endpoint);
        let probing = ctx.endpoint.protocol == Protocol::Auto;
        let mut last_err: Option<Error> = None;

        for protocol in candidates {
            if let Some(reason) = cancel_requested(cx) {
                return Outcome::Cancelled(reason);
            }
            match self.open(cx, ctx, protocol, mode).await {
                Outcome::Ok(stream) => {
                    tracing::debug!(%protocol, endpoint = %ctx.endpoint, "transport open");
                    ctx.transport = Some(TdsStream::new(stream, ctx.config.packet_size));
                    ctx.resolved_protocol = Some(protocol);
                    return Outcome::Ok(());
                }
                Outcome::Err(e) if probing => {
                    tracing::debug!(%protocol, error = %e, "transport not viable");
                    // the first real failure explains more than a later "unsupported"
                    if last_err.as_ref().is_none_or(is_unsupported) {
                        last_err = Some(e);
                    }
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        Outcome::Err(last_err.unwrap_or_else(|| {
            unsupported(format!("no transport available for '{}'", ctx.endpoint))
        }))
    }

    async fn open(
        &self,
        cx: &Cx,
        ctx: &mut NegotiationContext,
        protocol: Protocol,
        mode: ExecutionMode,
    ) -> Outcome<ConnectionStream, Error> {
        let config = &ctx.config;
        let endpoint = &ctx.endpoint;
        // blocking UDP even in async mode, see the module docs
        let ssrp = SsrpClient::new(config.browser_port, config.connect_timeout);

        let port = match protocol {
            Protocol::SharedMemory => {
                return Outcome::Err(unsupported(
                    "shared memory transport is not available in this build",
                ));
            }
            Protocol::NamedPipe => return open_pipe(&endpoint.named_pipe_path()),
            Protocol::Tcp | Protocol::Auto => match (endpoint.port, &endpoint.instance) {
                (Some(port), _) => port,
                (None, Some(instance)) => match ssrp.instance_port(&endpoint.host, instance) {
                    Ok(port) => port,
                    Err(e) => return Outcome::Err(e),
                },
                (None, None) => DEFAULT_TCP_PORT,
            },
            Protocol::Admin => endpoint.port.unwrap_or_else(|| {
                let instance = endpoint.instance.as_deref().unwrap_or(DEFAULT_INSTANCE);
                ssrp.dac_port(&endpoint.host, instance).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "admin port lookup failed, using default");
                    DEFAULT_ADMIN_PORT
                })
            }),
        };

        let timeout = config.connect_timeout;
        let host = endpoint.host.clone();
        let outcome = connect_tcp(cx, &host, port, timeout, mode).await;
        if matches!(outcome, Outcome::Ok(_)) {
            ctx.resolved_port = Some(port);
        }
        outcome
    }
}

impl Handler for TransportResolver {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn handle<'a>(
        &'a self,
        cx: &'a Cx,
        ctx: &'a mut NegotiationContext,
        mode: ExecutionMode,
    ) -> HandlerFuture<'a> {
        Box::pin(self.resolve(cx, ctx, mode))
    }
}

#[cfg(unix)]
fn open_pipe(path: &str) -> Outcome<ConnectionStream, Error> {
    if !path.starts_with('/') {
        return Outcome::Err(unsupported(format!(
            "named pipe '{path}' is not reachable from this platform"
        )));
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(stream) => Outcome::Ok(ConnectionStream::Pipe(stream)),
        Err(e) => Outcome::Err(connect_error(format!("Failed to open pipe {path}"), e)),
    }
}

#[cfg(not(unix))]
fn open_pipe(path: &str) -> Outcome<ConnectionStream, Error> {
    Outcome::Err(unsupported(format!(
        "named pipe '{path}' is not supported on this platform"
    )))
}

fn connect_error(message: String, e: io::Error) -> Error {
    let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Connect
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("{message}: {e}"),
        source: Some(Arc::new(e)),
    })
}

/// Resolve `host:port`. Async mode hands the lookup to asupersync so the
/// reactor thread never waits on DNS.
async fn resolve_addrs(
    cx: &Cx,
    host: &str,
    port: u16,
    mode: ExecutionMode,
) -> Outcome<Vec<SocketAddr>, Error> {
    let resolved = match mode {
        ExecutionMode::Blocking => (host, port).to_socket_addrs().map(Iterator::collect),
        ExecutionMode::Async => {
            let lookup = lookup_all((host.to_string(), port));
            match with_cancel(cx, lookup).await {
                Ok(resolved) => resolved,
                Err(reason) => return Outcome::Cancelled(reason),
            }
        }
    };
    let addrs: Vec<SocketAddr> = match resolved {
        Ok(addrs) => addrs,
        Err(e) => {
            return Outcome::Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::DnsResolution,
                message: format!("Failed to resolve {host}:{port}: {e}"),
                source: Some(Arc::new(e)),
            }));
        }
    };
    if addrs.is_empty() {
        return Outcome::Err(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::DnsResolution,
            message: format!("No address found for {host}:{port}"),
            source: None,
        }));
    }
    Outcome::Ok(addrs)
}

/// Open a TCP connection, trying each resolved address in turn.
async fn connect_tcp(
    cx: &Cx,
    host: &str,
    port: u16,
    timeout: Duration,
    mode: ExecutionMode,
) -> Outcome<ConnectionStream, Error> {
    let addrs = match resolve_addrs(cx, host, port, mode).await {
        Outcome::Ok(addrs) => addrs,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let mut last_err = None;
    for addr in addrs {
        if let Some(reason) = cancel_requested(cx) {
            return Outcome::Cancelled(reason);
        }
        let attempt = match mode {
            ExecutionMode::Blocking => StdTcpStream::connect_timeout(&addr, timeout).map(|s| {
                s.set_nodelay(true).ok();
                ConnectionStream::Sync(s)
            }),
            ExecutionMode::Async => {
                match with_cancel(cx, TcpStream::connect_timeout(addr, timeout)).await {
                    Ok(attempt) => attempt.map(|s| {
                        s.set_nodelay(true).ok();
                        ConnectionStream::Async(s)
                    }),
                    Err(reason) => return Outcome::Cancelled(reason),
                }
            }
        };
        if let Some(reason) = cancel_requested(cx) {
            return Outcome::Cancelled(reason);
        }
        match attempt {
            Ok(stream) => {
                tracing::debug!(%addr, ?mode, "tcp connected");
                return Outcome::Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "tcp connect failed");
                last_err = Some(connect_error(format!("Failed to connect to {addr}"), e));
            }
        }
    }
    Outcome::Err(last_err.unwrap_or_else(|| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("Failed to connect to {host}:{port}"),
            source: None,
        })
    }))
}
