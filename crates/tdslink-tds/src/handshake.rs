//! Prelogin handshake stage.
//!
//! Sends the client's prelogin options, reads the server's answer and folds
//! it into the negotiation context: negotiated encryption, instance check,
//! MARS capability and whether federated authentication is required.

use tdslink_core::error::{Error, ProtocolError, ProtocolErrorKind, Result};
use tdslink_core::{Cx, ExecutionMode, Outcome};

use crate::config::{ConnectionConfig, EncryptMode};
use crate::context::{HandshakeStatus, NegotiationContext};
use crate::pipeline::{Handler, HandlerFuture};
use crate::protocol::prelogin::{INSTANCE_FAILURE, directory};
use crate::protocol::{
    EncryptionOption, PacketType, PreloginMessage, PreloginOption, PreloginVersion,
    negotiate_encryption,
};
use crate::stream::TdsStream;

/// Encryption value the client announces.
///
/// Also the client's internal intent until the server answers.
pub fn client_intent(config: &ConnectionConfig) -> EncryptionOption {
    if !config.encryption_supported || config.is_tls_first() {
        EncryptionOption::NotSupported
    } else if config.encrypt == EncryptMode::Mandatory {
        EncryptionOption::On
    } else {
        EncryptionOption::Off
    }
}

/// Build the client prelogin message and record the encryption intent.
pub fn build_request(ctx: &mut NegotiationContext) -> PreloginMessage {
    let intent = client_intent(&ctx.config);
    ctx.client_encryption = intent;

    PreloginMessage {
        version: Some(PreloginVersion::current()),
        encryption: Some(intent.as_byte()),
        // empty instance name: just the terminating zero
        instance: Some(vec![0]),
        thread_id: Some(std::process::id()),
        mars: Some(u8::from(ctx.config.mars)),
        trace_id: Some(ctx.trace_id()),
        fed_auth_required: ctx.config.fed_auth_supported.then_some(0x01),
    }
}

fn invalid_value(message: String, value: u8) -> Error {
    Error::Protocol(ProtocolError {
        kind: ProtocolErrorKind::InvalidValue,
        message,
        raw_data: Some(vec![value]),
        source: None,
    })
}

/// Fold the server's raw prelogin response into the context.
///
/// Options are applied one at a time in the order the server listed them,
/// so an error stops before any later option takes effect. VERSION, THREADID
/// and TRACEID are skipped without reading their payloads. Leaves
/// `handshake_status` at `Success` or `InstanceFailure`. Errors are returned
/// for the caller to record.
pub fn apply_response(ctx: &mut NegotiationContext, response: &[u8]) -> Result<()> {
    ctx.mars_capable = ctx.config.mars;
    ctx.fed_auth_required = false;
    let mut instance_failed = false;

    for entry in directory(response) {
        let entry = entry?;
        match entry.option {
            PreloginOption::Encryption if ctx.tls_first => {
                tracing::trace!("TLS-first session, ignoring server encryption option");
            }
            PreloginOption::Encryption => apply_encryption(ctx, entry.first_byte(response)?)?,
            PreloginOption::Instance => {
                if entry.first_byte(response)? == INSTANCE_FAILURE {
                    tracing::debug!(
                        endpoint = %ctx.endpoint,
                        "server does not know the requested instance"
                    );
                    instance_failed = true;
                }
            }
            PreloginOption::Mars => ctx.mars_capable = entry.first_byte(response)? != 0,
            PreloginOption::FedAuthRequired => {
                let fed_auth = entry.first_byte(response)?;
                if fed_auth > 0x01 {
                    tracing::warn!(value = fed_auth, "unexpected FedAuthRequired value");
                    return Err(invalid_value(
                        format!("server sent invalid FedAuthRequired value {fed_auth}"),
                        fed_auth,
                    ));
                }
                if ctx.config.uses_federated_auth_settings() {
                    ctx.fed_auth_required = fed_auth == 0x01;
                }
            }
            PreloginOption::Version
            | PreloginOption::ThreadId
            | PreloginOption::TraceId
            | PreloginOption::Unknown(_)
            | PreloginOption::Terminator => {}
        }
    }

    ctx.handshake_status = if instance_failed {
        HandshakeStatus::InstanceFailure
    } else {
        HandshakeStatus::Success
    };
    Ok(())
}

/// A value outside the protocol still means the server can encrypt; the
/// client keeps its current setting.
fn apply_encryption(ctx: &mut NegotiationContext, raw: u8) -> Result<()> {
    let Some(server) = EncryptionOption::from_byte(raw) else {
        tracing::debug!(value = raw, "unknown server encryption value, keeping client setting");
        ctx.server_supports_encryption = true;
        return Ok(());
    };
    ctx.server_supports_encryption = server != EncryptionOption::NotSupported;
    ctx.client_encryption = negotiate_encryption(ctx.client_encryption, server)?;
    tracing::debug!(?server, negotiated = ?ctx.client_encryption, "encryption negotiated");
    Ok(())
}

/// Prelogin pipeline stage.
#[derive(Debug, Default)]
pub struct PreloginHandler;

impl PreloginHandler {
    pub fn new() -> Self {
        Self
    }

    async fn send(cx: &Cx, ctx: &mut NegotiationContext) -> Outcome<(), Error> {
        let request = build_request(ctx);
        let (directory, payload) = match request.encode_parts() {
            Ok(parts) => parts,
            Err(e) => return Outcome::Err(e),
        };
        let Some(stream) = ctx.transport.as_mut() else {
            return Outcome::Err(no_transport());
        };

        stream.set_packet_type(PacketType::PreLogin);
        for byte in directory {
            match stream.write_byte(cx, byte).await {
                Outcome::Ok(()) => {}
                other => return other,
            }
        }
        match stream.write_all(cx, &payload).await {
            Outcome::Ok(()) => {}
            other => return other,
        }
        stream.flush(cx).await
    }

    /// Read the whole response message as raw bytes.
    async fn receive(cx: &Cx, stream: &mut TdsStream) -> Outcome<Vec<u8>, Error> {
        // force a packet read so packet_data_left covers the response
        match stream.peek_byte(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let mut response = vec![0u8; stream.packet_data_left()];
        match stream.read_exact(cx, &mut response).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        tracing::trace!(len = response.len(), "prelogin response received");
        Outcome::Ok(response)
    }

    async fn exchange(&self, cx: &Cx, ctx: &mut NegotiationContext) -> Outcome<(), Error> {
        match Self::send(cx, ctx).await {
            Outcome::Ok(()) => {}
            other => return other,
        }
        let Some(stream) = ctx.transport.as_mut() else {
            return Outcome::Err(no_transport());
        };
        let response = match Self::receive(cx, stream).await {
            Outcome::Ok(bytes) => bytes,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Err(e) = apply_response(ctx, &response) {
            ctx.fail(e);
        }
        Outcome::Ok(())
    }
}

fn no_transport() -> Error {
    Error::Custom("prelogin requires an open transport".to_string())
}

impl Handler for PreloginHandler {
    fn name(&self) -> &'static str {
        "prelogin"
    }

    fn handle<'a>(
        &'a self,
        cx: &'a Cx,
        ctx: &'a mut NegotiationContext,
        _mode: ExecutionMode,
    ) -> HandlerFuture<'a> {
        Box::pin(self.exchange(cx, ctx))
    }
}
