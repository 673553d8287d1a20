//! Per-attempt negotiation state.

use std::sync::Arc;

use rand::RngCore;
use tdslink_core::Error;

use crate::config::ConnectionConfig;
use crate::endpoint::{Endpoint, Protocol};
use crate::protocol::{EncryptionOption, TraceId};
use crate::sspi::SspiNegotiator;
use crate::stream::{ConnectionStream, TdsStream};

/// Where the bootstrap sequence stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeStatus {
    #[default]
    InProgress,
    Success,
    /// Server answered that the requested instance does not exist
    InstanceFailure,
    FatalError,
}

impl HandshakeStatus {
    /// No stage runs after a terminal status.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            HandshakeStatus::InstanceFailure | HandshakeStatus::FatalError
        )
    }
}

/// Client activity identifier and its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityId {
    pub id: [u8; 16],
    pub sequence: u32,
}

/// State shared by the stages of one connection attempt.
///
/// Created fresh for every attempt and owned by the pipeline run that
/// drives it; stages borrow it mutably for the duration of one call.
#[derive(Debug)]
pub struct NegotiationContext {
    pub endpoint: Endpoint,
    pub config: Arc<ConnectionConfig>,
    pub transport: Option<TdsStream>,
    /// Transport the resolver settled on
    pub resolved_protocol: Option<Protocol>,
    /// Port found through SQL Browser, if one was looked up
    pub resolved_port: Option<u16>,
    pub tls_first: bool,
    /// Encryption intent before prelogin, negotiated mode after
    pub client_encryption: EncryptionOption,
    pub server_supports_encryption: bool,
    pub mars_capable: bool,
    pub fed_auth_required: bool,
    pub handshake_status: HandshakeStatus,
    pub error: Option<Error>,
    pub connection_id: [u8; 16],
    pub activity: ActivityId,
    completed: Vec<&'static str>,
    /// Negotiator kept for further SSPI round trips during login
    pub sspi: Option<SspiNegotiator>,
    /// First SSPI token to send with the login record
    pub sspi_blob: Option<Vec<u8>>,
}

impl NegotiationContext {
    /// Build a context from a configuration, parsing its data source.
    pub fn new(config: Arc<ConnectionConfig>) -> tdslink_core::Result<Self> {
        config.validate()?;
        let endpoint = Endpoint::parse(&config.data_source)?;

        let mut rng = rand::thread_rng();
        let mut connection_id = [0u8; 16];
        let mut activity_id = [0u8; 16];
        rng.fill_bytes(&mut connection_id);
        rng.fill_bytes(&mut activity_id);

        Ok(Self {
            endpoint,
            tls_first: config.is_tls_first(),
            client_encryption: EncryptionOption::Off,
            server_supports_encryption: false,
            mars_capable: config.mars,
            fed_auth_required: false,
            handshake_status: HandshakeStatus::InProgress,
            error: None,
            transport: None,
            resolved_protocol: None,
            resolved_port: None,
            connection_id,
            activity: ActivityId {
                id: activity_id,
                sequence: 1,
            },
            completed: Vec::new(),
            sspi: None,
            sspi_blob: None,
            config,
        })
    }

    /// Use an already open stream instead of resolving a transport.
    #[must_use]
    pub fn with_transport(mut self, stream: ConnectionStream) -> Self {
        self.transport = Some(TdsStream::new(stream, self.config.packet_size));
        self
    }

    /// Fix the trace identifiers (reproducible wire output).
    #[must_use]
    pub fn with_trace_ids(mut self, connection_id: [u8; 16], activity: ActivityId) -> Self {
        self.connection_id = connection_id;
        self.activity = activity;
        self
    }

    pub fn trace_id(&self) -> TraceId {
        TraceId {
            connection_id: self.connection_id,
            activity_id: self.activity.id,
            sequence: self.activity.sequence,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.handshake_status.is_terminal()
    }

    /// Record a fatal failure.
    pub fn fail(&mut self, error: Error) {
        tracing::debug!(error = %error, "negotiation failed");
        self.handshake_status = HandshakeStatus::FatalError;
        self.error = Some(error);
    }

    pub fn has_completed(&self, stage: &str) -> bool {
        self.completed.contains(&stage)
    }

    pub(crate) fn mark_completed(&mut self, stage: &'static str) {
        self.completed.push(stage);
    }

    /// Stages that ran to completion, in order.
    pub fn completed_stages(&self) -> &[&'static str] {
        &self.completed
    }
}
