//! Connection configuration.
//!
//! Holds everything the bootstrap stages read: where to connect, which
//! encryption policy to ask for, and which authentication scheme is in use.
//! Stages never mutate it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tdslink_core::error::{ConfigError, Error, Result};

use crate::protocol::DEFAULT_PACKET_SIZE;

/// Encryption policy requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptMode {
    /// Encrypt only if the server insists (the login is still protected)
    Optional,
    /// Ask the server to encrypt the whole session
    #[default]
    Mandatory,
    /// TLS before any TDS traffic (TDS 8); prelogin encryption is not negotiated
    Strict,
}

/// Authentication scheme named in the connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationMethod {
    #[default]
    NotSpecified,
    SqlPassword,
    ActiveDirectoryPassword,
    ActiveDirectoryIntegrated,
    ActiveDirectoryInteractive,
    ActiveDirectoryServicePrincipal,
    ActiveDirectoryManagedIdentity,
    ActiveDirectoryDefault,
}

/// Produces an access token on demand.
#[derive(Clone)]
pub struct AccessTokenCallback(Arc<dyn Fn() -> Result<String> + Send + Sync>);

impl AccessTokenCallback {
    pub fn new(f: impl Fn() -> Result<String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn token(&self) -> Result<String> {
        (self.0)()
    }
}

impl fmt::Debug for AccessTokenCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessTokenCallback(..)")
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `[tcp:|np:|lpc:|admin:]server[\instance][,port]`
    pub data_source: String,
    /// Timeout for establishing the transport
    #[serde(with = "tdslink_core::duration_ms")]
    pub connect_timeout: Duration,
    /// Encryption policy
    pub encrypt: EncryptMode,
    /// Whether this client can encrypt at all
    pub encryption_supported: bool,
    /// Request multiple active result sets
    pub mars: bool,
    /// Use the platform security package (Kerberos/NTLM)
    pub integrated_security: bool,
    pub authentication: AuthenticationMethod,
    /// Pre-acquired federated authentication token
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip)]
    pub access_token_callback: Option<AccessTokenCallback>,
    /// Service principal name override for integrated authentication
    pub server_spn: Option<String>,
    /// Advertise federated authentication support in prelogin
    pub fed_auth_supported: bool,
    /// Packet size used until login negotiates another one
    pub packet_size: usize,
    /// UDP port of the SQL Browser service
    pub browser_port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            data_source: "localhost".to_string(),
            connect_timeout: Duration::from_secs(15),
            encrypt: EncryptMode::default(),
            encryption_supported: true,
            mars: false,
            integrated_security: false,
            authentication: AuthenticationMethod::default(),
            access_token: None,
            access_token_callback: None,
            server_spn: None,
            fed_auth_supported: true,
            packet_size: DEFAULT_PACKET_SIZE,
            browser_port: crate::ssrp::SQL_BROWSER_PORT,
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid connection configuration: {e}"),
                source: Some(Arc::new(e)),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the data source.
    pub fn data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the encryption policy.
    pub fn encrypt(mut self, mode: EncryptMode) -> Self {
        self.encrypt = mode;
        self
    }

    /// Declare whether the client can encrypt.
    pub fn encryption_supported(mut self, supported: bool) -> Self {
        self.encryption_supported = supported;
        self
    }

    /// Enable or disable MARS.
    pub fn mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Enable or disable integrated security.
    pub fn integrated_security(mut self, enabled: bool) -> Self {
        self.integrated_security = enabled;
        self
    }

    /// Set the authentication method.
    pub fn authentication(mut self, method: AuthenticationMethod) -> Self {
        self.authentication = method;
        self
    }

    /// Set a pre-acquired access token.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the access token callback.
    pub fn access_token_callback(mut self, callback: AccessTokenCallback) -> Self {
        self.access_token_callback = Some(callback);
        self
    }

    /// Override the service principal name.
    pub fn server_spn(mut self, spn: impl Into<String>) -> Self {
        self.server_spn = Some(spn.into());
        self
    }

    /// Advertise (or not) federated authentication support.
    pub fn fed_auth_supported(mut self, supported: bool) -> Self {
        self.fed_auth_supported = supported;
        self
    }

    /// Set the packet size.
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the SQL Browser port.
    pub fn browser_port(mut self, port: u16) -> Self {
        self.browser_port = port;
        self
    }

    /// TLS precedes all TDS traffic.
    pub fn is_tls_first(&self) -> bool {
        self.encrypt == EncryptMode::Strict
    }

    /// Whether the server's FedAuthRequired answer should be honored.
    pub fn uses_federated_auth_settings(&self) -> bool {
        self.authentication != AuthenticationMethod::NotSpecified
            || self.access_token.is_some()
            || self.access_token_callback.is_some()
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        use crate::protocol::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};

        if self.data_source.trim().is_empty() {
            return Err(config_error("data source must not be empty"));
        }
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(config_error(format!(
                "packet size {} outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}",
                self.packet_size
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(config_error("connect timeout must be positive"));
        }
        Ok(())
    }
}

pub(crate) fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
        source: None,
    })
}
