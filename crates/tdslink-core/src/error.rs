//! Error types for connection bootstrap and resilience operations.
//!
//! Cancellation is not an error: it travels through
//! [`Outcome::Cancelled`](asupersync::Outcome) and never shows up here.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error handed over by pluggable components.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared error kept as the `source` of wrapped failures, so that an
/// [`Error`] can be recorded and returned at the same time.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// The primary error type for all tdslink operations.
#[derive(Debug)]
pub enum Error {
    /// Transport and endpoint errors (connect, resolve, disconnect)
    Connection(ConnectionError),
    /// Wire-level errors (malformed or invalid server data)
    Protocol(ProtocolError),
    /// Encryption policy conflicts found during prelogin
    Encryption(EncryptionError),
    /// Integrated authentication failures
    Authentication(AuthenticationError),
    /// Admission refused by a rate limiter
    Throttled(ThrottledError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<SharedError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// Connection lost during operation
    Disconnected,
    /// DNS resolution failed
    DnsResolution,
    /// The requested transport is not available
    UnsupportedProtocol,
    /// SQL Browser could not resolve the instance
    InstanceResolution,
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<SharedError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Structure could not be decoded (bad offsets, truncated frames)
    Malformed,
    /// A field decoded fine but holds a value outside its domain
    InvalidValue,
}

#[derive(Debug, Clone)]
pub struct EncryptionError {
    pub kind: EncryptionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionErrorKind {
    /// The server answered that it cannot encrypt
    NotSupportedByServer,
    /// The server requires encryption the client cannot provide
    NotSupportedByClient,
}

#[derive(Debug, Clone)]
pub struct AuthenticationError {
    pub code: AuthenticationErrorCode,
    pub message: String,
    /// Service principal name in use when the failure happened
    pub spn: Option<String>,
    pub source: Option<SharedError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationErrorCode {
    /// The negotiation library rejected the security context
    GenerateContextFailed,
    /// No negotiation library was configured
    ProviderUnavailable,
}

#[derive(Debug, Clone)]
pub struct ThrottledError {
    pub limiter: &'static str,
    pub message: String,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<SharedError>,
}

impl Error {
    /// Is this a failure that a fresh attempt may clear (network, throttling, timeouts)?
    ///
    /// Protocol, encryption policy and authentication failures are deterministic
    /// for a given server and never classify as retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Refused
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::DnsResolution
            ),
            Error::Throttled(_) | Error::Timeout | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// Raw bytes attached to a protocol error, if any.
    pub fn raw_data(&self) -> Option<&[u8]> {
        match self {
            Error::Protocol(p) => p.raw_data.as_deref(),
            _ => None,
        }
    }
}

impl Clone for Error {
    /// `io::Error` is not `Clone`; the copy keeps its kind and message.
    fn clone(&self) -> Self {
        match self {
            Error::Connection(e) => Error::Connection(e.clone()),
            Error::Protocol(e) => Error::Protocol(e.clone()),
            Error::Encryption(e) => Error::Encryption(e.clone()),
            Error::Authentication(e) => Error::Authentication(e.clone()),
            Error::Throttled(e) => Error::Throttled(e.clone()),
            Error::Config(e) => Error::Config(e.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Timeout => Error::Timeout,
            Error::Custom(msg) => Error::Custom(msg.clone()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Encryption(e) => write!(f, "Encryption error: {}", e.message),
            Error::Authentication(e) => {
                if let Some(spn) = &e.spn {
                    write!(f, "Authentication error (SPN {}): {}", spn, e.message)
                } else {
                    write!(f, "Authentication error: {}", e.message)
                }
            }
            Error::Throttled(e) => write!(f, "Throttled by {}: {}", e.limiter, e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Authentication(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for EncryptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<EncryptionError> for Error {
    fn from(err: EncryptionError) -> Self {
        Error::Encryption(err)
    }
}

impl From<AuthenticationError> for Error {
    fn from(err: AuthenticationError) -> Self {
        Error::Authentication(err)
    }
}

impl From<ThrottledError> for Error {
    fn from(err: ThrottledError) -> Self {
        Error::Throttled(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for tdslink operations.
pub type Result<T> = std::result::Result<T, Error>;
