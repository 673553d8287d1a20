//! TDS connection bootstrap for tdslink.
//!
//! This crate turns a data source string into a negotiated TDS channel:
//!
//! - Data source parsing and SQL Browser (SSRP) instance lookup
//! - Transport resolution over TCP (blocking or async) and local pipes
//! - TDS packet framing
//! - Prelogin option codec and handshake (encryption, instance, MARS, FedAuth)
//! - Integrated authentication token negotiation over a pluggable package
//! - A [`Connector`] applying rate limiting and retries around the whole run
//!
//! # Bootstrap sequence
//!
//! Each attempt builds a fresh [`NegotiationContext`] and hands it to a
//! [`Pipeline`] of stages: transport → prelogin → SSPI. A stage that records
//! a terminal status stops the run; later stages (login, TLS upgrade) plug
//! into the same [`Handler`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tdslink_core::{Cx, Outcome, RetryPolicy, RetryStrategy};
//! use tdslink_tds::{ConnectionConfig, Connector, EncryptMode};
//!
//! let config = ConnectionConfig::new()
//!     .data_source(r"tcp:db01\SALES")
//!     .encrypt(EncryptMode::Optional);
//!
//! let connector = Connector::new(config)
//!     .retry(RetryStrategy::new(RetryPolicy::fixed(3, Duration::from_secs(1))));
//!
//! match connector.open(&cx).await {
//!     Outcome::Ok(channel) => println!("encryption: {:?}", channel.encryption),
//!     Outcome::Err(e) => eprintln!("connect failed: {e}"),
//!     _ => {}
//! }
//! ```

pub mod config;
pub mod connector;
pub mod context;
pub mod endpoint;
pub mod handshake;
pub mod pipeline;
pub mod protocol;
pub mod sspi;
pub mod ssrp;
pub mod stream;
pub mod transport;

#[cfg(test)]
#[path = "../tests/common/mod.rs"]
pub(crate) mod test_support;

pub use config::{AccessTokenCallback, AuthenticationMethod, ConnectionConfig, EncryptMode};
pub use connector::{Connector, NegotiatedChannel, connect, connect_blocking};
pub use context::{ActivityId, HandshakeStatus, NegotiationContext};
pub use endpoint::{Endpoint, Protocol};
pub use handshake::PreloginHandler;
pub use pipeline::{Handler, HandlerFuture, Pipeline};
pub use sspi::{SspiContext, SspiContextProvider, SspiHandler, SspiNegotiator};
pub use stream::{ConnectionStream, DuplexStream, TdsStream, TransportKind};
pub use transport::TransportResolver;
