//! SQL Server Resolution Protocol client.
//!
//! The SQL Browser service listens on UDP 1434 and maps instance names to
//! the ports they listen on. Two requests are used here:
//!
//! - `CLNT_UCAST_INST` (0x04): instance name → description string holding `tcp;<port>`
//! - `CLNT_UCAST_DAC` (0x0F): instance name → dedicated admin connection port
//!
//! Responses start with `SVR_RESP` (0x05) followed by a little-endian u16 size.

use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tdslink_core::error::{ConnectionError, ConnectionErrorKind, Error, Result};

use crate::protocol::PacketReader;

/// Default SQL Browser UDP port.
pub const SQL_BROWSER_PORT: u16 = 1434;

const CLNT_UCAST_INST: u8 = 0x04;
const CLNT_UCAST_DAC: u8 = 0x0F;
const SVR_RESP: u8 = 0x05;
const DAC_PROTOCOL_VERSION: u8 = 0x01;
const MAX_RESPONSE_SIZE: usize = 4096;

/// Default instance name used when resolving a DAC port without an instance.
pub const DEFAULT_INSTANCE: &str = "MSSQLSERVER";

fn resolution_error(message: impl Into<String>, source: Option<std::io::Error>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::InstanceResolution,
        message: message.into(),
        source: source.map(|e| Arc::new(e) as _),
    })
}

/// Build a `CLNT_UCAST_INST` request.
pub fn instance_request(instance: &str) -> Vec<u8> {
    let mut req = Vec::with_capacity(instance.len() + 2);
    req.push(CLNT_UCAST_INST);
    req.extend_from_slice(instance.as_bytes());
    req.push(0);
    req
}

/// Build a `CLNT_UCAST_DAC` request.
pub fn dac_request(instance: &str) -> Vec<u8> {
    let mut req = Vec::with_capacity(instance.len() + 3);
    req.push(CLNT_UCAST_DAC);
    req.push(DAC_PROTOCOL_VERSION);
    req.extend_from_slice(instance.as_bytes());
    req.push(0);
    req
}

/// Strip the `SVR_RESP` header, returning the declared payload.
fn response_payload(response: &[u8]) -> Result<&[u8]> {
    let mut reader = PacketReader::new(response);
    if reader.read_u8() != Some(SVR_RESP) {
        return Err(resolution_error(
            "SQL Browser sent an unexpected response type",
            None,
        ));
    }
    let size = reader
        .read_u16_le()
        .ok_or_else(|| resolution_error("SQL Browser response is truncated", None))?;
    reader.read_bytes(usize::from(size)).ok_or_else(|| {
        resolution_error(
            format!(
                "SQL Browser response declares {size} bytes but carries {}",
                reader.remaining()
            ),
            None,
        )
    })
}

/// Extract the TCP port from a `CLNT_UCAST_INST` response.
///
/// The payload is `key;value;` pairs, e.g.
/// `ServerName;DB01;InstanceName;SALES;IsClustered;No;Version;16.0.1000.6;tcp;50123;;`.
pub fn parse_instance_response(response: &[u8], instance: &str) -> Result<u16> {
    let payload = response_payload(response)?;
    let text = String::from_utf8_lossy(payload);
    let mut fields = text.split(';');
    while let Some(key) = fields.next() {
        let Some(value) = fields.next() else { break };
        if key.eq_ignore_ascii_case("tcp") {
            return value.parse::<u16>().map_err(|_| {
                resolution_error(
                    format!("SQL Browser returned invalid TCP port '{value}' for '{instance}'"),
                    None,
                )
            });
        }
    }
    Err(resolution_error(
        format!("instance '{instance}' does not listen on TCP"),
        None,
    ))
}

/// Extract the admin port from a `CLNT_UCAST_DAC` response.
///
/// Unlike instance responses, the size field here counts the whole 6 byte
/// response: `0x05`, size, protocol version, little-endian port.
pub fn parse_dac_response(response: &[u8]) -> Result<u16> {
    let mut reader = PacketReader::new(response);
    if reader.read_u8() != Some(SVR_RESP) {
        return Err(resolution_error(
            "SQL Browser sent an unexpected response type",
            None,
        ));
    }
    let _size = reader.read_u16_le();
    let _version = reader.read_u8();
    reader
        .read_u16_le()
        .filter(|port| *port != 0)
        .ok_or_else(|| resolution_error("SQL Browser DAC response has no port", None))
}

/// Blocking SQL Browser client.
#[derive(Debug, Clone)]
pub struct SsrpClient {
    browser_port: u16,
    timeout: Duration,
}

impl SsrpClient {
    pub fn new(browser_port: u16, timeout: Duration) -> Self {
        Self {
            browser_port,
            timeout,
        }
    }

    /// Resolve the TCP port of a named instance.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn instance_port(&self, host: &str, instance: &str) -> Result<u16> {
        let response = self.exchange(host, &instance_request(instance))?;
        let port = parse_instance_response(&response, instance)?;
        tracing::debug!(host, instance, port, "resolved instance port");
        Ok(port)
    }

    /// Resolve the dedicated admin connection port of an instance.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn dac_port(&self, host: &str, instance: &str) -> Result<u16> {
        let response = self.exchange(host, &dac_request(instance))?;
        let port = parse_dac_response(&response)?;
        tracing::debug!(host, instance, port, "resolved admin port");
        Ok(port)
    }

    fn exchange(&self, host: &str, request: &[u8]) -> Result<Vec<u8>> {
        let target = (host, self.browser_port)
            .to_socket_addrs()
            .map_err(|e| resolution_error(format!("failed to resolve '{host}'"), Some(e)))?
            .next()
            .ok_or_else(|| resolution_error(format!("no address for '{host}'"), None))?;

        let bind_addr = if target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| resolution_error("failed to open UDP socket", Some(e)))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| resolution_error("failed to set UDP timeout", Some(e)))?;
        socket.send_to(request, target).map_err(|e| {
            resolution_error(format!("failed to reach SQL Browser at {target}"), Some(e))
        })?;

        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        let (n, _) = socket.recv_from(&mut buf).map_err(|e| {
            resolution_error(format!("no answer from SQL Browser at {target}"), Some(e))
        })?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svr_resp(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![SVR_RESP];
        out.extend_from_slice(&u16::try_from(payload.len()).unwrap().to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_requests() {
        assert_eq!(instance_request("SALES"), b"\x04SALES\x00".to_vec());
        assert_eq!(dac_request("SALES"), b"\x0F\x01SALES\x00".to_vec());
    }

    #[test]
    fn test_parse_instance_response() {
        let resp = svr_resp(
            b"ServerName;DB01;InstanceName;SALES;IsClustered;No;Version;16.0.1000.6;tcp;50123;np;\\\\DB01\\pipe\\MSSQL$SALES\\sql\\query;;",
        );
        assert_eq!(parse_instance_response(&resp, "SALES").unwrap(), 50123);
    }

    #[test]
    fn test_parse_instance_without_tcp() {
        let resp = svr_resp(b"ServerName;DB01;InstanceName;SALES;np;\\\\DB01\\pipe\\x;;");
        let err = parse_instance_response(&resp, "SALES").unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::InstanceResolution,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_truncated_response() {
        let mut resp = svr_resp(b"tcp;1433;");
        resp.truncate(5);
        assert!(parse_instance_response(&resp, "X").is_err());
        assert!(parse_instance_response(&[0x06, 0, 0], "X").is_err());
    }

    #[test]
    fn test_parse_dac_response() {
        // 0x05, size 6, version 1, port 1434 (LE)
        let resp = [0x05, 0x06, 0x00, 0x01, 0x9A, 0x05];
        assert_eq!(parse_dac_response(&resp).unwrap(), 1434);
    }

    #[test]
    fn test_loopback_instance_lookup() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            let (n, peer) = server.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"\x04SALES\x00");
            let resp = svr_resp(b"ServerName;LOOP;InstanceName;SALES;tcp;41433;;");
            server.send_to(&resp, peer).unwrap();
        });

        let client = SsrpClient::new(port, Duration::from_secs(5));
        assert_eq!(client.instance_port("127.0.0.1", "SALES").unwrap(), 41433);
        handle.join().unwrap();
    }
}
