//! Data source parsing.
//!
//! Accepted forms:
//!
//! ```text
//! server
//! server,1433
//! server\INSTANCE
//! tcp:server\INSTANCE,1433
//! admin:server
//! lpc:.
//! np:\\server\pipe\sql\query
//! np:/var/opt/mssql/tds.sock
//! ```

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use tdslink_core::error::Result;

use crate::config::config_error;

/// Default TCP port of a default instance.
pub const DEFAULT_TCP_PORT: u16 = 1433;

/// Transport requested by the data source prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// No prefix: try the viable transports in order
    Auto,
    Tcp,
    NamedPipe,
    SharedMemory,
    /// Dedicated administrator connection
    Admin,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Auto => "auto",
            Protocol::Tcp => "tcp",
            Protocol::NamedPipe => "np",
            Protocol::SharedMemory => "lpc",
            Protocol::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Parsed connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    /// Host name as written, with local aliases resolved to `localhost`
    pub host: String,
    pub instance: Option<String>,
    pub port: Option<u16>,
    /// Explicit pipe path for named pipe targets
    pub pipe_path: Option<String>,
    /// The target is this machine (`.`, `(local)`, `localhost`, loopback)
    pub is_local: bool,
}

const DATA_SOURCE_PATTERN: &str = r"(?ix)^
    (?:(?P<proto>tcp|np|lpc|admin):)?
    (?P<host>[^\\,]+?)
    (?:\\(?P<instance>[^\\,]+))?
    (?:,\s*(?P<port>[^,]+?))?
    $";

/// Compiled data source pattern, built once.
fn data_source_regex() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(DATA_SOURCE_PATTERN))
        .as_ref()
        .map_err(|e| config_error(format!("data source pattern failed to compile: {e}")))
}

fn is_local_alias(host: &str) -> bool {
    host == "."
        || host.eq_ignore_ascii_case("(local)")
        || host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
}

impl Endpoint {
    /// Parse a data source string.
    pub fn parse(data_source: &str) -> Result<Self> {
        let input = data_source.trim();
        if input.is_empty() {
            return Err(config_error("data source must not be empty"));
        }

        if let Some(path) = strip_prefix_ignore_case(input, "np:") {
            if path.starts_with('\\') || path.starts_with('/') {
                return Self::parse_pipe_path(path);
            }
        }

        let caps = data_source_regex()?
            .captures(input)
            .ok_or_else(|| config_error(format!("invalid data source '{input}'")))?;

        let protocol = match caps.name("proto").map(|m| m.as_str().to_ascii_lowercase()) {
            None => Protocol::Auto,
            Some(p) => match p.as_str() {
                "tcp" => Protocol::Tcp,
                "np" => Protocol::NamedPipe,
                "lpc" => Protocol::SharedMemory,
                _ => Protocol::Admin,
            },
        };

        let raw_host = caps.name("host").map_or("", |m| m.as_str()).trim();
        if raw_host.is_empty() {
            return Err(config_error(format!("missing server name in '{input}'")));
        }
        let is_local = is_local_alias(raw_host);
        let host = if raw_host == "." || raw_host.eq_ignore_ascii_case("(local)") {
            "localhost".to_string()
        } else {
            raw_host.to_string()
        };

        let instance = caps
            .name("instance")
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());

        let port = match caps.name("port") {
            None => None,
            Some(m) => Some(m.as_str().trim().parse::<u16>().map_err(|_| {
                config_error(format!("invalid port '{}' in '{input}'", m.as_str()))
            })?),
        };

        if protocol == Protocol::SharedMemory && !is_local {
            return Err(config_error(format!(
                "shared memory requires a local server, got '{raw_host}'"
            )));
        }

        Ok(Self {
            protocol,
            host,
            instance,
            port,
            pipe_path: None,
            is_local,
        })
    }

    fn parse_pipe_path(path: &str) -> Result<Self> {
        // UNC form: \\server\pipe\<name>
        let (host, is_local) = if let Some(unc) = path.strip_prefix(r"\\") {
            let mut parts = unc.split('\\');
            let server = parts.next().unwrap_or_default();
            let pipe = parts.next().unwrap_or_default();
            if server.is_empty() || !pipe.eq_ignore_ascii_case("pipe") || parts.next().is_none() {
                return Err(config_error(format!("invalid named pipe path '{path}'")));
            }
            let is_local = is_local_alias(server);
            let host = if server == "." {
                "localhost".to_string()
            } else {
                server.to_string()
            };
            (host, is_local)
        } else {
            ("localhost".to_string(), true)
        };

        Ok(Self {
            protocol: Protocol::NamedPipe,
            host,
            instance: None,
            port: None,
            pipe_path: Some(path.to_string()),
            is_local,
        })
    }

    /// Pipe path to use for a named pipe transport.
    pub fn named_pipe_path(&self) -> String {
        if let Some(path) = &self.pipe_path {
            return path.clone();
        }
        match &self.instance {
            Some(instance) => format!(r"\\{}\pipe\MSSQL${}\sql\query", self.host, instance),
            None => format!(r"\\{}\pipe\sql\query", self.host),
        }
    }

    /// Service principal names to try for integrated authentication, best first.
    ///
    /// An explicit port wins, then the instance name, then the port the
    /// transport actually connected to.
    pub fn spn_candidates(&self, resolved_port: Option<u16>) -> Vec<String> {
        let mut spns = Vec::with_capacity(2);
        match (self.port, &self.instance) {
            (Some(port), _) => spns.push(format!("MSSQLSvc/{}:{}", self.host, port)),
            (None, Some(instance)) => spns.push(format!("MSSQLSvc/{}:{}", self.host, instance)),
            (None, None) => spns.push(format!(
                "MSSQLSvc/{}:{}",
                self.host,
                resolved_port.unwrap_or(DEFAULT_TCP_PORT)
            )),
        }
        spns.push(format!("MSSQLSvc/{}", self.host));
        spns
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.pipe_path {
            return write!(f, "np:{path}");
        }
        if self.protocol != Protocol::Auto {
            write!(f, "{}:", self.protocol)?;
        }
        f.write_str(&self.host)?;
        if let Some(instance) = &self.instance {
            write!(f, "\\{instance}")?;
        }
        if let Some(port) = self.port {
            write!(f, ",{port}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_host() {
        let ep = Endpoint::parse("db.example.com").unwrap();
        assert_eq!(ep.protocol, Protocol::Auto);
        assert_eq!(ep.host, "db.example.com");
        assert_eq!(ep.instance, None);
        assert_eq!(ep.port, None);
        assert!(!ep.is_local);
    }

    #[test]
    fn test_prefix_instance_port() {
        let ep = Endpoint::parse(r"TCP:db.example.com\SALES, 1500").unwrap();
        assert_eq!(ep.protocol, Protocol::Tcp);
        assert_eq!(ep.host, "db.example.com");
        assert_eq!(ep.instance.as_deref(), Some("SALES"));
        assert_eq!(ep.port, Some(1500));
        assert_eq!(ep.to_string(), r"tcp:db.example.com\SALES,1500");
    }

    #[test]
    fn test_local_aliases() {
        for ds in [".", "(local)", "localhost", r".\SQLEXPRESS", "lpc:(local)"] {
            let ep = Endpoint::parse(ds).unwrap();
            assert!(ep.is_local, "{ds} should be local");
            assert_eq!(ep.host, "localhost");
        }
    }

    #[test]
    fn test_admin_prefix() {
        let ep = Endpoint::parse("admin:sqlhost").unwrap();
        assert_eq!(ep.protocol, Protocol::Admin);
        assert_eq!(ep.host, "sqlhost");
    }

    #[test]
    fn test_bad_inputs() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("host,notaport").is_err());
        assert!(Endpoint::parse("host,70000").is_err());
        assert!(Endpoint::parse("lpc:remotehost").is_err());
        assert!(Endpoint::parse(r"np:\\server\notpipe\x").is_err());
    }

    #[test]
    fn test_named_pipe_paths() {
        let unc = Endpoint::parse(r"np:\\db01\pipe\sql\query").unwrap();
        assert_eq!(unc.protocol, Protocol::NamedPipe);
        assert_eq!(unc.host, "db01");
        assert_eq!(unc.named_pipe_path(), r"\\db01\pipe\sql\query");

        let unix = Endpoint::parse("np:/var/opt/mssql/tds.sock").unwrap();
        assert!(unix.is_local);
        assert_eq!(unix.named_pipe_path(), "/var/opt/mssql/tds.sock");

        let derived = Endpoint::parse(r"np:db01\SALES").unwrap();
        assert_eq!(derived.named_pipe_path(), r"\\db01\pipe\MSSQL$SALES\sql\query");
    }

    #[test]
    fn test_spn_candidates() {
        let ep = Endpoint::parse(r"db01\SALES").unwrap();
        assert_eq!(
            ep.spn_candidates(None),
            vec!["MSSQLSvc/db01:SALES".to_string(), "MSSQLSvc/db01".to_string()]
        );
        // a named instance keeps its name even once the port is known
        assert_eq!(ep.spn_candidates(Some(50123))[0], "MSSQLSvc/db01:SALES");

        let default = Endpoint::parse("db01").unwrap();
        assert_eq!(default.spn_candidates(None)[0], "MSSQLSvc/db01:1433");
        assert_eq!(default.spn_candidates(Some(1500))[0], "MSSQLSvc/db01:1500");

        let explicit = Endpoint::parse(r"db01\SALES,1600").unwrap();
        assert_eq!(explicit.spn_candidates(Some(50123))[0], "MSSQLSvc/db01:1600");
    }
}
