use std::fmt;
use std::net::IpAddr;

use super::result::ProbeError;

pub const DEFAULT_TLS_PORT: u16 = 443;

/// A `host:port` pair pointing at a TLS listener.
///
/// The host is stored lower-cased and without IPv6 brackets, so two spellings of
/// the same listener (`Example.com` and `example.com:443`) compare equal and
/// render the same resource id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parses a strict `host:port` string. A missing or non-numeric port is an
    /// `InvalidFormat` error.
    pub fn parse(input: &str) -> Result<Self, ProbeError> {
        let invalid = || ProbeError::InvalidFormat(input.to_string());
        let trimmed = input.trim();

        let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
            // [v6]:port
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            let port = after.strip_prefix(':').ok_or_else(invalid)?;
            host.parse::<std::net::Ipv6Addr>().map_err(|_| invalid())?;
            (host, port)
        } else {
            let (host, port) = trimmed.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Parses a configuration entry, appending the default TLS port when the
    /// entry names only a host.
    pub fn from_config(input: &str) -> Result<Self, ProbeError> {
        let trimmed = input.trim();
        let has_port = if trimmed.starts_with('[') {
            trimmed.contains("]:")
        } else {
            trimmed.contains(':')
        };

        if has_port {
            Self::parse(trimmed)
        } else {
            Self::parse(&format!("{trimmed}:{DEFAULT_TLS_PORT}"))
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
