//! Forwarding endpoints and the mappings between them.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::num::ParseIntError;
use std::str::FromStr;

use thiserror::Error;

/// Longest host name accepted on the control channel.
pub const MAX_HOST_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Stable identifier used on the wire.
    pub fn id(self) -> u32 {
        match self {
            Self::Tcp => 1,
            Self::Udp => 2,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Tcp),
            2 => Some(Self::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(ParseEndpointError::UnknownProtocol(s.to_owned()))
        }
    }
}

/// One side of a forwarding rule.
///
/// An empty `host` stands for every local address when the endpoint is a
/// source, and for the loopback address when it is a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, Protocol::Tcp)
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, Protocol::Udp)
    }

    /// Resolve the address to bind when this endpoint is a source.
    pub fn resolve_local(&self) -> io::Result<SocketAddr> {
        self.resolve(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Resolve the address to connect to when this endpoint is a destination.
    pub fn resolve_remote(&self) -> io::Result<SocketAddr> {
        self.resolve(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn resolve(&self, empty: IpAddr) -> io::Result<SocketAddr> {
        if self.host.is_empty() {
            return Ok(SocketAddr::new(empty, self.port));
        }

        let host = self
            .host
            .strip_prefix('[')
            .and_then(|x| x.strip_suffix(']'))
            .unwrap_or(&self.host);

        (host, self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host has no addresses"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.is_empty() { "*" } else { &self.host };
        write!(f, "{host}:{} ({})", self.port, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseEndpointError {
    #[error("expected '<proto>:<host>:<port>'")]
    MissingSeparator,

    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("invalid port: {0}")]
    InvalidPort(ParseIntError),

    #[error("host is longer than {} bytes", MAX_HOST_LEN)]
    HostTooLong,
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    // Syntax: <proto>:<host>:<port>
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ParseEndpointError::*;

        let (protocol, rest) = s.split_once(':').ok_or(MissingSeparator)?;
        let (host, port) = rest.rsplit_once(':').ok_or(MissingSeparator)?;

        let protocol = protocol.parse()?;
        let port = port.parse().map_err(InvalidPort)?;

        if host.len() > MAX_HOST_LEN {
            return Err(HostTooLong);
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            protocol,
        })
    }
}

/// A source endpoint bound to a destination endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mapping {
    pub src: Endpoint,
    pub dest: Endpoint,
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dest)
    }
}
