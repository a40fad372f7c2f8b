
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};

/// Reserved host token that matches any sender landing on a given local
/// port. It participates in routing only and is never bound.
pub const LOCAL_WILDCARD_HOST: &str = "localhost";

/// Builds the canonical `ip:port` key used by the subscriber table and the
/// socket maps.
pub fn endpoint_key(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}

/// A local or remote `(ip, port)` pair. The empty ip and the zero port act
/// as routing wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Endpoint {
            ip: ip.into(),
            port,
        }
    }

    /// The any-any wildcard, matching every message not claimed by a more
    /// specific key.
    pub fn any() -> Self {
        Endpoint::default()
    }

    /// The local-any wildcard for `port`, matching any sender whose message
    /// arrived on that local port.
    pub fn local_wildcard(port: u16) -> Self {
        Endpoint::new(LOCAL_WILDCARD_HOST, port)
    }

    pub fn key(&self) -> String {
        endpoint_key(&self.ip, self.port)
    }

    pub fn is_wildcard(&self) -> bool {
        (self.ip.is_empty() && self.port == 0) || self.ip == LOCAL_WILDCARD_HOST
    }

    /// True when a default source has been configured, i.e. this endpoint
    /// should be bound before sending.
    pub fn is_configured_source(&self) -> bool {
        !self.ip.is_empty() || self.port != 0
    }

    /// The address to bind a local socket to. An empty ip binds every
    /// interface.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip = if self.ip.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            self.parse_host()?
        };
        Ok(SocketAddr::new(IpAddr::V4(ip), self.port))
    }

    /// The address to send to. Unlike [`bind_addr`](Self::bind_addr) an
    /// empty ip is rejected here.
    pub fn remote_addr(&self) -> Result<SocketAddr> {
        if self.ip.is_empty() || self.port == 0 {
            return Err(Error::ErrInvalidAddress(self.key()));
        }
        Ok(SocketAddr::new(IpAddr::V4(self.parse_host()?), self.port))
    }

    fn parse_host(&self) -> Result<Ipv4Addr> {
        if self.ip == LOCAL_WILDCARD_HOST {
            return Ok(Ipv4Addr::LOCALHOST);
        }
        self.ip
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::ErrInvalidAddress(self.key()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Forms the four candidate keys for a received payload, strongest match
/// first: exact sender, exact local endpoint, local-port wildcard, global
/// wildcard. The resolver picks the first key present in the subscriber
/// table.
pub fn route_candidates(src: &SocketAddr, local: &SocketAddr) -> [String; 4] {
    [
        endpoint_key(&src.ip().to_string(), src.port()),
        endpoint_key(&local.ip().to_string(), local.port()),
        endpoint_key(LOCAL_WILDCARD_HOST, local.port()),
        endpoint_key("", 0),
    ]
}
