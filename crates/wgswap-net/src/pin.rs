//! Dial Pinning
//!
//! Separates "which address we connect to" from "which identity we verify".
//! A [`PinnedEndpoint`] forces the TCP connection for one `host:port`
//! authority onto an already-resolved IP while TLS and the `Host` header
//! keep using the hostname.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A resolved endpoint paired with the identity it must present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedEndpoint {
    /// Hostname the server certificate is issued for
    identity: String,
    /// Port the pin applies to
    port: u16,
    /// Numeric address the connection is forced to
    addr: IpAddr,
}

impl PinnedEndpoint {
    /// Create a new pin for `identity:port` → `addr:port`
    pub fn new(identity: impl Into<String>, port: u16, addr: IpAddr) -> Self {
        Self {
            identity: identity.into(),
            port,
            addr,
        }
    }

    /// Verification identity (TLS server name)
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Pinned port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pinned numeric address
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The authority string this pin rewrites (`identity:port`)
    pub fn authority(&self) -> String {
        format!("{}:{}", self.identity, self.port)
    }

    /// Socket address the dial is redirected to
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Where a connection is actually dialed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// Redirected to a pinned address
    Pinned(SocketAddr),
    /// Dialed as requested (resolved by the system)
    Direct(String),
}

impl DialTarget {
    /// Resolve a `host:port` authority against a set of pins.
    ///
    /// The authority is rewritten only when it is exactly equal to a pin's
    /// `identity:port`; anything else passes through unmodified.
    pub fn for_authority(pins: &[PinnedEndpoint], authority: &str) -> Self {
        pins.iter()
            .find(|pin| pin.authority() == authority)
            .map(|pin| DialTarget::Pinned(pin.socket_addr()))
            .unwrap_or_else(|| DialTarget::Direct(authority.to_string()))
    }

    /// Resolve a host and port against a set of pins
    pub fn resolve(pins: &[PinnedEndpoint], host: &str, port: u16) -> Self {
        Self::for_authority(pins, &format!("{}:{}", host, port))
    }

    /// Is this dial redirected?
    pub fn is_pinned(&self) -> bool {
        matches!(self, DialTarget::Pinned(_))
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Pinned(addr) => write!(f, "{} (pinned)", addr),
            DialTarget::Direct(authority) => write!(f, "{}", authority),
        }
    }
}
