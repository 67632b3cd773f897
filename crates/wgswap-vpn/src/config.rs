//! Peer Configuration
//!
//! The peer configuration a provider server assigns when a public key is
//! registered with it.

use crate::keys::PublicKey;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Convert to SocketAddr
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SocketAddr brackets IPv6 literals
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Registration response as sent on the wire
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RegistrationResponse {
    pub status: String,
    pub server_key: PublicKey,
    pub server_port: u16,
    pub server_ip: IpAddr,
    pub peer_ip: IpAddr,
    #[serde(default)]
    pub dns_servers: Option<Vec<IpAddr>>,
}

/// WireGuard peer configuration assigned by the provider
///
/// Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerConfig {
    /// Provider status flag (`"OK"` on success)
    pub status: String,
    /// Server's public key
    pub server_key: PublicKey,
    /// Server's WireGuard endpoint
    pub endpoint: Endpoint,
    /// Address assigned to this client inside the tunnel
    pub peer_ip: IpAddr,
    /// DNS servers offered by the provider
    pub dns_servers: Vec<IpAddr>,
}

impl PeerConfig {
    /// Did the provider flag the registration as OK?
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK")
    }

    /// Client address as a single-host CIDR (`a.b.c.d/32` or `x::y/128`)
    pub fn client_cidr(&self) -> String {
        let prefix = if self.peer_ip.is_ipv4() { 32 } else { 128 };
        format!("{}/{}", self.peer_ip, prefix)
    }
}

impl From<RegistrationResponse> for PeerConfig {
    fn from(wire: RegistrationResponse) -> Self {
        Self {
            status: wire.status,
            server_key: wire.server_key,
            endpoint: Endpoint::new(wire.server_ip, wire.server_port),
            peer_ip: wire.peer_ip,
            dns_servers: wire.dns_servers.unwrap_or_default(),
        }
    }
}
