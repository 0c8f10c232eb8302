//! Peer identity and endpoint types.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Process-unique peer identifier, assigned by the peer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn is_outbound(self) -> bool {
        self == Direction::Outbound
    }
}

/// Transport endpoint of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// Name used to dial the peer, or the textual IP for inbound peers.
    pub hostname: String,
    /// Resolved address.
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            hostname: addr.ip().to_string(),
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname == self.ip.to_string() {
            write!(f, "{}", self.socket_addr())
        } else {
            write!(f, "{}({})", self.hostname, self.socket_addr())
        }
    }
}

/// A connected peer as seen by the peer manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub endpoint: PeerEndpoint,
    pub direction: Direction,
}
