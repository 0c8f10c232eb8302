//! # pickcluster-network
//!
//! P2P networking layer for the pickcluster node.
//!
//! This crate provides:
//! - Binary reader/writer primitives for the wire format
//! - Message framing with magic and double-SHA256 checksum
//! - Typed protocol messages
//! - Per-peer TCP connections and the peer manager task

mod codec;
mod connection;
mod error;
mod message;
mod peer;
pub mod penalties;
pub mod scoring;
mod service;
pub mod wire;

pub use codec::MessageCodec;
pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionState};
pub use error::{CodecError, NetworkError, NetworkResult};
pub use message::{Command, Message, NetworkAddress, Payload, Ping, Pong, VersionMessage};
pub use peer::{Direction, PeerEndpoint, PeerId, PeerInfo};
pub use penalties::{Penalties, PenaltyReason};
pub use scoring::PeerScore;
pub use service::{
    NetworkCommand, NetworkEvent, PeerManager, PeerManagerConfig, PeerManagerHandle,
};

use serde::{Deserialize, Serialize};

/// Highest protocol version this node speaks.
pub const PROTOCOL_VERSION: i32 = 70015;

/// First version that answers `ping` with `pong` and carries a ping nonce.
pub const BIP31_VERSION: i32 = 60000;

/// First version whose handshake carries the relay flag.
pub const RELAY_VERSION: i32 = 70001;

/// Width of the command field in the frame header.
pub const COMMAND_SIZE: usize = 12;

/// Frame header size: magic + command + length + checksum.
pub const HEADER_SIZE: usize = 4 + COMMAND_SIZE + 4 + 4;

/// Service flag for a full node.
pub const NODE_NETWORK: u64 = 1;

/// Network-level protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    /// Frame magic, written little-endian.
    pub magic: u32,
    /// Largest accepted payload in bytes.
    pub max_message_size: usize,
    /// Handshakes declaring a lower version are only partially decoded.
    pub min_supported_version: i32,
}

impl ProtocolInfo {
    pub const fn mainnet() -> Self {
        Self {
            magic: 0xD9B4_BEF9,
            max_message_size: 0x0200_0000,
            min_supported_version: 31800,
        }
    }

    pub const fn testnet() -> Self {
        Self {
            magic: 0x0709_110B,
            ..Self::mainnet()
        }
    }

    pub const fn regtest() -> Self {
        Self {
            magic: 0xDAB5_BFFA,
            ..Self::mainnet()
        }
    }
}

impl Default for ProtocolInfo {
    fn default() -> Self {
        Self::mainnet()
    }
}
