//! # pickcluster-node
//!
//! The node layer: version handshake, per-peer misbehavior scoring, handler
//! dispatch with a time-ordered polling schedule, and configuration.

pub mod config;
mod error;
pub mod handler;
pub mod node;
pub mod ping;

pub use config::{parse_peer_addr, Network, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use handler::{Handler, NodeContext, PollSchedule};
pub use node::{Node, NodeEvent, NodeHandle, PeerSnapshot, PeerState};
pub use ping::PingManager;
