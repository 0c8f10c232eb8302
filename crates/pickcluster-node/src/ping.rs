//! Ping/pong keep-alive and latency probing.

use crate::handler::{Handler, NodeContext};
use pickcluster_network::{Command, Message, PeerId, Ping, Pong, BIP31_VERSION};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Pings every handshaken peer on each poll, answers pings and tracks
/// round-trip latency from pongs.
#[derive(Debug, Clone)]
pub struct PingManager {
    interval: Duration,
}

impl Default for PingManager {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL)
    }
}

impl PingManager {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Handler for PingManager {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn commands(&self) -> Vec<Command> {
        vec![Command::Ping, Command::Pong]
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn poll(&mut self, ctx: &mut NodeContext<'_>) {
        let now = ctx.now();
        for peer_id in ctx.handshaken_peers() {
            let nonce: u64 = rand::random();
            if let Some(peer) = ctx.peer_mut(peer_id) {
                peer.score.ping_sent(nonce, now);
            }
            ctx.send(peer_id, Message::Ping(Ping { nonce }));
        }
    }

    fn handle_message(&mut self, ctx: &mut NodeContext<'_>, peer_id: PeerId, message: &Message) {
        match message {
            Message::Ping(ping) => {
                let answers = ctx
                    .peer(peer_id)
                    .map_or(false, |peer| peer.version > BIP31_VERSION);
                if answers {
                    ctx.send(peer_id, Message::Pong(Pong { nonce: ping.nonce }));
                }
            }
            Message::Pong(pong) => {
                let Some(peer) = ctx.peer_mut(peer_id) else {
                    return;
                };
                match peer.score.pong_received(pong.nonce, Instant::now()) {
                    Some(rtt) => debug!(
                        peer = %peer_id,
                        rtt_ms = rtt.as_millis() as u64,
                        latency = ?peer.score.latency(),
                        "Pong"
                    ),
                    None => debug!(peer = %peer_id, nonce = pong.nonce, "Unsolicited pong"),
                }
            }
            _ => {}
        }
    }
}
