//! Handler plugins and their polling schedule.

use crate::node::{NodeEvent, PeerState};
use pickcluster_network::{Command, Message, PeerId, PeerManagerHandle, PenaltyReason};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A plugin driven by the node.
///
/// Handlers only see peers that completed the handshake in
/// [`Handler::handle_message`]; `poll` and `on_connect` see every peer.
pub trait Handler: Send {
    fn name(&self) -> &'static str;

    /// Commands routed to [`Handler::handle_message`].
    fn commands(&self) -> Vec<Command>;

    /// How often [`Handler::poll`] runs. `None` disables polling.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    fn poll(&mut self, _ctx: &mut NodeContext<'_>) {}

    fn on_connect(&mut self, _ctx: &mut NodeContext<'_>, _peer_id: PeerId) {}

    fn handle_message(&mut self, ctx: &mut NodeContext<'_>, peer_id: PeerId, message: &Message);
}

/// Node state lent to a handler for the duration of one callback.
pub struct NodeContext<'a> {
    peers: &'a mut HashMap<PeerId, PeerState>,
    network: &'a PeerManagerHandle,
    events: &'a broadcast::Sender<NodeEvent>,
    local_version: i32,
    now: Instant,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(
        peers: &'a mut HashMap<PeerId, PeerState>,
        network: &'a PeerManagerHandle,
        events: &'a broadcast::Sender<NodeEvent>,
        local_version: i32,
    ) -> Self {
        Self {
            peers,
            network,
            events,
            local_version,
            now: Instant::now(),
        }
    }

    /// Time the callback started.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn local_version(&self) -> i32 {
        self.local_version
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerState> {
        self.peers.get(&peer_id)
    }

    pub fn peer_mut(&mut self, peer_id: PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(&peer_id)
    }

    /// Ids of peers that completed the handshake.
    pub fn handshaken_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_handshaken())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Queue `message`, encoded at the peer's negotiated version.
    pub fn send(&self, peer_id: PeerId, message: Message) {
        let version = match self.peers.get(&peer_id) {
            Some(peer) if peer.is_handshaken() => peer.version,
            Some(_) => self.local_version,
            None => {
                warn!(peer = %peer_id, command = %message.command(), "Send to unknown peer");
                return;
            }
        };
        if let Err(e) = self.network.send(peer_id, version, message) {
            warn!(peer = %peer_id, error = %e, "Failed to send message");
        }
    }

    /// Charge `reason` against the peer's tolerance, disconnecting it once
    /// the tolerance is used up.
    pub fn penalize(&mut self, peer_id: PeerId, reason: PenaltyReason) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let disconnect = peer.score.apply_penalty(reason);
        let tolerance = peer.score.tolerance();
        warn!(peer = %peer_id, %reason, tolerance, "Peer misbehaved");
        let _ = self.events.send(NodeEvent::PeerPenalized {
            peer_id,
            reason,
            tolerance,
        });

        if disconnect {
            info!(peer = %peer_id, "Disconnecting misbehaving peer");
            if let Err(e) = self.network.disconnect(peer_id) {
                warn!(peer = %peer_id, error = %e, "Failed to disconnect peer");
            }
        }
    }
}

/// Next due time after a poll that was due at `due` ran at `now`.
///
/// Normally `due + interval`. When that is already past, the handler
/// restarts from `now` so it never fires twice in one pass.
pub fn next_due(due: Instant, interval: Duration, now: Instant) -> Instant {
    let next = due + interval;
    if next <= now {
        now + interval
    } else {
        next
    }
}

/// Time-ordered queue of handler polls.
#[derive(Debug, Default)]
pub struct PollSchedule {
    queue: BinaryHeap<Reverse<(Instant, usize)>>,
}

impl PollSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, handler: usize, at: Instant) {
        self.queue.push(Reverse((at, handler)));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse((at, _))| *at)
    }

    /// Remove the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(usize, Instant)> {
        match self.queue.peek() {
            Some(Reverse((at, _))) if *at <= now => {
                self.queue.pop().map(|Reverse((at, handler))| (handler, at))
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
