//! Node implementation.
//!
//! The node owns the per-peer state table and every registered handler. It
//! reacts to peer manager events, sequences the version handshake, routes
//! other messages to subscribed handlers and fires handler polls from a
//! time-ordered schedule. All of this runs on the node's own task; callers
//! interact through a [`NodeHandle`].

use crate::config::NodeConfig;
use crate::handler::{next_due, Handler, NodeContext, PollSchedule};
use crate::{NodeError, NodeResult};
use pickcluster_network::{
    Command, Direction, Message, NetworkAddress, NetworkEvent, PeerEndpoint, PeerId, PeerInfo,
    PeerManager, PeerManagerHandle, PeerScore, PenaltyReason, VersionMessage,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Buffered node events per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Node-side state of one connected peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub info: PeerInfo,
    /// Negotiated protocol version, meaningful once handshaken.
    pub version: i32,
    /// Set once, by the first version message.
    pub handshaken: bool,
    /// Handshake fields the peer declared.
    pub user_agent: String,
    pub start_height: i32,
    pub verack_received: bool,
    pub score: PeerScore,
}

impl PeerState {
    pub fn new(info: PeerInfo) -> Self {
        Self {
            info,
            version: 0,
            handshaken: false,
            user_agent: String::new(),
            start_height: 0,
            verack_received: false,
            score: PeerScore::new(),
        }
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken
    }
}

/// Point-in-time view of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub endpoint: PeerEndpoint,
    pub direction: Direction,
    pub version: i32,
    pub user_agent: String,
    pub tolerance: i32,
    pub latency: Option<Duration>,
}

impl From<&PeerState> for PeerSnapshot {
    fn from(peer: &PeerState) -> Self {
        Self {
            id: peer.info.id,
            endpoint: peer.info.endpoint.clone(),
            direction: peer.info.direction,
            version: peer.version,
            user_agent: peer.user_agent.clone(),
            tolerance: peer.score.tolerance(),
            latency: peer.score.latency(),
        }
    }
}

/// Events published to [`NodeHandle::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected {
        peer_id: PeerId,
        info: PeerInfo,
    },
    HandshakeComplete {
        peer_id: PeerId,
        version: i32,
    },
    PeerPenalized {
        peer_id: PeerId,
        reason: PenaltyReason,
        tolerance: i32,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    ConnectFailed {
        hostname: String,
        port: u16,
        error: String,
    },
}

/// Commands accepted by the node task.
#[derive(Debug)]
enum NodeCommand {
    Connect { hostname: String, port: u16 },
    Disconnect { peer_id: PeerId },
    Send { peer_id: PeerId, message: Message },
    Peers { reply: oneshot::Sender<Vec<PeerSnapshot>> },
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable handle to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<NodeCommand>,
    events: broadcast::Sender<NodeEvent>,
    local_addr: Option<SocketAddr>,
}

impl NodeHandle {
    fn command(&self, command: NodeCommand) -> NodeResult<()> {
        self.commands.send(command).map_err(|_| NodeError::Stopped)
    }

    pub fn connect(&self, hostname: impl Into<String>, port: u16) -> NodeResult<()> {
        self.command(NodeCommand::Connect {
            hostname: hostname.into(),
            port,
        })
    }

    pub fn disconnect(&self, peer_id: PeerId) -> NodeResult<()> {
        self.command(NodeCommand::Disconnect { peer_id })
    }

    /// Send `message` to a peer at its negotiated version.
    pub fn send_message(&self, peer_id: PeerId, message: Message) -> NodeResult<()> {
        self.command(NodeCommand::Send { peer_id, message })
    }

    pub async fn peers(&self) -> NodeResult<Vec<PeerSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.command(NodeCommand::Peers { reply })?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Stop the node and its peer manager and wait for both.
    pub async fn shutdown(&self) -> NodeResult<()> {
        let (done, rx) = oneshot::channel();
        self.command(NodeCommand::Shutdown { done })?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Bound listener address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// The node task state.
pub struct Node {
    config: NodeConfig,
    network: PeerManagerHandle,
    network_events: mpsc::UnboundedReceiver<NetworkEvent>,
    network_task: JoinHandle<()>,
    peers: HashMap<PeerId, PeerState>,
    handlers: Vec<Box<dyn Handler>>,
    routes: HashMap<Command, Vec<usize>>,
    schedule: PollSchedule,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    events: broadcast::Sender<NodeEvent>,
    span: Span,
}

impl Node {
    /// Start the peer manager and build a node around it.
    ///
    /// The node does nothing until [`Node::run`] is awaited.
    pub async fn new(config: NodeConfig, span: Span) -> NodeResult<(Self, NodeHandle)> {
        let network_span = info_span!(parent: &span, "network");
        let (manager, network_events, network) = PeerManager::bind(
            config.peer_manager_config(),
            config.protocol_info(),
            network_span,
        )
        .await?;
        let network_task = tokio::spawn(manager.run());

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = NodeHandle {
            commands: command_tx,
            events: events.clone(),
            local_addr: network.local_addr(),
        };

        let node = Self {
            config,
            network,
            network_events,
            network_task,
            peers: HashMap::new(),
            handlers: Vec::new(),
            routes: HashMap::new(),
            schedule: PollSchedule::new(),
            commands,
            events,
            span,
        };
        Ok((node, handle))
    }

    /// Register a handler. Its first poll is one interval from now.
    pub fn register_handler(&mut self, handler: Box<dyn Handler>) {
        let index = self.handlers.len();
        for command in handler.commands() {
            self.routes.entry(command).or_default().push(index);
        }
        if let Some(interval) = handler.poll_interval() {
            self.schedule.schedule(index, Instant::now() + interval);
        }
        self.span.in_scope(|| info!(handler = handler.name(), "Registered handler"));
        self.handlers.push(handler);
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(self) {
        let span = self.span.clone();
        self.event_loop().instrument(span).await
    }

    async fn event_loop(mut self) {
        info!(
            version = self.config.protocol_version,
            agent = %self.config.user_agent,
            "Node started"
        );

        let done = loop {
            let deadline = self.schedule.next_deadline();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(done) = self.handle_command(command) {
                            break Some(done);
                        }
                    }
                    None => break None,
                },

                event = self.network_events.recv() => match event {
                    Some(event) => self.handle_network_event(event),
                    None => {
                        warn!("Peer manager stopped");
                        break None;
                    }
                },

                _ = wait_until(deadline) => self.run_due_polls(),
            }
        };

        info!("Node shutting down");
        if let Err(e) = self.network.shutdown().await {
            debug!(error = %e, "Peer manager already stopped");
        }
        if let Err(e) = (&mut self.network_task).await {
            warn!(error = %e, "Peer manager task panicked");
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn context(&mut self) -> (&mut Vec<Box<dyn Handler>>, NodeContext<'_>) {
        let ctx = NodeContext::new(
            &mut self.peers,
            &self.network,
            &self.events,
            self.config.protocol_version,
        );
        (&mut self.handlers, ctx)
    }

    fn publish(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: NodeCommand) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            NodeCommand::Connect { hostname, port } => {
                if let Err(e) = self.network.connect(hostname, port) {
                    warn!(error = %e, "Failed to queue connect");
                }
            }
            NodeCommand::Disconnect { peer_id } => {
                if let Err(e) = self.network.disconnect(peer_id) {
                    warn!(error = %e, "Failed to queue disconnect");
                }
            }
            NodeCommand::Send { peer_id, message } => {
                let (_, ctx) = self.context();
                ctx.send(peer_id, message);
            }
            NodeCommand::Peers { reply } => {
                let mut peers: Vec<PeerSnapshot> =
                    self.peers.values().map(PeerSnapshot::from).collect();
                peers.sort_by_key(|p| p.id);
                let _ = reply.send(peers);
            }
            NodeCommand::Shutdown { done } => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected { peer_id, info } => self.on_peer_connected(peer_id, info),
            NetworkEvent::MessageReceived { peer_id, message } => {
                self.on_message(peer_id, message)
            }
            NetworkEvent::ConnectFailed {
                peer_id,
                hostname,
                port,
                error,
            } => {
                info!(peer = %peer_id, host = %hostname, port, %error, "Connection attempt failed");
                self.publish(NodeEvent::ConnectFailed {
                    hostname,
                    port,
                    error,
                });
            }
            NetworkEvent::PeerDisconnected { peer_id, info } => {
                if self.peers.remove(&peer_id).is_some() {
                    info!(peer = %peer_id, addr = %info.endpoint, "Peer removed");
                    self.publish(NodeEvent::PeerDisconnected { peer_id });
                }
            }
        }
    }

    fn on_peer_connected(&mut self, peer_id: PeerId, info: PeerInfo) {
        info!(peer = %peer_id, addr = %info.endpoint, direction = ?info.direction, "Peer connected");
        let outbound = info.direction.is_outbound();
        let endpoint = info.endpoint.clone();
        self.peers.insert(peer_id, PeerState::new(info.clone()));
        self.publish(NodeEvent::PeerConnected { peer_id, info });

        if outbound {
            self.send_version(peer_id, &endpoint);
        }

        let (handlers, mut ctx) = self.context();
        for handler in handlers.iter_mut() {
            handler.on_connect(&mut ctx, peer_id);
        }
    }

    fn on_message(&mut self, peer_id: PeerId, message: Message) {
        let Some(peer) = self.peers.get(&peer_id) else {
            debug!(peer = %peer_id, command = %message.command(), "Message from unknown peer");
            return;
        };
        let handshaken = peer.is_handshaken();

        match message {
            Message::Version(version) => self.on_version(peer_id, version),
            Message::Verack => {
                if handshaken {
                    debug!(peer = %peer_id, "Verack");
                    if let Some(peer) = self.peers.get_mut(&peer_id) {
                        peer.verack_received = true;
                    }
                } else {
                    let (_, mut ctx) = self.context();
                    ctx.penalize(peer_id, PenaltyReason::UnexpectedMessage);
                }
            }
            Message::Unknown { command, payload } => {
                info!(peer = %peer_id, %command, bytes = payload.len(), "Ignoring unknown command");
            }
            message if !handshaken => {
                debug!(peer = %peer_id, command = %message.command(), "Message before handshake");
                let (_, mut ctx) = self.context();
                ctx.penalize(peer_id, PenaltyReason::UnexpectedMessage);
            }
            message => self.dispatch(peer_id, message),
        }
    }

    fn on_version(&mut self, peer_id: PeerId, version: VersionMessage) {
        let local = self.config.protocol_version;
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };

        if peer.is_handshaken() {
            let (_, mut ctx) = self.context();
            ctx.penalize(peer_id, PenaltyReason::DuplicateHandshake);
            return;
        }

        let negotiated = local.min(version.version);
        peer.version = negotiated;
        peer.handshaken = true;
        peer.user_agent = version.user_agent;
        peer.start_height = version.start_height;
        let inbound = !peer.info.direction.is_outbound();
        let endpoint = peer.info.endpoint.clone();

        info!(
            peer = %peer_id,
            peer_version = version.version,
            negotiated,
            agent = %peer.user_agent,
            height = peer.start_height,
            "Handshake"
        );

        if let Err(e) = self.network.set_version(peer_id, negotiated) {
            warn!(peer = %peer_id, error = %e, "Failed to set peer version");
        }
        if inbound {
            self.send_version(peer_id, &endpoint);
        }
        let (_, ctx) = self.context();
        ctx.send(peer_id, Message::Verack);

        self.publish(NodeEvent::HandshakeComplete {
            peer_id,
            version: negotiated,
        });
    }

    fn send_version(&mut self, peer_id: PeerId, endpoint: &PeerEndpoint) {
        let message = Message::Version(self.version_message(endpoint));
        let (_, ctx) = self.context();
        ctx.send(peer_id, message);
    }

    fn version_message(&self, endpoint: &PeerEndpoint) -> VersionMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let (from_ip, from_port) = match self.config.listen_addr {
            Some(addr) => (addr.ip(), addr.port()),
            None => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        };

        VersionMessage {
            version: self.config.protocol_version,
            services: self.config.services,
            timestamp,
            addr_to: NetworkAddress::from_ip(endpoint.ip, endpoint.port, 0),
            addr_from: NetworkAddress::from_ip(from_ip, from_port, self.config.services),
            nonce: rand::random(),
            user_agent: self.config.user_agent.clone(),
            start_height: self.config.start_height,
            relay: Some(self.config.relay),
        }
    }

    fn dispatch(&mut self, peer_id: PeerId, message: Message) {
        let command = message.command();
        let Some(indices) = self.routes.get(&command).cloned() else {
            debug!(peer = %peer_id, %command, "No handler for command");
            return;
        };
        let (handlers, mut ctx) = self.context();
        for index in indices {
            handlers[index].handle_message(&mut ctx, peer_id, &message);
        }
    }

    fn run_due_polls(&mut self) {
        let now = Instant::now();
        while let Some((index, due)) = self.schedule.pop_due(now) {
            let interval = {
                let (handlers, mut ctx) = self.context();
                let handler = &mut handlers[index];
                debug!(handler = handler.name(), "Poll");
                handler.poll(&mut ctx);
                handler.poll_interval()
            };
            if let Some(interval) = interval {
                self.schedule.schedule(index, next_due(due, interval, now));
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
