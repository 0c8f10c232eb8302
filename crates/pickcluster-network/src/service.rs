//! Peer manager task.
//!
//! This module provides:
//! - Optional TCP listener for inbound connections
//! - The peer table, owned exclusively by the manager task
//! - Command handling (connect, disconnect, send, set version, shutdown)
//! - Relabeling of connection events for the node

use crate::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, Message, NetworkError, NetworkResult,
    PeerId, PeerInfo, ProtocolInfo, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Accept inbound peers here when set.
    pub listen_addr: Option<SocketAddr>,
    /// Bound on name resolution and on the TCP connect.
    pub connect_timeout: Duration,
    /// Bound on a single socket read or send-queue wait.
    pub io_poll_interval: Duration,
    /// Bound on writing one frame to a peer.
    pub write_timeout: Duration,
    /// Decoding version until a handshake sets one per peer.
    pub initial_version: i32,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            connect_timeout: Duration::from_secs(5),
            io_poll_interval: Duration::from_millis(250),
            write_timeout: Duration::from_secs(10),
            initial_version: PROTOCOL_VERSION,
        }
    }
}

/// Events emitted by the peer manager.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerConnected {
        peer_id: PeerId,
        info: PeerInfo,
    },
    ConnectFailed {
        peer_id: PeerId,
        hostname: String,
        port: u16,
        error: String,
    },
    MessageReceived {
        peer_id: PeerId,
        message: Message,
    },
    PeerDisconnected {
        peer_id: PeerId,
        info: PeerInfo,
    },
}

/// Commands accepted by the peer manager.
#[derive(Debug)]
pub enum NetworkCommand {
    Connect { hostname: String, port: u16 },
    Disconnect { peer_id: PeerId },
    Send { peer_id: PeerId, version: i32, message: Message },
    SetVersion { peer_id: PeerId, version: i32 },
    /// Interrupt every connection, wait for them and stop.
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable handle for enqueueing commands.
#[derive(Debug, Clone)]
pub struct PeerManagerHandle {
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
    local_addr: Option<SocketAddr>,
}

impl PeerManagerHandle {
    fn command(&self, command: NetworkCommand) -> NetworkResult<()> {
        self.command_tx
            .send(command)
            .map_err(|_| NetworkError::ServiceStopped)
    }

    pub fn connect(&self, hostname: impl Into<String>, port: u16) -> NetworkResult<()> {
        self.command(NetworkCommand::Connect {
            hostname: hostname.into(),
            port,
        })
    }

    pub fn disconnect(&self, peer_id: PeerId) -> NetworkResult<()> {
        self.command(NetworkCommand::Disconnect { peer_id })
    }

    pub fn send(&self, peer_id: PeerId, version: i32, message: Message) -> NetworkResult<()> {
        self.command(NetworkCommand::Send {
            peer_id,
            version,
            message,
        })
    }

    pub fn set_version(&self, peer_id: PeerId, version: i32) -> NetworkResult<()> {
        self.command(NetworkCommand::SetVersion { peer_id, version })
    }

    /// Stop the manager and wait until every connection has finished.
    pub async fn shutdown(&self) -> NetworkResult<()> {
        let (done, rx) = oneshot::channel();
        self.command(NetworkCommand::Shutdown { done })?;
        rx.await.map_err(|_| NetworkError::ServiceStopped)
    }

    /// Bound listener address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Owns every live connection. All table mutations happen on its task.
pub struct PeerManager {
    config: PeerManagerConfig,
    protocol: ProtocolInfo,
    listener: Option<TcpListener>,
    connections: HashMap<PeerId, ConnectionHandle>,
    /// Peers whose connection reported `Connected`.
    connected: HashMap<PeerId, PeerInfo>,
    next_id: u64,
    command_rx: mpsc::UnboundedReceiver<NetworkCommand>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    span: Span,
}

impl PeerManager {
    /// Create the manager, binding the listener if configured.
    pub async fn bind(
        config: PeerManagerConfig,
        protocol: ProtocolInfo,
        span: Span,
    ) -> NetworkResult<(Self, mpsc::UnboundedReceiver<NetworkEvent>, PeerManagerHandle)> {
        let listener = match config.listen_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let local_addr = listener.as_ref().map(|l| l.local_addr()).transpose()?;
        if let Some(addr) = local_addr {
            span.in_scope(|| info!(addr = %addr, "Listening"));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let manager = Self {
            config,
            protocol,
            listener,
            connections: HashMap::new(),
            connected: HashMap::new(),
            next_id: 1,
            command_rx,
            conn_tx,
            conn_rx,
            event_tx,
            span,
        };
        let handle = PeerManagerHandle {
            command_tx,
            local_addr,
        };
        Ok((manager, event_rx, handle))
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(self) {
        let span = self.span.clone();
        self.event_loop().instrument(span).await
    }

    async fn event_loop(mut self) {
        let done = loop {
            tokio::select! {
                biased;

                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(done) = self.handle_command(command) {
                            break Some(done);
                        }
                    }
                    None => break None,
                },

                Some(event) = self.conn_rx.recv() => {
                    self.handle_connection_event(event).await;
                }

                accepted = accept(self.listener.as_ref()) => match accepted {
                    Ok((stream, addr)) => self.handle_inbound(stream, addr),
                    Err(e) => warn!(error = %e, "Accept error"),
                },
            }
        };

        self.shutdown_connections().await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn allocate_id(&mut self) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        id
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            protocol: self.protocol,
            initial_version: self.config.initial_version,
            connect_timeout: self.config.connect_timeout,
            io_poll_interval: self.config.io_poll_interval,
            write_timeout: self.config.write_timeout,
        }
    }

    fn peer_span(&self, peer_id: PeerId) -> Span {
        info_span!(parent: &self.span, "peer", id = %peer_id)
    }

    fn handle_command(&mut self, command: NetworkCommand) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            NetworkCommand::Connect { hostname, port } => {
                let peer_id = self.allocate_id();
                info!(peer = %peer_id, host = %hostname, port, "Connecting to peer");
                let handle = ConnectionHandle::connect(
                    peer_id,
                    hostname,
                    port,
                    self.connection_config(),
                    self.conn_tx.clone(),
                    self.peer_span(peer_id),
                );
                self.connections.insert(peer_id, handle);
            }
            NetworkCommand::Disconnect { peer_id } => match self.connections.get(&peer_id) {
                Some(handle) => {
                    info!(peer = %peer_id, "Disconnecting peer");
                    handle.interrupt();
                }
                None => debug!(peer = %peer_id, "Disconnect for unknown peer"),
            },
            NetworkCommand::Send {
                peer_id,
                version,
                message,
            } => {
                let result = self
                    .connections
                    .get(&peer_id)
                    .ok_or(NetworkError::PeerNotFound(peer_id))
                    .and_then(|handle| handle.send(version, message));
                if let Err(e) = result {
                    warn!(peer = %peer_id, error = %e, "Failed to queue message");
                }
            }
            NetworkCommand::SetVersion { peer_id, version } => {
                match self.connections.get(&peer_id) {
                    Some(handle) => handle.set_version(version),
                    None => debug!(peer = %peer_id, "Version for unknown peer"),
                }
            }
            NetworkCommand::Shutdown { done } => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    fn handle_inbound(&mut self, stream: TcpStream, addr: SocketAddr) {
        let peer_id = self.allocate_id();
        info!(peer = %peer_id, addr = %addr, "Incoming connection");
        let handle = ConnectionHandle::accept(
            peer_id,
            stream,
            addr,
            self.connection_config(),
            self.conn_tx.clone(),
            self.peer_span(peer_id),
        );
        self.connections.insert(peer_id, handle);
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let event = match event {
            ConnectionEvent::Connected { peer_id, info } => {
                self.connected.insert(peer_id, info.clone());
                NetworkEvent::PeerConnected { peer_id, info }
            }
            ConnectionEvent::MessageReceived { peer_id, message } => {
                NetworkEvent::MessageReceived { peer_id, message }
            }
            ConnectionEvent::ConnectFailed {
                peer_id,
                hostname,
                port,
                error,
            } => {
                self.reap(peer_id).await;
                NetworkEvent::ConnectFailed {
                    peer_id,
                    hostname,
                    port,
                    error,
                }
            }
            ConnectionEvent::Disconnected { peer_id } => {
                self.reap(peer_id).await;
                match self.connected.remove(&peer_id) {
                    Some(info) => NetworkEvent::PeerDisconnected { peer_id, info },
                    None => return,
                }
            }
        };
        if self.event_tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    /// Drop a finished connection from the table.
    async fn reap(&mut self, peer_id: PeerId) {
        if let Some(handle) = self.connections.remove(&peer_id) {
            handle.join().await;
        }
    }

    async fn shutdown_connections(&mut self) {
        info!(peers = self.connections.len(), "Peer manager shutting down");
        for handle in self.connections.values() {
            handle.interrupt();
        }
        for (_, handle) in self.connections.drain() {
            handle.join().await;
        }

        // Republish what the connections reported while stopping.
        while let Ok(event) = self.conn_rx.try_recv() {
            if let ConnectionEvent::Disconnected { peer_id } = event {
                if let Some(info) = self.connected.remove(&peer_id) {
                    let _ = self
                        .event_tx
                        .send(NetworkEvent::PeerDisconnected { peer_id, info });
                }
            }
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Ping;
    use crate::Direction;

    fn config(listen: bool) -> PeerManagerConfig {
        PeerManagerConfig {
            listen_addr: listen.then(|| "127.0.0.1:0".parse().unwrap()),
            io_poll_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn start(
        listen: bool,
    ) -> (
        mpsc::UnboundedReceiver<NetworkEvent>,
        PeerManagerHandle,
        tokio::task::JoinHandle<()>,
    ) {
        let (manager, events, handle) =
            PeerManager::bind(config(listen), ProtocolInfo::regtest(), Span::none())
                .await
                .unwrap();
        let task = tokio::spawn(manager.run());
        (events, handle, task)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_send_disconnect() {
        let (mut a_events, a, a_task) = start(false).await;
        let (mut b_events, b, b_task) = start(true).await;
        let port = b.local_addr().unwrap().port();

        a.connect("127.0.0.1", port).unwrap();
        let a_peer = match next_event(&mut a_events).await {
            NetworkEvent::PeerConnected { peer_id, info } => {
                assert_eq!(peer_id, PeerId(1));
                assert_eq!(info.direction, Direction::Outbound);
                peer_id
            }
            other => panic!("unexpected {other:?}"),
        };
        let b_peer = match next_event(&mut b_events).await {
            NetworkEvent::PeerConnected { peer_id, info } => {
                assert_eq!(info.direction, Direction::Inbound);
                peer_id
            }
            other => panic!("unexpected {other:?}"),
        };

        a.send(a_peer, PROTOCOL_VERSION, Message::Ping(Ping { nonce: 3 }))
            .unwrap();
        match next_event(&mut b_events).await {
            NetworkEvent::MessageReceived { peer_id, message } => {
                assert_eq!(peer_id, b_peer);
                assert_eq!(message, Message::Ping(Ping { nonce: 3 }));
            }
            other => panic!("unexpected {other:?}"),
        }

        a.disconnect(a_peer).unwrap();
        assert!(matches!(
            next_event(&mut a_events).await,
            NetworkEvent::PeerDisconnected { peer_id, .. } if peer_id == a_peer
        ));
        assert!(matches!(
            next_event(&mut b_events).await,
            NetworkEvent::PeerDisconnected { peer_id, .. } if peer_id == b_peer
        ));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        a_task.await.unwrap();
        b_task.await.unwrap();
        assert!(matches!(a.connect("127.0.0.1", port), Err(NetworkError::ServiceStopped)));
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_failures_reported() {
        let (mut events, handle, task) = start(false).await;
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        handle.connect("127.0.0.1", port).unwrap();
        handle.connect("127.0.0.1", port).unwrap();

        let mut failed = Vec::new();
        for _ in 0..2 {
            match next_event(&mut events).await {
                NetworkEvent::ConnectFailed { peer_id, port: p, .. } => {
                    assert_eq!(p, port);
                    failed.push(peer_id);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        failed.sort();
        assert_eq!(failed, vec![PeerId(1), PeerId(2)]);

        // Sending to a peer that is gone is logged, not fatal.
        handle
            .send(PeerId(1), PROTOCOL_VERSION, Message::Verack)
            .unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_live_peers() {
        let (mut a_events, a, a_task) = start(false).await;
        let (mut b_events, b, b_task) = start(true).await;

        a.connect("127.0.0.1", b.local_addr().unwrap().port())
            .unwrap();
        assert!(matches!(
            next_event(&mut a_events).await,
            NetworkEvent::PeerConnected { .. }
        ));
        assert!(matches!(
            next_event(&mut b_events).await,
            NetworkEvent::PeerConnected { .. }
        ));

        a.shutdown().await.unwrap();
        a_task.await.unwrap();
        assert!(matches!(
            next_event(&mut a_events).await,
            NetworkEvent::PeerDisconnected { .. }
        ));
        assert!(matches!(
            next_event(&mut b_events).await,
            NetworkEvent::PeerDisconnected { .. }
        ));

        b.shutdown().await.unwrap();
        b_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_peer() {
        let (mut events, handle, task) = start(false).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        handle
            .connect("127.0.0.1", listener.local_addr().unwrap().port())
            .unwrap();
        // Held open and never read.
        let (_remote, _) = listener.accept().await.unwrap();

        let peer_id = match next_event(&mut events).await {
            NetworkEvent::PeerConnected { peer_id, .. } => peer_id,
            other => panic!("unexpected {other:?}"),
        };
        let blob = Message::Unknown {
            command: "blob".into(),
            payload: bytes::Bytes::from(vec![0u8; 16 << 20]),
        };
        handle.send(peer_id, PROTOCOL_VERSION, blob).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown blocked on a stalled write")
            .unwrap();
        task.await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            NetworkEvent::PeerDisconnected { peer_id: id, .. } if id == peer_id
        ));
    }
}
