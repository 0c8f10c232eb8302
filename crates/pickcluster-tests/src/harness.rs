//! Test harness for integration tests.
//!
//! Starts nodes on loopback listeners and provides helpers for waiting on
//! node events and for driving a peer by hand over a raw socket.

use bytes::BytesMut;
use pickcluster_network::{Message, MessageCodec, NetworkResult, ProtocolInfo};
use pickcluster_node::{Network, Node, NodeConfig, NodeEvent, NodeHandle, PingManager};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tracing::info_span;

/// Default bound on waiting for an event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// A node running on its own task, listening on an ephemeral port.
pub struct TestNode {
    pub handle: NodeHandle,
    pub events: broadcast::Receiver<NodeEvent>,
    task: JoinHandle<()>,
}

impl TestNode {
    /// Start a regtest node offering `version`.
    pub async fn start(version: i32) -> Self {
        Self::start_with(version, Duration::from_secs(60)).await
    }

    /// Start a regtest node offering `version` that pings every `ping_interval`.
    pub async fn start_with(version: i32, ping_interval: Duration) -> Self {
        let mut config = NodeConfig::default_for_network(Network::Regtest);
        config.protocol_version = version;
        config.listen_addr = Some("127.0.0.1:0".parse().expect("valid address"));
        config.io_poll_interval_ms = 50;

        let (mut node, handle) = Node::new(config, info_span!("test_node", version))
            .await
            .expect("Failed to start node");
        node.register_handler(Box::new(PingManager::new(ping_interval)));
        let events = handle.subscribe();
        let task = tokio::spawn(node.run());

        Self {
            handle,
            events,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr().expect("test node listens")
    }

    /// Dial `other` by its listen address.
    pub fn connect_to(&self, other: &TestNode) {
        let addr = other.addr();
        self.handle
            .connect(addr.ip().to_string(), addr.port())
            .expect("node running");
    }

    /// Wait for the first event matching `f`, discarding the rest.
    pub async fn wait_for<T>(&mut self, f: impl FnMut(&NodeEvent) -> Option<T>) -> T {
        wait_for_event(&mut self.events, EVENT_TIMEOUT, f).await
    }

    /// Shut down and wait for the node task.
    pub async fn stop(self) {
        self.handle.shutdown().await.expect("node running");
        self.task.await.expect("node task panicked");
    }
}

/// Receive events until `f` returns `Some`, panicking after `timeout`.
pub async fn wait_for_event<T>(
    events: &mut broadcast::Receiver<NodeEvent>,
    timeout: Duration,
    mut f: impl FnMut(&NodeEvent) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(out) = f(&event) {
                        return out;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("node event channel closed"),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .expect("timed out waiting for node event")
}

/// A hand-driven peer speaking the wire protocol over a raw socket.
pub struct RawPeer {
    stream: TcpStream,
    codec: MessageCodec,
    buf: BytesMut,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr, protocol: ProtocolInfo, version: i32) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect raw peer");
        Self {
            stream,
            codec: MessageCodec::new(protocol, version),
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, message: &Message) -> NetworkResult<()> {
        let mut frame = BytesMut::new();
        self.codec
            .encode_frame(self.codec.version(), message, &mut frame)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Next decoded message, or `None` once the node closes the socket.
    pub async fn recv(&mut self) -> NetworkResult<Option<Message>> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(message));
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Receive until the node closes the connection, bounded by `timeout`.
    pub async fn expect_closed(&mut self, timeout: Duration) {
        let drain = async {
            loop {
                match self.recv().await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => return,
                }
            }
        };
        tokio::time::timeout(timeout, drain)
            .await
            .expect("connection was not closed");
    }
}
