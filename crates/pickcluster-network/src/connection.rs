//! Connection handling.
//!
//! Each peer connection runs as its own task with a paired send task. The
//! read side polls the socket with a short timeout so that an interrupt is
//! observed promptly, accumulates bytes and drains every complete frame.

use crate::{
    Direction, Message, MessageCodec, NetworkError, NetworkResult, PeerEndpoint, PeerId, PeerInfo,
    ProtocolInfo,
};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn, Instrument, Span};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 4096;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub protocol: ProtocolInfo,
    /// Version used to decode until the handshake negotiates one.
    pub initial_version: i32,
    pub connect_timeout: Duration,
    /// Upper bound on a single blocking read or queue wait.
    pub io_poll_interval: Duration,
    /// Upper bound on writing one frame. Expiry closes the connection.
    pub write_timeout: Duration,
}

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Resolving,
    Connecting,
    Connected,
    Closing,
    Closed,
    ConnectFailed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::ConnectFailed)
    }
}

/// Events reported by a connection to its manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
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
    /// Sent exactly once after a connection that reached `Connected` ends.
    Disconnected {
        peer_id: PeerId,
    },
}

/// A queued outbound message and the version to encode it at.
#[derive(Debug)]
struct Outbound {
    version: i32,
    message: Message,
}

/// Manager-side handle to a running connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
    peer_id: PeerId,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    version_tx: watch::Sender<i32>,
    state_rx: watch::Receiver<ConnectionState>,
    interrupt: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Everything a connection task owns.
struct ConnectionTask {
    peer_id: PeerId,
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    version_rx: watch::Receiver<i32>,
    state_tx: watch::Sender<ConnectionState>,
    interrupt: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Resolve and dial `hostname:port` in a new task.
    pub fn connect(
        peer_id: PeerId,
        hostname: String,
        port: u16,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        span: Span,
    ) -> Self {
        Self::spawn(peer_id, config, events, ConnectionState::Resolving, span, |task, outbound_rx| {
            task.run_outbound(outbound_rx, hostname, port)
        })
    }

    /// Drive an accepted socket in a new task.
    pub fn accept(
        peer_id: PeerId,
        stream: TcpStream,
        addr: SocketAddr,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        span: Span,
    ) -> Self {
        let endpoint = PeerEndpoint::from_socket_addr(addr);
        Self::spawn(peer_id, config, events, ConnectionState::Connected, span, |task, outbound_rx| {
            task.run_connected(outbound_rx, stream, endpoint, Direction::Inbound)
        })
    }

    fn spawn<F, Fut>(
        peer_id: PeerId,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        initial: ConnectionState,
        span: Span,
        run: F,
    ) -> Self
    where
        F: FnOnce(ConnectionTask, mpsc::UnboundedReceiver<Outbound>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (version_tx, version_rx) = watch::channel(config.initial_version);
        let (state_tx, state_rx) = watch::channel(initial);
        let interrupt = Arc::new(AtomicBool::new(false));

        let task = ConnectionTask {
            peer_id,
            config,
            events,
            version_rx,
            state_tx,
            interrupt: interrupt.clone(),
        };
        let task = tokio::spawn(run(task, outbound_rx).instrument(span));

        Self {
            peer_id,
            outbound_tx,
            version_tx,
            state_rx,
            interrupt,
            task,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Queue `message` for sending. Fails once the send loop has stopped.
    pub fn send(&self, version: i32, message: Message) -> NetworkResult<()> {
        self.outbound_tx
            .send(Outbound { version, message })
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Version used to decode subsequent inbound frames.
    pub fn set_version(&self, version: i32) {
        self.version_tx.send_replace(version);
    }

    /// Ask both loops to stop at their next poll.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Wait for the connection task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(peer = %self.peer_id, error = %e, "Connection task panicked");
        }
    }
}

impl ConnectionTask {
    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "Connection state");
        self.state_tx.send_replace(state);
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ConnectionEvent) {
        // The manager only drops its receiver after joining every connection.
        let _ = self.events.send(event);
    }

    async fn run_outbound(
        self,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        hostname: String,
        port: u16,
    ) {
        match self.dial(&hostname, port).await {
            Ok(stream) => {
                let endpoint = match stream.peer_addr() {
                    Ok(addr) => PeerEndpoint {
                        hostname,
                        ip: addr.ip(),
                        port: addr.port(),
                    },
                    Err(e) => return self.connect_failed(hostname, port, e.into()),
                };
                self.run_connected(outbound_rx, stream, endpoint, Direction::Outbound)
                    .await
            }
            Err(e) => self.connect_failed(hostname, port, e),
        }
    }

    async fn dial(&self, hostname: &str, port: u16) -> NetworkResult<TcpStream> {
        let timeout = self.config.connect_timeout;

        let addr = tokio::time::timeout(timeout, lookup_host((hostname, port)))
            .await
            .map_err(|_| NetworkError::Timeout(format!("resolving {hostname}")))??
            .next()
            .ok_or_else(|| {
                NetworkError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses for {hostname}"),
                ))
            })?;

        self.set_state(ConnectionState::Connecting);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connecting to {addr}")))??;
        Ok(stream)
    }

    fn connect_failed(self, hostname: String, port: u16, error: NetworkError) {
        warn!(host = %hostname, port, error = %error, "Connect failed");
        self.set_state(ConnectionState::ConnectFailed);
        self.emit(ConnectionEvent::ConnectFailed {
            peer_id: self.peer_id,
            hostname,
            port,
            error: error.to_string(),
        });
    }

    async fn run_connected(
        self,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        stream: TcpStream,
        endpoint: PeerEndpoint,
        direction: Direction,
    ) {
        // Frames are written as soon as they are encoded.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        self.set_state(ConnectionState::Connected);
        info!(addr = %endpoint, ?direction, "Peer connected");
        self.emit(ConnectionEvent::Connected {
            peer_id: self.peer_id,
            info: PeerInfo {
                id: self.peer_id,
                endpoint,
                direction,
            },
        });

        let (reader, writer) = stream.into_split();
        let codec = MessageCodec::new(self.config.protocol, *self.version_rx.borrow());

        let send_task = tokio::spawn(
            send_loop(
                writer,
                outbound_rx,
                codec.clone(),
                self.interrupt.clone(),
                self.config.io_poll_interval,
                self.config.write_timeout,
            )
            .in_current_span(),
        );

        match self.read_loop(reader, codec).await {
            Ok(()) => debug!("Read loop finished"),
            Err(e) => warn!(error = %e, "Closing connection"),
        }

        self.set_state(ConnectionState::Closing);
        self.interrupt.store(true, Ordering::SeqCst);
        match send_task.await {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "Socket shutdown failed");
                }
            }
            Err(e) => warn!(error = %e, "Send task panicked"),
        }

        self.set_state(ConnectionState::Closed);
        info!("Peer disconnected");
        self.emit(ConnectionEvent::Disconnected {
            peer_id: self.peer_id,
        });
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, mut codec: MessageCodec) -> NetworkResult<()> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        while !self.interrupted() {
            buf.reserve(READ_CHUNK);
            let read =
                match tokio::time::timeout(self.config.io_poll_interval, reader.read_buf(&mut buf))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => continue,
                };
            if read == 0 {
                debug!("Peer closed the connection");
                return Ok(());
            }

            codec.set_version(*self.version_rx.borrow());
            while let Some(message) = codec.decode(&mut buf)? {
                debug!(command = %message.command(), "Received message");
                self.emit(ConnectionEvent::MessageReceived {
                    peer_id: self.peer_id,
                    message,
                });
            }
        }
        Ok(())
    }
}

/// Drain the outbound queue until interrupted, the queue closes or a write
/// fails. Returns the write half so the caller can shut it down.
async fn send_loop(
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    codec: MessageCodec,
    interrupt: Arc<AtomicBool>,
    poll: Duration,
    write_timeout: Duration,
) -> OwnedWriteHalf {
    let mut frame = BytesMut::new();

    while !interrupt.load(Ordering::SeqCst) {
        let outbound = match tokio::time::timeout(poll, outbound_rx.recv()).await {
            Ok(Some(outbound)) => outbound,
            Ok(None) => break,
            Err(_) => continue,
        };

        frame.clear();
        if let Err(e) = codec.encode_frame(outbound.version, &outbound.message, &mut frame) {
            warn!(command = %outbound.message.command(), error = %e, "Dropping unencodable message");
            continue;
        }

        debug!(command = %outbound.message.command(), bytes = frame.len(), "Sending message");
        if let Err(e) = write_frame(&mut writer, &frame, &interrupt, poll, write_timeout).await {
            warn!(error = %e, "Write failed");
            break;
        }
    }

    interrupt.store(true, Ordering::SeqCst);
    writer
}

/// Write all of `frame`, retrying partial writes.
///
/// Each write waits at most `poll` so an interrupt stops it between
/// attempts; the whole frame must be out within `write_timeout`.
async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    interrupt: &AtomicBool,
    poll: Duration,
    write_timeout: Duration,
) -> NetworkResult<()> {
    let deadline = Instant::now() + write_timeout;
    let mut written = 0;

    while written < frame.len() {
        if interrupt.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed);
        }
        if Instant::now() >= deadline {
            return Err(NetworkError::Timeout(format!(
                "writing frame, {written} of {} bytes sent",
                frame.len()
            )));
        }
        match tokio::time::timeout(poll, writer.write(&frame[written..])).await {
            Ok(Ok(0)) => return Err(NetworkError::ConnectionClosed),
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    Ok(())
}
