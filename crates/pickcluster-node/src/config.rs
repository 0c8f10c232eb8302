//! Node configuration.

use anyhow::{bail, Context, Result};
use pickcluster_network::{PeerManagerConfig, ProtocolInfo, NODE_NETWORK, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Network preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Main,
    Testnet,
    Regtest,
}

impl Network {
    pub fn protocol(self) -> ProtocolInfo {
        match self {
            Network::Main => ProtocolInfo::mainnet(),
            Network::Testnet => ProtocolInfo::testnet(),
            Network::Regtest => ProtocolInfo::regtest(),
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Network::Main => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Client name sent in the handshake.
    pub user_agent: String,
    pub network: Network,
    /// Overrides the network preset when set.
    pub protocol: Option<ProtocolInfo>,
    /// Highest protocol version offered to peers.
    pub protocol_version: i32,
    /// Service bits advertised in the handshake.
    pub services: u64,
    /// Best block height advertised in the handshake.
    pub start_height: i32,
    pub relay: bool,
    /// Accept inbound peers here.
    pub listen_addr: Option<SocketAddr>,
    /// `host:port` dialed at startup.
    pub bootstrap_peer: Option<String>,
    pub ping_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub io_poll_interval_ms: u64,
    /// A peer that takes longer than this to accept one frame is dropped.
    pub write_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::default_for_network(Network::Main)
    }
}

impl NodeConfig {
    /// Load from `path` if it exists, else use the defaults for `network`.
    pub fn load(path: &Path, network: Network) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default_for_network(network));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, then apply a network chosen on the command line.
    ///
    /// Without `network` the file's own network is kept, falling back to
    /// mainnet when there is no file.
    pub fn load_with_network(path: &Path, network: Option<Network>) -> Result<Self> {
        let mut config = Self::load(path, network.unwrap_or_default())?;
        if let Some(network) = network {
            config.network = network;
        }
        Ok(config)
    }

    /// Default config for a network.
    pub fn default_for_network(network: Network) -> Self {
        Self {
            user_agent: format!("/pickcluster:{}/", env!("CARGO_PKG_VERSION")),
            network,
            protocol: None,
            protocol_version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            start_height: 0,
            relay: false,
            listen_addr: None,
            bootstrap_peer: None,
            ping_interval_secs: 5,
            connect_timeout_secs: 5,
            io_poll_interval_ms: 250,
            write_timeout_secs: 10,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol_version <= 0 {
            bail!("protocol_version must be positive, got {}", self.protocol_version);
        }
        if self.ping_interval_secs == 0 {
            bail!("ping_interval_secs must be positive");
        }
        if self.io_poll_interval_ms == 0 {
            bail!("io_poll_interval_ms must be positive");
        }
        if self.write_timeout_secs == 0 {
            bail!("write_timeout_secs must be positive");
        }
        if let Some(peer) = &self.bootstrap_peer {
            parse_peer_addr(peer, self.network.default_port())?;
        }
        Ok(())
    }

    /// Protocol parameters in effect.
    pub fn protocol_info(&self) -> ProtocolInfo {
        self.protocol.unwrap_or_else(|| self.network.protocol())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn peer_manager_config(&self) -> PeerManagerConfig {
        PeerManagerConfig {
            listen_addr: self.listen_addr,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            io_poll_interval: Duration::from_millis(self.io_poll_interval_ms),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            initial_version: self.protocol_version,
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Split `host:port`, or a bare host using `default_port`.
///
/// Bracketed IPv6 literals (`[::1]:8333`) are accepted.
pub fn parse_peer_addr(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok((socket.ip().to_string(), socket.port()));
    }
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in {addr:?}"))?;
            (host, port)
        }
        _ => (addr, default_port),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("Missing host in {addr:?}");
    }
    Ok((host.to_string(), port))
}
