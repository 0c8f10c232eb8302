//! P2P protocol messages.

use crate::wire::{ByteReader, ByteWriter};
use crate::{
    CodecError, NetworkError, NetworkResult, ProtocolInfo, BIP31_VERSION, COMMAND_SIZE,
    RELAY_VERSION,
};
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Prefix that embeds an IPv4 address in the 16-byte address field.
const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF];

/// A payload with a symmetric wire form.
///
/// `version` is the protocol version negotiated with the peer, or the local
/// version before the handshake completes.
pub trait Payload: Sized {
    fn encode(&self, version: i32, writer: &mut ByteWriter);

    fn decode(
        version: i32,
        protocol: &ProtocolInfo,
        reader: &mut ByteReader<'_>,
    ) -> Result<Self, CodecError>;
}

/// Logical command name carried in the frame header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    /// Anything not in the catalog, by its stripped name.
    Unknown(String),
}

impl Command {
    /// Parse the 12-byte header field, stripping trailing NUL padding.
    pub fn from_wire(raw: &[u8; COMMAND_SIZE]) -> Self {
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Self::from_name(&String::from_utf8_lossy(&raw[..end]))
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            other => Command::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Unknown(name) => name,
        }
    }

    /// NUL-padded header form.
    pub fn to_wire(&self) -> NetworkResult<[u8; COMMAND_SIZE]> {
        let name = self.name().as_bytes();
        if name.len() > COMMAND_SIZE {
            return Err(NetworkError::CommandTooLong(self.name().to_string()));
        }
        let mut raw = [0u8; COMMAND_SIZE];
        raw[..name.len()].copy_from_slice(name);
        Ok(raw)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Network address as carried in handshakes and address lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Absent inside a handshake.
    pub timestamp: Option<u32>,
    pub services: u64,
    pub address: [u8; 16],
    /// Always big-endian on the wire.
    pub port: u16,
}

impl Default for NetworkAddress {
    fn default() -> Self {
        Self::from_ipv4([0, 0, 0, 0], 0, 0)
    }
}

impl NetworkAddress {
    pub fn from_ipv4(octets: [u8; 4], port: u16, services: u64) -> Self {
        let mut address = [0u8; 16];
        address[..12].copy_from_slice(&IPV4_MAPPED_PREFIX);
        address[12..].copy_from_slice(&octets);
        Self {
            timestamp: None,
            services,
            address,
            port,
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16, services: u64) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::from_ipv4(v4.octets(), port, services),
            IpAddr::V6(v6) => Self {
                timestamp: None,
                services,
                address: v6.octets(),
                port,
            },
        }
    }

    /// IPv4-mapped addresses come back as [`IpAddr::V4`].
    pub fn ip(&self) -> IpAddr {
        if self.address[..12] == IPV4_MAPPED_PREFIX {
            let [a, b, c, d] = [
                self.address[12],
                self.address[13],
                self.address[14],
                self.address[15],
            ];
            IpAddr::V4(Ipv4Addr::new(a, b, c, d))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.address))
        }
    }
}

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_to: NetworkAddress,
    pub addr_from: NetworkAddress,
    /// Random per-connection nonce.
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// Present from [`RELAY_VERSION`] on.
    pub relay: Option<bool>,
}

impl Payload for VersionMessage {
    // The relay flag follows the version declared in the message itself.
    fn encode(&self, _version: i32, w: &mut ByteWriter) {
        w.put_i32(self.version);
        w.put_u64(self.services);
        w.put_i64(self.timestamp);
        w.put_net_address(&self.addr_to, false);
        w.put_net_address(&self.addr_from, false);
        w.put_u64(self.nonce);
        w.put_var_str(&self.user_agent);
        w.put_i32(self.start_height);
        if self.version >= RELAY_VERSION {
            w.put_bool(self.relay.unwrap_or(true));
        }
    }

    fn decode(
        _version: i32,
        protocol: &ProtocolInfo,
        r: &mut ByteReader<'_>,
    ) -> Result<Self, CodecError> {
        let version = r.get_i32()?;
        if version < protocol.min_supported_version {
            return Ok(Self {
                version,
                ..Default::default()
            });
        }

        let services = r.get_u64()?;
        let timestamp = r.get_i64()?;
        let addr_to = r.get_net_address(false)?;
        let addr_from = r.get_net_address(false)?;
        let nonce = r.get_u64()?;
        let user_agent = r.get_var_str()?;
        let start_height = r.get_i32()?;
        // Some clients omit the flag even when their version has it.
        let relay = if version >= RELAY_VERSION && r.remaining() > 0 {
            Some(r.get_bool()?)
        } else {
            None
        };

        Ok(Self {
            version,
            services,
            timestamp,
            addr_to,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

fn encode_nonce(nonce: u64, version: i32, w: &mut ByteWriter) {
    if version > BIP31_VERSION {
        w.put_u64(nonce);
    }
}

fn decode_nonce(r: &mut ByteReader<'_>) -> Result<u64, CodecError> {
    if r.remaining() == 0 {
        Ok(0)
    } else {
        r.get_u64()
    }
}

/// Keep-alive probe. Peers at or below [`BIP31_VERSION`] send no nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping {
    pub nonce: u64,
}

impl Payload for Ping {
    fn encode(&self, version: i32, w: &mut ByteWriter) {
        encode_nonce(self.nonce, version, w);
    }

    fn decode(_: i32, _: &ProtocolInfo, r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            nonce: decode_nonce(r)?,
        })
    }
}

/// Reply to [`Ping`], echoing its nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pong {
    pub nonce: u64,
}

impl Payload for Pong {
    fn encode(&self, _version: i32, w: &mut ByteWriter) {
        w.put_u64(self.nonce);
    }

    fn decode(_: i32, _: &ProtocolInfo, r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            nonce: decode_nonce(r)?,
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(Ping),
    Pong(Pong),
    /// A command the catalog does not know, with its raw payload.
    Unknown { command: String, payload: Bytes },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::Unknown { command, .. } => Command::Unknown(command.clone()),
        }
    }

    pub fn encode_payload(&self, version: i32, w: &mut ByteWriter) {
        match self {
            Message::Version(msg) => msg.encode(version, w),
            Message::Verack => {}
            Message::Ping(msg) => msg.encode(version, w),
            Message::Pong(msg) => msg.encode(version, w),
            Message::Unknown { payload, .. } => w.put_bytes(payload),
        }
    }

    /// Decode the payload for `command`. Trailing bytes are ignored.
    pub fn decode_payload(
        command: &Command,
        version: i32,
        protocol: &ProtocolInfo,
        payload: &[u8],
    ) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        Ok(match command {
            Command::Version => Message::Version(VersionMessage::decode(version, protocol, &mut r)?),
            Command::Verack => Message::Verack,
            Command::Ping => Message::Ping(Ping::decode(version, protocol, &mut r)?),
            Command::Pong => Message::Pong(Pong::decode(version, protocol, &mut r)?),
            Command::Unknown(name) => Message::Unknown {
                command: name.clone(),
                payload: Bytes::copy_from_slice(payload),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTOCOL_VERSION;

    fn sample_version(version: i32) -> VersionMessage {
        VersionMessage {
            version,
            services: 1,
            timestamp: 1_700_000_000,
            addr_to: NetworkAddress::from_ipv4([127, 0, 0, 1], 8333, 1),
            addr_from: NetworkAddress::from_ipv4([10, 1, 2, 3], 18444, 0),
            nonce: 0xDEAD_BEEF_CAFE_F00D,
            user_agent: "/pickcluster:0.1.0/".into(),
            start_height: 42,
            relay: if version >= RELAY_VERSION { Some(false) } else { None },
        }
    }

    fn encode(msg: &Message, version: i32) -> Vec<u8> {
        let mut w = ByteWriter::new();
        msg.encode_payload(version, &mut w);
        w.as_slice().to_vec()
    }

    #[test]
    fn test_command_wire_form() {
        let mut raw = [0u8; COMMAND_SIZE];
        raw[..6].copy_from_slice(b"verack");
        assert_eq!(Command::from_wire(&raw), Command::Verack);
        assert_eq!(Command::Verack.to_wire().unwrap(), raw);

        let mut raw = [0u8; COMMAND_SIZE];
        raw[..7].copy_from_slice(b"getaddr");
        assert_eq!(Command::from_wire(&raw), Command::Unknown("getaddr".into()));

        let long = Command::Unknown("sendcmpctblock".into());
        assert!(matches!(
            long.to_wire(),
            Err(NetworkError::CommandTooLong(name)) if name == "sendcmpctblock"
        ));
    }

    #[test]
    fn test_version_roundtrip() {
        for version in [PROTOCOL_VERSION, RELAY_VERSION - 1, 60002] {
            let msg = sample_version(version);
            let bytes = encode(&Message::Version(msg.clone()), PROTOCOL_VERSION);
            let decoded =
                Message::decode_payload(&Command::Version, 0, &ProtocolInfo::mainnet(), &bytes)
                    .unwrap();
            assert_eq!(decoded, Message::Version(msg));
        }
    }

    #[test]
    fn test_version_below_minimum_short_circuits() {
        let msg = sample_version(300);
        let bytes = encode(&Message::Version(msg), PROTOCOL_VERSION);
        let decoded =
            Message::decode_payload(&Command::Version, 0, &ProtocolInfo::mainnet(), &bytes)
                .unwrap();
        assert_eq!(
            decoded,
            Message::Version(VersionMessage {
                version: 300,
                ..Default::default()
            })
        );
    }

    #[test]
    fn test_version_missing_relay_flag() {
        let msg = sample_version(PROTOCOL_VERSION);
        let mut bytes = encode(&Message::Version(msg.clone()), PROTOCOL_VERSION);
        bytes.pop();
        let decoded =
            Message::decode_payload(&Command::Version, 0, &ProtocolInfo::mainnet(), &bytes)
                .unwrap();
        assert_eq!(
            decoded,
            Message::Version(VersionMessage { relay: None, ..msg })
        );
    }

    #[test]
    fn test_truncated_version_is_exhausted() {
        let bytes = encode(&Message::Version(sample_version(PROTOCOL_VERSION)), 0);
        let err = Message::decode_payload(
            &Command::Version,
            0,
            &ProtocolInfo::mainnet(),
            &bytes[..40],
        )
        .unwrap_err();
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_ping_nonce_depends_on_version() {
        let ping = Message::Ping(Ping { nonce: 7 });
        assert!(encode(&ping, BIP31_VERSION).is_empty());
        assert_eq!(encode(&ping, BIP31_VERSION + 1), 7u64.to_le_bytes());

        let decoded =
            Message::decode_payload(&Command::Ping, 0, &ProtocolInfo::mainnet(), &[]).unwrap();
        assert_eq!(decoded, Message::Ping(Ping { nonce: 0 }));
    }

    #[test]
    fn test_verack_is_empty() {
        assert!(encode(&Message::Verack, PROTOCOL_VERSION).is_empty());
    }

    #[test]
    fn test_unknown_keeps_payload() {
        let payload = [1u8, 2, 3];
        let command = Command::from_name("inv");
        let decoded =
            Message::decode_payload(&command, 0, &ProtocolInfo::mainnet(), &payload).unwrap();
        assert_eq!(decoded.command(), command);
        assert_eq!(encode(&decoded, PROTOCOL_VERSION), payload);
    }

    #[test]
    fn test_network_address_ip() {
        let v4 = NetworkAddress::from_ip("192.168.0.9".parse().unwrap(), 1, 0);
        assert_eq!(v4.ip(), "192.168.0.9".parse::<IpAddr>().unwrap());
        let v6 = NetworkAddress::from_ip("2001:db8::1".parse().unwrap(), 1, 0);
        assert_eq!(v6.ip(), "2001:db8::1".parse::<IpAddr>().unwrap());
    }
}
