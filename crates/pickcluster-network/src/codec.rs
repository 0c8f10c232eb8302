//! Message framing for the P2P protocol.
//!
//! Frame layout:
//!
//! ```text
//! magic (4, LE) | command (12, NUL-padded) | length (4, LE) | checksum (4) | payload
//! ```
//!
//! The checksum is the first four bytes of `SHA256(SHA256(payload))`.

use crate::message::{Command, Message};
use crate::wire::{ByteReader, ByteWriter};
use crate::{NetworkError, NetworkResult, ProtocolInfo, COMMAND_SIZE, HEADER_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Parsed frame header.
struct FrameHeader {
    magic: u32,
    command: [u8; COMMAND_SIZE],
    length: usize,
    checksum: [u8; 4],
}

impl FrameHeader {
    /// `None` until a full header is buffered.
    fn peek(src: &[u8]) -> Option<Self> {
        let mut r = ByteReader::new(src);
        let magic = r.get_u32().ok()?;
        let command = r.get_array::<COMMAND_SIZE>().ok()?;
        let length = r.get_u32().ok()? as usize;
        let checksum = r.get_array::<4>().ok()?;
        Some(Self {
            magic,
            command,
            length,
            checksum,
        })
    }
}

/// Codec for P2P frames.
///
/// `version` is the protocol version used for payloads whose layout depends
/// on it; the connection updates it once the handshake negotiates one.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    protocol: ProtocolInfo,
    version: i32,
}

impl MessageCodec {
    pub fn new(protocol: ProtocolInfo, version: i32) -> Self {
        Self { protocol, version }
    }

    pub fn protocol(&self) -> &ProtocolInfo {
        &self.protocol
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn set_version(&mut self, version: i32) {
        self.version = version;
    }

    /// First four bytes of the double SHA256 of `payload`.
    pub fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = Sha256::digest(Sha256::digest(payload));
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// Write a full frame for `message` encoded at `version`.
    pub fn encode_frame(
        &self,
        version: i32,
        message: &Message,
        dst: &mut BytesMut,
    ) -> NetworkResult<()> {
        let command = message.command().to_wire()?;

        let mut payload = ByteWriter::new();
        message.encode_payload(version, &mut payload);
        let payload = payload.into_inner();

        if payload.len() > self.protocol.max_message_size {
            return Err(NetworkError::FrameTooLarge {
                size: payload.len(),
                max: self.protocol.max_message_size,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32_le(self.protocol.magic);
        dst.put_slice(&command);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&Self::checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(header) = FrameHeader::peek(src) else {
                return Ok(None);
            };

            if header.length > self.protocol.max_message_size {
                return Err(NetworkError::FrameTooLarge {
                    size: header.length,
                    max: self.protocol.max_message_size,
                });
            }

            let total_size = HEADER_SIZE + header.length;
            if src.len() < total_size {
                src.reserve(total_size - src.len());
                return Ok(None);
            }

            if header.magic != self.protocol.magic {
                return Err(NetworkError::BadMagic {
                    expected: self.protocol.magic,
                    got: header.magic,
                });
            }

            src.advance(HEADER_SIZE);
            let payload = src.split_to(header.length).freeze();
            let command = Command::from_wire(&header.command);

            if Self::checksum(&payload) != header.checksum {
                debug!(
                    command = %command,
                    length = header.length,
                    "Dropping frame with bad checksum"
                );
                continue;
            }

            return Message::decode_payload(&command, self.version, &self.protocol, &payload)
                .map(Some)
                .map_err(|source| NetworkError::MalformedPayload {
                    command: command.to_string(),
                    source,
                });
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_frame(self.version, &item, dst)
    }
}
