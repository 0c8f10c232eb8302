//! Cursor-based binary reader and writer.
//!
//! Fixed-width integers follow the currently selected [`Endian`]. Variable
//! length integers are always little-endian, and network address ports are
//! always big-endian, whatever the selected mode.
//!
//! Varint layout:
//!
//! ```text
//! value < 0xFD          1 byte   value
//! value <= 0xFFFF       3 bytes  0xFD + u16
//! value <= 0xFFFFFFFF   5 bytes  0xFE + u32
//! otherwise             9 bytes  0xFF + u64
//! ```
//!
//! Only the shortest form is accepted on read.

use crate::message::NetworkAddress;
use crate::CodecError;
use bytes::{BufMut, BytesMut};

/// Byte order for fixed-width fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

macro_rules! get_fixed {
    ($name:ident, $ty:ty, $len:literal) => {
        #[doc = concat!("Read a `", stringify!($ty), "` in the current byte order.")]
        pub fn $name(&mut self) -> Result<$ty, CodecError> {
            let bytes = self.take_array::<$len>()?;
            Ok(match self.endian {
                Endian::Little => <$ty>::from_le_bytes(bytes),
                Endian::Big => <$ty>::from_be_bytes(bytes),
            })
        }
    };
}

macro_rules! put_fixed {
    ($name:ident, $ty:ty, $le:ident, $be:ident) => {
        #[doc = concat!("Write a `", stringify!($ty), "` in the current byte order.")]
        pub fn $name(&mut self, value: $ty) {
            match self.endian {
                Endian::Little => self.buf.$le(value),
                Endian::Big => self.buf.$be(value),
            }
        }
    };
}

/// Reads primitives from a borrowed byte slice.
///
/// A read that would run past the end fails with
/// [`CodecError::Exhausted`] and leaves the position untouched.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> ByteReader<'a> {
    /// Create a little-endian reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            endian: Endian::Little,
        }
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Unread tail of the buffer.
    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(CodecError::Exhausted {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.get_u8()? as i8)
    }

    get_fixed!(get_u16, u16, 2);
    get_fixed!(get_i16, i16, 2);
    get_fixed!(get_u32, u32, 4);
    get_fixed!(get_i32, i32, 4);
    get_fixed!(get_u64, u64, 8);
    get_fixed!(get_i64, i64, 8);

    /// Read a single-byte boolean; any non-zero value is `true`.
    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.get_u8()? != 0)
    }

    /// Read a variable-length integer, rejecting non-canonical forms.
    pub fn get_varint(&mut self) -> Result<u64, CodecError> {
        let start = self.pos;
        let prefix = self.get_u8()?;
        let (value, min) = match prefix {
            0xFD => self.take_array::<2>().map(|b| (u16::from_le_bytes(b) as u64, 0xFD)),
            0xFE => self.take_array::<4>().map(|b| (u32::from_le_bytes(b) as u64, 0x1_0000)),
            0xFF => self.take_array::<8>().map(|b| (u64::from_le_bytes(b), 0x1_0000_0000)),
            small => return Ok(small as u64),
        }
        .map_err(|e| {
            self.pos = start;
            e
        })?;

        if value < min {
            self.pos = start;
            return Err(CodecError::NonCanonicalVarint { prefix, value });
        }
        Ok(value)
    }

    /// Read exactly `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    /// Read a fixed-size byte array.
    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.take_array::<N>()
    }

    /// Read a varint length followed by that many UTF-8 bytes.
    pub fn get_var_str(&mut self) -> Result<String, CodecError> {
        let start = self.pos;
        let len = self.get_varint()?;
        let bytes = match usize::try_from(len).ok().map(|len| self.take(len)) {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                self.pos = start;
                return Err(e);
            }
            None => {
                self.pos = start;
                return Err(CodecError::Exhausted {
                    needed: usize::MAX,
                    remaining: self.remaining(),
                });
            }
        };
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::InvalidString(e.to_string()))
    }

    /// Read a network address; the timestamp is absent inside handshakes.
    pub fn get_net_address(
        &mut self,
        timestamp_included: bool,
    ) -> Result<NetworkAddress, CodecError> {
        let start = self.pos;
        let result = self.read_net_address(timestamp_included);
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    fn read_net_address(&mut self, timestamp_included: bool) -> Result<NetworkAddress, CodecError> {
        let timestamp = if timestamp_included {
            Some(self.get_u32()?)
        } else {
            None
        };
        let services = self.get_u64()?;
        let address = self.take_array::<16>()?;
        let port = u16::from_be_bytes(self.take_array::<2>()?);
        Ok(NetworkAddress {
            timestamp,
            services,
            address,
            port,
        })
    }
}

/// Writes primitives into a growable buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: BytesMut,
    endian: Endian,
}

impl ByteWriter {
    /// Create an empty little-endian writer.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            endian: Endian::Little,
        }
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    put_fixed!(put_u16, u16, put_u16_le, put_u16);
    put_fixed!(put_i16, i16, put_i16_le, put_i16);
    put_fixed!(put_u32, u32, put_u32_le, put_u32);
    put_fixed!(put_i32, i32, put_i32_le, put_i32);
    put_fixed!(put_u64, u64, put_u64_le, put_u64);
    put_fixed!(put_i64, i64, put_i64_le, put_i64);

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    /// Write a variable-length integer in its shortest form.
    pub fn put_varint(&mut self, value: u64) {
        match value {
            0..=0xFC => self.buf.put_u8(value as u8),
            0xFD..=0xFFFF => {
                self.buf.put_u8(0xFD);
                self.buf.put_u16_le(value as u16);
            }
            0x1_0000..=0xFFFF_FFFF => {
                self.buf.put_u8(0xFE);
                self.buf.put_u32_le(value as u32);
            }
            _ => {
                self.buf.put_u8(0xFF);
                self.buf.put_u64_le(value);
            }
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a varint length followed by the UTF-8 bytes of `value`.
    pub fn put_var_str(&mut self, value: &str) {
        self.put_varint(value.len() as u64);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_net_address(&mut self, addr: &NetworkAddress, timestamp_included: bool) {
        if timestamp_included {
            self.put_u32(addr.timestamp.unwrap_or(0));
        }
        self.put_u64(addr.services);
        self.buf.put_slice(&addr.address);
        self.buf.put_u16(addr.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: u64) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_varint(value);
        w.as_slice().to_vec()
    }

    #[test]
    fn test_varint_shortest_forms() {
        assert_eq!(varint_bytes(0xFC), hex::decode("fc").unwrap());
        assert_eq!(varint_bytes(0xFD), hex::decode("fdfd00").unwrap());
        assert_eq!(varint_bytes(0xFFFF), hex::decode("fdffff").unwrap());
        assert_eq!(varint_bytes(0x10000), hex::decode("fe00000100").unwrap());
        assert_eq!(
            varint_bytes(u64::MAX),
            hex::decode("ffffffffffffffffff").unwrap()
        );
    }

    #[test]
    fn test_varint_rejects_non_canonical() {
        for encoded in ["fd0100", "fdfc00", "fe0000ffff", "fe01000000", "ff00000000ffffffff"] {
            let bytes = hex::decode(encoded).unwrap();
            let mut r = ByteReader::new(&bytes);
            let err = r.get_varint().unwrap_err();
            assert!(
                matches!(err, CodecError::NonCanonicalVarint { .. }),
                "{encoded} gave {err:?}"
            );
            assert_eq!(r.position(), 0);
        }
    }

    #[test]
    fn test_varint_ignores_endian_mode() {
        let mut w = ByteWriter::new();
        w.set_endian(Endian::Big);
        w.put_varint(0x1234);
        assert_eq!(w.as_slice(), &[0xFD, 0x34, 0x12]);

        let bytes = w.as_slice().to_vec();
        let mut r = ByteReader::new(&bytes);
        r.set_endian(Endian::Big);
        assert_eq!(r.get_varint().unwrap(), 0x1234);
    }

    #[test]
    fn test_exhausted_leaves_position() {
        let bytes = [1u8, 2, 3];
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 1);
        let err = r.get_u32().unwrap_err();
        assert_eq!(
            err,
            CodecError::Exhausted {
                needed: 4,
                remaining: 2
            }
        );
        assert!(err.is_exhausted());
        assert_eq!(r.position(), 1);
        assert_eq!(r.get_u16().unwrap(), 0x0302);
    }

    #[test]
    fn test_truncated_varint_is_exhausted() {
        let bytes = [0xFE, 0x01, 0x02];
        let mut r = ByteReader::new(&bytes);
        assert!(r.get_varint().unwrap_err().is_exhausted());
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn test_fixed_width_endianness() {
        let mut w = ByteWriter::new();
        w.put_u32(0x0102_0304);
        w.set_endian(Endian::Big);
        w.put_u32(0x0102_0304);
        w.put_i16(-2);
        assert_eq!(
            w.as_slice(),
            &[0x04, 0x03, 0x02, 0x01, 0x01, 0x02, 0x03, 0x04, 0xFF, 0xFE]
        );

        let bytes = w.as_slice().to_vec();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u32().unwrap(), 0x0102_0304);
        r.set_endian(Endian::Big);
        assert_eq!(r.get_u32().unwrap(), 0x0102_0304);
        assert_eq!(r.get_i16().unwrap(), -2);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_bool_and_signed_bytes() {
        let mut w = ByteWriter::new();
        w.put_bool(true);
        w.put_bool(false);
        w.put_i8(-128);
        let bytes = w.as_slice().to_vec();
        let mut r = ByteReader::new(&bytes);
        assert!(r.get_bool().unwrap());
        assert!(!r.get_bool().unwrap());
        assert_eq!(r.get_i8().unwrap(), -128);
    }

    #[test]
    fn test_var_str() {
        let mut w = ByteWriter::new();
        w.put_var_str("/pickcluster:0.1.0/");
        let bytes = w.as_slice().to_vec();
        assert_eq!(bytes[0] as usize, "/pickcluster:0.1.0/".len());

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_var_str().unwrap(), "/pickcluster:0.1.0/");

        let truncated = &bytes[..5];
        let mut r = ByteReader::new(truncated);
        assert!(r.get_var_str().unwrap_err().is_exhausted());
        assert_eq!(r.position(), 0);

        let invalid = [2u8, 0xC3, 0x28];
        let mut r = ByteReader::new(&invalid);
        assert!(matches!(
            r.get_var_str(),
            Err(CodecError::InvalidString(_))
        ));
    }

    #[test]
    fn test_net_address_port_is_big_endian() {
        let addr = NetworkAddress::from_ipv4([10, 0, 0, 1], 8333, 1);
        let mut w = ByteWriter::new();
        w.put_net_address(&addr, false);
        let bytes = w.as_slice().to_vec();
        assert_eq!(bytes.len(), 26);
        assert_eq!(&bytes[8..20], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(&bytes[24..26], &8333u16.to_be_bytes());

        let mut r = ByteReader::new(&bytes);
        r.set_endian(Endian::Big);
        let decoded = r.get_net_address(false).unwrap();
        assert_eq!(decoded.port, 8333);
        assert_eq!(decoded.timestamp, None);
    }

    #[test]
    fn test_net_address_with_timestamp() {
        let mut addr = NetworkAddress::from_ipv4([192, 168, 1, 7], 18333, 9);
        addr.timestamp = Some(1_700_000_000);
        let mut w = ByteWriter::new();
        w.put_net_address(&addr, true);
        let bytes = w.as_slice().to_vec();
        assert_eq!(bytes.len(), 30);

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_net_address(true).unwrap(), addr);

        let mut short = ByteReader::new(&bytes[..29]);
        assert!(short.get_net_address(true).unwrap_err().is_exhausted());
        assert_eq!(short.position(), 0);
    }
}
