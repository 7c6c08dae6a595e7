//! Little-endian field reader and writer.
//!
//! Used for the bodies of control datagrams (connection ids, timestamps,
//! NAT endpoints, tokens). Every read is bounds-checked and returns `None`
//! past the end of the buffer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const ADDR_V4: u8 = 4;
const ADDR_V6: u8 = 6;

/// Appends little-endian fields to a byte vector.
#[derive(Debug)]
pub struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> WireWriter<'a> {
    #[inline]
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Family byte (4 or 6), address octets, then port.
    pub fn write_addr(&mut self, addr: &SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.write_u8(ADDR_V4);
                self.write_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.write_u8(ADDR_V6);
                self.write_bytes(&ip.octets());
            }
        }
        self.write_u16(addr.port());
    }

    /// u16 length prefix followed by UTF-8 bytes.
    ///
    /// Strings longer than `u16::MAX` bytes are truncated at a char boundary.
    pub fn write_str(&mut self, value: &str) {
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.write_u16(end as u16);
        self.write_bytes(&value.as_bytes()[..end]);
    }
}

/// Reads little-endian fields from a byte slice.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Everything not yet read.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    #[inline]
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    #[inline]
    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    #[inline]
    pub fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub fn read_u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    #[inline]
    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        self.take(n)
    }

    pub fn read_addr(&mut self) -> Option<SocketAddr> {
        let ip = match self.read_u8()? {
            ADDR_V4 => {
                let o = self.take(4)?;
                IpAddr::V4(Ipv4Addr::new(o[0], o[1], o[2], o[3]))
            }
            ADDR_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        let port = self.read_u16()?;
        Some(SocketAddr::new(ip, port))
    }

    /// Length-prefixed UTF-8 string, rejected if longer than `max_len` bytes.
    pub fn read_str(&mut self, max_len: usize) -> Option<&'a str> {
        let len = self.read_u16()? as usize;
        if len > max_len {
            return None;
        }
        std::str::from_utf8(self.take(len)?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_fields() {
        let mut buf = Vec::new();
        let mut w = WireWriter::new(&mut buf);
        w.write_u8(7);
        w.write_u16(0xBEEF);
        w.write_u64(0x0102_0304_0506_0708);
        w.write_str("token");
        assert_eq!(buf[1..3], [0xEF, 0xBE]);

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_u8(), Some(7));
        assert_eq!(r.read_u16(), Some(0xBEEF));
        assert_eq!(r.read_u64(), Some(0x0102_0304_0506_0708));
        assert_eq!(r.read_str(256), Some("token"));
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.read_u8(), None);
    }

    #[test]
    fn test_addresses() {
        let v4: SocketAddr = "192.168.1.20:7777".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let mut buf = Vec::new();
        let mut w = WireWriter::new(&mut buf);
        w.write_addr(&v4);
        w.write_addr(&v6);
        assert_eq!(buf.len(), (1 + 4 + 2) + (1 + 16 + 2));

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_addr(), Some(v4));
        assert_eq!(r.read_addr(), Some(v6));
    }

    #[test]
    fn test_bad_address_family() {
        let mut r = WireReader::new(&[9, 1, 2, 3, 4, 0, 0]);
        assert_eq!(r.read_addr(), None);
    }

    #[test]
    fn test_string_too_long() {
        let mut buf = Vec::new();
        WireWriter::new(&mut buf).write_str("abcdef");
        assert_eq!(WireReader::new(&buf).read_str(5), None);
        assert_eq!(WireReader::new(&buf).read_str(6), Some("abcdef"));
    }

    #[test]
    fn test_truncated_read() {
        let mut r = WireReader::new(&[1, 2, 3]);
        assert_eq!(r.read_u32(), None);
        // failed read does not consume
        assert_eq!(r.read_u16(), Some(0x0201));
    }
}
