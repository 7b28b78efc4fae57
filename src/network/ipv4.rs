//! IPv4 protocol implementation
//!
//! This module provides IPv4 header parsing, validation and serialization.
//!
//! Features:
//! - IPv4 header parsing and serialization
//! - Checksum calculation and validation over the raw header, options included
//! - Fragment field helpers

use std::net::Ipv4Addr;

use crate::error::{NxError, Result};
use crate::network::checksum;
use byteorder::{BigEndian, ByteOrder};

pub const IPV4_HEADER_LEN: usize = 20;
const IPV4_VERSION: u8 = 4;
const DEFAULT_IHL: u8 = 5; // 5 * 4 = 20 bytes (standard header length)

/// IPv4 packet header structure
///
/// Represents the standard 20-byte IPv4 header as defined in RFC 791
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8, // Internet Header Length
    pub tos: u8, // Type of Service
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16, // Flags and Fragment Offset
    pub ttl: u8,                // Time to Live
    pub protocol: u8,           // Next Protocol
    pub checksum: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a header without options; the checksum is filled by `write`
    pub fn new(
        tos: u8,
        payload_len: usize,
        id: u16,
        flags_frag_offset: u16,
        ttl: u8,
        protocol: u8,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
    ) -> Self {
        Ipv4Header {
            version: IPV4_VERSION,
            ihl: DEFAULT_IHL,
            tos,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            id,
            flags_frag_offset,
            ttl,
            protocol,
            checksum: 0,
            src_addr,
            dst_addr,
        }
    }

    /// Parse IPv4 header from byte slice
    ///
    /// Returns None if the data is too short or if the version field is not 4
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return None;
        }

        let version = (data[0] & 0xF0) >> 4;
        if version != IPV4_VERSION {
            return None;
        }

        Some(Ipv4Header {
            version,
            ihl: data[0] & 0x0F,
            tos: data[1],
            total_len: BigEndian::read_u16(&data[2..4]),
            id: BigEndian::read_u16(&data[4..6]),
            flags_frag_offset: BigEndian::read_u16(&data[6..8]),
            ttl: data[8],
            protocol: data[9],
            checksum: BigEndian::read_u16(&data[10..12]),
            src_addr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst_addr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Serialize into `out` (at least 20 bytes) and fill in the checksum
    pub fn write(&mut self, out: &mut [u8]) {
        out[0] = (self.version << 4) | self.ihl;
        out[1] = self.tos;
        BigEndian::write_u16(&mut out[2..4], self.total_len);
        BigEndian::write_u16(&mut out[4..6], self.id);
        BigEndian::write_u16(&mut out[6..8], self.flags_frag_offset);
        out[8] = self.ttl;
        out[9] = self.protocol;
        BigEndian::write_u16(&mut out[10..12], 0);
        out[12..16].copy_from_slice(&self.src_addr.octets());
        out[16..20].copy_from_slice(&self.dst_addr.octets());
        self.checksum = checksum(&out[..IPV4_HEADER_LEN]);
        BigEndian::write_u16(&mut out[10..12], self.checksum);
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Get payload length
    ///
    /// Returns the length of the payload (total length - header length)
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }

    /// Fragment offset in bytes
    pub fn fragment_offset(&self) -> usize {
        ((self.flags_frag_offset & flags::FRAGMENT_OFFSET_MASK) as usize) * 8
    }

    pub fn more_fragments(&self) -> bool {
        self.flags_frag_offset & flags::MORE_FRAGMENTS != 0
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags_frag_offset & flags::DONT_FRAGMENT != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// Validate a header against the raw bytes it was parsed from
    ///
    /// `raw` must start at the header; checksum covers options as well.
    /// `datagram_len` counts every byte received, header included.
    pub fn validate(&self, raw: &[u8], datagram_len: usize) -> Result<()> {
        // Check IHL (minimum 5 for 20-byte header)
        if self.ihl < DEFAULT_IHL || raw.len() < self.header_len() {
            return Err(NxError::InvalidPacket);
        }

        // Check total length
        if (self.total_len as usize) < self.header_len() || (self.total_len as usize) > datagram_len {
            return Err(NxError::InvalidPacket);
        }

        // Validate checksum
        if !Ipv4Utils::validate_checksum(&raw[..self.header_len()]) {
            return Err(NxError::InvalidPacket);
        }

        Ok(())
    }
}

/// IPv4 protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const IGMP: u8 = 2;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}

/// IPv4 flags constants
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

pub struct Ipv4Utils {}

impl Ipv4Utils {
    /// Returns true if the raw header sums to zero
    pub fn validate_checksum(raw_header: &[u8]) -> bool {
        checksum(raw_header) == 0
    }

    /// Directed or limited broadcast for `addr`/`mask`
    pub fn is_broadcast_for(dst: Ipv4Addr, addr: Ipv4Addr, mask: Ipv4Addr) -> bool {
        if dst.is_broadcast() {
            return true;
        }
        let host = !u32::from(mask);
        host != 0
            && u32::from(dst) & u32::from(mask) == u32::from(addr) & u32::from(mask)
            && u32::from(dst) & host == host
    }

    pub fn same_network(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
        u32::from(a) & u32::from(mask) == u32::from(b) & u32::from(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_parse() {
        let mut header = Ipv4Header::new(
            0,
            8,
            7,
            flags::DONT_FRAGMENT,
            64,
            protocol::ICMP,
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
        );
        let mut raw = [0u8; 28];
        header.write(&mut raw);

        let parsed = Ipv4Header::from_bytes(&raw).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.validate(&raw, raw.len()).is_ok());
        assert!(parsed.dont_fragment());
        assert_eq!(parsed.payload_len(), 8);
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let mut header = Ipv4Header::new(
            0,
            0,
            1,
            0,
            64,
            protocol::UDP,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        let mut raw = [0u8; 20];
        header.write(&mut raw);
        raw[8] = 1;
        let parsed = Ipv4Header::from_bytes(&raw).unwrap();
        assert_eq!(parsed.validate(&raw, raw.len()), Err(NxError::InvalidPacket));
    }

    #[test]
    fn test_broadcast_detection() {
        let addr = Ipv4Addr::new(192, 168, 1, 10);
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(Ipv4Utils::is_broadcast_for(Ipv4Addr::new(192, 168, 1, 255), addr, mask));
        assert!(Ipv4Utils::is_broadcast_for(Ipv4Addr::BROADCAST, addr, mask));
        assert!(!Ipv4Utils::is_broadcast_for(Ipv4Addr::new(192, 168, 2, 255), addr, mask));
        assert!(Ipv4Utils::same_network(addr, Ipv4Addr::new(192, 168, 1, 99), mask));
    }

    #[test]
    fn test_fragment_fields() {
        let mut header = Ipv4Header::new(
            0,
            0,
            1,
            flags::MORE_FRAGMENTS | 3,
            64,
            protocol::UDP,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
        );
        let mut raw = [0u8; 20];
        header.write(&mut raw);
        assert!(header.is_fragment());
        assert_eq!(header.fragment_offset(), 24);
    }
}
