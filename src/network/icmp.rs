//! ICMP (Internet Control Message Protocol) implementation
//!
//! This module provides ICMP and ICMPv6 header parsing. Both versions share
//! the 8-byte layout for the messages the stack handles (echo and the
//! Neighbor Discovery messages in `ndp`), so one header type serves both.

use byteorder::{BigEndian, ByteOrder};

/// Minimum ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// ICMPv6 message types
pub mod v6 {
    pub const DEST_UNREACHABLE: u8 = 1;
    pub const ECHO_REQUEST: u8 = 128;
    pub const ECHO_REPLY: u8 = 129;
    pub const ROUTER_SOLICITATION: u8 = 133;
    pub const ROUTER_ADVERTISEMENT: u8 = 134;
    pub const NEIGHBOR_SOLICITATION: u8 = 135;
    pub const NEIGHBOR_ADVERTISEMENT: u8 = 136;
}

/// ICMP packet header structure
///
/// Represents the standard 8-byte ICMP header as defined in RFC 792
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,  // ICMP message type
    pub msg_code: u8,  // ICMP message code
    pub checksum: u16, // ICMP checksum
    pub rest: [u8; 4], // Type-specific data (e.g., identifier and sequence for echo)
}

impl IcmpHeader {
    /// Echo message with identifier and sequence filled in
    pub fn echo(msg_type: u8, identifier: u16, sequence: u16) -> Self {
        let mut header = IcmpHeader {
            msg_type,
            msg_code: 0,
            checksum: 0,
            rest: [0; 4],
        };
        header.set_identifier(identifier);
        header.set_sequence(sequence);
        header
    }

    /// Parse ICMP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid ICMP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }

        let mut rest = [0u8; 4];
        rest.copy_from_slice(&data[4..8]);
        Some(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            rest,
        })
    }

    /// Convert ICMP header to bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.msg_type;
        bytes[1] = self.msg_code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }

    /// Check if this is an Echo Request message
    pub fn is_echo_request(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REQUEST
    }

    /// Check if this is an Echo Reply message
    pub fn is_echo_reply(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REPLY
    }

    /// Get the identifier field for Echo Request/Reply messages
    pub fn identifier(&self) -> u16 {
        BigEndian::read_u16(&self.rest[0..2])
    }

    /// Get the sequence number field for Echo Request/Reply messages
    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.rest[2..4])
    }

    /// Set the identifier field for Echo Request/Reply messages
    pub fn set_identifier(&mut self, id: u16) {
        BigEndian::write_u16(&mut self.rest[0..2], id);
    }

    /// Set the sequence number field for Echo Request/Reply messages
    pub fn set_sequence(&mut self, seq: u16) {
        BigEndian::write_u16(&mut self.rest[2..4], seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_fields() {
        let header = IcmpHeader::echo(ICMP_TYPE_ECHO_REQUEST, 0x1234, 7);
        let parsed = IcmpHeader::from_bytes(&header.to_bytes()).unwrap();
        assert!(parsed.is_echo_request());
        assert_eq!(parsed.identifier(), 0x1234);
        assert_eq!(parsed.sequence(), 7);
    }

    #[test]
    fn test_short_input() {
        assert!(IcmpHeader::from_bytes(&[8, 0, 0]).is_none());
    }
}
