//! Wire formats of the network layer
//!
//! This module contains the header codecs used by the stack:
//! - Ethernet framing and link (MAC) addresses
//! - IPv4 and IPv6 headers
//! - ICMP and ICMPv6 messages
//! - ARP and RARP packets
//! - Neighbor Discovery messages
//! - IGMPv2 messages
//!
//! Codecs only translate between bytes and structs. Validation that needs
//! instance state (our addresses, enabled services) happens in `ip`.

pub mod arp;
pub mod icmp;
pub mod igmp;
pub mod ipv4;
pub mod ipv6;
pub mod ndp;

use core::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};

pub use arp::{ArpOperation, ArpPacket};
pub use icmp::{IcmpHeader, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
pub use igmp::IgmpMessage;
pub use ipv4::{flags, protocol, Ipv4Header};
pub use ipv6::Ipv6Header;
pub use ndp::NdMessage;

/// Length of an Ethernet II header
pub const ETHERNET_HEADER_LEN: usize = 14;

/// EtherType values carried in Ethernet II frames
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const RARP: u16 = 0x8035;
    pub const IPV6: u16 = 0x86DD;
}

/// 48-bit link-layer address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// 01:00:5e followed by the low 23 bits of the group
    pub fn from_ipv4_multicast(group: Ipv4Addr) -> Self {
        let o = group.octets();
        MacAddress([0x01, 0x00, 0x5E, o[1] & 0x7F, o[2], o[3]])
    }

    /// 33:33 followed by the low 32 bits of the group
    pub fn from_ipv6_multicast(group: Ipv6Addr) -> Self {
        let o = group.octets();
        MacAddress([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }

    /// Interface identifier of a link-local address (modified EUI-64)
    pub fn eui64(&self) -> [u8; 8] {
        let m = self.0;
        [m[0] ^ 0x02, m[1], m[2], 0xFF, 0xFE, m[3], m[4], m[5]]
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Ethernet II header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub destination: MacAddress,
    pub source: MacAddress,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ETHERNET_HEADER_LEN {
            return None;
        }
        let mut destination = [0u8; 6];
        let mut source = [0u8; 6];
        destination.copy_from_slice(&data[0..6]);
        source.copy_from_slice(&data[6..12]);
        Some(EthernetHeader {
            destination: MacAddress(destination),
            source: MacAddress(source),
            ethertype: BigEndian::read_u16(&data[12..14]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(&self.destination.0);
        out[6..12].copy_from_slice(&self.source.0);
        BigEndian::write_u16(&mut out[12..14], self.ethertype);
    }
}

/// Calculate Internet checksum
///
/// Algorithm: Sum data in 16-bit chunks, add carry bits to the sum,
/// and return the one's complement of the result.
/// This is used for IP, ICMP, IGMP, UDP and TCP checksums.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Add `data` to a running 32-bit one's complement sum
pub fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    // Process data in 2-byte chunks
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += BigEndian::read_u16(chunk) as u32;
    }

    // Handle odd-length data by padding with zero
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Keep room for further additions
    while (sum >> 16) > 0xFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum
}

/// Fold the carries and return the one's complement
pub fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Checksum of a transport segment including the IPv4 or IPv6 pseudo header
///
/// Mixed address families yield zero, which never verifies.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    transport_checksum_chain(src, dst, protocol, segment.len(), [segment])
}

/// Pseudo-header checksum over a segment of `len` bytes split across `buffers`
pub fn transport_checksum_chain<'a>(
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    len: usize,
    buffers: impl IntoIterator<Item = &'a [u8]>,
) -> u16 {
    let len = len as u32;
    let sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut sum = sum_words(&s.octets(), 0);
            sum = sum_words(&d.octets(), sum);
            sum + protocol as u32 + len
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut sum = sum_words(&s.octets(), 0);
            sum = sum_words(&d.octets(), sum);
            sum + (len >> 16) + (len & 0xFFFF) + protocol as u32
        }
        _ => return 0,
    };
    fold(sum_buffers(buffers, sum))
}

/// `sum_words` over buffers taken as one contiguous block
pub fn sum_buffers<'a>(buffers: impl IntoIterator<Item = &'a [u8]>, mut sum: u32) -> u32 {
    // high byte of a word split across two buffers
    let mut odd: Option<u8> = None;
    for mut buffer in buffers {
        if let (Some(high), Some((&low, rest))) = (odd, buffer.split_first()) {
            sum = sum_words(&[high, low], sum);
            odd = None;
            buffer = rest;
        }
        let even = buffer.len() & !1;
        sum = sum_words(&buffer[..even], sum);
        if even < buffer.len() {
            odd = Some(buffer[even]);
        }
    }
    match odd {
        Some(high) => sum_words(&[high], sum),
        None => sum,
    }
}

/// Class-based mask for an address learned without one (RARP)
pub fn classful_mask(addr: Ipv4Addr) -> Ipv4Addr {
    match addr.octets()[0] {
        0..=127 => Ipv4Addr::new(255, 0, 0, 0),
        128..=191 => Ipv4Addr::new(255, 255, 0, 0),
        _ => Ipv4Addr::new(255, 255, 255, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verifies_to_zero() {
        let mut data = [0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x40, 0x01, 0, 0];
        let c = checksum(&data);
        BigEndian::write_u16(&mut data[10..12], c);
        assert_eq!(checksum(&data), 0);
    }

    #[test]
    fn test_odd_length() {
        assert_eq!(checksum(&[0x01]), !0x0100);
    }

    #[test]
    fn test_multicast_mac_mapping() {
        let mac = MacAddress::from_ipv4_multicast(Ipv4Addr::new(239, 129, 2, 3));
        assert_eq!(mac.0, [0x01, 0x00, 0x5E, 0x01, 0x02, 0x03]);
        let group: Ipv6Addr = "ff02::1:ff00:1234".parse().unwrap();
        let mac = MacAddress::from_ipv6_multicast(group);
        assert_eq!(mac.0, [0x33, 0x33, 0xFF, 0x00, 0x12, 0x34]);
        assert!(mac.is_multicast());
    }

    #[test]
    fn test_transport_checksum_roundtrip() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let mut seg = [0x12, 0x34, 0x00, 0x35, 0x00, 0x0a, 0x00, 0x00, 0xab, 0xcd];
        let c = transport_checksum(src, dst, protocol::UDP, &seg);
        BigEndian::write_u16(&mut seg[6..8], c);
        assert_eq!(transport_checksum(src, dst, protocol::UDP, &seg), 0);
    }

    #[test]
    fn test_sum_across_odd_buffer_boundaries() {
        let data: Vec<u8> = (1..=23u8).collect();
        let whole = checksum(&data);
        assert_eq!(fold(sum_buffers([&data[..5], &data[5..6], &data[6..]], 0)), whole);
        assert_eq!(fold(sum_buffers([&data[..0], &data[..11], &data[11..]], 0)), whole);
    }
}
