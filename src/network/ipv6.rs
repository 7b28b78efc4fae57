//! IPv6 header and address helpers

use std::net::Ipv6Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::network::MacAddress;

pub const IPV6_HEADER_LEN: usize = 40;

/// All-nodes link-local multicast group
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
/// All-routers link-local multicast group
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Fixed IPv6 header (RFC 8200)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
}

impl Ipv6Header {
    pub fn new(payload_len: usize, next_header: u8, hop_limit: u8, src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_len: payload_len as u16,
            next_header,
            hop_limit,
            src_addr: src,
            dst_addr: dst,
        }
    }

    /// Returns None on short input or a version other than 6
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < IPV6_HEADER_LEN || data[0] >> 4 != 6 {
            return None;
        }
        let word = BigEndian::read_u32(&data[0..4]);
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);
        Some(Ipv6Header {
            traffic_class: ((word >> 20) & 0xFF) as u8,
            flow_label: word & 0x000F_FFFF,
            payload_len: BigEndian::read_u16(&data[4..6]),
            next_header: data[6],
            hop_limit: data[7],
            src_addr: Ipv6Addr::from(src),
            dst_addr: Ipv6Addr::from(dst),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        let word = (6u32 << 28) | ((self.traffic_class as u32) << 20) | (self.flow_label & 0x000F_FFFF);
        BigEndian::write_u32(&mut out[0..4], word);
        BigEndian::write_u16(&mut out[4..6], self.payload_len);
        out[6] = self.next_header;
        out[7] = self.hop_limit;
        out[8..24].copy_from_slice(&self.src_addr.octets());
        out[24..40].copy_from_slice(&self.dst_addr.octets());
    }
}

/// fe80::/64 with the modified EUI-64 of `mac`
pub fn link_local_from_mac(mac: MacAddress) -> Ipv6Addr {
    let mut o = [0u8; 16];
    o[0] = 0xfe;
    o[1] = 0x80;
    o[8..16].copy_from_slice(&mac.eui64());
    Ipv6Addr::from(o)
}

/// Address formed from a /64 prefix and the EUI-64 of `mac`
pub fn address_from_prefix(prefix: Ipv6Addr, mac: MacAddress) -> Ipv6Addr {
    let mut o = prefix.octets();
    o[8..16].copy_from_slice(&mac.eui64());
    Ipv6Addr::from(o)
}

/// ff02::1:ffXX:XXXX for `addr`
pub fn solicited_node(addr: Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, o[13], o[14], o[15],
    ])
}

pub fn is_link_local(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// True when the first `prefix_len` bits of both addresses agree
pub fn prefix_match(a: Ipv6Addr, b: Ipv6Addr, prefix_len: u8) -> bool {
    let a = u128::from(a);
    let b = u128::from(b);
    match prefix_len {
        0 => true,
        n if n >= 128 => a == b,
        n => (a ^ b) >> (128 - n as u32) == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_fields() {
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let dst: Ipv6Addr = "fe80::2".parse().unwrap();
        let header = Ipv6Header::new(12, 58, 255, src, dst);
        let mut raw = [0u8; IPV6_HEADER_LEN];
        header.write(&mut raw);
        assert_eq!(raw[0] >> 4, 6);
        assert_eq!(Ipv6Header::from_bytes(&raw), Some(header));
    }

    #[test]
    fn test_link_local_and_solicited_node() {
        let mac = MacAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let ll = link_local_from_mac(mac);
        assert_eq!(ll, "fe80::211:22ff:fe33:4455".parse::<Ipv6Addr>().unwrap());
        assert!(is_link_local(ll));
        assert_eq!(
            solicited_node(ll),
            "ff02::1:ff33:4455".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_prefix_match() {
        let a: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let b: Ipv6Addr = "2001:db8::ffff".parse().unwrap();
        let c: Ipv6Addr = "2001:db9::1".parse().unwrap();
        assert!(prefix_match(a, b, 64));
        assert!(!prefix_match(a, c, 32));
        assert!(prefix_match(a, c, 0));
    }
}
