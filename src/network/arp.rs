//! ARP and RARP packets for IPv4 over Ethernet (RFC 826, RFC 903)

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{NxError, Result};
use crate::network::{ethertype, MacAddress};

/// Size of an Ethernet/IPv4 ARP packet
pub const ARP_PACKET_LEN: usize = 28;

const HTYPE_ETHERNET: u16 = 1;

/// ARP opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
    RarpRequest,
    RarpReply,
}

impl ArpOperation {
    fn code(self) -> u16 {
        match self {
            ArpOperation::Request => 1,
            ArpOperation::Reply => 2,
            ArpOperation::RarpRequest => 3,
            ArpOperation::RarpReply => 4,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(ArpOperation::Request),
            2 => Some(ArpOperation::Reply),
            3 => Some(ArpOperation::RarpRequest),
            4 => Some(ArpOperation::RarpReply),
            _ => None,
        }
    }
}

/// Parsed ARP/RARP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        ArpPacket {
            operation: ArpOperation::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::ZERO,
            target_ip,
        }
    }

    /// Reply to `request` from the owner of its target address
    pub fn reply_to(request: &ArpPacket, our_mac: MacAddress) -> Self {
        ArpPacket {
            operation: ArpOperation::Reply,
            sender_mac: our_mac,
            sender_ip: request.target_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        }
    }

    /// RARP request asking for the address of `mac`
    pub fn rarp_request(mac: MacAddress) -> Self {
        ArpPacket {
            operation: ArpOperation::RarpRequest,
            sender_mac: mac,
            sender_ip: Ipv4Addr::UNSPECIFIED,
            target_mac: mac,
            target_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Announcement of our own binding
    pub fn gratuitous(mac: MacAddress, ip: Ipv4Addr) -> Self {
        ArpPacket {
            operation: ArpOperation::Request,
            sender_mac: mac,
            sender_ip: ip,
            target_mac: MacAddress::ZERO,
            target_ip: ip,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ARP_PACKET_LEN {
            return Err(NxError::InvalidPacket);
        }
        let htype = BigEndian::read_u16(&data[0..2]);
        let ptype = BigEndian::read_u16(&data[2..4]);
        if htype != HTYPE_ETHERNET || ptype != ethertype::IPV4 || data[4] != 6 || data[5] != 4 {
            return Err(NxError::InvalidPacket);
        }
        let operation =
            ArpOperation::from_code(BigEndian::read_u16(&data[6..8])).ok_or(NxError::InvalidPacket)?;
        let mut sender_mac = [0u8; 6];
        let mut target_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        target_mac.copy_from_slice(&data[18..24]);
        Ok(ArpPacket {
            operation,
            sender_mac: MacAddress(sender_mac),
            sender_ip: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            target_mac: MacAddress(target_mac),
            target_ip: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
        })
    }

    pub fn serialize(&self) -> [u8; ARP_PACKET_LEN] {
        let mut out = [0u8; ARP_PACKET_LEN];
        BigEndian::write_u16(&mut out[0..2], HTYPE_ETHERNET);
        BigEndian::write_u16(&mut out[2..4], ethertype::IPV4);
        out[4] = 6;
        out[5] = 4;
        BigEndian::write_u16(&mut out[6..8], self.operation.code());
        out[8..14].copy_from_slice(&self.sender_mac.0);
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(&self.target_mac.0);
        out[24..28].copy_from_slice(&self.target_ip.octets());
        out
    }

    pub fn is_rarp(&self) -> bool {
        matches!(self.operation, ArpOperation::RarpRequest | ArpOperation::RarpReply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_reply() {
        let mac_a = MacAddress([2, 0, 0, 0, 0, 1]);
        let mac_b = MacAddress([2, 0, 0, 0, 0, 2]);
        let req = ArpPacket::request(mac_a, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        let parsed = ArpPacket::parse(&req.serialize()).unwrap();
        assert_eq!(parsed, req);

        let reply = ArpPacket::reply_to(&parsed, mac_b);
        assert_eq!(reply.operation, ArpOperation::Reply);
        assert_eq!(reply.sender_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(reply.target_mac, mac_a);
    }

    #[test]
    fn test_rejects_bad_hardware_type() {
        let mut raw = ArpPacket::rarp_request(MacAddress([2, 0, 0, 0, 0, 1])).serialize();
        assert!(ArpPacket::parse(&raw).unwrap().is_rarp());
        raw[1] = 6;
        assert_eq!(ArpPacket::parse(&raw), Err(NxError::InvalidPacket));
    }

    #[test]
    fn test_unknown_opcode() {
        let mut raw = ArpPacket::gratuitous(MacAddress::BROADCAST, Ipv4Addr::LOCALHOST).serialize();
        raw[7] = 9;
        assert!(ArpPacket::parse(&raw).is_err());
        assert!(ArpPacket::parse(&raw[..20]).is_err());
    }
}
