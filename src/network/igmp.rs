//! IGMPv2 messages (RFC 2236)

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{NxError, Result};
use crate::network::checksum;

pub const IGMP_MESSAGE_LEN: usize = 8;

pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMP_V1_MEMBERSHIP_REPORT: u8 = 0x12;
pub const IGMP_V2_MEMBERSHIP_REPORT: u8 = 0x16;
pub const IGMP_LEAVE_GROUP: u8 = 0x17;

/// Destination of leave messages
pub const ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
/// Group every host belongs to; never reported
pub const ALL_HOSTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgmpMessage {
    pub msg_type: u8,
    pub max_response_time: u8,
    pub group: Ipv4Addr,
}

impl IgmpMessage {
    pub fn report(group: Ipv4Addr) -> Self {
        IgmpMessage {
            msg_type: IGMP_V2_MEMBERSHIP_REPORT,
            max_response_time: 0,
            group,
        }
    }

    pub fn leave(group: Ipv4Addr) -> Self {
        IgmpMessage {
            msg_type: IGMP_LEAVE_GROUP,
            max_response_time: 0,
            group,
        }
    }

    /// Parse and verify the checksum
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < IGMP_MESSAGE_LEN {
            return Err(NxError::InvalidPacket);
        }
        if checksum(&data[..IGMP_MESSAGE_LEN]) != 0 {
            return Err(NxError::InvalidPacket);
        }
        Ok(IgmpMessage {
            msg_type: data[0],
            max_response_time: data[1],
            group: Ipv4Addr::new(data[4], data[5], data[6], data[7]),
        })
    }

    pub fn serialize(&self) -> [u8; IGMP_MESSAGE_LEN] {
        let mut out = [0u8; IGMP_MESSAGE_LEN];
        out[0] = self.msg_type;
        out[1] = self.max_response_time;
        out[4..8].copy_from_slice(&self.group.octets());
        let sum = checksum(&out);
        BigEndian::write_u16(&mut out[2..4], sum);
        out
    }

    pub fn is_query(&self) -> bool {
        self.msg_type == IGMP_MEMBERSHIP_QUERY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_checksum() {
        let raw = IgmpMessage::report(Ipv4Addr::new(239, 1, 1, 1)).serialize();
        let parsed = IgmpMessage::parse(&raw).unwrap();
        assert_eq!(parsed.msg_type, IGMP_V2_MEMBERSHIP_REPORT);
        assert_eq!(parsed.group, Ipv4Addr::new(239, 1, 1, 1));
    }

    #[test]
    fn test_bad_checksum() {
        let mut raw = IgmpMessage::leave(Ipv4Addr::new(239, 1, 1, 1)).serialize();
        raw[7] ^= 0xFF;
        assert_eq!(IgmpMessage::parse(&raw), Err(NxError::InvalidPacket));
    }
}
