//! Neighbor Discovery messages (RFC 4861)
//!
//! Messages are parsed from and serialized to a whole ICMPv6 message. The
//! checksum field is left zero on output; it depends on the pseudo header and
//! is filled in by the sender.

use std::net::Ipv6Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{NxError, Result};
use crate::network::icmp::v6;
use crate::network::MacAddress;

const OPT_SOURCE_LINK_ADDR: u8 = 1;
const OPT_TARGET_LINK_ADDR: u8 = 2;
const OPT_PREFIX_INFO: u8 = 3;

const NA_FLAG_ROUTER: u32 = 0x8000_0000;
const NA_FLAG_SOLICITED: u32 = 0x4000_0000;
const NA_FLAG_OVERRIDE: u32 = 0x2000_0000;

const PREFIX_FLAG_ON_LINK: u8 = 0x80;
const PREFIX_FLAG_AUTONOMOUS: u8 = 0x40;

/// Prefix Information option of a Router Advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInfo {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_lifetime: u32,
}

/// ND message understood by the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdMessage {
    NeighborSolicitation {
        target: Ipv6Addr,
        source_mac: Option<MacAddress>,
    },
    NeighborAdvertisement {
        target: Ipv6Addr,
        target_mac: Option<MacAddress>,
        router: bool,
        solicited: bool,
        override_flag: bool,
    },
    RouterAdvertisement {
        router_lifetime: u16,
        source_mac: Option<MacAddress>,
        prefixes: Vec<PrefixInfo>,
    },
}

fn read_addr(data: &[u8]) -> Ipv6Addr {
    let mut o = [0u8; 16];
    o.copy_from_slice(&data[..16]);
    Ipv6Addr::from(o)
}

/// Walk the TLV options, returning (type, body) pairs
fn options(mut data: &[u8]) -> Result<Vec<(u8, &[u8])>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return Err(NxError::InvalidPacket);
        }
        let len = data[1] as usize * 8;
        if len == 0 || len > data.len() {
            return Err(NxError::InvalidPacket);
        }
        out.push((data[0], &data[2..len]));
        data = &data[len..];
    }
    Ok(out)
}

fn link_option(opts: &[(u8, &[u8])], kind: u8) -> Option<MacAddress> {
    opts.iter().find(|(t, body)| *t == kind && body.len() >= 6).map(|(_, body)| {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&body[..6]);
        MacAddress(mac)
    })
}

fn push_link_option(out: &mut Vec<u8>, kind: u8, mac: MacAddress) {
    out.push(kind);
    out.push(1);
    out.extend_from_slice(&mac.0);
}

impl NdMessage {
    /// Parse an ICMPv6 message; Ok(None) for types that are not ND
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < 8 {
            return Err(NxError::InvalidPacket);
        }
        match data[0] {
            v6::NEIGHBOR_SOLICITATION => {
                if data.len() < 24 {
                    return Err(NxError::InvalidPacket);
                }
                let opts = options(&data[24..])?;
                Ok(Some(NdMessage::NeighborSolicitation {
                    target: read_addr(&data[8..24]),
                    source_mac: link_option(&opts, OPT_SOURCE_LINK_ADDR),
                }))
            }
            v6::NEIGHBOR_ADVERTISEMENT => {
                if data.len() < 24 {
                    return Err(NxError::InvalidPacket);
                }
                let word = BigEndian::read_u32(&data[4..8]);
                let opts = options(&data[24..])?;
                Ok(Some(NdMessage::NeighborAdvertisement {
                    target: read_addr(&data[8..24]),
                    target_mac: link_option(&opts, OPT_TARGET_LINK_ADDR),
                    router: word & NA_FLAG_ROUTER != 0,
                    solicited: word & NA_FLAG_SOLICITED != 0,
                    override_flag: word & NA_FLAG_OVERRIDE != 0,
                }))
            }
            v6::ROUTER_ADVERTISEMENT => {
                if data.len() < 16 {
                    return Err(NxError::InvalidPacket);
                }
                let opts = options(&data[16..])?;
                let prefixes = opts
                    .iter()
                    .filter(|(t, body)| *t == OPT_PREFIX_INFO && body.len() >= 30)
                    .map(|(_, body)| PrefixInfo {
                        prefix_len: body[0],
                        on_link: body[1] & PREFIX_FLAG_ON_LINK != 0,
                        autonomous: body[1] & PREFIX_FLAG_AUTONOMOUS != 0,
                        valid_lifetime: BigEndian::read_u32(&body[2..6]),
                        prefix: read_addr(&body[14..30]),
                    })
                    .collect();
                Ok(Some(NdMessage::RouterAdvertisement {
                    router_lifetime: BigEndian::read_u16(&data[6..8]),
                    source_mac: link_option(&opts, OPT_SOURCE_LINK_ADDR),
                    prefixes,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Serialize as an ICMPv6 message with a zero checksum
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            NdMessage::NeighborSolicitation { target, source_mac } => {
                out.extend_from_slice(&[v6::NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0]);
                out.extend_from_slice(&target.octets());
                if let Some(mac) = source_mac {
                    push_link_option(&mut out, OPT_SOURCE_LINK_ADDR, *mac);
                }
            }
            NdMessage::NeighborAdvertisement {
                target,
                target_mac,
                router,
                solicited,
                override_flag,
            } => {
                let mut word = 0u32;
                if *router {
                    word |= NA_FLAG_ROUTER;
                }
                if *solicited {
                    word |= NA_FLAG_SOLICITED;
                }
                if *override_flag {
                    word |= NA_FLAG_OVERRIDE;
                }
                out.extend_from_slice(&[v6::NEIGHBOR_ADVERTISEMENT, 0, 0, 0]);
                out.extend_from_slice(&word.to_be_bytes());
                out.extend_from_slice(&target.octets());
                if let Some(mac) = target_mac {
                    push_link_option(&mut out, OPT_TARGET_LINK_ADDR, *mac);
                }
            }
            NdMessage::RouterAdvertisement {
                router_lifetime,
                source_mac,
                prefixes,
            } => {
                out.extend_from_slice(&[v6::ROUTER_ADVERTISEMENT, 0, 0, 0, 64, 0]);
                out.extend_from_slice(&router_lifetime.to_be_bytes());
                out.extend_from_slice(&[0; 8]);
                if let Some(mac) = source_mac {
                    push_link_option(&mut out, OPT_SOURCE_LINK_ADDR, *mac);
                }
                for p in prefixes {
                    let mut flags = 0u8;
                    if p.on_link {
                        flags |= PREFIX_FLAG_ON_LINK;
                    }
                    if p.autonomous {
                        flags |= PREFIX_FLAG_AUTONOMOUS;
                    }
                    out.extend_from_slice(&[OPT_PREFIX_INFO, 4, p.prefix_len, flags]);
                    out.extend_from_slice(&p.valid_lifetime.to_be_bytes());
                    out.extend_from_slice(&p.valid_lifetime.to_be_bytes());
                    out.extend_from_slice(&[0; 4]);
                    out.extend_from_slice(&p.prefix.octets());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solicitation_with_option() {
        let msg = NdMessage::NeighborSolicitation {
            target: "fe80::2".parse().unwrap(),
            source_mac: Some(MacAddress([2, 0, 0, 0, 0, 1])),
        };
        let raw = msg.serialize();
        assert_eq!(raw.len(), 32);
        assert_eq!(NdMessage::parse(&raw).unwrap(), Some(msg));
    }

    #[test]
    fn test_advertisement_flags() {
        let msg = NdMessage::NeighborAdvertisement {
            target: "fe80::9".parse().unwrap(),
            target_mac: Some(MacAddress([2, 0, 0, 0, 0, 9])),
            router: false,
            solicited: true,
            override_flag: true,
        };
        assert_eq!(NdMessage::parse(&msg.serialize()).unwrap(), Some(msg));
    }

    #[test]
    fn test_router_advertisement_prefix() {
        let msg = NdMessage::RouterAdvertisement {
            router_lifetime: 1800,
            source_mac: None,
            prefixes: vec![PrefixInfo {
                prefix: "2001:db8::".parse().unwrap(),
                prefix_len: 64,
                on_link: true,
                autonomous: true,
                valid_lifetime: 3600,
            }],
        };
        assert_eq!(NdMessage::parse(&msg.serialize()).unwrap(), Some(msg));
    }

    #[test]
    fn test_zero_length_option_rejected() {
        let mut raw = NdMessage::NeighborSolicitation {
            target: "fe80::2".parse().unwrap(),
            source_mac: Some(MacAddress::ZERO),
        }
        .serialize();
        raw[25] = 0;
        assert_eq!(NdMessage::parse(&raw), Err(NxError::InvalidPacket));
    }

    #[test]
    fn test_echo_is_not_nd() {
        assert_eq!(NdMessage::parse(&[v6::ECHO_REQUEST, 0, 0, 0, 0, 0, 0, 0]), Ok(None));
    }
}
