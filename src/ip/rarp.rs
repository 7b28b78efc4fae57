//! Reverse ARP: learn our IPv4 address from the link
//!
//! While enabled, the periodic pass broadcasts a request for every interface
//! that still has no address. The first reply naming our MAC assigns the
//! address with its classful mask.

use log::{debug, info};

use crate::error::{NxError, Result};
use crate::iface::driver::DriverCommand;
use crate::ip::{Ip, IpState};
use crate::network::{classful_mask, ArpOperation, ArpPacket};
use crate::packet::{Packet, PHYSICAL_HEADER};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RarpInfo {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub invalid_messages: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RarpState {
    stats: RarpInfo,
}

impl IpState {
    pub(crate) fn rarp_periodic(&mut self) {
        if self.rarp.is_none() {
            return;
        }
        let pending: Vec<(usize, ArpPacket)> = self
            .live_interfaces()
            .filter(|i| i.ipv4.is_none() && i.address_mapping_needed)
            .map(|i| (i.index, ArpPacket::rarp_request(i.mac)))
            .collect();
        for (interface, message) in pending {
            let Ok(packet) = self.pool.allocate_with(PHYSICAL_HEADER, &message.serialize()) else {
                return;
            };
            if self.driver_send(interface, DriverCommand::RarpSend, packet, None).is_ok() {
                if let Some(rarp) = self.rarp.as_mut() {
                    rarp.stats.requests_sent += 1;
                }
            }
        }
    }

    pub(crate) fn rarp_packet_receive(&mut self, packet: Packet) {
        let interface = packet.meta.interface.unwrap_or(0);
        let Some(rarp) = self.rarp.as_mut() else {
            return;
        };
        let message = match ArpPacket::parse(packet.data()) {
            Ok(m) if m.operation == ArpOperation::RarpReply => m,
            _ => {
                rarp.stats.invalid_messages += 1;
                return;
            }
        };
        let assigned = match self.interfaces.get_mut(interface).and_then(|i| i.as_mut()) {
            Some(iface) if iface.ipv4.is_none() && iface.mac == message.target_mac => {
                let mask = classful_mask(message.target_ip);
                iface.ipv4 = Some((message.target_ip, mask));
                true
            }
            _ => false,
        };
        if let Some(rarp) = self.rarp.as_mut() {
            rarp.stats.responses_received += 1;
        }
        if assigned {
            info!("rarp: interface {} assigned {}", interface, message.target_ip);
            self.address_changed(interface);
        } else {
            debug!("rarp: reply for {} ignored", message.target_mac);
        }
    }
}

impl Ip {
    pub fn rarp_enable(&self) -> Result<()> {
        self.locked(|s| {
            if s.rarp.is_some() {
                return Err(NxError::AlreadyEnabled);
            }
            s.rarp = Some(RarpState::default());
            Ok(())
        })
    }

    pub fn rarp_disable(&self) -> Result<()> {
        self.locked(|s| s.rarp.take().map(|_| ()).ok_or(NxError::NotEnabled))
    }

    pub fn rarp_info(&self) -> Result<RarpInfo> {
        self.locked(|s| s.rarp.as_ref().map(|r| r.stats).ok_or(NxError::NotEnabled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpConfig;
    use crate::iface::VirtualNetwork;
    use crate::network::ethertype;
    use crate::packet::PacketPool;
    use std::net::Ipv4Addr;

    #[test]
    fn test_reply_assigns_address() {
        let net = VirtualNetwork::new(3);
        let link = net.link();
        let mac = link.mac();
        let ip = Ip::create(
            "rarp",
            PacketPool::new("rarp", 256, 8),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            link,
            IpConfig::manual(),
        )
        .unwrap();
        ip.rarp_enable().unwrap();
        net.capture_start();
        ip.periodic_tick().unwrap();
        ip.process_pending().unwrap();
        let frames = net.captured();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ethertype, ethertype::RARP);

        let reply = ArpPacket {
            operation: ArpOperation::RarpReply,
            sender_mac: crate::network::MacAddress([2, 0, 0, 0, 3, 9]),
            sender_ip: Ipv4Addr::new(172, 20, 0, 1),
            target_mac: mac,
            target_ip: Ipv4Addr::new(172, 20, 0, 5),
        };
        let receiver = ip.link_receiver().unwrap();
        let mut packet = receiver.allocate().unwrap();
        packet.append(&reply.serialize()).unwrap();
        packet.meta.interface = Some(0);
        receiver.rarp_packet_deferred_receive(packet);
        ip.process_pending().unwrap();

        assert_eq!(
            ip.address().unwrap(),
            (Ipv4Addr::new(172, 20, 0, 5), Ipv4Addr::new(255, 255, 0, 0))
        );
        assert_eq!(ip.rarp_info().unwrap().responses_received, 1);

        // no more requests once addressed
        ip.periodic_tick().unwrap();
        ip.process_pending().unwrap();
        assert!(net.captured().is_empty());
    }
}
