//! ARP service of an IP instance
//!
//! The cache itself lives in `arp_cache`; this module wires it to the
//! interfaces: requests and replies on the wire, the periodic retransmission
//! pass, and the application API.

use std::net::{IpAddr, Ipv4Addr};

use log::{debug, trace};

use crate::error::{NxError, Result};
use crate::iface::driver::DriverCommand;
use crate::ip::arp_cache::{ArpCache, ArpEntryKind, ArpParams, Drained};
use crate::ip::route::RouteKind;
use crate::ip::{Ip, IpState};
use crate::network::{ArpOperation, ArpPacket, MacAddress};
use crate::packet::{Packet, PHYSICAL_HEADER};

/// ARP counters and table occupancy
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArpInfo {
    pub requests_sent: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub responses_received: u64,
    pub dynamic_entries: usize,
    pub static_entries: usize,
    pub aged_entries: u64,
    pub invalid_messages: u64,
    pub packets_dropped: u64,
}

impl IpState {
    fn arp_transmit(&mut self, interface: usize, command: DriverCommand, message: ArpPacket, to: Option<MacAddress>) {
        let packet = match self.pool.allocate_with(PHYSICAL_HEADER, &message.serialize()) {
            Ok(packet) => packet,
            Err(_) => {
                trace!("arp: no packet for {:?}", message.operation);
                return;
            }
        };
        if let Err(e) = self.driver_send(interface, command, packet, to) {
            debug!("arp: driver refused {:?}: {}", command, e);
        }
    }

    /// Broadcast a request for `target` on `interface`
    pub(crate) fn arp_request_send(&mut self, target: Ipv4Addr, interface: usize) {
        let Ok(iface) = self.interface(interface) else {
            return;
        };
        let sender = iface.ipv4_address().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let message = ArpPacket::request(iface.mac, sender, target);
        if let Some(arp) = self.arp.as_mut() {
            arp.stats.requests_sent += 1;
        }
        trace!("arp: who-has {} tell {}", target, sender);
        self.arp_transmit(interface, DriverCommand::ArpSend, message, None);
    }

    fn arp_drained(&mut self, drained: Option<Drained>) {
        if let Some(Drained { mac, interface, packets }) = drained {
            self.drained_send(interface, mac, packets);
        }
    }

    /// Process one packet from the deferred ARP FIFO
    pub(crate) fn arp_packet_receive(&mut self, packet: Packet) {
        let interface = packet.meta.interface.unwrap_or(0);
        let Some(arp) = self.arp.as_mut() else {
            return;
        };
        let message = match ArpPacket::parse(packet.data()) {
            Ok(message) if !message.is_rarp() => message,
            _ => {
                arp.stats.invalid_messages += 1;
                return;
            }
        };
        drop(packet);
        let Ok(iface) = self.interface(interface) else {
            return;
        };
        let our_ip = iface.ipv4_address();
        let our_mac = iface.mac;
        let for_us = our_ip == Some(message.target_ip);
        let learnable = !message.sender_ip.is_unspecified() && Some(message.sender_ip) != our_ip;

        match message.operation {
            ArpOperation::Request => {
                let Some(arp) = self.arp.as_mut() else {
                    return;
                };
                arp.stats.requests_received += 1;
                let drained = if learnable {
                    arp.learn(message.sender_ip, message.sender_mac, interface, for_us)
                } else {
                    None
                };
                self.arp_drained(drained);
                if for_us {
                    let reply = ArpPacket::reply_to(&message, our_mac);
                    if let Some(arp) = self.arp.as_mut() {
                        arp.stats.responses_sent += 1;
                    }
                    trace!("arp: {} is-at {}", message.target_ip, our_mac);
                    self.arp_transmit(interface, DriverCommand::ArpResponseSend, reply, Some(message.sender_mac));
                }
            }
            ArpOperation::Reply => {
                let Some(arp) = self.arp.as_mut() else {
                    return;
                };
                arp.stats.responses_received += 1;
                if learnable {
                    let drained = arp.learn(message.sender_ip, message.sender_mac, interface, for_us);
                    self.arp_drained(drained);
                }
            }
            ArpOperation::RarpRequest | ArpOperation::RarpReply => {}
        }
    }

    /// ARP half of the periodic pass
    pub(crate) fn arp_periodic(&mut self) {
        let Some(arp) = self.arp.as_mut() else {
            return;
        };
        for probe in arp.age_tick() {
            self.arp_request_send(probe.ip, probe.interface);
        }
    }

    fn arp_cache(&mut self) -> Result<&mut ArpCache> {
        self.arp.as_mut().ok_or(NxError::NotEnabled)
    }

    /// Interface that reaches `ip` directly
    fn arp_direct_interface(&self, ip: Ipv4Addr) -> Result<usize> {
        let route = self.route(IpAddr::V4(ip), None)?;
        if route.kind != RouteKind::Direct || route.next_hop != IpAddr::V4(ip) {
            return Err(NxError::IpAddressError);
        }
        Ok(route.interface)
    }
}

impl Ip {
    /// Enable ARP with a cache of `entries` entries
    pub fn arp_enable(&self, entries: usize) -> Result<()> {
        self.locked(|s| {
            if s.arp.is_some() {
                return Err(NxError::AlreadyEnabled);
            }
            let config = &s.config;
            let params = ArpParams {
                update_rate: config.arp_update_rate,
                expiration_rate: config.arp_expiration_rate,
                max_retries: config.arp_max_retries,
                max_queue_depth: config.arp_max_queue_depth,
                evict: config.arp_evict,
            };
            s.arp = Some(ArpCache::new(entries, config.arp_table_size, params)?);
            debug!("arp enabled with {} entries", entries);
            Ok(())
        })
    }

    /// Pin `ip` to `mac`. `ip` must be directly reachable.
    pub fn arp_static_entry_create(&self, ip: Ipv4Addr, mac: MacAddress) -> Result<()> {
        if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
            return Err(NxError::IpAddressError);
        }
        self.locked(|s| {
            s.arp_cache()?;
            let interface = s.arp_direct_interface(ip)?;
            let drained = s.arp_cache()?.bind_static(ip, mac, interface)?;
            s.arp_drained(Some(drained));
            Ok(())
        })
    }

    pub fn arp_static_entry_delete(&self, ip: Ipv4Addr, mac: MacAddress) -> Result<()> {
        self.locked(|s| s.arp_cache()?.delete_static(ip, mac))
    }

    /// Remove every static entry
    pub fn arp_static_entries_delete(&self) -> Result<usize> {
        self.locked(|s| Ok(s.arp_cache()?.delete_static_all()))
    }

    /// Create or refresh a dynamic entry
    pub fn arp_dynamic_entry_set(&self, ip: Ipv4Addr, mac: MacAddress) -> Result<()> {
        self.locked(|s| {
            s.arp_cache()?;
            let interface = s.arp_direct_interface(ip)?;
            let arp = s.arp_cache()?;
            if let Some(idx) = arp.find(ip) {
                if arp.entry(idx).kind == ArpEntryKind::Static {
                    return Err(NxError::DuplicateEntry);
                }
            }
            let drained = arp.learn(ip, mac, interface, true).ok_or(NxError::NoMoreEntries)?;
            s.arp_drained(Some(drained));
            Ok(())
        })
    }

    /// Drop every dynamic entry with its queued packets
    pub fn arp_dynamic_entries_invalidate(&self) -> Result<usize> {
        self.locked(|s| Ok(s.arp_cache()?.invalidate_dynamic()))
    }

    pub fn arp_entry_delete(&self, ip: Ipv4Addr) -> Result<()> {
        self.locked(|s| s.arp_cache()?.delete(ip))
    }

    pub fn arp_hardware_address_find(&self, ip: Ipv4Addr) -> Result<MacAddress> {
        self.locked(|s| s.arp_cache()?.hardware_address_find(ip).ok_or(NxError::EntryNotFound))
    }

    pub fn arp_ip_address_find(&self, mac: MacAddress) -> Result<Ipv4Addr> {
        self.locked(|s| s.arp_cache()?.ip_address_find(mac).ok_or(NxError::EntryNotFound))
    }

    /// Announce our binding on every addressed interface
    pub fn arp_gratuitous_send(&self) -> Result<()> {
        self.locked(|s| {
            s.arp_cache()?;
            let announcements: Vec<(usize, ArpPacket)> = s
                .live_interfaces()
                .filter(|i| i.address_mapping_needed)
                .filter_map(|i| i.ipv4_address().map(|addr| (i.index, ArpPacket::gratuitous(i.mac, addr))))
                .collect();
            for (interface, message) in announcements {
                s.arp_cache()?.stats.requests_sent += 1;
                s.arp_transmit(interface, DriverCommand::ArpSend, message, None);
            }
            Ok(())
        })
    }

    pub fn arp_info(&self) -> Result<ArpInfo> {
        self.locked(|s| {
            let arp = s.arp.as_ref().ok_or(NxError::NotEnabled)?;
            Ok(ArpInfo {
                requests_sent: arp.stats.requests_sent,
                requests_received: arp.stats.requests_received,
                responses_sent: arp.stats.responses_sent,
                responses_received: arp.stats.responses_received,
                dynamic_entries: arp.dynamic_count(),
                static_entries: arp.static_count(),
                aged_entries: arp.stats.aged_entries,
                invalid_messages: arp.stats.invalid_messages,
                packets_dropped: arp.stats.packets_dropped,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;
    use crate::network::ethertype;

    #[test]
    fn test_request_answered_and_sender_learned() {
        let net = VirtualNetwork::new(1);
        let a = instance(&net, 1);
        let b = instance(&net, 2);
        a.arp_enable(8).unwrap();
        b.arp_enable(8).unwrap();
        net.capture_start();

        a.locked(|s| {
            s.arp_request_send(Ipv4Addr::new(10, 0, 0, 2), 0);
            Ok(())
        })
        .unwrap();
        b.process_pending().unwrap();
        a.process_pending().unwrap();

        let frames = net.captured();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.ethertype == ethertype::ARP));
        // b learned a from the request aimed at it
        assert_eq!(
            b.arp_hardware_address_find(Ipv4Addr::new(10, 0, 0, 1)).unwrap(),
            frames[0].source
        );
        assert_eq!(a.arp_info().unwrap().responses_received, 1);
        assert_eq!(b.arp_info().unwrap().responses_sent, 1);
    }

    #[test]
    fn test_static_entry_requires_direct_route() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.arp_enable(4).unwrap();
        let mac = MacAddress([2, 0, 0, 0, 9, 9]);
        assert_eq!(
            ip.arp_static_entry_create(Ipv4Addr::new(192, 168, 7, 7), mac),
            Err(NxError::IpAddressError)
        );
        ip.arp_static_entry_create(Ipv4Addr::new(10, 0, 0, 7), mac).unwrap();
        assert_eq!(ip.arp_info().unwrap().static_entries, 1);
        assert_eq!(ip.arp_ip_address_find(mac).unwrap(), Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(
            ip.arp_dynamic_entry_set(Ipv4Addr::new(10, 0, 0, 7), MacAddress([2, 0, 0, 0, 9, 8])),
            Err(NxError::DuplicateEntry)
        );
        ip.arp_static_entry_delete(Ipv4Addr::new(10, 0, 0, 7), mac).unwrap();
        assert_eq!(ip.arp_info().unwrap().static_entries, 0);
    }

    #[test]
    fn test_arp_not_enabled() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        assert_eq!(ip.arp_info().unwrap_err(), NxError::NotEnabled);
        ip.arp_enable(2).unwrap();
        assert_eq!(ip.arp_enable(2), Err(NxError::AlreadyEnabled));
    }

    #[test]
    fn test_unresolved_entry_purged_after_retries() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.arp_enable(4).unwrap();
        ip.locked(|s| {
            s.config.arp_update_rate = 1;
            if let Some(arp) = s.arp.as_mut() {
                *arp = ArpCache::new(
                    4,
                    s.config.arp_table_size,
                    ArpParams {
                        update_rate: 1,
                        expiration_rate: 0,
                        max_retries: 2,
                        max_queue_depth: 4,
                        evict: true,
                    },
                )?;
            }
            let packet = s.pool.allocate_with(crate::packet::UDP_PACKET, b"x")?;
            s.send_to(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50)), None, 17)
        })
        .unwrap();
        for _ in 0..3 {
            ip.periodic_tick().unwrap();
            ip.process_pending().unwrap();
        }
        let info = ip.arp_info().unwrap();
        assert_eq!(info.dynamic_entries, 0);
        assert_eq!(info.packets_dropped, 1);
        assert_eq!(info.requests_sent, 3);
    }
}
