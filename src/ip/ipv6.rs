//! IPv6 addressing and Neighbor Discovery
//!
//! Enabling IPv6 gives every interface a link-local address derived from its
//! MAC. Addresses start tentative and become valid after duplicate address
//! detection: `nd_dad_transmits` periodic ticks without a conflicting
//! advertisement or solicitation. Neighbor Discovery messages are built and
//! sent straight to the link, they never go through the neighbor cache
//! themselves.

use std::net::{IpAddr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};

use crate::error::{NxError, Result};
use crate::iface::driver::{DriverCommand, DriverRequest};
use crate::iface::interface::{Ipv6AddressOrigin, Ipv6AddressState, Ipv6Entry};
use crate::ip::address::Ipv6AddressEvent;
use crate::ip::nd_cache::{NdCache, NdDrained, NdParams, NdProbe};
use crate::ip::{Ip, IpState};
use crate::network::icmp::v6;
use crate::network::ipv6::{
    address_from_prefix, link_local_from_mac, solicited_node, ALL_NODES, IPV6_HEADER_LEN,
};
use crate::network::ndp::NdMessage;
use crate::network::{protocol, transport_checksum, transport_checksum_chain, Ipv6Header, MacAddress};
use crate::packet::{Packet, IP_PACKET};

/// A default router and the ticks left on its advertised lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DefaultRouter {
    pub address: Ipv6Addr,
    pub interface: usize,
    /// None for routers added by the application
    pub lifetime: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Group {
    address: Ipv6Addr,
    interface: usize,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct DadProbe {
    interface: usize,
    address: Ipv6Addr,
    remaining: u32,
}

pub(crate) struct Ipv6State {
    pub(crate) nd: NdCache,
    pub(crate) routers: Vec<DefaultRouter>,
    groups: Vec<Group>,
    dad: Vec<DadProbe>,
    autoconfig: bool,
}

impl Ipv6State {
    pub(crate) fn group_joined(&self, address: Ipv6Addr, interface: usize) -> bool {
        self.groups
            .iter()
            .any(|g| g.address == address && g.interface == interface)
    }
}

impl IpState {
    fn ipv6_state(&mut self) -> Result<&mut Ipv6State> {
        self.ipv6.as_mut().ok_or(NxError::NotEnabled)
    }

    fn link_multicast(&mut self, interface: usize, group: Ipv6Addr, join: bool) {
        let command = if join {
            DriverCommand::MulticastJoin
        } else {
            DriverCommand::MulticastLeave
        };
        let mut request = DriverRequest::new(command, interface).with_address(MacAddress::from_ipv6_multicast(group));
        if let Err(e) = self.driver_request(&mut request) {
            debug!("ipv6: {:?} {} on interface {} failed: {}", command, group, interface, e);
        }
    }

    /// Build an ICMPv6 message and hand it to the driver for `mac`
    fn icmpv6_link_send(&mut self, interface: usize, src: Ipv6Addr, dst: Ipv6Addr, mac: MacAddress, mut msg: Vec<u8>) {
        let sum = transport_checksum(IpAddr::V6(src), IpAddr::V6(dst), protocol::ICMPV6, &msg);
        BigEndian::write_u16(&mut msg[2..4], sum);
        let mut packet = match self.pool.allocate_with(IP_PACKET, &msg) {
            Ok(packet) => packet,
            Err(_) => return,
        };
        let header = Ipv6Header::new(msg.len(), protocol::ICMPV6, 255, src, dst);
        match packet.prepend(IPV6_HEADER_LEN) {
            Ok(out) => header.write(out),
            Err(_) => return,
        }
        self.stats.total_packets_sent += 1;
        self.stats.total_bytes_sent += msg.len() as u64;
        if self.driver_send(interface, DriverCommand::Send, packet, Some(mac)).is_err() {
            self.stats.send_packets_dropped += 1;
        }
    }

    /// Solicit `target`, multicast to its solicited-node group unless `unicast`
    pub(crate) fn neighbor_solicitation_send(&mut self, target: Ipv6Addr, interface: usize, unicast: Option<MacAddress>) {
        let Ok(iface) = self.interface(interface) else {
            return;
        };
        let Some(src) = iface.ipv6_source_for(target) else {
            return;
        };
        let our_mac = iface.mac;
        let (dst, mac) = match unicast {
            Some(mac) => (target, mac),
            None => {
                let group = solicited_node(target);
                (group, MacAddress::from_ipv6_multicast(group))
            }
        };
        trace!("nd: solicit {} from {}", target, src);
        let msg = NdMessage::NeighborSolicitation {
            target,
            source_mac: Some(our_mac),
        };
        self.icmpv6_link_send(interface, src, dst, mac, msg.serialize());
    }

    fn dad_solicitation_send(&mut self, target: Ipv6Addr, interface: usize) {
        let group = solicited_node(target);
        let msg = NdMessage::NeighborSolicitation {
            target,
            source_mac: None,
        };
        self.icmpv6_link_send(
            interface,
            Ipv6Addr::UNSPECIFIED,
            group,
            MacAddress::from_ipv6_multicast(group),
            msg.serialize(),
        );
    }

    fn nd_drained(&mut self, drained: Option<NdDrained>) {
        if let Some(NdDrained { mac, interface, packets }) = drained {
            self.drained_send(interface, mac, packets);
        }
    }

    /// Configure `address` on `interface` and start DAD
    pub(crate) fn ipv6_address_add(
        &mut self,
        interface: usize,
        address: Ipv6Addr,
        prefix_len: u8,
        origin: Ipv6AddressOrigin,
    ) -> Result<usize> {
        if address.is_unspecified() || address.is_multicast() || prefix_len > 128 {
            return Err(NxError::IpAddressError);
        }
        let dad_ticks = self.config.nd_dad_transmits;
        self.ipv6_state()?;
        let iface = self.interface_mut(interface)?;
        if iface.has_ipv6(address) {
            return Err(NxError::DuplicateEntry);
        }
        let slot = iface
            .ipv6
            .iter()
            .position(|e| e.is_none())
            .ok_or(NxError::NoMoreEntries)?;
        let state = if dad_ticks == 0 {
            Ipv6AddressState::Valid
        } else {
            Ipv6AddressState::Tentative
        };
        iface.ipv6[slot] = Some(Ipv6Entry {
            address,
            prefix_len,
            state,
            origin,
        });
        let mapping = iface.address_mapping_needed;
        debug!("ipv6: {}/{} on interface {} slot {} ({:?})", address, prefix_len, interface, slot, state);
        if mapping {
            self.link_multicast(interface, solicited_node(address), true);
        }
        if state == Ipv6AddressState::Tentative {
            self.ipv6_state()?.dad.push(DadProbe {
                interface,
                address,
                remaining: dad_ticks,
            });
            if mapping {
                self.dad_solicitation_send(address, interface);
            }
        } else {
            self.ipv6_address_changed(Ipv6AddressEvent::Valid, interface, address);
        }
        Ok(slot)
    }

    fn ipv6_address_remove(&mut self, interface: usize, slot: usize, event: Ipv6AddressEvent) -> Result<()> {
        let iface = self.interface_mut(interface)?;
        let entry = iface
            .ipv6
            .get_mut(slot)
            .and_then(|e| e.take())
            .ok_or(NxError::EntryNotFound)?;
        let mapping = iface.address_mapping_needed;
        if let Some(ipv6) = self.ipv6.as_mut() {
            ipv6.dad.retain(|d| !(d.interface == interface && d.address == entry.address));
        }
        if mapping {
            self.link_multicast(interface, solicited_node(entry.address), false);
        }
        self.ipv6_address_changed(event, interface, entry.address);
        Ok(())
    }

    /// Drop a tentative address somebody else already owns
    fn dad_conflict(&mut self, interface: usize, address: Ipv6Addr) -> bool {
        let slot = self.interface(interface).ok().and_then(|iface| {
            iface.ipv6.iter().position(|e| {
                e.is_some_and(|e| e.address == address && e.state == Ipv6AddressState::Tentative)
            })
        });
        match slot {
            Some(slot) => {
                warn!("ipv6: duplicate address {} on interface {}", address, interface);
                let _ = self.ipv6_address_remove(interface, slot, Ipv6AddressEvent::DuplicateDetected);
                true
            }
            None => false,
        }
    }

    /// Bring up link-local addressing on one interface
    pub(crate) fn ipv6_interface_start(&mut self, interface: usize) -> Result<()> {
        let iface = self.interface(interface)?;
        let mac = iface.mac;
        let mapping = iface.address_mapping_needed;
        if mapping {
            self.link_multicast(interface, ALL_NODES, true);
            self.ipv6_address_add(interface, link_local_from_mac(mac), 64, Ipv6AddressOrigin::LinkLocal)?;
        }
        Ok(())
    }

    /// Forget everything IPv6 knows about `interface`
    pub(crate) fn ipv6_interface_purge(&mut self, interface: usize) {
        if let Some(ipv6) = self.ipv6.as_mut() {
            ipv6.nd.interface_entries_delete(interface);
            ipv6.routers.retain(|r| r.interface != interface);
            ipv6.groups.retain(|g| g.interface != interface);
            ipv6.dad.retain(|d| d.interface != interface);
        }
    }

    /// ICMPv6 input: Neighbor Discovery here, echo in `icmp`
    pub(crate) fn icmpv6_receive(&mut self, packet: Packet) {
        let (Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) = (packet.meta.source, packet.meta.destination) else {
            self.stats.invalid_packets += 1;
            return;
        };
        if self.ipv6.is_none() || packet.len() < 8 {
            self.stats.invalid_packets += 1;
            return;
        }
        if transport_checksum_chain(IpAddr::V6(src), IpAddr::V6(dst), protocol::ICMPV6, packet.len(), packet.buffers()) != 0 {
            match self.icmp.as_mut() {
                Some(icmp) => icmp.stats.checksum_errors += 1,
                None => self.stats.receive_checksum_errors += 1,
            }
            return;
        }
        let interface = packet.meta.interface.unwrap_or(0);
        let kind = packet.data()[0];
        match kind {
            v6::ECHO_REQUEST | v6::ECHO_REPLY => self.icmpv6_echo_receive(packet),
            _ => match NdMessage::parse(packet.data()) {
                Ok(Some(message)) => self.nd_message_receive(interface, src, message),
                Ok(None) => {
                    if let Some(icmp) = self.icmp.as_mut() {
                        icmp.stats.unhandled_messages += 1;
                    }
                }
                Err(_) => self.stats.invalid_packets += 1,
            },
        }
    }

    fn nd_message_receive(&mut self, interface: usize, src: Ipv6Addr, message: NdMessage) {
        let Ok(iface) = self.interface(interface) else {
            return;
        };
        let our_mac = iface.mac;
        let owned = iface.ipv6.iter().flatten().find(|e| match &message {
            NdMessage::NeighborSolicitation { target, .. } | NdMessage::NeighborAdvertisement { target, .. } => {
                e.address == *target
            }
            NdMessage::RouterAdvertisement { .. } => false,
        });
        let owned_state = owned.map(|e| e.state);

        match message {
            NdMessage::NeighborSolicitation { target, source_mac } => {
                match owned_state {
                    None => return,
                    Some(Ipv6AddressState::Tentative) => {
                        if src.is_unspecified() {
                            self.dad_conflict(interface, target);
                        }
                        return;
                    }
                    Some(Ipv6AddressState::Valid) => {}
                }
                let solicited = !src.is_unspecified();
                if solicited {
                    if let Some(mac) = source_mac {
                        let drained = self
                            .ipv6
                            .as_mut()
                            .and_then(|ipv6| ipv6.nd.solicitation_learn(src, mac, interface));
                        self.nd_drained(drained);
                    }
                }
                let (reply_dst, reply_mac) = match (solicited, source_mac) {
                    (true, Some(mac)) => (src, mac),
                    (true, None) => match self.ipv6.as_ref().and_then(|v| v.nd.hardware_address_find(src)) {
                        Some(mac) => (src, mac),
                        None => return,
                    },
                    (false, _) => (ALL_NODES, MacAddress::from_ipv6_multicast(ALL_NODES)),
                };
                let reply = NdMessage::NeighborAdvertisement {
                    target,
                    target_mac: Some(our_mac),
                    router: false,
                    solicited,
                    override_flag: true,
                };
                trace!("nd: advertise {} to {}", target, reply_dst);
                self.icmpv6_link_send(interface, target, reply_dst, reply_mac, reply.serialize());
            }
            NdMessage::NeighborAdvertisement {
                target,
                target_mac,
                solicited,
                override_flag,
                ..
            } => {
                if owned_state.is_some() {
                    if owned_state == Some(Ipv6AddressState::Tentative) {
                        self.dad_conflict(interface, target);
                    }
                    return;
                }
                let drained = self
                    .ipv6
                    .as_mut()
                    .and_then(|ipv6| ipv6.nd.advertisement(target, target_mac, solicited, override_flag));
                self.nd_drained(drained);
            }
            NdMessage::RouterAdvertisement {
                router_lifetime,
                source_mac,
                prefixes,
            } => {
                let Some(ipv6) = self.ipv6.as_mut() else {
                    return;
                };
                if let Some(mac) = source_mac {
                    let drained = ipv6.nd.solicitation_learn(src, mac, interface);
                    self.nd_drained(drained);
                }
                let Some(ipv6) = self.ipv6.as_mut() else {
                    return;
                };
                ipv6.routers.retain(|r| !(r.address == src && r.interface == interface));
                if router_lifetime > 0 {
                    if ipv6.routers.len() < self.config.ipv6_default_routers {
                        ipv6.routers.push(DefaultRouter {
                            address: src,
                            interface,
                            lifetime: Some(router_lifetime as u32),
                        });
                        debug!("ipv6: default router {} on interface {}", src, interface);
                    }
                }
                if !ipv6.autoconfig {
                    return;
                }
                for prefix in prefixes.iter().filter(|p| p.autonomous && p.prefix_len == 64 && p.valid_lifetime > 0) {
                    let address = address_from_prefix(prefix.prefix, our_mac);
                    match self.ipv6_address_add(interface, address, 64, Ipv6AddressOrigin::Autoconfigured) {
                        Ok(_) | Err(NxError::DuplicateEntry) => {}
                        Err(e) => debug!("ipv6: autoconfig of {} failed: {}", address, e),
                    }
                }
            }
        }
    }

    /// IPv6 half of the periodic pass
    pub(crate) fn ipv6_periodic(&mut self) {
        let Some(ipv6) = self.ipv6.as_mut() else {
            return;
        };
        let probes = ipv6.nd.age_tick();

        let mut confirmed = Vec::new();
        ipv6.dad.retain_mut(|probe| {
            probe.remaining = probe.remaining.saturating_sub(1);
            if probe.remaining == 0 {
                confirmed.push((probe.interface, probe.address));
                false
            } else {
                true
            }
        });
        ipv6.routers.retain_mut(|router| match router.lifetime.as_mut() {
            Some(ticks) => {
                *ticks = ticks.saturating_sub(1);
                *ticks > 0
            }
            None => true,
        });

        for probe in probes {
            match probe {
                NdProbe::Multicast { ip, interface } => self.neighbor_solicitation_send(ip, interface, None),
                NdProbe::Unicast { ip, mac, interface } => self.neighbor_solicitation_send(ip, interface, Some(mac)),
            }
        }
        for (interface, address) in confirmed {
            let promoted = self.interface_mut(interface).ok().and_then(|iface| {
                iface
                    .ipv6
                    .iter_mut()
                    .flatten()
                    .find(|e| e.address == address)
                    .map(|e| e.state = Ipv6AddressState::Valid)
            });
            if promoted.is_some() {
                debug!("ipv6: {} valid on interface {}", address, interface);
                self.ipv6_address_changed(Ipv6AddressEvent::Valid, interface, address);
            }
        }
    }
}

impl Ip {
    /// Enable IPv6 and configure link-local addresses
    pub fn ipv6_enable(&self) -> Result<()> {
        self.locked(|s| {
            if s.ipv6.is_some() {
                return Err(NxError::AlreadyEnabled);
            }
            let config = &s.config;
            let params = NdParams {
                max_queue_depth: config.nd_max_queue_depth,
                max_multicast_solicit: config.nd_max_multicast_solicit,
                max_unicast_solicit: config.nd_max_unicast_solicit,
                retrans_timer: config.nd_retrans_timer,
                reachable_time: config.nd_reachable_time,
                delay_first_probe: config.nd_delay_first_probe,
            };
            s.ipv6 = Some(Ipv6State {
                nd: NdCache::new(config.nd_cache_size, params),
                routers: Vec::new(),
                groups: Vec::new(),
                dad: Vec::new(),
                autoconfig: false,
            });
            let interfaces: Vec<usize> = s.live_interfaces().map(|i| i.index).collect();
            for index in interfaces {
                s.ipv6_interface_start(index)?;
            }
            Ok(())
        })
    }

    /// Add an address; returns the slot it occupies
    pub fn ipv6_address_set(&self, interface: usize, address: Ipv6Addr, prefix_len: u8) -> Result<usize> {
        self.locked(|s| s.ipv6_address_add(interface, address, prefix_len, Ipv6AddressOrigin::Manual))
    }

    pub fn ipv6_address_get(&self, interface: usize, slot: usize) -> Result<Ipv6Entry> {
        self.locked(|s| {
            s.ipv6_state()?;
            s.interface(interface)?
                .ipv6
                .get(slot)
                .copied()
                .flatten()
                .ok_or(NxError::EntryNotFound)
        })
    }

    /// Every configured address of `interface`
    pub fn ipv6_addresses(&self, interface: usize) -> Result<Vec<Ipv6Entry>> {
        self.locked(|s| Ok(s.interface(interface)?.ipv6.iter().flatten().copied().collect()))
    }

    pub fn ipv6_address_delete(&self, interface: usize, slot: usize) -> Result<()> {
        self.locked(|s| {
            s.ipv6_state()?;
            s.ipv6_address_remove(interface, slot, Ipv6AddressEvent::Deleted)
        })
    }

    pub fn ipv6_default_router_add(&self, router: Ipv6Addr, interface: usize) -> Result<()> {
        self.locked(|s| {
            s.interface(interface)?;
            let limit = s.config.ipv6_default_routers;
            let ipv6 = s.ipv6_state()?;
            if ipv6.routers.iter().any(|r| r.address == router && r.interface == interface) {
                return Err(NxError::DuplicateEntry);
            }
            if ipv6.routers.len() >= limit {
                return Err(NxError::NoMoreEntries);
            }
            ipv6.routers.push(DefaultRouter {
                address: router,
                interface,
                lifetime: None,
            });
            Ok(())
        })
    }

    pub fn ipv6_default_router_delete(&self, router: Ipv6Addr) -> Result<()> {
        self.locked(|s| {
            let ipv6 = s.ipv6_state()?;
            let before = ipv6.routers.len();
            ipv6.routers.retain(|r| r.address != router);
            if ipv6.routers.len() == before {
                Err(NxError::EntryNotFound)
            } else {
                Ok(())
            }
        })
    }

    /// Default routers known on `interface`
    pub fn ipv6_default_router_get(&self, interface: usize) -> Result<Vec<Ipv6Addr>> {
        self.locked(|s| {
            Ok(s.ipv6_state()?
                .routers
                .iter()
                .filter(|r| r.interface == interface)
                .map(|r| r.address)
                .collect())
        })
    }

    /// Form addresses from autonomous prefixes in Router Advertisements
    pub fn ipv6_autoconfig_enable(&self) -> Result<()> {
        self.locked(|s| {
            s.ipv6_state()?.autoconfig = true;
            Ok(())
        })
    }

    pub fn ipv6_autoconfig_disable(&self) -> Result<()> {
        self.locked(|s| {
            s.ipv6_state()?.autoconfig = false;
            Ok(())
        })
    }

    /// Join an IPv6 multicast group on `interface`
    pub fn ipv6_multicast_join(&self, group: Ipv6Addr, interface: usize) -> Result<()> {
        if !group.is_multicast() {
            return Err(NxError::IpAddressError);
        }
        self.locked(|s| {
            s.interface(interface)?;
            let limit = s.config.max_multicast_groups;
            let ipv6 = s.ipv6_state()?;
            if let Some(g) = ipv6.groups.iter_mut().find(|g| g.address == group && g.interface == interface) {
                g.count += 1;
                return Ok(());
            }
            if ipv6.groups.len() >= limit {
                return Err(NxError::NoMoreEntries);
            }
            ipv6.groups.push(Group {
                address: group,
                interface,
                count: 1,
            });
            s.link_multicast(interface, group, true);
            Ok(())
        })
    }

    pub fn ipv6_multicast_leave(&self, group: Ipv6Addr, interface: usize) -> Result<()> {
        self.locked(|s| {
            let ipv6 = s.ipv6_state()?;
            let pos = ipv6
                .groups
                .iter()
                .position(|g| g.address == group && g.interface == interface)
                .ok_or(NxError::EntryNotFound)?;
            ipv6.groups[pos].count -= 1;
            if ipv6.groups[pos].count == 0 {
                ipv6.groups.remove(pos);
                s.link_multicast(interface, group, false);
            }
            Ok(())
        })
    }

    /// Pin `ip` to `mac` in the neighbor cache
    pub fn nd_cache_entry_set(&self, ip: Ipv6Addr, interface: usize, mac: MacAddress) -> Result<()> {
        self.locked(|s| {
            s.interface(interface)?;
            let drained = s.ipv6_state()?.nd.set_static(ip, mac, interface)?;
            s.nd_drained(Some(drained));
            Ok(())
        })
    }

    pub fn nd_cache_entry_delete(&self, ip: Ipv6Addr) -> Result<()> {
        self.locked(|s| s.ipv6_state()?.nd.delete(ip))
    }

    /// Drop every dynamic neighbor
    pub fn nd_cache_invalidate(&self) -> Result<()> {
        self.locked(|s| {
            s.ipv6_state()?.nd.invalidate();
            Ok(())
        })
    }

    /// Delete exactly the entries learned or set on `interface`
    pub fn nd_cache_interface_entries_delete(&self, interface: usize) -> Result<usize> {
        self.locked(|s| Ok(s.ipv6_state()?.nd.interface_entries_delete(interface)))
    }

    pub fn nd_cache_hardware_address_find(&self, ip: Ipv6Addr) -> Result<MacAddress> {
        self.locked(|s| s.ipv6_state()?.nd.hardware_address_find(ip).ok_or(NxError::EntryNotFound))
    }

    pub fn nd_cache_ip_address_find(&self, mac: MacAddress) -> Result<Ipv6Addr> {
        self.locked(|s| s.ipv6_state()?.nd.ip_address_find(mac).ok_or(NxError::EntryNotFound))
    }

    /// Neighbor cache entries currently in use
    pub fn nd_cache_entries(&self) -> Result<usize> {
        self.locked(|s| Ok(s.ipv6_state()?.nd.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;
    use crate::network::ethertype;

    fn settle(ips: &[&Ip]) {
        for _ in 0..4 {
            for ip in ips {
                ip.process_pending().unwrap();
            }
        }
    }

    fn tick(ips: &[&Ip]) {
        for ip in ips {
            ip.periodic_tick().unwrap();
        }
        settle(ips);
    }

    #[test]
    fn test_link_local_after_dad() {
        let net = VirtualNetwork::new(6);
        let ip = instance(&net, 1);
        net.capture_start();
        ip.ipv6_enable().unwrap();
        let entry = ip.ipv6_address_get(0, 0).unwrap();
        assert_eq!(entry.state, Ipv6AddressState::Tentative);
        assert_eq!(entry.origin, Ipv6AddressOrigin::LinkLocal);
        assert_eq!(entry.address.segments()[0], 0xfe80);

        let frames = net.captured();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ethertype, ethertype::IPV6);
        let header = Ipv6Header::from_bytes(frames[0].payload()).unwrap();
        assert!(header.src_addr.is_unspecified());

        tick(&[&ip]);
        assert_eq!(ip.ipv6_address_get(0, 0).unwrap().state, Ipv6AddressState::Valid);
    }

    #[test]
    fn test_duplicate_address_removed() {
        let net = VirtualNetwork::new(6);
        let a = instance(&net, 1);
        let b = instance(&net, 2);
        a.ipv6_enable().unwrap();
        b.ipv6_enable().unwrap();
        tick(&[&a, &b]);
        let shared: Ipv6Addr = "2001:db8::42".parse().unwrap();
        a.ipv6_address_set(0, shared, 64).unwrap();
        tick(&[&a, &b]);
        assert!(a.ipv6_addresses(0).unwrap().iter().any(|e| e.address == shared));

        // b tries the same address and hears a's advertisement
        let slot = b.ipv6_address_set(0, shared, 64).unwrap();
        settle(&[&a, &b]);
        assert_eq!(b.ipv6_address_get(0, slot), Err(NxError::EntryNotFound));
    }

    #[test]
    fn test_neighbor_resolution_between_instances() {
        let net = VirtualNetwork::new(6);
        let a = instance(&net, 1);
        let b = instance(&net, 2);
        a.ipv6_enable().unwrap();
        b.ipv6_enable().unwrap();
        tick(&[&a, &b]);
        let b_ll = b.ipv6_address_get(0, 0).unwrap().address;
        a.locked(|s| {
            let packet = s.pool.allocate_with(crate::packet::UDP_PACKET, b"hello")?;
            s.send_to(packet, IpAddr::V6(b_ll), None, 253)
        })
        .unwrap();
        settle(&[&a, &b]);
        assert_eq!(a.nd_cache_hardware_address_find(b_ll).unwrap(), MacAddress([2, 0, 0, 0, 6, 2]));
        // b learned a from the solicitation
        assert_eq!(b.nd_cache_entries().unwrap(), 1);
    }

    #[test]
    fn test_interface_entries_delete_is_exact() {
        let net = VirtualNetwork::new(6);
        let ip = instance(&net, 1);
        ip.ipv6_enable().unwrap();
        let second = net.link();
        ip.interface_attach("eth1", std::net::Ipv4Addr::new(10, 1, 0, 1), std::net::Ipv4Addr::new(255, 255, 255, 0), second)
            .unwrap();
        let mac = MacAddress([2, 0, 0, 0, 7, 7]);
        ip.nd_cache_entry_set("fe80::1".parse().unwrap(), 0, mac).unwrap();
        ip.nd_cache_entry_set("fe80::2".parse().unwrap(), 1, mac).unwrap();
        ip.nd_cache_entry_set("fe80::3".parse().unwrap(), 1, mac).unwrap();
        assert_eq!(ip.nd_cache_interface_entries_delete(1).unwrap(), 2);
        assert_eq!(ip.nd_cache_entries().unwrap(), 1);
        assert_eq!(ip.nd_cache_ip_address_find(mac).unwrap(), "fe80::1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_router_advertisement_autoconfig() {
        let net = VirtualNetwork::new(6);
        let ip = instance(&net, 1);
        ip.ipv6_enable().unwrap();
        ip.ipv6_autoconfig_enable().unwrap();
        tick(&[&ip]);
        let router: Ipv6Addr = "fe80::99".parse().unwrap();
        let ra = NdMessage::RouterAdvertisement {
            router_lifetime: 1800,
            source_mac: Some(MacAddress([2, 0, 0, 0, 6, 99])),
            prefixes: vec![crate::network::ndp::PrefixInfo {
                prefix: "2001:db8:1::".parse().unwrap(),
                prefix_len: 64,
                on_link: true,
                autonomous: true,
                valid_lifetime: 3600,
            }],
        };
        let mut msg = ra.serialize();
        let sum = transport_checksum(IpAddr::V6(router), IpAddr::V6(ALL_NODES), protocol::ICMPV6, &msg);
        BigEndian::write_u16(&mut msg[2..4], sum);
        let receiver = ip.link_receiver().unwrap();
        let mut packet = ip.pool().unwrap().allocate_with(IP_PACKET, &msg).unwrap();
        Ipv6Header::new(msg.len(), protocol::ICMPV6, 255, router, ALL_NODES).write(packet.prepend(40).unwrap());
        packet.meta.interface = Some(0);
        receiver.packet_deferred_receive(packet);
        ip.process_pending().unwrap();

        assert_eq!(ip.ipv6_default_router_get(0).unwrap(), vec![router]);
        let addresses = ip.ipv6_addresses(0).unwrap();
        let auto = addresses
            .iter()
            .find(|e| e.origin == Ipv6AddressOrigin::Autoconfigured)
            .unwrap();
        assert_eq!(auto.address.segments()[..4], [0x2001, 0xdb8, 1, 0]);
    }
}
