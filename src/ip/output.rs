//! Datagram output: header build, fragmentation, next-hop resolution
//!
//! Callers hand over a packet whose data is the transport payload, with
//! enough headroom for the IP and link headers. From here the packet either
//! reaches a driver, sits on an ARP/ND entry queue, loops back onto the
//! deferred receive FIFO, or is released and counted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{trace, warn};

use crate::error::{NxError, Result};
use crate::iface::driver::DriverCommand;
use crate::ip::arp_cache::ArpLookup;
use crate::ip::nd_cache::NdLookup;
use crate::ip::route::{Route, RouteKind};
use crate::ip::IpState;
use crate::kernel::IpEvents;
use crate::network::ipv4::IPV4_HEADER_LEN;
use crate::network::ipv6::IPV6_HEADER_LEN;
use crate::network::{flags, Ipv4Header, Ipv6Header, MacAddress};
use crate::packet::{Packet, IP_PACKET};

/// Per-datagram header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DatagramOptions {
    pub protocol: u8,
    /// TTL for IPv4, hop limit for IPv6
    pub ttl: u8,
    pub tos: u8,
    pub dont_fragment: bool,
}

impl IpState {
    /// Default header fields for `protocol` towards `dst`
    pub(crate) fn datagram_options(&self, dst: IpAddr, protocol: u8) -> DatagramOptions {
        DatagramOptions {
            protocol,
            ttl: match dst {
                IpAddr::V4(_) => self.config.default_ttl,
                IpAddr::V6(_) => self.config.default_hop_limit,
            },
            tos: 0,
            dont_fragment: false,
        }
    }

    /// Route and send with default options
    pub(crate) fn send_to(&mut self, packet: Packet, dst: IpAddr, hint: Option<usize>, protocol: u8) -> Result<()> {
        let route = self.route(dst, hint)?;
        let options = self.datagram_options(dst, protocol);
        self.send_datagram(packet, &route, options)
    }

    /// Prepend the IP header and pass the datagram down
    pub(crate) fn send_datagram(&mut self, packet: Packet, route: &Route, options: DatagramOptions) -> Result<()> {
        match (route.source, route.destination) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => self.send_v4(packet, route, src, dst, options),
            (IpAddr::V6(src), IpAddr::V6(dst)) => self.send_v6(packet, route, src, dst, options),
            _ => Err(NxError::IpAddressError),
        }
    }

    fn send_v4(
        &mut self,
        mut packet: Packet,
        route: &Route,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        options: DatagramOptions,
    ) -> Result<()> {
        let mtu = self.interface(route.interface)?.mtu;
        let id = self.next_packet_id();
        let df = if options.dont_fragment { flags::DONT_FRAGMENT } else { 0 };
        let mut header = Ipv4Header::new(options.tos, packet.len(), id, df, options.ttl, options.protocol, src, dst);
        self.stats.total_packets_sent += 1;
        self.stats.total_bytes_sent += packet.len() as u64;

        if IPV4_HEADER_LEN + packet.len() > mtu {
            if options.dont_fragment || self.reassembly.is_none() {
                self.stats.send_packets_dropped += 1;
                warn!("datagram of {} bytes exceeds mtu {}, dropped", packet.len(), mtu);
                return Ok(());
            }
            return self.fragment_send(packet, header, route, mtu);
        }

        header.write(packet.prepend(IPV4_HEADER_LEN)?);
        packet.meta.interface = Some(route.interface);
        if route.kind == RouteKind::Local {
            self.loopback(packet);
            return Ok(());
        }
        self.link_output_v4(packet, route)
    }

    /// Split on 8-byte boundaries; the first failure releases the remainder
    pub(crate) fn fragment_send(&mut self, packet: Packet, header: Ipv4Header, route: &Route, mtu: usize) -> Result<()> {
        let chunk = mtu.saturating_sub(IPV4_HEADER_LEN) & !7;
        if chunk == 0 {
            self.stats.send_packets_dropped += 1;
            warn!("mtu {} leaves no room for fragments", mtu);
            return Err(NxError::InvalidParameters);
        }
        let data = packet.to_vec();
        drop(packet);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk).min(data.len());
            let mut fragment = match self.pool.allocate_with(IP_PACKET, &data[offset..end]) {
                Ok(fragment) => fragment,
                Err(e) => {
                    self.stats.send_packets_dropped += 1;
                    return Err(e);
                }
            };
            let more = if end < data.len() { flags::MORE_FRAGMENTS } else { 0 };
            let mut piece = Ipv4Header::new(
                header.tos,
                end - offset,
                header.id,
                more | ((offset / 8) as u16 & flags::FRAGMENT_OFFSET_MASK),
                header.ttl,
                header.protocol,
                header.src_addr,
                header.dst_addr,
            );
            piece.write(fragment.prepend(IPV4_HEADER_LEN)?);
            fragment.meta.interface = Some(route.interface);
            self.stats.total_fragments_sent += 1;
            trace!("fragment id {} offset {} len {}", header.id, offset, end - offset);
            self.link_output_v4(fragment, route)?;
            offset = end;
        }
        Ok(())
    }

    fn send_v6(
        &mut self,
        mut packet: Packet,
        route: &Route,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        options: DatagramOptions,
    ) -> Result<()> {
        let mtu = self.interface(route.interface)?.mtu;
        self.stats.total_packets_sent += 1;
        self.stats.total_bytes_sent += packet.len() as u64;
        if IPV6_HEADER_LEN + packet.len() > mtu {
            self.stats.send_packets_dropped += 1;
            warn!("ipv6 datagram of {} bytes exceeds mtu {}, dropped", packet.len(), mtu);
            return Ok(());
        }
        let header = Ipv6Header::new(packet.len(), options.protocol, options.ttl, src, dst);
        header.write(packet.prepend(IPV6_HEADER_LEN)?);
        packet.meta.interface = Some(route.interface);
        if route.kind == RouteKind::Local {
            self.loopback(packet);
            return Ok(());
        }
        self.link_output_v6(packet, route)
    }

    fn loopback(&mut self, packet: Packet) {
        trace!("loopback datagram of {} bytes", packet.len());
        self.shared.enqueue(IpEvents::RECEIVE, packet);
    }

    fn link_output_v4(&mut self, packet: Packet, route: &Route) -> Result<()> {
        let iface = self.interface(route.interface)?;
        let interface = iface.index;
        if !iface.address_mapping_needed {
            return self.driver_send(interface, DriverCommand::Send, packet, None);
        }
        let IpAddr::V4(next_hop) = route.next_hop else {
            return Err(NxError::IpAddressError);
        };
        match route.kind {
            RouteKind::Broadcast => self.driver_send(interface, DriverCommand::Broadcast, packet, None),
            RouteKind::Multicast => {
                let mac = MacAddress::from_ipv4_multicast(next_hop);
                self.driver_send(interface, DriverCommand::Send, packet, Some(mac))
            }
            _ => {
                let Some(arp) = self.arp.as_mut() else {
                    self.stats.send_packets_dropped += 1;
                    warn!("arp not enabled, datagram to {} dropped", next_hop);
                    return Ok(());
                };
                match arp.resolve(next_hop, interface, packet) {
                    Ok(ArpLookup::Resolved(mac, packet)) => {
                        self.driver_send(interface, DriverCommand::Send, packet, Some(mac))
                    }
                    Ok(ArpLookup::Pending { send_request }) => {
                        if send_request {
                            self.arp_request_send(next_hop, interface);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.stats.send_packets_dropped += 1;
                        trace!("no arp entry for {}: {}", next_hop, e);
                        Ok(())
                    }
                }
            }
        }
    }

    fn link_output_v6(&mut self, packet: Packet, route: &Route) -> Result<()> {
        let iface = self.interface(route.interface)?;
        let interface = iface.index;
        if !iface.address_mapping_needed {
            return self.driver_send(interface, DriverCommand::Send, packet, None);
        }
        let IpAddr::V6(next_hop) = route.next_hop else {
            return Err(NxError::IpAddressError);
        };
        if route.kind == RouteKind::Multicast {
            let mac = MacAddress::from_ipv6_multicast(next_hop);
            return self.driver_send(interface, DriverCommand::Send, packet, Some(mac));
        }
        let Some(ipv6) = self.ipv6.as_mut() else {
            return Err(NxError::NotEnabled);
        };
        match ipv6.nd.resolve(next_hop, interface, packet) {
            Ok(NdLookup::Resolved(mac, packet)) => self.driver_send(interface, DriverCommand::Send, packet, Some(mac)),
            Ok(NdLookup::Pending { solicit }) => {
                if solicit {
                    self.neighbor_solicitation_send(next_hop, interface, None);
                }
                Ok(())
            }
            Err(e) => {
                self.stats.send_packets_dropped += 1;
                trace!("no neighbor entry for {}: {}", next_hop, e);
                Ok(())
            }
        }
    }

    /// Transmit packets released by an address resolution
    pub(crate) fn drained_send(&mut self, interface: usize, mac: MacAddress, packets: Vec<Packet>) {
        for packet in packets {
            if self.driver_send(interface, DriverCommand::Send, packet, Some(mac)).is_err() {
                self.stats.send_packets_dropped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;
    use crate::network::{ethertype, protocol};
    use crate::packet::UDP_PACKET;

    #[test]
    fn test_unresolved_next_hop_sends_arp_request() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.arp_enable(8).unwrap();
        net.capture_start();
        ip.locked(|s| {
            let packet = s.pool.allocate_with(UDP_PACKET, b"queued").unwrap();
            s.send_to(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), None, protocol::UDP)
        })
        .unwrap();
        let frames = net.captured();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ethertype, ethertype::ARP);
        assert!(frames[0].destination.is_broadcast());
    }

    #[test]
    fn test_oversize_with_fragmentation_disabled_is_dropped() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        net.capture_start();
        ip.locked(|s| {
            let packet = s.pool.allocate_with(IP_PACKET, &[7u8; 1490]).unwrap();
            s.send_to(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)), None, protocol::UDP)
        })
        .unwrap();
        assert!(net.captured().is_empty());
        assert_eq!(ip.info().unwrap().send_packets_dropped, 1);
    }

    #[test]
    fn test_fragments_on_eight_byte_boundaries() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.fragment_enable().unwrap();
        net.capture_start();
        ip.locked(|s| {
            let packet = s.pool.allocate_with(IP_PACKET, &[7u8; 1500]).unwrap();
            s.send_to(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)), None, protocol::UDP)
        })
        .unwrap();
        let frames = net.captured();
        assert_eq!(frames.len(), 2);
        let first = Ipv4Header::from_bytes(frames[0].payload()).unwrap();
        let second = Ipv4Header::from_bytes(frames[1].payload()).unwrap();
        assert!(first.more_fragments());
        assert_eq!(first.payload_len(), 1480);
        assert_eq!(second.fragment_offset(), 1480);
        assert_eq!(second.payload_len(), 20);
        assert!(!second.more_fragments());
        assert_eq!(first.id, second.id);
        assert_eq!(ip.info().unwrap().total_fragments_sent, 2);
    }

    #[test]
    fn test_chained_datagram_fragmented() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.fragment_enable().unwrap();
        net.capture_start();
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        ip.locked(|s| {
            let packet = s.pool.allocate_chain(IP_PACKET, &data).unwrap();
            assert!(packet.is_chained());
            s.send_to(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)), None, protocol::UDP)
        })
        .unwrap();
        let frames = net.captured();
        assert_eq!(frames.len(), 3);
        let mut sent = Vec::new();
        for frame in &frames {
            let header = Ipv4Header::from_bytes(frame.payload()).unwrap();
            assert_eq!(header.fragment_offset(), sent.len());
            sent.extend_from_slice(&frame.payload()[IPV4_HEADER_LEN..IPV4_HEADER_LEN + header.payload_len()]);
        }
        assert_eq!(sent, data);
        assert_eq!(ip.pool().unwrap().available(), 64);
    }

    #[test]
    fn test_fragment_pool_exhaustion_releases_remainder() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.arp_enable(8).unwrap();
        ip.fragment_enable().unwrap();
        let result = ip.locked(|s| {
            let packet = s.pool.allocate_chain(IP_PACKET, &[7u8; 3000]).unwrap();
            let held: Vec<Packet> = (0..s.pool.available()).map(|_| s.pool.allocate(0).unwrap()).collect();
            // two buffers come back with the datagram; both fragments that
            // fit wait on the unresolved neighbor and the third finds none
            let result = s.send_to(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), None, protocol::UDP);
            drop(held);
            Ok(result)
        })
        .unwrap();
        assert_eq!(result, Err(NxError::NoPacket));
        let info = ip.info().unwrap();
        assert_eq!(info.total_fragments_sent, 2);
        assert_eq!(info.send_packets_dropped, 1);
        assert_eq!(ip.pool().unwrap().available(), 62);
        ip.arp_dynamic_entries_invalidate().unwrap();
        assert_eq!(ip.pool().unwrap().available(), 64);
    }

    #[test]
    fn test_mtu_without_room_for_a_fragment_fails() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.fragment_enable().unwrap();
        net.capture_start();
        let result = ip.locked(|s| {
            if let Some(iface) = s.interfaces[0].as_mut() {
                iface.mtu = 24;
            }
            let packet = s.pool.allocate_with(IP_PACKET, &[7u8; 100]).unwrap();
            Ok(s.send_to(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)), None, protocol::UDP))
        })
        .unwrap();
        assert_eq!(result, Err(NxError::InvalidParameters));
        assert!(net.captured().is_empty());
        assert_eq!(ip.pool().unwrap().available(), 64);

        let small = VirtualNetwork::new(2);
        small.set_mtu(40);
        let created = crate::ip::Ip::create(
            "small",
            crate::packet::PacketPool::new("small", 256, 4),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            small.link(),
            crate::config::IpConfig::manual(),
        );
        assert_eq!(created.err(), Some(NxError::InvalidParameters));
    }
}
