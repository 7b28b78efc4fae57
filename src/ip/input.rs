//! Datagram input: validation, destination filter, protocol dispatch

use std::net::IpAddr;

use log::trace;

use crate::ip::IpState;
use crate::network::ipv4::Ipv4Utils;
use crate::network::ipv6::{solicited_node, ALL_NODES, IPV6_HEADER_LEN};
use crate::network::{protocol, Ipv4Header, Ipv6Header};
use crate::packet::Packet;

impl IpState {
    /// Entry point for every datagram drained from the receive FIFO
    pub(crate) fn packet_receive(&mut self, packet: Packet) {
        self.stats.total_packets_received += 1;
        self.stats.total_bytes_received += packet.len() as u64;
        match packet.data().first().map(|b| b >> 4) {
            Some(4) => self.ipv4_receive(packet),
            Some(6) => self.ipv6_receive(packet),
            _ => self.stats.invalid_packets += 1,
        }
    }

    fn ipv4_receive(&mut self, mut packet: Packet) {
        let Some(header) = Ipv4Header::from_bytes(packet.data()) else {
            self.stats.invalid_packets += 1;
            return;
        };
        if header.validate(packet.data(), packet.len()).is_err() {
            let hlen = header.header_len();
            if hlen >= 20 && packet.data().len() >= hlen && !Ipv4Utils::validate_checksum(&packet.data()[..hlen]) {
                self.stats.receive_checksum_errors += 1;
            } else {
                self.stats.invalid_packets += 1;
            }
            return;
        }
        packet.truncate(header.total_len as usize);

        let interface = packet.meta.interface.unwrap_or(0);
        let dst = header.dst_addr;
        let accepted = match self.interface(interface) {
            Ok(iface) => {
                iface.accepts_ipv4(dst)
                    || self.live_interfaces().any(|i| i.ipv4_address() == Some(dst))
                    || (dst.is_multicast() && self.multicast.accepts(dst, interface))
            }
            Err(_) => false,
        };
        if !accepted {
            trace!("datagram for {} not ours", dst);
            self.stats.receive_packets_dropped += 1;
            return;
        }

        if packet.strip_front(header.header_len()).is_err() {
            self.stats.invalid_packets += 1;
            return;
        }
        packet.meta.interface = Some(interface);
        packet.meta.source = Some(IpAddr::V4(header.src_addr));
        packet.meta.destination = Some(IpAddr::V4(dst));
        packet.meta.protocol = header.protocol;

        let packet = if header.is_fragment() {
            self.stats.total_fragments_received += 1;
            if self.reassembly.is_none() {
                self.stats.receive_packets_dropped += 1;
                return;
            }
            match self.reassemble(packet, &header) {
                Some(whole) => whole,
                None => return,
            }
        } else {
            packet
        };
        self.protocol_dispatch(header.protocol, packet);
    }

    fn ipv6_receive(&mut self, mut packet: Packet) {
        let Some(header) = Ipv6Header::from_bytes(packet.data()) else {
            self.stats.invalid_packets += 1;
            return;
        };
        let total = IPV6_HEADER_LEN + header.payload_len as usize;
        if total > packet.len() {
            self.stats.invalid_packets += 1;
            return;
        }
        packet.truncate(total);

        let interface = packet.meta.interface.unwrap_or(0);
        let dst = header.dst_addr;
        let accepted = match (self.interface(interface), self.ipv6.as_ref()) {
            (Ok(iface), Some(ipv6)) => {
                iface.has_ipv6(dst)
                    || dst == ALL_NODES
                    || iface.ipv6.iter().flatten().any(|e| solicited_node(e.address) == dst)
                    || ipv6.group_joined(dst, interface)
                    || self.live_interfaces().any(|i| i.ipv6_valid().any(|e| e.address == dst))
            }
            _ => false,
        };
        if !accepted {
            self.stats.receive_packets_dropped += 1;
            return;
        }
        if packet.strip_front(IPV6_HEADER_LEN).is_err() {
            self.stats.invalid_packets += 1;
            return;
        }
        packet.meta.interface = Some(interface);
        packet.meta.source = Some(IpAddr::V6(header.src_addr));
        packet.meta.destination = Some(IpAddr::V6(dst));
        packet.meta.protocol = header.next_header;
        self.protocol_dispatch(header.next_header, packet);
    }

    /// Hand a reassembled payload to its transport
    pub(crate) fn protocol_dispatch(&mut self, proto: u8, packet: Packet) {
        let v6 = matches!(packet.meta.source, Some(IpAddr::V6(_)));
        match proto {
            protocol::ICMP if !v6 && self.icmp.is_some() => self.icmp_receive(packet),
            protocol::ICMPV6 if v6 => self.icmpv6_receive(packet),
            protocol::IGMP if !v6 && self.multicast.igmp_enabled() => self.igmp_receive(packet),
            protocol::TCP if self.tcp.is_some() => self.tcp_receive(packet),
            protocol::UDP if self.udp.is_some() => self.udp_receive(packet),
            _ => self.raw_deliver(packet),
        }
    }
}
