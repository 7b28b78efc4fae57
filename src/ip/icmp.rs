//! ICMP and ICMPv6 echo
//!
//! Requests addressed to us are answered. A ping registers the calling
//! thread in the instance's ping suspension list under the sequence number
//! before the request leaves, then parks outside the IP mutex. A reply
//! resumes the first waiter registered with its sequence number; the
//! waiter's own timeout and a racing reply are arbitrated by the list.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::error::{NxError, Result};
use crate::ip::{Ip, IpState};
use crate::kernel::WaitOption;
use crate::network::icmp::{v6, ICMP_HEADER_LEN, ICMP_TYPE_DEST_UNREACHABLE};
use crate::network::{checksum, fold, protocol, sum_buffers, transport_checksum, IcmpHeader, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
use crate::packet::{Packet, IP_PACKET};

/// Identifier carried in every echo request of this stack
const ECHO_IDENTIFIER: u16 = 0x4e58;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IcmpInfo {
    pub pings_sent: u64,
    pub ping_timeouts: u64,
    pub ping_threads_suspended: usize,
    pub ping_responses_received: u64,
    pub checksum_errors: u64,
    pub unhandled_messages: u64,
    pub invalid_packets: u64,
}

#[derive(Debug, Default)]
pub(crate) struct IcmpState {
    pub(crate) stats: IcmpInfo,
    sequence: u16,
}

impl IcmpState {
    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}

impl IpState {
    /// Route `msg`, fill in its checksum and send it
    fn icmp_message_send(&mut self, dst: IpAddr, hint: Option<usize>, mut msg: Vec<u8>) -> Result<()> {
        let route = self.route(dst, hint)?;
        let (proto, sum) = match dst {
            IpAddr::V4(_) => (protocol::ICMP, checksum(&msg)),
            IpAddr::V6(_) => (
                protocol::ICMPV6,
                transport_checksum(route.source, dst, protocol::ICMPV6, &msg),
            ),
        };
        BigEndian::write_u16(&mut msg[2..4], sum);
        let packet = self.pool.allocate_chain(IP_PACKET, &msg)?;
        let options = self.datagram_options(dst, proto);
        self.send_datagram(packet, &route, options)
    }

    fn echo_reply_send(&mut self, request: &Packet, reply_type: u8) {
        let (Some(src), Some(dst)) = (request.meta.source, request.meta.destination) else {
            return;
        };
        let unicast = match dst {
            IpAddr::V4(d) => !d.is_broadcast() && !d.is_multicast() && self.live_interfaces().any(|i| i.ipv4_address() == Some(d)),
            IpAddr::V6(d) => !d.is_multicast(),
        };
        if !unicast {
            trace!("echo request to {} not answered", dst);
            return;
        }
        let mut msg = request.to_vec();
        msg[0] = reply_type;
        msg[1] = 0;
        msg[2] = 0;
        msg[3] = 0;
        if let Err(e) = self.icmp_message_send(src, request.meta.interface, msg) {
            debug!("echo reply to {} failed: {}", src, e);
        }
    }

    /// Hand an echo reply to the thread waiting for its sequence number
    fn echo_reply_deliver(&mut self, mut packet: Packet, header: IcmpHeader) {
        let Some(icmp) = self.icmp.as_mut() else {
            return;
        };
        let unspecified = match packet.meta.source {
            Some(IpAddr::V4(a)) => a.is_unspecified(),
            Some(IpAddr::V6(a)) => a.is_unspecified(),
            None => true,
        };
        if unspecified || packet.strip_front(ICMP_HEADER_LEN).is_err() {
            icmp.stats.invalid_packets += 1;
            return;
        }
        icmp.stats.ping_responses_received += 1;
        let sequence = header.sequence() as u32;
        if self.ping_waiters.resume_first(|key| key == sequence, Ok(packet)).is_err() {
            trace!("echo reply {} has no waiter", sequence);
            if let Some(icmp) = self.icmp.as_mut() {
                icmp.stats.invalid_packets += 1;
            }
        }
    }

    pub(crate) fn icmp_receive(&mut self, packet: Packet) {
        let Some(icmp) = self.icmp.as_mut() else {
            return;
        };
        let Some(header) = IcmpHeader::from_bytes(packet.data()) else {
            icmp.stats.invalid_packets += 1;
            return;
        };
        if fold(sum_buffers(packet.buffers(), 0)) != 0 {
            icmp.stats.checksum_errors += 1;
            return;
        }
        match header.msg_type {
            ICMP_TYPE_ECHO_REQUEST => self.echo_reply_send(&packet, ICMP_TYPE_ECHO_REPLY),
            ICMP_TYPE_ECHO_REPLY => self.echo_reply_deliver(packet, header),
            ICMP_TYPE_DEST_UNREACHABLE => {
                debug!("destination unreachable (code {}) from {:?}", header.msg_code, packet.meta.source);
                icmp.stats.unhandled_messages += 1;
            }
            _ => icmp.stats.unhandled_messages += 1,
        }
    }

    /// Echo half of ICMPv6; the checksum was verified by the caller
    pub(crate) fn icmpv6_echo_receive(&mut self, packet: Packet) {
        let Some(header) = IcmpHeader::from_bytes(packet.data()) else {
            self.stats.invalid_packets += 1;
            return;
        };
        match header.msg_type {
            v6::ECHO_REQUEST => self.echo_reply_send(&packet, v6::ECHO_REPLY),
            v6::ECHO_REPLY => self.echo_reply_deliver(packet, header),
            _ => {}
        }
    }
}

impl Ip {
    pub fn icmp_enable(&self) -> Result<()> {
        self.locked(|s| {
            if s.icmp.is_some() {
                return Err(NxError::AlreadyEnabled);
            }
            s.icmp = Some(IcmpState::default());
            Ok(())
        })
    }

    /// Send an echo request with `data` and wait for the reply.
    ///
    /// The reply packet is returned with the ICMP header stripped.
    pub fn ping(&self, destination: Ipv4Addr, data: &[u8], wait: WaitOption) -> Result<Packet> {
        self.echo(IpAddr::V4(destination), ICMP_TYPE_ECHO_REQUEST, data, wait)
    }

    pub fn ping6(&self, destination: Ipv6Addr, data: &[u8], wait: WaitOption) -> Result<Packet> {
        self.echo(IpAddr::V6(destination), v6::ECHO_REQUEST, data, wait)
    }

    fn echo(&self, destination: IpAddr, request_type: u8, data: &[u8], wait: WaitOption) -> Result<Packet> {
        let handle = self.locked(|s| {
            let icmp = s.icmp.as_mut().ok_or(NxError::NotEnabled)?;
            let sequence = icmp.next_sequence();
            let mut msg = IcmpHeader::echo(request_type, ECHO_IDENTIFIER, sequence).to_bytes().to_vec();
            msg.extend_from_slice(data);

            let handle = s.ping_waiters.register(sequence as u32);
            if let Err(e) = s.icmp_message_send(destination, None, msg) {
                handle.cancel();
                return Err(e);
            }
            if let Some(icmp) = s.icmp.as_mut() {
                icmp.stats.pings_sent += 1;
            }
            trace!("ping {} sequence {}", destination, sequence);
            Ok(handle)
        })?;

        let result = handle.wait(wait, NxError::NoResponse);
        if result.as_ref().err() == Some(&NxError::NoResponse) {
            let _ = self.locked(|s| {
                if let Some(icmp) = s.icmp.as_mut() {
                    icmp.stats.ping_timeouts += 1;
                }
                Ok(())
            });
        }
        result
    }

    pub fn icmp_info(&self) -> Result<IcmpInfo> {
        self.locked(|s| {
            let icmp = s.icmp.as_ref().ok_or(NxError::NotEnabled)?;
            Ok(IcmpInfo {
                ping_threads_suspended: s.ping_waiters.len(),
                ..icmp.stats
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpConfig;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;
    use crate::network::ipv4::IPV4_HEADER_LEN;
    use crate::network::Ipv4Header;
    use crate::packet::PacketPool;
    use std::time::Duration;

    fn threaded(net: &VirtualNetwork, last: u8) -> Ip {
        let config = IpConfig {
            periodic_interval: Duration::from_millis(20),
            ..IpConfig::default()
        };
        let ip = Ip::create(
            &format!("ip{}", last),
            PacketPool::new("icmp", 1600, 32),
            Ipv4Addr::new(10, 0, 0, last),
            Ipv4Addr::new(255, 255, 255, 0),
            net.link(),
            config,
        )
        .unwrap();
        ip.arp_enable(8).unwrap();
        ip.icmp_enable().unwrap();
        ip
    }

    #[test]
    fn test_ping_between_instances() {
        let net = VirtualNetwork::new(2);
        let a = threaded(&net, 1);
        let b = threaded(&net, 2);
        let reply = a
            .ping(Ipv4Addr::new(10, 0, 0, 2), b"are you there", WaitOption::from_millis(2000))
            .unwrap();
        assert_eq!(reply.data(), b"are you there");
        assert_eq!(reply.meta.source, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
        drop(reply);

        let info = a.icmp_info().unwrap();
        assert_eq!(info.pings_sent, 1);
        assert_eq!(info.ping_responses_received, 1);
        assert_eq!(info.ping_threads_suspended, 0);
        a.delete().unwrap();
        b.delete().unwrap();
    }

    #[test]
    fn test_ping_timeout_counted() {
        let net = VirtualNetwork::new(2);
        let ip = instance(&net, 1);
        ip.icmp_enable().unwrap();
        ip.arp_enable(8).unwrap();
        let err = ip
            .ping(Ipv4Addr::new(10, 0, 0, 99), b"x", WaitOption::from_millis(20))
            .unwrap_err();
        assert_eq!(err, NxError::NoResponse);
        let info = ip.icmp_info().unwrap();
        assert_eq!(info.ping_timeouts, 1);
        assert_eq!(info.ping_threads_suspended, 0);
    }

    #[test]
    fn test_unmatched_reply_is_invalid() {
        let net = VirtualNetwork::new(2);
        let ip = instance(&net, 1);
        ip.icmp_enable().unwrap();
        let mut msg = IcmpHeader::echo(ICMP_TYPE_ECHO_REPLY, ECHO_IDENTIFIER, 42).to_bytes().to_vec();
        msg.extend_from_slice(b"late");
        let sum = checksum(&msg);
        BigEndian::write_u16(&mut msg[2..4], sum);

        let mut packet = ip.pool().unwrap().allocate_with(IP_PACKET, &msg).unwrap();
        Ipv4Header::new(0, msg.len(), 1, 0, 64, protocol::ICMP, Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(10, 0, 0, 1))
            .write(packet.prepend(IPV4_HEADER_LEN).unwrap());
        packet.meta.interface = Some(0);
        ip.locked(|s| {
            s.packet_receive(packet);
            Ok(())
        })
        .unwrap();

        let info = ip.icmp_info().unwrap();
        assert_eq!(info.ping_responses_received, 1);
        assert_eq!(info.invalid_packets, 1);
        assert_eq!(ip.pool().unwrap().available(), 64);
    }

    #[test]
    fn test_ping_requires_icmp() {
        let net = VirtualNetwork::new(2);
        let ip = instance(&net, 1);
        assert_eq!(
            ip.ping(Ipv4Addr::new(10, 0, 0, 2), b"", WaitOption::NoWait).unwrap_err(),
            NxError::NotEnabled
        );
    }
}
