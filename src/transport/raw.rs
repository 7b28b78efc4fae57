//! Raw IP service
//!
//! Datagrams of protocols no other layer claims are queued here once raw
//! service is enabled, their IP header stripped and the protocol number
//! kept in the packet metadata.

use std::collections::VecDeque;
use std::net::IpAddr;

use log::{debug, trace};

use crate::error::{NxError, Result};
use crate::ip::{Ip, IpState};
use crate::kernel::WaitOption;
use crate::packet::Packet;

pub(crate) struct RawLayer {
    queue: VecDeque<Packet>,
    queue_max: usize,
}

impl RawLayer {
    fn new(queue_max: usize) -> Self {
        RawLayer {
            queue: VecDeque::new(),
            queue_max: queue_max.max(1),
        }
    }
}

impl IpState {
    pub(crate) fn raw_deliver(&mut self, packet: Packet) {
        let Some(raw) = self.raw.as_mut() else {
            trace!("protocol {} not handled, dropped", packet.meta.protocol);
            self.stats.receive_packets_dropped += 1;
            return;
        };
        if raw.queue.len() >= raw.queue_max {
            raw.queue.pop_front();
            self.stats.receive_packets_dropped += 1;
        }
        raw.queue.push_back(packet);
    }

    fn raw_output(&mut self, packet: Packet, dst: IpAddr, hint: Option<usize>, protocol: u8, tos: u8) -> Result<()> {
        if self.raw.is_none() {
            return Err(NxError::NotEnabled);
        }
        if dst.is_unspecified() {
            return Err(NxError::IpAddressError);
        }
        let route = self.route(dst, hint)?;
        let mut options = self.datagram_options(dst, protocol);
        options.tos = tos;
        self.send_datagram(packet, &route, options)
    }
}

impl Ip {
    pub fn raw_enable(&self) -> Result<()> {
        self.locked(|s| {
            if s.raw.is_some() {
                return Err(NxError::AlreadyEnabled);
            }
            s.raw = Some(RawLayer::new(s.config.raw_queue_max));
            Ok(())
        })
    }

    /// Disable raw service; queued datagrams are released
    pub fn raw_disable(&self) -> Result<()> {
        self.locked(|s| {
            let raw = s.raw.take().ok_or(NxError::NotEnabled)?;
            debug!("raw service disabled, {} datagrams released", raw.queue.len());
            Ok(())
        })
    }

    /// Send `packet` as the payload of a `protocol` datagram
    pub fn raw_send(&self, packet: Packet, destination: IpAddr, protocol: u8, type_of_service: u8) -> Result<()> {
        self.locked(|s| s.raw_output(packet, destination, None, protocol, type_of_service))
    }

    pub fn raw_source_send(
        &self,
        packet: Packet,
        destination: IpAddr,
        interface: usize,
        protocol: u8,
        type_of_service: u8,
    ) -> Result<()> {
        self.locked(|s| s.raw_output(packet, destination, Some(interface), protocol, type_of_service))
    }

    /// Take the oldest queued raw datagram
    pub fn raw_receive(&self, wait: WaitOption) -> Result<Packet> {
        self.block_on(
            wait,
            |s| match s.raw.as_mut() {
                None => Some(Err(NxError::NotEnabled)),
                Some(raw) => raw.queue.pop_front().map(Ok),
            },
            |_| NxError::NoPacket,
        )
    }

    /// Change the raw queue depth, releasing the oldest entries over it
    pub fn raw_receive_queue_max_set(&self, maximum: usize) -> Result<()> {
        self.locked(|s| {
            let raw = s.raw.as_mut().ok_or(NxError::NotEnabled)?;
            raw.queue_max = maximum.max(1);
            let mut released = 0;
            while raw.queue.len() > raw.queue_max {
                raw.queue.pop_front();
                released += 1;
            }
            s.stats.receive_packets_dropped += released;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;
    use crate::packet::IP_PACKET;
    use std::net::Ipv4Addr;

    const PROTO: u8 = 253;

    fn send_self(ip: &Ip, data: &[u8]) {
        let packet = ip.pool().unwrap().allocate_with(IP_PACKET, data).unwrap();
        ip.raw_send(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), PROTO, 0).unwrap();
    }

    #[test]
    fn test_raw_loopback_keeps_protocol() {
        let net = VirtualNetwork::new(11);
        let ip = instance(&net, 1);
        ip.raw_enable().unwrap();
        send_self(&ip, b"raw payload");
        ip.process_pending().unwrap();
        let packet = ip.raw_receive(WaitOption::NoWait).unwrap();
        assert_eq!(packet.data(), b"raw payload");
        assert_eq!(packet.meta.protocol, PROTO);
        assert_eq!(packet.meta.source, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_queue_limit_drops_oldest() {
        let net = VirtualNetwork::new(11);
        let ip = instance(&net, 1);
        ip.raw_enable().unwrap();
        ip.raw_receive_queue_max_set(2).unwrap();
        for data in [b"a", b"b", b"c"] {
            send_self(&ip, data);
        }
        ip.process_pending().unwrap();
        assert_eq!(ip.raw_receive(WaitOption::NoWait).unwrap().data(), b"b");
        assert_eq!(ip.raw_receive(WaitOption::NoWait).unwrap().data(), b"c");
        assert_eq!(ip.info().unwrap().receive_packets_dropped, 1);
    }

    #[test]
    fn test_disable_releases_queue() {
        let net = VirtualNetwork::new(11);
        let ip = instance(&net, 1);
        let free = ip.pool().unwrap().available();
        ip.raw_enable().unwrap();
        send_self(&ip, b"held");
        ip.process_pending().unwrap();
        assert_eq!(ip.pool().unwrap().available(), free - 1);
        ip.raw_disable().unwrap();
        assert_eq!(ip.pool().unwrap().available(), free);
        assert_eq!(ip.raw_receive(WaitOption::NoWait).unwrap_err(), NxError::NotEnabled);
        assert_eq!(ip.raw_disable(), Err(NxError::NotEnabled));
    }
}
