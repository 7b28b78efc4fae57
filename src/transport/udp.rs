//! UDP (User Datagram Protocol) implementation
//!
//! Sockets are bound to one port each. Datagrams for a bound port are
//! queued on the socket up to its queue limit, the oldest being released
//! when a new one would not fit. Datagrams for unbound ports are dropped.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::error::{NxError, Result};
use crate::ip::{Ip, IpState};
use crate::kernel::WaitOption;
use crate::network::{protocol, transport_checksum_chain};
use crate::packet::Packet;
use crate::transport::{ephemeral_port, PortBound, SocketId, SocketTable};

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// UDP packet header structure
///
/// Represents the standard 8-byte UDP header as defined in RFC 768
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16, // Length of UDP header and data
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse UDP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid UDP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }

        Some(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    /// Convert UDP header to bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes
    }
}

/// Called after a datagram was queued on the socket
pub type UdpReceiveNotify = Arc<dyn Fn(&UdpSocket) + Send + Sync>;

/// Per-socket transmit parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpOptions {
    pub type_of_service: u8,
    pub time_to_live: u8,
    pub dont_fragment: bool,
    /// Compute checksums on IPv4 output; IPv6 always does
    pub checksum: bool,
    /// Datagrams kept on the receive queue
    pub queue_maximum: usize,
}

impl Default for UdpOptions {
    fn default() -> Self {
        UdpOptions {
            type_of_service: 0,
            time_to_live: 128,
            dont_fragment: false,
            checksum: true,
            queue_maximum: 16,
        }
    }
}

/// Instance-wide UDP counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpInfo {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub invalid_packets: u64,
    pub receive_packets_dropped: u64,
    pub checksum_errors: u64,
    pub created_sockets: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpSocketInfo {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_queued: usize,
    pub receive_packets_dropped: u64,
    pub checksum_errors: u64,
}

struct UdpSock {
    name: String,
    port: Option<u16>,
    options: UdpOptions,
    queue: VecDeque<Packet>,
    receive_notify: Option<UdpReceiveNotify>,
    stats: UdpSocketInfo,
}

impl PortBound for UdpSock {
    fn port_slot(&mut self) -> &mut Option<u16> {
        &mut self.port
    }
}

pub(crate) struct UdpLayer {
    sockets: SocketTable<UdpSock>,
    next_port: u16,
    first_port: u16,
    stats: UdpInfo,
}

impl UdpLayer {
    fn new(first_port: u16, port_table_size: usize) -> Self {
        UdpLayer {
            sockets: SocketTable::new(port_table_size),
            next_port: first_port,
            first_port,
            stats: UdpInfo::default(),
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.sockets.is_bound(port)
    }

    /// Release the port of `id`, handing it to the oldest waiter
    fn unbind(&mut self, id: SocketId) -> Option<u16> {
        let port = self.sockets.unbind(id)?;
        if let Some(waiter) = self.sockets.grant_waiter(port) {
            if let Some(sock) = self.sockets.get(waiter) {
                debug!("udp {}: waited-for port {} granted", sock.name, port);
            }
        }
        Some(port)
    }

    fn socket(&mut self, id: SocketId) -> Result<&mut UdpSock> {
        self.sockets.get_mut(id).ok_or(NxError::NotCreated)
    }

    /// Unbind every socket, releasing queued datagrams
    pub(crate) fn unbind_all(&mut self) {
        self.sockets.for_each_mut(|_, sock| sock.queue.clear());
        self.sockets.clear_bindings();
    }
}

impl IpState {
    fn udp_layer(&mut self) -> Result<&mut UdpLayer> {
        self.udp.as_mut().ok_or(NxError::NotEnabled)
    }

    pub(crate) fn udp_receive(&mut self, mut packet: Packet) {
        let handle = self.handle();
        let Some(udp) = self.udp.as_mut() else {
            return;
        };
        let (Some(src), Some(dst)) = (packet.meta.source, packet.meta.destination) else {
            udp.stats.invalid_packets += 1;
            return;
        };
        let Some(header) = UdpHeader::from_bytes(packet.data()) else {
            udp.stats.invalid_packets += 1;
            return;
        };
        let length = header.length as usize;
        if length < UDP_HEADER_LEN || length > packet.len() {
            udp.stats.invalid_packets += 1;
            return;
        }
        packet.truncate(length);
        let verify = header.checksum != 0 || src.is_ipv6();
        if verify && transport_checksum_chain(src, dst, protocol::UDP, length, packet.buffers()) != 0 {
            udp.stats.checksum_errors += 1;
            return;
        }
        udp.stats.packets_received += 1;
        udp.stats.bytes_received += (length - UDP_HEADER_LEN) as u64;

        let found = udp.sockets.bound(header.dst_port).next();
        let Some(id) = found else {
            trace!("udp: no socket on port {}", header.dst_port);
            udp.stats.receive_packets_dropped += 1;
            return;
        };
        if packet.strip_front(UDP_HEADER_LEN).is_err() {
            return;
        }
        packet.meta.source_port = header.src_port;
        packet.meta.protocol = protocol::UDP;

        let Some(sock) = udp.sockets.get_mut(id) else {
            return;
        };
        if sock.queue.len() >= sock.options.queue_maximum.max(1) {
            sock.queue.pop_front();
            sock.stats.receive_packets_dropped += 1;
            udp.stats.receive_packets_dropped += 1;
        }
        sock.stats.packets_received += 1;
        sock.stats.bytes_received += packet.len() as u64;
        sock.queue.push_back(packet);
        if let (Some(notify), Some(ip)) = (sock.receive_notify.clone(), handle) {
            self.defer(move || notify(&UdpSocket { ip, id }));
        }
    }

    fn udp_send(&mut self, id: SocketId, mut packet: Packet, dst: IpAddr, port: u16, hint: Option<usize>) -> Result<()> {
        if port == 0 || dst.is_unspecified() {
            return Err(NxError::IpAddressError);
        }
        let sock = self.udp_layer()?.socket(id)?;
        let src_port = sock.port.ok_or(NxError::NotBound)?;
        let socket_options = sock.options;
        let route = self.route(dst, hint)?;

        let payload_len = packet.len();
        let header = UdpHeader {
            src_port,
            dst_port: port,
            length: (UDP_HEADER_LEN + payload_len) as u16,
            checksum: 0,
        };
        packet.prepend(UDP_HEADER_LEN)?.copy_from_slice(&header.to_bytes());
        if socket_options.checksum || dst.is_ipv6() {
            let sum = match transport_checksum_chain(route.source, dst, protocol::UDP, packet.len(), packet.buffers()) {
                0 => 0xFFFF,
                sum => sum,
            };
            BigEndian::write_u16(&mut packet.data_mut()[6..8], sum);
        }

        let mut options = self.datagram_options(dst, protocol::UDP);
        if dst.is_ipv4() {
            options.ttl = socket_options.time_to_live;
        }
        options.tos = socket_options.type_of_service;
        options.dont_fragment = socket_options.dont_fragment;
        self.send_datagram(packet, &route, options)?;

        let udp = self.udp_layer()?;
        udp.stats.packets_sent += 1;
        udp.stats.bytes_sent += payload_len as u64;
        let sock = udp.socket(id)?;
        sock.stats.packets_sent += 1;
        sock.stats.bytes_sent += payload_len as u64;
        Ok(())
    }
}

impl Ip {
    pub fn udp_enable(&self) -> Result<()> {
        self.locked(|s| {
            if s.udp.is_some() {
                return Err(NxError::AlreadyEnabled);
            }
            s.udp = Some(UdpLayer::new(s.config.first_ephemeral_port, s.config.port_table_size));
            Ok(())
        })
    }

    pub fn udp_info(&self) -> Result<UdpInfo> {
        self.locked(|s| {
            let udp = s.udp_layer()?;
            Ok(UdpInfo {
                created_sockets: udp.sockets.len(),
                ..udp.stats
            })
        })
    }

    /// Sender address, port and arrival interface of a received datagram
    pub fn udp_packet_info_extract(packet: &Packet) -> Result<(IpAddr, u16, usize)> {
        match (packet.meta.source, packet.meta.interface) {
            (Some(source), Some(interface)) if packet.meta.protocol == protocol::UDP => {
                Ok((source, packet.meta.source_port, interface))
            }
            _ => Err(NxError::InvalidPacket),
        }
    }
}

/// Handle onto a UDP socket of an IP instance
#[derive(Clone)]
pub struct UdpSocket {
    ip: Ip,
    id: SocketId,
}

impl core::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UdpSocket").field("id", &self.id).finish()
    }
}

impl UdpSocket {
    pub fn create(ip: &Ip, name: &str, options: UdpOptions) -> Result<UdpSocket> {
        let id = ip.locked(|s| {
            let udp = s.udp_layer()?;
            Ok(udp.sockets.insert(UdpSock {
                name: name.to_string(),
                port: None,
                options,
                queue: VecDeque::new(),
                receive_notify: None,
                stats: UdpSocketInfo::default(),
            }))
        })?;
        Ok(UdpSocket { ip: ip.clone(), id })
    }

    fn with<R>(&self, f: impl FnOnce(&mut UdpSock) -> Result<R>) -> Result<R> {
        let id = self.id;
        self.ip.locked(|s| f(s.udp_layer()?.socket(id)?))
    }

    pub fn name(&self) -> Result<String> {
        self.with(|sock| Ok(sock.name.clone()))
    }

    /// Bind to `port`, or to a free ephemeral port when zero.
    ///
    /// A port owned by another socket is waited for according to `wait`;
    /// waiters get the port in the order they asked for it.
    pub fn bind(&self, port: u16, wait: WaitOption) -> Result<u16> {
        let id = self.id;
        let mut queued = false;
        let result = self.ip.block_on(
            wait,
            |s| {
                let udp = match s.udp_layer() {
                    Ok(udp) => udp,
                    Err(e) => return Some(Err(e)),
                };
                let bound = match udp.socket(id) {
                    Ok(sock) => sock.port,
                    Err(e) => return Some(Err(e)),
                };
                if queued {
                    if bound == Some(port) {
                        return Some(Ok(port));
                    }
                    return if udp.sockets.is_waiting(id) {
                        None
                    } else {
                        Some(Err(NxError::PortUnavailable))
                    };
                }
                if bound.is_some() || udp.sockets.is_waiting(id) {
                    return Some(Err(NxError::AlreadyBound));
                }
                let chosen = if port == 0 {
                    let first = udp.first_port;
                    let mut next = udp.next_port;
                    let found = ephemeral_port(first, &mut next, |p| udp.port_in_use(p));
                    udp.next_port = next;
                    match found {
                        Some(p) => p,
                        None => return Some(Err(NxError::NoFreePorts)),
                    }
                } else if udp.port_in_use(port) {
                    udp.sockets.wait_for_port(id, port);
                    queued = true;
                    return None;
                } else {
                    port
                };
                Some(udp.sockets.bind(id, chosen).map(|()| chosen))
            },
            |s| {
                if let Some(udp) = s.udp.as_mut() {
                    udp.sockets.cancel_wait(id);
                }
                NxError::PortUnavailable
            },
        );
        if let Ok(port) = result {
            debug!("udp socket bound to port {}", port);
        }
        result
    }

    /// Release the port; queued datagrams are released too
    pub fn unbind(&self) -> Result<()> {
        let id = self.id;
        self.ip.locked(|s| {
            let udp = s.udp_layer()?;
            udp.socket(id)?.queue.clear();
            udp.unbind(id).map(|_| ()).ok_or(NxError::NotBound)
        })
    }

    pub fn port(&self) -> Result<u16> {
        self.with(|sock| sock.port.ok_or(NxError::NotBound))
    }

    /// Send `packet` (the payload) to `address`:`port`
    pub fn send(&self, packet: Packet, address: IpAddr, port: u16) -> Result<()> {
        let id = self.id;
        self.ip.locked(|s| s.udp_send(id, packet, address, port, None))
    }

    /// Send through a specific interface
    pub fn source_send(&self, packet: Packet, address: IpAddr, port: u16, interface: usize) -> Result<()> {
        let id = self.id;
        self.ip.locked(|s| s.udp_send(id, packet, address, port, Some(interface)))
    }

    /// Take the oldest queued datagram, its UDP header stripped
    pub fn receive(&self, wait: WaitOption) -> Result<Packet> {
        let id = self.id;
        self.ip.block_on(
            wait,
            |s| {
                let sock = match s.udp_layer().and_then(|u| u.socket(id)) {
                    Ok(sock) => sock,
                    Err(e) => return Some(Err(e)),
                };
                if sock.port.is_none() {
                    return Some(Err(NxError::NotBound));
                }
                sock.queue.pop_front().map(Ok)
            },
            |_| NxError::NoPacket,
        )
    }

    pub fn receive_notify(&self, notify: Option<UdpReceiveNotify>) -> Result<()> {
        self.with(|sock| {
            sock.receive_notify = notify;
            Ok(())
        })
    }

    pub fn receive_queue_max_set(&self, maximum: usize) -> Result<()> {
        self.with(|sock| {
            sock.options.queue_maximum = maximum.max(1);
            while sock.queue.len() > sock.options.queue_maximum {
                sock.queue.pop_front();
                sock.stats.receive_packets_dropped += 1;
            }
            Ok(())
        })
    }

    pub fn info(&self) -> Result<UdpSocketInfo> {
        self.with(|sock| {
            Ok(UdpSocketInfo {
                packets_queued: sock.queue.len(),
                ..sock.stats
            })
        })
    }

    /// Delete an unbound socket
    pub fn delete(&self) -> Result<()> {
        let id = self.id;
        self.ip.locked(|s| {
            let udp = s.udp_layer()?;
            if udp.socket(id)?.port.is_some() || udp.sockets.is_waiting(id) {
                return Err(NxError::StillBound);
            }
            udp.sockets.remove(id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;
    use crate::packet::UDP_PACKET;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn settle(ips: &[&Ip]) {
        for _ in 0..4 {
            for ip in ips {
                ip.process_pending().unwrap();
            }
        }
    }

    fn pair(net: &VirtualNetwork) -> (Ip, Ip) {
        let a = instance(net, 1);
        let b = instance(net, 2);
        for ip in [&a, &b] {
            ip.arp_enable(8).unwrap();
            ip.udp_enable().unwrap();
        }
        (a, b)
    }

    #[test]
    fn test_datagram_between_instances() {
        let net = VirtualNetwork::new(9);
        let (a, b) = pair(&net);
        let tx = UdpSocket::create(&a, "tx", UdpOptions::default()).unwrap();
        let rx = UdpSocket::create(&b, "rx", UdpOptions::default()).unwrap();
        let tx_port = tx.bind(0, WaitOption::NoWait).unwrap();
        assert_eq!(tx_port, 0xC000);
        rx.bind(5000, WaitOption::NoWait).unwrap();

        let packet = a.pool().unwrap().allocate_with(UDP_PACKET, b"hello udp").unwrap();
        tx.send(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5000).unwrap();
        settle(&[&a, &b]);

        let got = rx.receive(WaitOption::NoWait).unwrap();
        assert_eq!(got.data(), b"hello udp");
        let (source, port, interface) = Ip::udp_packet_info_extract(&got).unwrap();
        assert_eq!(source, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(port, tx_port);
        assert_eq!(interface, 0);
        assert_eq!(tx.info().unwrap().bytes_sent, 9);
        assert_eq!(rx.info().unwrap().packets_received, 1);
    }

    #[test]
    fn test_queue_overflow_releases_oldest() {
        let net = VirtualNetwork::new(9);
        let ip = instance(&net, 1);
        ip.udp_enable().unwrap();
        let options = UdpOptions {
            queue_maximum: 2,
            ..UdpOptions::default()
        };
        let sock = UdpSocket::create(&ip, "q", options).unwrap();
        sock.bind(7, WaitOption::NoWait).unwrap();
        for text in [b"one", b"two", b"thr"] {
            let packet = ip.pool().unwrap().allocate_with(UDP_PACKET, text).unwrap();
            sock.send(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7).unwrap();
        }
        ip.process_pending().unwrap();
        assert_eq!(sock.receive(WaitOption::NoWait).unwrap().data(), b"two");
        assert_eq!(sock.receive(WaitOption::NoWait).unwrap().data(), b"thr");
        assert_eq!(sock.receive(WaitOption::NoWait).unwrap_err(), NxError::NoPacket);
        assert_eq!(sock.info().unwrap().receive_packets_dropped, 1);
    }

    #[test]
    fn test_delete_requires_unbind() {
        let net = VirtualNetwork::new(9);
        let ip = instance(&net, 1);
        ip.udp_enable().unwrap();
        let sock = UdpSocket::create(&ip, "d", UdpOptions::default()).unwrap();
        sock.bind(99, WaitOption::NoWait).unwrap();
        assert_eq!(sock.delete(), Err(NxError::StillBound));
        sock.unbind().unwrap();
        sock.delete().unwrap();
        assert_eq!(sock.port(), Err(NxError::NotCreated));
    }

    #[test]
    fn test_waiting_bind_gets_port_on_unbind() {
        let net = VirtualNetwork::new(9);
        let ip = instance(&net, 1);
        ip.udp_enable().unwrap();
        let owner = UdpSocket::create(&ip, "owner", UdpOptions::default()).unwrap();
        let waiter = UdpSocket::create(&ip, "waiter", UdpOptions::default()).unwrap();
        owner.bind(53, WaitOption::NoWait).unwrap();
        assert_eq!(waiter.bind(53, WaitOption::NoWait), Err(NxError::PortUnavailable));

        let w = waiter.clone();
        let t = thread::spawn(move || w.bind(53, WaitOption::from_millis(2000)));
        thread::sleep(Duration::from_millis(20));
        owner.unbind().unwrap();
        assert_eq!(t.join().unwrap(), Ok(53));
    }

    #[test]
    fn test_receive_notify_runs_unlocked() {
        let net = VirtualNetwork::new(9);
        let ip = instance(&net, 1);
        ip.udp_enable().unwrap();
        let sock = UdpSocket::create(&ip, "n", UdpOptions::default()).unwrap();
        sock.bind(8, WaitOption::NoWait).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        sock.receive_notify(Some(Arc::new(move |s: &UdpSocket| {
            counter.fetch_add(s.info().unwrap().packets_queued, Ordering::SeqCst);
        })))
        .unwrap();
        let packet = ip.pool().unwrap().allocate_with(UDP_PACKET, b"x").unwrap();
        sock.send(packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8).unwrap();
        ip.process_pending().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
