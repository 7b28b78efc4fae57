//! Application side of TCP sockets

use std::cell::Cell;
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;

use super::{Queued, Tcb, TcpFlags, TcpLayer, TcpNotify, TcpOptions, TcpSocketInfo, TcpState};
use crate::error::{NxError, Result};
use crate::ip::route::RouteKind;
use crate::ip::{Ip, IpState};
use crate::kernel::WaitOption;
use crate::packet::{Packet, TCP_PACKET};
use crate::transport::{ephemeral_port, SocketId};

/// Handle onto a TCP socket of an IP instance
#[derive(Clone)]
pub struct TcpSocket {
    ip: Ip,
    id: SocketId,
}

impl core::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpSocket").field("id", &self.id).finish()
    }
}

impl PartialEq for TcpSocket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.ip.inner, &other.ip.inner) && self.id == other.id
    }
}

/// A send that stopped early
pub struct TcpSendError {
    pub error: NxError,
    /// Bytes queued for transmission before the failure
    pub queued: usize,
    /// The data that was not queued, back with the caller
    pub packet: Packet,
}

impl core::fmt::Debug for TcpSendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpSendError")
            .field("error", &self.error)
            .field("queued", &self.queued)
            .field("remaining", &self.packet.len())
            .finish()
    }
}

impl core::fmt::Display for TcpSendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} after {} bytes queued", self.error, self.queued)
    }
}

impl std::error::Error for TcpSendError {}

impl From<TcpSendError> for NxError {
    fn from(e: TcpSendError) -> Self {
        e.error
    }
}

impl TcpSocket {
    pub(crate) fn from_parts(ip: Ip, id: SocketId) -> Self {
        TcpSocket { ip, id }
    }

    /// Table id, provided the socket belongs to `ip`
    pub(crate) fn owned_by(&self, ip: &Ip) -> Result<SocketId> {
        if Arc::ptr_eq(&self.ip.inner, &ip.inner) {
            Ok(self.id)
        } else {
            Err(NxError::PtrError)
        }
    }

    pub fn create(ip: &Ip, name: &str, options: TcpOptions) -> Result<TcpSocket> {
        let id = ip.locked(|s| {
            let tcb = Tcb::new(name, options, &s.config);
            let tcp = s.tcp.as_mut().ok_or(NxError::NotEnabled)?;
            Ok(tcp.sockets.insert(tcb))
        })?;
        Ok(TcpSocket { ip: ip.clone(), id })
    }

    pub fn ip(&self) -> &Ip {
        &self.ip
    }

    fn call<R>(&self, f: impl FnOnce(&mut IpState, &mut TcpLayer) -> Result<R>) -> Result<R> {
        self.ip.locked(|s| s.with_tcp(f))
    }

    fn with<R>(&self, f: impl FnOnce(&mut Tcb) -> Result<R>) -> Result<R> {
        let id = self.id;
        self.call(|_, tcp| f(tcp.socket(id)?))
    }

    /// Bind to `port`, or to a free ephemeral port when zero.
    ///
    /// A port owned by another socket is waited for according to `wait`.
    /// Waiters are served in arrival order: when the port is released the
    /// oldest one is bound to it.
    pub fn client_socket_bind(&self, port: u16, wait: WaitOption) -> Result<u16> {
        let id = self.id;
        let mut queued = false;
        let result = self.ip.block_on(
            wait,
            |s| {
                s.with_tcp(|_, tcp| {
                    if queued {
                        if tcp.socket(id)?.port == Some(port) {
                            return Ok(Some(port));
                        }
                        return if tcp.sockets.is_waiting(id) {
                            Ok(None)
                        } else {
                            Err(NxError::PortUnavailable)
                        };
                    }
                    if tcp.socket(id)?.port.is_some() || tcp.sockets.is_waiting(id) {
                        return Err(NxError::AlreadyBound);
                    }
                    let chosen = if port == 0 {
                        let mut next = tcp.next_port;
                        let found = ephemeral_port(tcp.first_port, &mut next, |p| tcp.port_in_use(p));
                        tcp.next_port = next;
                        found.ok_or(NxError::NoFreePorts)?
                    } else if tcp.port_in_use(port) {
                        tcp.sockets.wait_for_port(id, port);
                        queued = true;
                        return Ok(None);
                    } else {
                        port
                    };
                    tcp.sockets.bind(id, chosen)?;
                    Ok(Some(chosen))
                })
                .transpose()
            },
            |s| {
                if let Some(tcp) = s.tcp.as_mut() {
                    tcp.sockets.cancel_wait(id);
                }
                NxError::PortUnavailable
            },
        );
        if let Ok(port) = result {
            debug!("tcp socket bound to port {}", port);
        }
        result
    }

    /// Release the port. A socket in TIME_WAIT is closed first.
    pub fn client_socket_unbind(&self) -> Result<()> {
        let id = self.id;
        self.call(|_, tcp| {
            let tcb = tcp.socket(id)?;
            match tcb.state {
                TcpState::Closed => {}
                TcpState::TimeWait => tcb.abort(),
                _ => return Err(NxError::NotClosed),
            }
            if tcb.listen_port.is_some() {
                return Err(NxError::NotClosed);
            }
            tcp.unbind(id).map(|_| ()).ok_or(NxError::NotBound)
        })
    }

    /// Open a connection to `address`:`port`.
    ///
    /// With `NoWait` the handshake continues in the background and
    /// `InProgress` is returned. A handshake that does not finish within
    /// `wait` is abandoned.
    pub fn client_socket_connect(&self, address: IpAddr, port: u16, wait: WaitOption) -> Result<()> {
        if port == 0 {
            return Err(NxError::InvalidParameters);
        }
        if address.is_unspecified() {
            return Err(NxError::IpAddressError);
        }
        let id = self.id;
        self.call(|s, tcp| {
            let isn = tcp.next_isn();
            let default_mss = s.config.tcp_default_mss;
            let tcb = tcp.sockets.get_mut(id).ok_or(NxError::NotCreated)?;
            if tcb.port.is_none() {
                return Err(NxError::NotBound);
            }
            if tcb.state != TcpState::Closed {
                return Err(NxError::NotClosed);
            }
            let route = s.route(address, None)?;
            if matches!(route.kind, RouteKind::Broadcast | RouteKind::Multicast) {
                return Err(NxError::IpAddressError);
            }
            let mtu = s.interface(route.interface)?.mtu;
            tcb.open(route.source, address, port, route.interface, mtu, isn, default_mss);
            tcb.cwnd = tcb.send_mss();
            tcb.state = TcpState::SynSent;
            tcb.transmit_queue.push_back(Queued {
                seq: isn,
                flags: TcpFlags::SYN,
                data: None,
            });
            let segment = tcb.segment(isn, TcpFlags::SYN, None);
            s.tcp_emit(&mut tcp.stats, segment);
            tcb.restart_timer();
            debug!("tcp {}: connecting to {}:{}", tcb.name, address, port);
            Ok(())
        })?;

        let no_wait = wait.is_no_wait();
        self.ip.block_on(
            wait,
            |s| {
                s.with_tcp(|_, tcp| match tcp.socket(id)?.state {
                    TcpState::Established | TcpState::CloseWait => Ok(Some(())),
                    TcpState::Closed => Err(NxError::NotConnected),
                    _ => Ok(None),
                })
                .transpose()
            },
            |s| {
                if no_wait {
                    return NxError::InProgress;
                }
                if let Some(tcb) = s.tcp.as_mut().and_then(|t| t.sockets.get_mut(id)) {
                    if matches!(tcb.state, TcpState::SynSent | TcpState::SynReceived) {
                        tcb.abort();
                    }
                }
                NxError::NotConnected
            },
        )
    }

    /// Wait for the connection handed to this listening socket
    pub fn server_socket_accept(&self, wait: WaitOption) -> Result<()> {
        let id = self.id;
        self.with(|tcb| match (tcb.listen_port, tcb.state) {
            (Some(_), TcpState::Listen | TcpState::SynReceived | TcpState::Established | TcpState::CloseWait) => Ok(()),
            _ => Err(NxError::NotListenState),
        })?;
        let no_wait = wait.is_no_wait();
        self.ip.block_on(
            wait,
            |s| {
                s.with_tcp(|_, tcp| match tcp.socket(id)?.state {
                    TcpState::Established | TcpState::CloseWait => Ok(Some(())),
                    TcpState::Closed => Err(NxError::NotConnected),
                    _ => Ok(None),
                })
                .transpose()
            },
            |_| {
                if no_wait {
                    NxError::InProgress
                } else {
                    NxError::NotConnected
                }
            },
        )
    }

    /// Detach a server socket from its listener and release the port
    pub fn server_socket_unaccept(&self) -> Result<()> {
        let id = self.id;
        self.call(|_, tcp| {
            let tcb = tcp.socket(id)?;
            if tcb.listen_port.is_none() {
                return Err(NxError::NotListenState);
            }
            match tcb.state {
                TcpState::Listen | TcpState::Closed | TcpState::TimeWait => {}
                _ => return Err(NxError::NotListenState),
            }
            tcb.abort();
            tcb.listen_port = None;
            for listener in tcp.listeners.iter_mut() {
                if listener.socket == Some(id) {
                    listener.socket = None;
                }
            }
            tcp.unbind(id);
            Ok(())
        })
    }

    /// Queue `packet` for transmission.
    ///
    /// The data is split into MSS-sized segments, each copied into fresh
    /// buffers. Transmission is held back by the peer's window, the
    /// congestion window and the transmit queue depth; `wait` decides how
    /// long to wait for room. Segments queued before a failure stay queued
    /// and the unsent rest of `packet` comes back in the error.
    pub fn send(&self, packet: Packet, wait: WaitOption) -> core::result::Result<(), TcpSendError> {
        let id = self.id;
        let mut offset = 0;
        let blocked = Cell::new(NxError::WindowOverflow);
        let result = self.ip.block_on(
            wait,
            |s| {
                s.with_tcp(|s, tcp| s.tcp_data_queue(tcp, id, &packet, &mut offset, &blocked))
                    .transpose()
            },
            |_| blocked.get(),
        );
        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                let mut packet = packet;
                if packet.trim_front(offset).is_err() {
                    packet.truncate(0);
                }
                Err(TcpSendError {
                    error,
                    queued: offset,
                    packet,
                })
            }
        }
    }

    /// Take the next in-order data packet
    pub fn receive(&self, wait: WaitOption) -> Result<Packet> {
        let id = self.id;
        self.ip.block_on(
            wait,
            |s| {
                s.with_tcp(|s, tcp| {
                    let tcb = tcp.sockets.get_mut(id).ok_or(NxError::NotCreated)?;
                    if let Some(packet) = tcb.receive_queue.pop_front() {
                        let mss = tcb.send_mss();
                        let window = tcb.receive_window();
                        let reopened = window >= mss && window.saturating_sub(packet.len() as u32) < mss;
                        if reopened && tcb.state.synchronized() {
                            let segment = tcb.ack_segment();
                            s.tcp_emit(&mut tcp.stats, segment);
                        }
                        return Ok(Some(packet));
                    }
                    let open = matches!(
                        tcb.state,
                        TcpState::SynSent
                            | TcpState::SynReceived
                            | TcpState::Established
                            | TcpState::FinWait1
                            | TcpState::FinWait2
                    );
                    if tcb.fin_received || !open {
                        return Err(NxError::NotConnected);
                    }
                    Ok(None)
                })
                .transpose()
            },
            |_| NxError::NoPacket,
        )
    }

    /// Close the connection.
    ///
    /// `NoWait` resets the connection. Otherwise a FIN is sent and the
    /// call waits for the close to finish; when `wait` runs out first the
    /// connection is reset and `NoResponse` returned.
    pub fn disconnect(&self, wait: WaitOption) -> Result<()> {
        let id = self.id;
        let abortive = wait.is_no_wait();
        let finished = self.call(|s, tcp| {
            let tcb = tcp.sockets.get_mut(id).ok_or(NxError::NotCreated)?;
            match tcb.state {
                TcpState::Closed => Err(NxError::NotConnected),
                TcpState::TimeWait => Ok(true),
                TcpState::Listen | TcpState::SynSent => {
                    tcb.abort();
                    Ok(true)
                }
                _ if abortive => {
                    let segment = tcb.reset_segment();
                    s.tcp_emit(&mut tcp.stats, segment);
                    tcb.abort();
                    tcp.stats.disconnections += 1;
                    debug!("tcp {}: reset", tcb.name);
                    Ok(true)
                }
                TcpState::SynReceived | TcpState::Established => {
                    tcb.disconnect_requested = true;
                    tcb.state = TcpState::FinWait1;
                    s.tcp_fin_send(&mut tcp.stats, tcb);
                    Ok(false)
                }
                TcpState::CloseWait => {
                    tcb.disconnect_requested = true;
                    tcb.state = TcpState::LastAck;
                    s.tcp_fin_send(&mut tcp.stats, tcb);
                    Ok(false)
                }
                _ => {
                    tcb.disconnect_requested = true;
                    Ok(false)
                }
            }
        })?;
        if finished {
            return Ok(());
        }

        self.ip.block_on(
            wait,
            |s| {
                s.with_tcp(|_, tcp| match tcp.socket(id)?.state {
                    TcpState::Closed | TcpState::TimeWait => Ok(Some(())),
                    _ => Ok(None),
                })
                .transpose()
            },
            |s| {
                let _ = s.with_tcp(|s, tcp| {
                    if let Some(tcb) = tcp.sockets.get_mut(id) {
                        let segment = tcb.reset_segment();
                        s.tcp_emit(&mut tcp.stats, segment);
                        tcb.abort();
                        tcb.disconnect_requested = false;
                    }
                    Ok(())
                });
                NxError::NoResponse
            },
        )
    }

    /// Delete a closed, unbound socket
    pub fn delete(&self) -> Result<()> {
        let id = self.id;
        self.call(|_, tcp| {
            let tcb = tcp.socket(id)?;
            if tcb.state != TcpState::Closed || tcb.port.is_some() {
                return Err(NxError::StillBound);
            }
            if tcp.sockets.is_waiting(id) {
                return Err(NxError::StillBound);
            }
            tcp.sockets.remove(id);
            Ok(())
        })
    }

    fn notify_set(&self, f: impl FnOnce(&mut Tcb)) -> Result<()> {
        self.with(|tcb| {
            f(tcb);
            Ok(())
        })
    }

    /// Called after data was queued for `receive`
    pub fn receive_notify(&self, notify: Option<TcpNotify>) -> Result<()> {
        self.notify_set(|tcb| tcb.notify.receive = notify)
    }

    /// Called when the peer opens its window
    pub fn window_update_notify_set(&self, notify: Option<TcpNotify>) -> Result<()> {
        self.notify_set(|tcb| tcb.notify.window_update = notify)
    }

    /// Called once when the peer closes or resets the connection
    pub fn disconnect_notify(&self, notify: Option<TcpNotify>) -> Result<()> {
        self.notify_set(|tcb| tcb.notify.disconnect = notify)
    }

    pub fn disconnect_complete_notify(&self, notify: Option<TcpNotify>) -> Result<()> {
        self.notify_set(|tcb| tcb.notify.disconnect_complete = notify)
    }

    pub fn establish_notify(&self, notify: Option<TcpNotify>) -> Result<()> {
        self.notify_set(|tcb| tcb.notify.establish = notify)
    }

    /// Retransmission and queue limits of this socket
    pub fn transmit_configure(&self, queue_max: usize, timeout_rate: u32, max_retries: u32, retry_shift: u32) -> Result<()> {
        if queue_max == 0 || timeout_rate == 0 {
            return Err(NxError::InvalidParameters);
        }
        self.with(|tcb| {
            tcb.transmit_queue_max = queue_max;
            tcb.retransmit.rate = timeout_rate;
            tcb.retransmit.max_retries = max_retries;
            tcb.retransmit.shift = retry_shift;
            Ok(())
        })
    }

    pub fn receive_queue_max_set(&self, maximum: usize) -> Result<()> {
        if maximum == 0 {
            return Err(NxError::InvalidParameters);
        }
        self.with(|tcb| {
            tcb.receive_queue_max = maximum;
            Ok(())
        })
    }

    /// Cap the MSS advertised by the next connection
    pub fn mss_set(&self, mss: u16) -> Result<()> {
        if mss == 0 {
            return Err(NxError::InvalidParameters);
        }
        self.with(|tcb| {
            tcb.mss_override = mss;
            Ok(())
        })
    }

    pub fn info(&self) -> Result<TcpSocketInfo> {
        self.with(|tcb| Ok(tcb.info()))
    }

    pub fn state(&self) -> Result<TcpState> {
        self.with(|tcb| Ok(tcb.state))
    }

    /// Remote address and port of the connection
    pub fn peer_info(&self) -> Result<(IpAddr, u16)> {
        self.with(|tcb| {
            if matches!(tcb.state, TcpState::Closed | TcpState::Listen) {
                return Err(NxError::NotConnected);
            }
            Ok((tcb.remote, tcb.remote_port))
        })
    }

    pub fn port(&self) -> Result<u16> {
        self.with(|tcb| tcb.port.ok_or(NxError::NotBound))
    }

    pub fn name(&self) -> Result<String> {
        self.with(|tcb| Ok(tcb.name.clone()))
    }
}

impl IpState {
    /// Segment and queue `data[*offset..]` as far as the windows allow.
    ///
    /// `Ok(None)` means the caller has to wait; `blocked` names the limit.
    fn tcp_data_queue(
        &mut self,
        tcp: &mut TcpLayer,
        id: SocketId,
        packet: &Packet,
        offset: &mut usize,
        blocked: &Cell<NxError>,
    ) -> Result<Option<()>> {
        let tcb = tcp.sockets.get_mut(id).ok_or(NxError::NotCreated)?;
        if !matches!(tcb.state, TcpState::Established | TcpState::CloseWait) {
            return Err(NxError::NotConnected);
        }
        let total = packet.len();
        while *offset < total {
            if tcb.transmit_queue.len() >= tcb.transmit_queue_max {
                blocked.set(NxError::TxQueueDepth);
                return Ok(None);
            }
            let usable = tcb.usable_window() as usize;
            if usable == 0 {
                if tcb.snd_wnd == 0 && tcb.transmit_queue.is_empty() {
                    tcb.persist_start();
                }
                blocked.set(NxError::WindowOverflow);
                return Ok(None);
            }
            let len = (total - *offset).min(tcb.send_mss() as usize).min(usable);
            let mut bytes = vec![0u8; len];
            packet.data_extract_offset(*offset, &mut bytes)?;
            let chunk = self.pool.allocate_chain(TCP_PACKET, &bytes)?;
            let copy = chunk.duplicate(&self.pool, TCP_PACKET).ok();
            let seq = tcb.snd_nxt;
            let flags = TcpFlags::ACK | TcpFlags::PSH;
            tcb.transmit_queue.push_back(Queued {
                seq,
                flags,
                data: Some(chunk),
            });
            tcb.snd_nxt = seq.wrapping_add(len as u32);
            tcb.stats.packets_sent += 1;
            tcb.stats.bytes_sent += len as u64;
            if let Some(copy) = copy {
                let segment = tcb.segment(seq, flags, Some(copy));
                self.tcp_emit(&mut tcp.stats, segment);
            }
            if tcb.retransmit.countdown.is_none() {
                tcb.restart_timer();
            }
            *offset += len;
        }
        Ok(Some(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;
    use crate::transport::tcp::ListenCallback;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn pair(net: &VirtualNetwork) -> (Ip, Ip) {
        let a = instance(net, 1);
        let b = instance(net, 2);
        for ip in [&a, &b] {
            ip.arp_enable(8).unwrap();
            ip.tcp_enable().unwrap();
        }
        (a, b)
    }

    fn settle(ips: &[&Ip]) {
        for _ in 0..8 {
            for ip in ips {
                ip.process_pending().unwrap();
            }
        }
    }

    /// Runs helper passes for both instances on a thread until dropped
    struct Pump {
        stop: Arc<AtomicBool>,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl Pump {
        fn start(a: &Ip, b: &Ip) -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let (a, b, flag) = (a.clone(), b.clone(), stop.clone());
            let thread = thread::spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    let _ = a.process_pending();
                    let _ = b.process_pending();
                    thread::sleep(Duration::from_millis(1));
                }
            });
            Pump {
                stop,
                thread: Some(thread),
            }
        }
    }

    impl Drop for Pump {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn connect(a: &Ip, b: &Ip, client: &TcpSocket) {
        client.client_socket_bind(0, WaitOption::NoWait).unwrap();
        assert_eq!(
            client.client_socket_connect(SERVER, 80, WaitOption::NoWait),
            Err(NxError::InProgress)
        );
        settle(&[a, b]);
        assert_eq!(client.state().unwrap(), TcpState::Established);
    }

    #[test]
    fn test_connect_transfer_and_close() {
        let net = VirtualNetwork::new(21);
        let (a, b) = pair(&net);
        let server = TcpSocket::create(&b, "server", TcpOptions::default()).unwrap();
        b.tcp_server_socket_listen(80, &server, 4, None).unwrap();
        let client = TcpSocket::create(&a, "client", TcpOptions::default()).unwrap();
        connect(&a, &b, &client);
        server.server_socket_accept(WaitOption::NoWait).unwrap();
        assert_eq!(server.peer_info().unwrap(), (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), client.port().unwrap()));

        let packet = a.pool().unwrap().allocate_with(TCP_PACKET, b"over tcp").unwrap();
        client.send(packet, WaitOption::NoWait).unwrap();
        settle(&[&a, &b]);
        assert_eq!(server.receive(WaitOption::NoWait).unwrap().data(), b"over tcp");
        assert_eq!(server.receive(WaitOption::NoWait).unwrap_err(), NxError::NoPacket);
        assert_eq!(client.info().unwrap().transmit_queue_depth, 0);

        let pump = Pump::start(&a, &b);
        let closer = client.clone();
        let t = thread::spawn(move || closer.disconnect(WaitOption::from_millis(3000)));
        for _ in 0..1000 {
            if server.state().unwrap() == TcpState::CloseWait {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(server.receive(WaitOption::NoWait).unwrap_err(), NxError::NotConnected);
        server.disconnect(WaitOption::from_millis(3000)).unwrap();
        assert_eq!(t.join().unwrap(), Ok(()));
        drop(pump);

        assert_eq!(server.state().unwrap(), TcpState::Closed);
        assert_eq!(client.state().unwrap(), TcpState::TimeWait);
        client.client_socket_unbind().unwrap();
        assert_eq!(client.state().unwrap(), TcpState::Closed);
        assert_eq!(b.tcp_info().unwrap().connections, 1);
    }

    #[test]
    fn test_connect_to_closed_port_is_refused() {
        let net = VirtualNetwork::new(22);
        let (a, b) = pair(&net);
        let client = TcpSocket::create(&a, "client", TcpOptions::default()).unwrap();
        client.client_socket_bind(0, WaitOption::NoWait).unwrap();
        assert_eq!(
            client.client_socket_connect(SERVER, 81, WaitOption::NoWait),
            Err(NxError::InProgress)
        );
        settle(&[&a, &b]);
        assert_eq!(client.state().unwrap(), TcpState::Closed);
        assert_eq!(b.tcp_info().unwrap().resets_sent, 1);
        assert_eq!(a.tcp_info().unwrap().resets_received, 1);
        assert_eq!(client.peer_info(), Err(NxError::NotConnected));
    }

    #[test]
    fn test_delete_requires_closed_and_unbound() {
        let net = VirtualNetwork::new(23);
        let (a, _b) = pair(&net);
        let sock = TcpSocket::create(&a, "d", TcpOptions::default()).unwrap();
        assert_eq!(sock.client_socket_bind(7000, WaitOption::NoWait), Ok(7000));
        assert_eq!(sock.client_socket_bind(7001, WaitOption::NoWait), Err(NxError::AlreadyBound));
        assert_eq!(sock.delete(), Err(NxError::StillBound));
        sock.client_socket_unbind().unwrap();
        assert_eq!(sock.client_socket_unbind(), Err(NxError::NotBound));
        assert_eq!(a.tcp_info().unwrap().created_sockets, 1);
        sock.delete().unwrap();
        assert_eq!(sock.state(), Err(NxError::NotCreated));
        assert_eq!(a.tcp_info().unwrap().created_sockets, 0);
    }

    #[test]
    fn test_argument_checks() {
        let net = VirtualNetwork::new(24);
        let (a, b) = pair(&net);
        let sock = TcpSocket::create(&a, "args", TcpOptions::default()).unwrap();
        assert_eq!(sock.client_socket_connect(SERVER, 80, WaitOption::NoWait), Err(NxError::NotBound));
        sock.client_socket_bind(0, WaitOption::NoWait).unwrap();
        assert_eq!(sock.client_socket_connect(SERVER, 0, WaitOption::NoWait), Err(NxError::InvalidParameters));
        assert_eq!(
            sock.client_socket_connect(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 80, WaitOption::NoWait),
            Err(NxError::IpAddressError)
        );
        assert_eq!(
            sock.client_socket_connect(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)), 80, WaitOption::NoWait),
            Err(NxError::IpAddressError)
        );
        assert_eq!(sock.disconnect(WaitOption::NoWait), Err(NxError::NotConnected));
        assert_eq!(sock.server_socket_accept(WaitOption::NoWait), Err(NxError::NotListenState));
        assert_eq!(sock.transmit_configure(0, 1, 1, 0), Err(NxError::InvalidParameters));
        assert_eq!(b.tcp_server_socket_listen(80, &sock, 0, None), Err(NxError::PtrError));
    }

    #[test]
    fn test_listen_queue_and_relisten() {
        let net = VirtualNetwork::new(25);
        let (a, b) = pair(&net);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback: ListenCallback = Arc::new(move |_: &TcpSocket, port: u16| {
            assert_eq!(port, 80);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let first = TcpSocket::create(&b, "first", TcpOptions::default()).unwrap();
        b.tcp_server_socket_listen(80, &first, 2, Some(callback)).unwrap();
        let spare = TcpSocket::create(&b, "spare", TcpOptions::default()).unwrap();
        assert_eq!(b.tcp_server_socket_listen(80, &spare, 2, None), Err(NxError::DuplicateListen));

        let one = TcpSocket::create(&a, "one", TcpOptions::default()).unwrap();
        connect(&a, &b, &one);
        first.server_socket_accept(WaitOption::NoWait).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let two = TcpSocket::create(&a, "two", TcpOptions::default()).unwrap();
        two.client_socket_bind(0, WaitOption::NoWait).unwrap();
        assert_eq!(two.client_socket_connect(SERVER, 80, WaitOption::NoWait), Err(NxError::InProgress));
        settle(&[&a, &b]);
        assert_eq!(two.state().unwrap(), TcpState::SynSent);

        b.tcp_server_socket_relisten(80, &spare).unwrap();
        settle(&[&a, &b]);
        assert_eq!(two.state().unwrap(), TcpState::Established);
        spare.server_socket_accept(WaitOption::NoWait).unwrap();
        assert_eq!(spare.peer_info().unwrap().1, two.port().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        b.tcp_server_socket_unlisten(80).unwrap();
        assert_eq!(b.tcp_server_socket_unlisten(80), Err(NxError::EntryNotFound));
    }

    #[test]
    fn test_receive_window_limits_sender() {
        let net = VirtualNetwork::new(26);
        let (a, b) = pair(&net);
        let options = TcpOptions {
            window_size: 100,
            ..TcpOptions::default()
        };
        let server = TcpSocket::create(&b, "server", options).unwrap();
        b.tcp_server_socket_listen(80, &server, 0, None).unwrap();
        let client = TcpSocket::create(&a, "client", TcpOptions::default()).unwrap();
        connect(&a, &b, &client);
        assert_eq!(client.info().unwrap().transmit_window, 100);

        let data: Vec<u8> = (0..150u8).collect();
        let packet = a.pool().unwrap().allocate_with(TCP_PACKET, &data).unwrap();
        let err = client.send(packet, WaitOption::NoWait).unwrap_err();
        assert_eq!(err.error, NxError::WindowOverflow);
        assert_eq!(err.queued, 100);
        assert_eq!(err.packet.to_vec(), &data[100..]);
        settle(&[&a, &b]);
        assert_eq!(server.receive(WaitOption::NoWait).unwrap().len(), 100);
        assert_eq!(server.info().unwrap().bytes_received, 100);
    }

    #[test]
    fn test_closed_window_is_probed() {
        let net = VirtualNetwork::new(31);
        let (a, b) = pair(&net);
        let options = TcpOptions {
            window_size: 100,
            ..TcpOptions::default()
        };
        let server = TcpSocket::create(&b, "server", options).unwrap();
        b.tcp_server_socket_listen(80, &server, 0, None).unwrap();
        let client = TcpSocket::create(&a, "client", TcpOptions::default()).unwrap();
        connect(&a, &b, &client);

        let fill = a.pool().unwrap().allocate_with(TCP_PACKET, &[1u8; 100]).unwrap();
        client.send(fill, WaitOption::NoWait).unwrap();
        settle(&[&a, &b]);
        assert_eq!(client.info().unwrap().transmit_window, 0);

        let more = a.pool().unwrap().allocate_with(TCP_PACKET, &[2u8; 10]).unwrap();
        let err = client.send(more, WaitOption::NoWait).unwrap_err();
        assert_eq!(err.error, NxError::WindowOverflow);
        assert_eq!(err.queued, 0);

        // the window reopens below one MSS, so no update is volunteered
        assert_eq!(server.receive(WaitOption::NoWait).unwrap().len(), 100);
        settle(&[&a, &b]);
        assert_eq!(client.info().unwrap().transmit_window, 0);

        for _ in 0..12 {
            a.tcp_fast_tick().unwrap();
            settle(&[&a, &b]);
        }
        assert_eq!(client.info().unwrap().transmit_window, 100);
        assert_eq!(client.state().unwrap(), TcpState::Established);
        client.send(err.packet, WaitOption::NoWait).unwrap();
        settle(&[&a, &b]);
        assert_eq!(server.receive(WaitOption::NoWait).unwrap().data(), &[2u8; 10]);
    }

    #[test]
    fn test_pool_exhaustion_mid_split_returns_remainder() {
        let net = VirtualNetwork::new(27);
        let (a, b) = pair(&net);
        let server = TcpSocket::create(&b, "server", TcpOptions::default()).unwrap();
        b.tcp_server_socket_listen(80, &server, 0, None).unwrap();
        let client = TcpSocket::create(&a, "client", TcpOptions::default()).unwrap();
        connect(&a, &b, &client);

        // one acknowledged segment opens the congestion window to two
        let first = a.pool().unwrap().allocate_with(TCP_PACKET, b"warm up").unwrap();
        client.send(first, WaitOption::NoWait).unwrap();
        settle(&[&a, &b]);
        assert_eq!(client.info().unwrap().congestion_window, 2920);

        let pool = a.pool().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let packet = pool.allocate_chain(TCP_PACKET, &data).unwrap();
        let held: Vec<Packet> = (1..pool.available()).map(|_| pool.allocate(0).unwrap()).collect();
        let err = client.send(packet, WaitOption::NoWait).unwrap_err();
        assert_eq!(err.error, NxError::NoPacket);
        assert_eq!(err.queued, 1460);
        assert_eq!(err.packet.to_vec(), &data[1460..]);
        assert_eq!(client.info().unwrap().transmit_queue_depth, 1);
        drop(held);
    }

    #[test]
    fn test_chained_packet_sent_whole() {
        let net = VirtualNetwork::new(28);
        let (a, b) = pair(&net);
        let server = TcpSocket::create(&b, "server", TcpOptions::default()).unwrap();
        b.tcp_server_socket_listen(80, &server, 0, None).unwrap();
        let client = TcpSocket::create(&a, "client", TcpOptions::default()).unwrap();
        connect(&a, &b, &client);

        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let packet = a.pool().unwrap().allocate_chain(TCP_PACKET, &data).unwrap();
        let pump = Pump::start(&a, &b);
        client.send(packet, WaitOption::from_millis(3000)).unwrap();
        let mut received = Vec::new();
        while received.len() < data.len() {
            received.extend(server.receive(WaitOption::from_millis(3000)).unwrap().to_vec());
        }
        drop(pump);
        assert_eq!(received, data);
        assert_eq!(client.info().unwrap().bytes_sent, 4000);
    }

    #[test]
    fn test_bind_waiters_served_in_arrival_order() {
        let net = VirtualNetwork::new(29);
        let (a, _b) = pair(&net);
        let owner = TcpSocket::create(&a, "owner", TcpOptions::default()).unwrap();
        owner.client_socket_bind(7000, WaitOption::NoWait).unwrap();
        let first = TcpSocket::create(&a, "first", TcpOptions::default()).unwrap();
        let second = TcpSocket::create(&a, "second", TcpOptions::default()).unwrap();

        let f = first.clone();
        let t1 = thread::spawn(move || f.client_socket_bind(7000, WaitOption::from_millis(3000)));
        thread::sleep(Duration::from_millis(50));
        let s2 = second.clone();
        let t2 = thread::spawn(move || s2.client_socket_bind(7000, WaitOption::from_millis(3000)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(second.delete(), Err(NxError::StillBound));

        owner.client_socket_unbind().unwrap();
        assert_eq!(t1.join().unwrap(), Ok(7000));
        assert_eq!(first.port().unwrap(), 7000);
        assert_eq!(second.port(), Err(NxError::NotBound));

        first.client_socket_unbind().unwrap();
        assert_eq!(t2.join().unwrap(), Ok(7000));
        assert_eq!(second.port().unwrap(), 7000);
    }

    #[test]
    fn test_bind_wait_times_out() {
        let net = VirtualNetwork::new(30);
        let (a, _b) = pair(&net);
        let owner = TcpSocket::create(&a, "owner", TcpOptions::default()).unwrap();
        owner.client_socket_bind(7001, WaitOption::NoWait).unwrap();
        let late = TcpSocket::create(&a, "late", TcpOptions::default()).unwrap();
        assert_eq!(
            late.client_socket_bind(7001, WaitOption::from_millis(20)),
            Err(NxError::PortUnavailable)
        );
        owner.client_socket_unbind().unwrap();
        assert_eq!(late.port(), Err(NxError::NotBound));
        late.delete().unwrap();
    }
}
