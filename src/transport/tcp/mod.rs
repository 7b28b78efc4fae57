//! TCP (Transmission Control Protocol) implementation
//!
//! Connection state lives in a `Tcb` per socket, stored in the instance's
//! TCP layer. Segment processing and timers borrow the layer out of the
//! instance state for the duration of one pass, which lets them transmit
//! through the IP layer while holding a socket.
//!
//! Every unacknowledged segment sits on the socket's transmit queue until
//! the peer acknowledges it; the fast timer resends the oldest one when its
//! countdown runs out.

mod header;
mod input;
mod socket;
mod timer;

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};

use crate::config::IpConfig;
use crate::error::{NxError, Result};
use crate::ip::{Ip, IpState};
use crate::network::{protocol, transport_checksum_chain};
use crate::packet::{Packet, TCP_PACKET};
use crate::transport::{PortBound, SocketId, SocketTable};

pub use header::{TcpFlags, TcpHeader, TCP_HEADER_LEN};
pub use socket::{TcpSendError, TcpSocket};

/// Socket event callback
pub type TcpNotify = Arc<dyn Fn(&TcpSocket) + Send + Sync>;

/// Called when a listening socket takes a connection request for `port`
pub type ListenCallback = Arc<dyn Fn(&TcpSocket, u16) + Send + Sync>;

/// TCP connection states as defined in RFC 793
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    LastAck,
}

impl TcpState {
    /// The peer knows about this connection
    fn synchronized(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent)
    }
}

/// Per-socket transmit parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    pub type_of_service: u8,
    pub time_to_live: u8,
    /// Receive window advertised to the peer
    pub window_size: u32,
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions {
            type_of_service: 0,
            time_to_live: 128,
            window_size: 8192,
        }
    }
}

/// Instance-wide TCP counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub invalid_packets: u64,
    pub receive_packets_dropped: u64,
    pub checksum_errors: u64,
    pub connections: u64,
    pub disconnections: u64,
    pub connections_dropped: u64,
    pub retransmit_packets: u64,
    pub resets_sent: u64,
    pub resets_received: u64,
    pub created_sockets: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpSocketInfo {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub retransmit_packets: u64,
    pub packets_queued: usize,
    pub transmit_queue_depth: usize,
    pub transmit_window: u32,
    pub receive_window: u32,
    pub congestion_window: u32,
    pub state: TcpState,
}

/// Congestion window ceiling; without window scaling the peer never offers more
const MAX_CWND: u32 = u16::MAX as u32;

pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    !seq_lt(b, a)
}

pub(crate) fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// A segment awaiting acknowledgment
struct Queued {
    seq: u32,
    flags: TcpFlags,
    data: Option<Packet>,
}

impl Queued {
    /// Sequence space taken, SYN and FIN counting one each
    fn len(&self) -> u32 {
        let data = self.data.as_ref().map_or(0, |p| p.len() as u32);
        data + self.flags.intersection(TcpFlags::SYN | TcpFlags::FIN).bits().count_ones()
    }
}

struct Retransmit {
    rate: u32,
    max_timeout: u32,
    max_retries: u32,
    shift: u32,
    retries: u32,
    /// Fast ticks until the oldest segment is resent
    countdown: Option<u32>,
}

impl Retransmit {
    fn timeout(&self) -> u32 {
        let shift = self.retries.saturating_mul(self.shift).min(31);
        ((self.rate.max(1) as u64) << shift).min(self.max_timeout.max(1) as u64) as u32
    }
}

#[derive(Default, Clone)]
struct Notifies {
    receive: Option<TcpNotify>,
    window_update: Option<TcpNotify>,
    disconnect: Option<TcpNotify>,
    disconnect_complete: Option<TcpNotify>,
    establish: Option<TcpNotify>,
}

#[derive(Debug, Clone, Copy)]
enum Notify {
    Receive,
    WindowUpdate,
    Disconnect,
    DisconnectComplete,
    Establish,
}

/// Connection state of one socket
pub(crate) struct Tcb {
    name: String,
    state: TcpState,
    options: TcpOptions,
    /// Kept in step with the bound-port chains by the socket table
    port: Option<u16>,
    /// Port of the listener this socket serves
    listen_port: Option<u16>,
    interface: Option<usize>,
    local: IpAddr,
    remote: IpAddr,
    remote_port: u16,
    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    irs: u32,
    rcv_nxt: u32,
    /// MSS set by the application, zero to derive it from the MTU
    mss_override: u16,
    local_mss: u16,
    peer_mss: u16,
    cwnd: u32,
    ssthresh: u32,
    dup_acks: u32,
    transmit_queue: VecDeque<Queued>,
    transmit_queue_max: usize,
    retransmit: Retransmit,
    /// Fast ticks until the next zero-window probe
    persist: Option<u32>,
    persist_probes: u32,
    receive_queue: VecDeque<Packet>,
    receive_queue_max: usize,
    fin_sent: bool,
    fin_received: bool,
    time_wait: u32,
    notify: Notifies,
    stats: TcpSocketInfo,
    disconnect_requested: bool,
    disconnect_notified: bool,
}

impl Tcb {
    fn new(name: &str, options: TcpOptions, config: &IpConfig) -> Self {
        Tcb {
            name: name.to_string(),
            state: TcpState::Closed,
            options,
            port: None,
            listen_port: None,
            interface: None,
            local: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_port: 0,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            irs: 0,
            rcv_nxt: 0,
            mss_override: 0,
            local_mss: config.tcp_default_mss,
            peer_mss: config.tcp_default_mss,
            cwnd: 0,
            ssthresh: 0,
            dup_acks: 0,
            transmit_queue: VecDeque::new(),
            transmit_queue_max: config.tcp_transmit_queue_max.max(1),
            retransmit: Retransmit {
                rate: config.tcp_timeout_rate,
                max_timeout: config.tcp_max_timeout,
                max_retries: config.tcp_max_retries,
                shift: config.tcp_retry_shift,
                retries: 0,
                countdown: None,
            },
            persist: None,
            persist_probes: 0,
            receive_queue: VecDeque::new(),
            receive_queue_max: usize::MAX,
            fin_sent: false,
            fin_received: false,
            time_wait: 0,
            notify: Notifies::default(),
            stats: TcpSocketInfo::default(),
            disconnect_requested: false,
            disconnect_notified: false,
        }
    }

    /// Prepare for a new connection over `interface`
    #[allow(clippy::too_many_arguments)]
    fn open(&mut self, local: IpAddr, remote: IpAddr, remote_port: u16, interface: usize, mtu: usize, isn: u32, default_mss: u16) {
        let ip_header = if remote.is_ipv6() { 40 } else { 20 };
        let derived = mtu.saturating_sub(ip_header + TCP_HEADER_LEN).min(u16::MAX as usize) as u16;
        self.local_mss = if self.mss_override != 0 {
            self.mss_override.min(derived)
        } else {
            derived
        };
        self.local = local;
        self.remote = remote;
        self.remote_port = remote_port;
        self.interface = Some(interface);
        self.iss = isn;
        self.snd_una = isn;
        self.snd_nxt = isn.wrapping_add(1);
        self.snd_wnd = 0;
        self.peer_mss = default_mss;
        self.ssthresh = u16::MAX as u32;
        self.dup_acks = 0;
        self.fin_sent = false;
        self.fin_received = false;
        self.disconnect_requested = false;
        self.disconnect_notified = false;
        self.retransmit.retries = 0;
        self.transmit_queue.clear();
        self.receive_queue.clear();
    }

    /// Adopt the peer's SYN
    fn synchronize(&mut self, header: &TcpHeader, default_mss: u16) {
        self.irs = header.seq_number;
        self.rcv_nxt = header.seq_number.wrapping_add(1);
        self.peer_mss = header.mss.unwrap_or(default_mss);
        self.snd_wnd = header.window_size as u32;
        self.cwnd = self.send_mss();
    }

    fn send_mss(&self) -> u32 {
        self.local_mss.min(self.peer_mss).max(1) as u32
    }

    fn flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Bytes that may be sent right now
    fn usable_window(&self) -> u32 {
        self.snd_wnd.min(self.cwnd).saturating_sub(self.flight())
    }

    fn receive_window(&self) -> u32 {
        let queued: usize = self.receive_queue.iter().map(|p| p.len()).sum();
        self.options.window_size.saturating_sub(queued as u32)
    }

    fn segment(&self, seq: u32, flags: TcpFlags, data: Option<Packet>) -> OutSegment {
        OutSegment {
            local: self.local,
            remote: self.remote,
            local_port: self.port.unwrap_or(0),
            remote_port: self.remote_port,
            seq,
            ack: if flags.contains(TcpFlags::ACK) { self.rcv_nxt } else { 0 },
            flags,
            window: self.receive_window().min(u16::MAX as u32) as u16,
            mss: flags.contains(TcpFlags::SYN).then_some(self.local_mss),
            data,
            interface: self.interface,
            ttl: Some(self.options.time_to_live),
            tos: self.options.type_of_service,
        }
    }

    fn ack_segment(&self) -> OutSegment {
        self.segment(self.snd_nxt, TcpFlags::ACK, None)
    }

    fn reset_segment(&self) -> OutSegment {
        self.segment(self.snd_nxt, TcpFlags::RST | TcpFlags::ACK, None)
    }

    fn restart_timer(&mut self) {
        self.retransmit.countdown = Some(self.retransmit.timeout());
    }

    /// Grow the congestion window for newly acknowledged data
    fn open_congestion_window(&mut self) {
        let mss = self.send_mss();
        let grown = if self.cwnd < self.ssthresh {
            self.cwnd + mss
        } else {
            self.cwnd + (mss * mss / self.cwnd.max(1)).max(1)
        };
        self.cwnd = grown.min(MAX_CWND);
    }

    /// Start probing a closed peer window unless already probing
    fn persist_start(&mut self) {
        if self.persist.is_none() {
            self.persist_probes = 0;
            self.persist = Some(self.retransmit.rate.max(1));
        }
    }

    fn persist_stop(&mut self) {
        self.persist = None;
        self.persist_probes = 0;
    }

    /// Probe interval, backed off like retransmissions but never giving up
    fn persist_interval(&self) -> u32 {
        let shift = self.persist_probes.saturating_mul(self.retransmit.shift.max(1)).min(31);
        ((self.retransmit.rate.max(1) as u64) << shift).min(self.retransmit.max_timeout.max(1) as u64) as u32
    }

    /// Zero-length segment one below the unacknowledged sequence; the peer
    /// answers with an ACK carrying its current window
    fn window_probe(&self) -> OutSegment {
        self.segment(self.snd_una.wrapping_sub(1), TcpFlags::ACK, None)
    }

    /// Drop acknowledged segments; a partly acknowledged one is trimmed
    fn acknowledge(&mut self, ack: u32) {
        while let Some(front) = self.transmit_queue.front_mut() {
            let end = front.seq.wrapping_add(front.len());
            if seq_le(end, ack) {
                self.transmit_queue.pop_front();
                continue;
            }
            if seq_gt(ack, front.seq) && !front.flags.contains(TcpFlags::SYN) {
                let acked = ack.wrapping_sub(front.seq) as usize;
                if let Some(data) = front.data.as_mut() {
                    let _ = data.strip_front(acked.min(data.len()));
                }
                front.seq = ack;
            }
            break;
        }
        self.snd_una = ack;
    }

    fn fin_acked(&self) -> bool {
        self.fin_sent && self.snd_una == self.snd_nxt
    }

    fn release_queues(&mut self) {
        self.transmit_queue.clear();
        self.receive_queue.clear();
        self.retransmit.countdown = None;
        self.persist_stop();
    }

    /// Forget the connection without telling the peer
    fn abort(&mut self) {
        self.state = TcpState::Closed;
        self.release_queues();
        self.time_wait = 0;
    }

    fn enter_time_wait(&mut self, ticks: u32) {
        self.state = TcpState::TimeWait;
        self.time_wait = ticks.max(1);
        self.transmit_queue.clear();
        self.retransmit.countdown = None;
    }

    fn info(&self) -> TcpSocketInfo {
        TcpSocketInfo {
            packets_queued: self.receive_queue.len(),
            transmit_queue_depth: self.transmit_queue.len(),
            transmit_window: self.snd_wnd,
            receive_window: self.receive_window(),
            congestion_window: self.cwnd,
            state: self.state,
            ..self.stats
        }
    }
}

impl PortBound for Tcb {
    fn port_slot(&mut self) -> &mut Option<u16> {
        &mut self.port
    }
}

/// A connection request waiting for a socket
#[derive(Debug, Clone, Copy)]
struct SynRequest {
    header: TcpHeader,
    source: IpAddr,
    destination: IpAddr,
    interface: Option<usize>,
}

struct Listener {
    port: u16,
    /// Socket that takes the next request
    socket: Option<SocketId>,
    queue: VecDeque<SynRequest>,
    queue_max: usize,
    callback: Option<ListenCallback>,
}

pub(crate) struct TcpLayer {
    sockets: SocketTable<Tcb>,
    listeners: Vec<Listener>,
    first_port: u16,
    next_port: u16,
    isn: u32,
    stats: TcpInfo,
}

impl TcpLayer {
    fn new(config: &IpConfig) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0x2f6b_1e37);
        TcpLayer {
            sockets: SocketTable::new(config.port_table_size),
            listeners: Vec::new(),
            first_port: config.first_ephemeral_port,
            next_port: config.first_ephemeral_port,
            isn: seed,
            stats: TcpInfo::default(),
        }
    }

    fn next_isn(&mut self) -> u32 {
        self.isn = self.isn.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        self.isn
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.sockets.is_bound(port) || self.listeners.iter().any(|l| l.port == port)
    }

    /// Take `id` off its port chain; a freed port goes to the oldest waiter
    fn unbind(&mut self, id: SocketId) -> Option<u16> {
        let port = self.sockets.unbind(id)?;
        self.port_released(port);
        Some(port)
    }

    fn port_released(&mut self, port: u16) {
        if self.port_in_use(port) {
            return;
        }
        if let Some(waiter) = self.sockets.grant_waiter(port) {
            if let Some(tcb) = self.sockets.get(waiter) {
                debug!("tcp {}: waited-for port {} granted", tcb.name, port);
            }
        }
    }

    fn socket(&mut self, id: SocketId) -> Result<&mut Tcb> {
        self.sockets.get_mut(id).ok_or(NxError::NotCreated)
    }

    /// Socket owning the connection a segment belongs to
    fn connection(&self, local_port: u16, remote: IpAddr, remote_port: u16) -> Option<SocketId> {
        self.sockets.bound(local_port).find(|&id| {
            self.sockets.get(id).is_some_and(|t| {
                t.remote == remote && t.remote_port == remote_port && !matches!(t.state, TcpState::Closed | TcpState::Listen)
            })
        })
    }

    /// Reset every connection; returns the RST segments to send
    pub(crate) fn abort_all(&mut self) -> Vec<OutSegment> {
        let mut resets = Vec::new();
        self.sockets.for_each_mut(|_, tcb| {
            if tcb.state.synchronized() && tcb.state != TcpState::TimeWait {
                resets.push(tcb.reset_segment());
            }
            tcb.abort();
            tcb.listen_port = None;
        });
        self.sockets.clear_bindings();
        self.listeners.clear();
        resets
    }
}

/// A segment ready for the IP layer
pub(crate) struct OutSegment {
    local: IpAddr,
    remote: IpAddr,
    local_port: u16,
    remote_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    mss: Option<u16>,
    data: Option<Packet>,
    interface: Option<usize>,
    ttl: Option<u8>,
    tos: u8,
}

impl IpState {
    /// Run `f` with the TCP layer moved out of the instance state
    pub(crate) fn with_tcp<R>(&mut self, f: impl FnOnce(&mut IpState, &mut TcpLayer) -> Result<R>) -> Result<R> {
        let mut tcp = self.tcp.take().ok_or(NxError::NotEnabled)?;
        let result = f(self, &mut tcp);
        self.tcp = Some(tcp);
        result
    }

    /// Build the header, checksum and hand the segment to IP
    pub(crate) fn tcp_segment_output(&mut self, segment: OutSegment) -> Result<()> {
        let mut packet = match segment.data {
            Some(packet) => packet,
            None => self.pool.allocate(TCP_PACKET)?,
        };
        let mut header = TcpHeader::new(
            segment.local_port,
            segment.remote_port,
            segment.seq,
            segment.ack,
            segment.flags,
            segment.window,
        );
        if let Some(mss) = segment.mss {
            header = header.with_mss(mss);
        }
        header.write(packet.prepend(header.data_offset)?);
        let sum = transport_checksum_chain(segment.local, segment.remote, protocol::TCP, packet.len(), packet.buffers());
        BigEndian::write_u16(&mut packet.data_mut()[16..18], sum);

        let mut route = self.route(segment.remote, segment.interface)?;
        route.source = segment.local;
        let mut options = self.datagram_options(segment.remote, protocol::TCP);
        if let (Some(ttl), IpAddr::V4(_)) = (segment.ttl, segment.remote) {
            options.ttl = ttl;
        }
        options.tos = segment.tos;
        self.send_datagram(packet, &route, options)
    }

    /// Send and count; failures leave retransmission to the timer
    fn tcp_emit(&mut self, stats: &mut TcpInfo, segment: OutSegment) {
        let bytes = segment.data.as_ref().map_or(0, |p| p.len() as u64);
        let reset = segment.flags.contains(TcpFlags::RST);
        match self.tcp_segment_output(segment) {
            Ok(()) => {
                stats.packets_sent += 1;
                stats.bytes_sent += bytes;
                if reset {
                    stats.resets_sent += 1;
                }
            }
            Err(e) => debug!("tcp segment not sent: {}", e),
        }
    }

    /// Resend the oldest unacknowledged segment
    fn tcp_retransmit(&mut self, stats: &mut TcpInfo, tcb: &mut Tcb) {
        let Some(front) = tcb.transmit_queue.front() else {
            return;
        };
        let data = match front.data.as_ref().map(|p| p.duplicate(&self.pool, TCP_PACKET)) {
            Some(Ok(copy)) => Some(copy),
            Some(Err(e)) => {
                debug!("retransmit of {} deferred: {}", front.seq, e);
                return;
            }
            None => None,
        };
        let mut flags = front.flags;
        if tcb.state.synchronized() && !flags.contains(TcpFlags::RST) {
            flags |= TcpFlags::ACK;
        }
        let segment = tcb.segment(front.seq, flags, data);
        tcb.stats.retransmit_packets += 1;
        stats.retransmit_packets += 1;
        self.tcp_emit(stats, segment);
    }

    fn tcp_notify(&mut self, id: SocketId, tcb: &Tcb, which: Notify) {
        let slot = match which {
            Notify::Receive => &tcb.notify.receive,
            Notify::WindowUpdate => &tcb.notify.window_update,
            Notify::Disconnect => &tcb.notify.disconnect,
            Notify::DisconnectComplete => &tcb.notify.disconnect_complete,
            Notify::Establish => &tcb.notify.establish,
        };
        if let (Some(notify), Some(ip)) = (slot.clone(), self.handle()) {
            self.defer(move || notify(&TcpSocket::from_parts(ip, id)));
        }
    }

    /// Peer went away: FIN, RST or retransmission ceiling
    fn tcp_peer_disconnected(&mut self, id: SocketId, tcb: &mut Tcb) {
        if !tcb.disconnect_notified {
            tcb.disconnect_notified = true;
            self.tcp_notify(id, tcb, Notify::Disconnect);
        }
    }

    /// Our own disconnect finished
    fn tcp_disconnect_finished(&mut self, id: SocketId, tcb: &mut Tcb, stats: &mut TcpInfo) {
        stats.disconnections += 1;
        if tcb.disconnect_requested {
            tcb.disconnect_requested = false;
            self.tcp_notify(id, tcb, Notify::DisconnectComplete);
        }
    }

    /// Queue and send our FIN
    fn tcp_fin_send(&mut self, stats: &mut TcpInfo, tcb: &mut Tcb) {
        let seq = tcb.snd_nxt;
        let flags = TcpFlags::FIN | TcpFlags::ACK;
        tcb.transmit_queue.push_back(Queued { seq, flags, data: None });
        tcb.snd_nxt = seq.wrapping_add(1);
        tcb.fin_sent = true;
        let segment = tcb.segment(seq, flags, None);
        self.tcp_emit(stats, segment);
        if tcb.retransmit.countdown.is_none() {
            tcb.restart_timer();
        }
    }

    /// Give a listening socket the connection request `syn`
    fn tcp_passive_open(&mut self, tcp: &mut TcpLayer, id: SocketId, syn: SynRequest, callback: Option<ListenCallback>) {
        let isn = tcp.next_isn();
        let default_mss = self.config.tcp_default_mss;
        let Some(tcb) = tcp.sockets.get_mut(id) else {
            return;
        };
        let interface = syn.interface.unwrap_or(0);
        let mtu = self.interface(interface).map_or(1500, |i| i.mtu);
        tcb.open(syn.destination, syn.source, syn.header.src_port, interface, mtu, isn, default_mss);
        tcb.synchronize(&syn.header, default_mss);
        tcb.state = TcpState::SynReceived;

        let flags = TcpFlags::SYN | TcpFlags::ACK;
        tcb.transmit_queue.push_back(Queued { seq: isn, flags, data: None });
        let segment = tcb.segment(isn, flags, None);
        self.tcp_emit(&mut tcp.stats, segment);
        tcb.restart_timer();
        debug!("tcp {}: SYN from {}:{}", tcb.name, syn.source, syn.header.src_port);

        let port = syn.header.dst_port;
        if let (Some(callback), Some(ip)) = (callback, self.handle()) {
            self.defer(move || callback(&TcpSocket::from_parts(ip, id), port));
        }
    }
}

impl Ip {
    pub fn tcp_enable(&self) -> Result<()> {
        self.locked(|s| {
            if s.tcp.is_some() {
                return Err(NxError::AlreadyEnabled);
            }
            s.tcp = Some(TcpLayer::new(&s.config));
            Ok(())
        })
    }

    pub fn tcp_info(&self) -> Result<TcpInfo> {
        self.locked(|s| {
            let tcp = s.tcp.as_ref().ok_or(NxError::NotEnabled)?;
            Ok(TcpInfo {
                created_sockets: tcp.sockets.len(),
                ..tcp.stats
            })
        })
    }

    /// Listen on `port` with `socket` taking the first connection.
    ///
    /// Up to `queue_max` further requests are held until a socket is
    /// handed over with `tcp_server_socket_relisten`; zero selects the
    /// configured default.
    pub fn tcp_server_socket_listen(
        &self,
        port: u16,
        socket: &TcpSocket,
        queue_max: usize,
        callback: Option<ListenCallback>,
    ) -> Result<()> {
        if port == 0 {
            return Err(NxError::InvalidParameters);
        }
        let id = socket.owned_by(self)?;
        self.locked(|s| {
            let queue_max = if queue_max == 0 { s.config.tcp_listen_queue_max } else { queue_max };
            s.with_tcp(|_, tcp| {
                if tcp.listeners.iter().any(|l| l.port == port) {
                    return Err(NxError::DuplicateListen);
                }
                let taken = tcp.sockets.bound(port).any(|other| other != id);
                let tcb = tcp.socket(id)?;
                if tcb.state != TcpState::Closed {
                    return Err(NxError::NotClosed);
                }
                if tcb.port.is_some() {
                    return Err(NxError::AlreadyBound);
                }
                if taken {
                    return Err(NxError::PortUnavailable);
                }
                tcb.state = TcpState::Listen;
                tcb.listen_port = Some(port);
                tcp.sockets.bind(id, port)?;
                tcp.listeners.push(Listener {
                    port,
                    socket: Some(id),
                    queue: VecDeque::new(),
                    queue_max,
                    callback,
                });
                info!("tcp listening on port {}", port);
                Ok(())
            })
        })
    }

    /// Hand `socket` to the listener on `port`.
    ///
    /// A queued connection request is given to it at once.
    pub fn tcp_server_socket_relisten(&self, port: u16, socket: &TcpSocket) -> Result<()> {
        let id = socket.owned_by(self)?;
        self.locked(|s| {
            s.with_tcp(|s, tcp| {
                let pos = tcp
                    .listeners
                    .iter()
                    .position(|l| l.port == port)
                    .ok_or(NxError::NotEnabled)?;
                let current = tcp.listeners[pos].socket;
                if current.is_some_and(|c| c != id && tcp.sockets.get(c).is_some_and(|t| t.state == TcpState::Listen)) {
                    return Err(NxError::AlreadyBound);
                }
                let tcb = tcp.socket(id)?;
                if tcb.state != TcpState::Closed {
                    return Err(NxError::NotClosed);
                }
                if tcb.port.is_some_and(|p| p != port) {
                    return Err(NxError::AlreadyBound);
                }
                tcb.state = TcpState::Listen;
                tcb.listen_port = Some(port);
                if tcb.port.is_none() {
                    tcp.sockets.bind(id, port)?;
                }

                let listener = &mut tcp.listeners[pos];
                match listener.queue.pop_front() {
                    Some(syn) => {
                        listener.socket = None;
                        let callback = listener.callback.clone();
                        s.tcp_passive_open(tcp, id, syn, callback);
                    }
                    None => listener.socket = Some(id),
                }
                Ok(())
            })
        })
    }

    /// Stop listening on `port`; queued requests are dropped
    pub fn tcp_server_socket_unlisten(&self, port: u16) -> Result<()> {
        self.locked(|s| {
            s.with_tcp(|_, tcp| {
                let pos = tcp
                    .listeners
                    .iter()
                    .position(|l| l.port == port)
                    .ok_or(NxError::EntryNotFound)?;
                let listener = tcp.listeners.remove(pos);
                if let Some(id) = listener.socket {
                    let idle = tcp.sockets.get_mut(id).filter(|t| t.state == TcpState::Listen);
                    if let Some(tcb) = idle {
                        tcb.state = TcpState::Closed;
                        tcb.listen_port = None;
                        tcp.sockets.unbind(id);
                    }
                }
                tcp.port_released(port);
                debug!("tcp unlisten {}, {} requests dropped", port, listener.queue.len());
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_compare_wraps() {
        assert!(seq_lt(u32::MAX, 1));
        assert!(seq_gt(1, u32::MAX));
        assert!(seq_le(5, 5));
        assert!(!seq_lt(5, 5));
    }

    #[test]
    fn test_retransmit_timeout_backs_off_to_ceiling() {
        let mut retransmit = Retransmit {
            rate: 10,
            max_timeout: 640,
            max_retries: 10,
            shift: 1,
            retries: 0,
            countdown: None,
        };
        let timeouts: Vec<u32> = (0..9)
            .map(|r| {
                retransmit.retries = r;
                retransmit.timeout()
            })
            .collect();
        assert_eq!(timeouts, vec![10, 20, 40, 80, 160, 320, 640, 640, 640]);
        retransmit.retries = 200;
        assert_eq!(retransmit.timeout(), 640);
    }

    #[test]
    fn test_congestion_window_capped() {
        let mut tcb = Tcb::new("cwnd", TcpOptions::default(), &IpConfig::default());
        let mss = tcb.send_mss();
        tcb.ssthresh = u32::MAX;
        tcb.cwnd = mss;
        tcb.open_congestion_window();
        assert_eq!(tcb.cwnd, 2 * mss);

        tcb.cwnd = MAX_CWND - 1;
        tcb.open_congestion_window();
        assert_eq!(tcb.cwnd, MAX_CWND);

        tcb.ssthresh = 0;
        for _ in 0..1000 {
            tcb.open_congestion_window();
        }
        assert_eq!(tcb.cwnd, MAX_CWND);
    }

    #[test]
    fn test_queued_length_counts_control_flags() {
        let syn = Queued {
            seq: 0,
            flags: TcpFlags::SYN,
            data: None,
        };
        let fin = Queued {
            seq: 0,
            flags: TcpFlags::FIN | TcpFlags::ACK,
            data: None,
        };
        assert_eq!(syn.len(), 1);
        assert_eq!(fin.len(), 1);
    }
}
