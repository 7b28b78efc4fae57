//! Segment arrival processing

use std::net::IpAddr;

use log::{debug, trace};

use super::{seq_gt, seq_le, seq_lt, Notify, OutSegment, SynRequest, TcpFlags, TcpHeader, TcpLayer, TcpState};
use crate::ip::IpState;
use crate::network::{protocol, transport_checksum_chain};
use crate::packet::Packet;
use crate::transport::SocketId;

/// Parsed arrival, header already stripped from the payload packet
struct Arrival {
    header: TcpHeader,
    source: IpAddr,
    destination: IpAddr,
    interface: Option<usize>,
    payload: usize,
}

impl IpState {
    pub(crate) fn tcp_receive(&mut self, packet: Packet) {
        let _ = self.with_tcp(|s, tcp| {
            s.tcp_segment_receive(tcp, packet);
            Ok(())
        });
    }

    fn tcp_segment_receive(&mut self, tcp: &mut TcpLayer, mut packet: Packet) {
        let (Some(source), Some(destination)) = (packet.meta.source, packet.meta.destination) else {
            tcp.stats.invalid_packets += 1;
            return;
        };
        let Some(header) = TcpHeader::from_bytes(packet.data()) else {
            tcp.stats.invalid_packets += 1;
            return;
        };
        if transport_checksum_chain(source, destination, protocol::TCP, packet.len(), packet.buffers()) != 0 {
            tcp.stats.checksum_errors += 1;
            return;
        }
        let unicast = match destination {
            IpAddr::V4(d) => !d.is_broadcast() && !d.is_multicast(),
            IpAddr::V6(d) => !d.is_multicast(),
        };
        if !unicast || packet.strip_front(header.data_offset).is_err() {
            tcp.stats.invalid_packets += 1;
            return;
        }
        let arrival = Arrival {
            header,
            source,
            destination,
            interface: packet.meta.interface,
            payload: packet.len(),
        };
        tcp.stats.packets_received += 1;
        tcp.stats.bytes_received += arrival.payload as u64;
        packet.meta.source_port = header.src_port;
        packet.meta.protocol = protocol::TCP;

        if let Some(id) = tcp.connection(header.dst_port, source, header.src_port) {
            self.tcp_connection_input(tcp, id, arrival, packet);
            return;
        }
        if header.is_rst() {
            return;
        }
        if header.is_syn() && !header.is_ack() {
            if let Some(pos) = tcp.listeners.iter().position(|l| l.port == header.dst_port) {
                self.tcp_listen_input(tcp, pos, &arrival);
                return;
            }
        }
        trace!("tcp: no connection for port {}, reset", header.dst_port);
        tcp.stats.receive_packets_dropped += 1;
        self.tcp_reset_reply(tcp, &arrival);
    }

    /// Answer a segment nobody owns with RST
    fn tcp_reset_reply(&mut self, tcp: &mut TcpLayer, arrival: &Arrival) {
        let header = &arrival.header;
        let (seq, ack, flags) = if header.is_ack() {
            (header.ack_number, 0, TcpFlags::RST)
        } else {
            let len = arrival.payload as u32 + header.is_syn() as u32 + header.is_fin() as u32;
            (0, header.seq_number.wrapping_add(len), TcpFlags::RST | TcpFlags::ACK)
        };
        let segment = OutSegment {
            local: arrival.destination,
            remote: arrival.source,
            local_port: header.dst_port,
            remote_port: header.src_port,
            seq,
            ack,
            flags,
            window: 0,
            mss: None,
            data: None,
            interface: arrival.interface,
            ttl: None,
            tos: 0,
        };
        self.tcp_emit(&mut tcp.stats, segment);
    }

    fn tcp_listen_input(&mut self, tcp: &mut TcpLayer, pos: usize, arrival: &Arrival) {
        let syn = SynRequest {
            header: arrival.header,
            source: arrival.source,
            destination: arrival.destination,
            interface: arrival.interface,
        };
        let listener = &mut tcp.listeners[pos];
        let ready = listener
            .socket
            .filter(|id| tcp.sockets.get(*id).is_some_and(|t| t.state == TcpState::Listen));
        match ready {
            Some(id) => {
                listener.socket = None;
                let callback = listener.callback.clone();
                self.tcp_passive_open(tcp, id, syn, callback);
            }
            None => {
                let duplicate = listener
                    .queue
                    .iter()
                    .any(|q| q.source == syn.source && q.header.src_port == syn.header.src_port);
                if duplicate {
                    return;
                }
                if listener.queue.len() < listener.queue_max {
                    trace!("tcp: SYN for port {} queued", listener.port);
                    listener.queue.push_back(syn);
                } else {
                    debug!("tcp: listen queue of port {} full", listener.port);
                    tcp.stats.receive_packets_dropped += 1;
                }
            }
        }
    }

    fn tcp_syn_sent_input(&mut self, tcp: &mut TcpLayer, id: SocketId, arrival: &Arrival) {
        let default_mss = self.config.tcp_default_mss;
        let Some(tcb) = tcp.sockets.get_mut(id) else {
            return;
        };
        let header = &arrival.header;
        if header.is_ack() && (seq_le(header.ack_number, tcb.iss) || seq_gt(header.ack_number, tcb.snd_nxt)) {
            if !header.is_rst() {
                let segment = tcb.segment(header.ack_number, TcpFlags::RST, None);
                self.tcp_emit(&mut tcp.stats, segment);
            }
            return;
        }
        if header.is_rst() {
            if header.is_ack() {
                debug!("tcp {}: connection refused", tcb.name);
                tcp.stats.resets_received += 1;
                tcb.abort();
                self.tcp_peer_disconnected(id, tcb);
            }
            return;
        }
        if !header.is_syn() {
            return;
        }
        tcb.synchronize(header, default_mss);
        if header.is_ack() {
            tcb.acknowledge(header.ack_number);
            tcb.retransmit.retries = 0;
            tcb.retransmit.countdown = None;
            tcb.state = TcpState::Established;
            tcp.stats.connections += 1;
            debug!("tcp {}: established", tcb.name);
            let segment = tcb.ack_segment();
            self.tcp_emit(&mut tcp.stats, segment);
            self.tcp_notify(id, tcb, Notify::Establish);
        } else {
            // simultaneous open
            tcb.state = TcpState::SynReceived;
            let flags = TcpFlags::SYN | TcpFlags::ACK;
            if let Some(front) = tcb.transmit_queue.front_mut() {
                front.flags = flags;
            }
            let segment = tcb.segment(tcb.iss, flags, None);
            self.tcp_emit(&mut tcp.stats, segment);
        }
    }

    fn tcp_connection_input(&mut self, tcp: &mut TcpLayer, id: SocketId, arrival: Arrival, mut packet: Packet) {
        let state = match tcp.sockets.get(id) {
            Some(tcb) => tcb.state,
            None => return,
        };
        if state == TcpState::SynSent {
            self.tcp_syn_sent_input(tcp, id, &arrival);
            return;
        }
        let time_wait_ticks = self.config.tcp_time_wait_ticks;
        let Some(tcb) = tcp.sockets.get_mut(id) else {
            return;
        };
        let header = arrival.header;

        if header.is_rst() {
            if header.seq_number == tcb.rcv_nxt {
                debug!("tcp {}: reset by peer in {:?}", tcb.name, tcb.state);
                tcp.stats.resets_received += 1;
                tcb.abort();
                self.tcp_peer_disconnected(id, tcb);
            }
            return;
        }

        if header.is_syn() {
            let retransmitted = header.seq_number == tcb.irs;
            if tcb.state == TcpState::SynReceived && retransmitted && !header.is_ack() {
                let segment = tcb.segment(tcb.iss, TcpFlags::SYN | TcpFlags::ACK, None);
                self.tcp_emit(&mut tcp.stats, segment);
                return;
            }
            if !(tcb.state == TcpState::SynReceived && retransmitted) {
                let segment = tcb.ack_segment();
                self.tcp_emit(&mut tcp.stats, segment);
                return;
            }
        }

        let occupies = arrival.payload > 0 || header.is_fin();
        if !occupies && !header.is_syn() && seq_lt(header.seq_number, tcb.rcv_nxt) {
            trace!("tcp {}: window probe", tcb.name);
            let segment = tcb.ack_segment();
            self.tcp_emit(&mut tcp.stats, segment);
            return;
        }
        let expected = if header.is_syn() {
            header.seq_number.wrapping_add(1)
        } else {
            header.seq_number
        };
        if occupies && expected != tcb.rcv_nxt {
            trace!("tcp {}: out of order segment {} (want {})", tcb.name, expected, tcb.rcv_nxt);
            tcp.stats.receive_packets_dropped += 1;
            let segment = tcb.ack_segment();
            self.tcp_emit(&mut tcp.stats, segment);
            return;
        }
        if !header.is_ack() {
            return;
        }

        let ack = header.ack_number;
        if tcb.state == TcpState::SynReceived {
            if seq_gt(ack, tcb.snd_una) && seq_le(ack, tcb.snd_nxt) {
                tcb.state = TcpState::Established;
                tcp.stats.connections += 1;
                debug!("tcp {}: established", tcb.name);
                if header.is_syn() {
                    let segment = tcb.ack_segment();
                    self.tcp_emit(&mut tcp.stats, segment);
                }
                self.tcp_notify(id, tcb, Notify::Establish);
            } else {
                let segment = tcb.segment(ack, TcpFlags::RST, None);
                self.tcp_emit(&mut tcp.stats, segment);
                return;
            }
        }
        if seq_gt(ack, tcb.snd_nxt) {
            let segment = tcb.ack_segment();
            self.tcp_emit(&mut tcp.stats, segment);
            return;
        }

        let window = header.window_size as u32;
        let mss = tcb.send_mss();
        if seq_gt(ack, tcb.snd_una) {
            tcb.acknowledge(ack);
            tcb.open_congestion_window();
            tcb.dup_acks = 0;
            tcb.retransmit.retries = 0;
            if tcb.transmit_queue.is_empty() {
                tcb.retransmit.countdown = None;
            } else {
                tcb.restart_timer();
            }
        } else if ack == tcb.snd_una && !occupies && window == tcb.snd_wnd && !tcb.transmit_queue.is_empty() {
            tcb.dup_acks += 1;
            if tcb.dup_acks == 3 {
                debug!("tcp {}: fast retransmit of {}", tcb.name, tcb.snd_una);
                tcb.ssthresh = (tcb.flight() / 2).max(2 * mss);
                tcb.cwnd = tcb.ssthresh + 3 * mss;
                self.tcp_retransmit(&mut tcp.stats, tcb);
            }
        }
        if window != tcb.snd_wnd {
            let opened = window > tcb.snd_wnd;
            tcb.snd_wnd = window;
            if opened {
                tcb.persist_stop();
                self.tcp_notify(id, tcb, Notify::WindowUpdate);
            }
        }

        if tcb.fin_acked() {
            match tcb.state {
                TcpState::FinWait1 => tcb.state = TcpState::FinWait2,
                TcpState::Closing => {
                    tcb.enter_time_wait(time_wait_ticks);
                    self.tcp_disconnect_finished(id, tcb, &mut tcp.stats);
                }
                TcpState::LastAck => {
                    debug!("tcp {}: closed", tcb.name);
                    tcb.abort();
                    self.tcp_disconnect_finished(id, tcb, &mut tcp.stats);
                    return;
                }
                _ => {}
            }
        }

        let mut ack_needed = false;
        if arrival.payload > 0 {
            let accepting = matches!(
                tcb.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            );
            if !accepting {
                return;
            }
            if arrival.payload as u32 > tcb.receive_window() || tcb.receive_queue.len() >= tcb.receive_queue_max {
                trace!("tcp {}: no room for {} bytes", tcb.name, arrival.payload);
                tcp.stats.receive_packets_dropped += 1;
                let segment = tcb.ack_segment();
                self.tcp_emit(&mut tcp.stats, segment);
                return;
            }
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(arrival.payload as u32);
            tcb.stats.packets_received += 1;
            tcb.stats.bytes_received += arrival.payload as u64;
            packet.truncate(arrival.payload);
            tcb.receive_queue.push_back(packet);
            self.tcp_notify(id, tcb, Notify::Receive);
            ack_needed = true;
        }

        if header.is_fin() {
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
            tcb.fin_received = true;
            ack_needed = true;
            match tcb.state {
                TcpState::SynReceived | TcpState::Established => {
                    debug!("tcp {}: peer closed", tcb.name);
                    tcb.state = TcpState::CloseWait;
                    self.tcp_peer_disconnected(id, tcb);
                }
                TcpState::FinWait1 => {
                    tcb.state = TcpState::Closing;
                    self.tcp_peer_disconnected(id, tcb);
                }
                TcpState::FinWait2 => {
                    tcb.enter_time_wait(time_wait_ticks);
                    self.tcp_disconnect_finished(id, tcb, &mut tcp.stats);
                }
                _ => {}
            }
        }
        if ack_needed {
            let segment = tcb.ack_segment();
            self.tcp_emit(&mut tcp.stats, segment);
        }
    }
}
