//! Fast periodic TCP timers: retransmission, window probes and TIME_WAIT

use log::{debug, warn};

use super::{TcpLayer, TcpState};
use crate::ip::IpState;

impl IpState {
    /// One fast tick
    pub(crate) fn tcp_fast_pass(&mut self) {
        let _ = self.with_tcp(|s, tcp| {
            s.tcp_timers(tcp);
            Ok(())
        });
    }

    fn tcp_timers(&mut self, tcp: &mut TcpLayer) {
        for id in tcp.sockets.ids() {
            let Some(tcb) = tcp.sockets.get_mut(id) else {
                continue;
            };
            if tcb.state == TcpState::TimeWait {
                tcb.time_wait = tcb.time_wait.saturating_sub(1);
                if tcb.time_wait == 0 {
                    debug!("tcp {}: TIME_WAIT over", tcb.name);
                    tcb.abort();
                }
                continue;
            }
            if let Some(ticks) = tcb.persist {
                if tcb.snd_wnd != 0 || !tcb.state.synchronized() {
                    tcb.persist_stop();
                } else if ticks > 1 {
                    tcb.persist = Some(ticks - 1);
                } else {
                    debug!("tcp {}: probing zero window of {}", tcb.name, tcb.remote);
                    let segment = tcb.window_probe();
                    self.tcp_emit(&mut tcp.stats, segment);
                    tcb.persist_probes += 1;
                    tcb.persist = Some(tcb.persist_interval());
                }
            }
            let Some(countdown) = tcb.retransmit.countdown else {
                continue;
            };
            if countdown > 1 {
                tcb.retransmit.countdown = Some(countdown - 1);
                continue;
            }

            tcb.retransmit.retries += 1;
            if tcb.retransmit.retries > tcb.retransmit.max_retries {
                warn!(
                    "tcp {}: no answer from {}:{} after {} retries, connection dropped",
                    tcb.name, tcb.remote, tcb.remote_port, tcb.retransmit.max_retries
                );
                if tcb.state.synchronized() {
                    let segment = tcb.reset_segment();
                    self.tcp_emit(&mut tcp.stats, segment);
                }
                tcp.stats.connections_dropped += 1;
                tcb.abort();
                tcb.retransmit.retries = 0;
                self.tcp_peer_disconnected(id, tcb);
                continue;
            }

            let mss = tcb.send_mss();
            tcb.ssthresh = (tcb.flight() / 2).max(2 * mss);
            tcb.cwnd = mss;
            tcb.dup_acks = 0;
            self.tcp_retransmit(&mut tcp.stats, tcb);
            tcb.retransmit.countdown = Some(tcb.retransmit.timeout());
        }
    }
}
