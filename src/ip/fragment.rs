//! IPv4 reassembly
//!
//! Fragments are grouped by (source, destination, id, protocol). A datagram
//! is complete once the last fragment has been seen and the pieces cover
//! every byte up to it; the fragments are then linked into one packet chain
//! without copying. Incomplete datagrams are released after
//! `fragment_timeout` periodic ticks; when every slot is busy the oldest
//! partial datagram makes room.

use std::net::Ipv4Addr;

use log::{debug, trace};

use crate::error::{NxError, Result};
use crate::ip::{Ip, IpState};
use crate::network::Ipv4Header;
use crate::packet::Packet;

type Key = (Ipv4Addr, Ipv4Addr, u16, u8);

struct Partial {
    key: Key,
    /// (byte offset, fragment payload)
    pieces: Vec<(usize, Packet)>,
    /// Payload length, known once the last fragment arrived
    total: Option<usize>,
    age: u32,
}

impl Partial {
    fn complete(&mut self) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        self.pieces.sort_by_key(|(offset, _)| *offset);
        let mut covered = 0;
        for (offset, piece) in &self.pieces {
            if *offset > covered {
                return false;
            }
            covered = covered.max(offset + piece.len());
        }
        covered >= total
    }
}

pub(crate) struct Reassembly {
    partials: Vec<Partial>,
    capacity: usize,
    timeout: u32,
}

impl Reassembly {
    pub(crate) fn new(capacity: usize, timeout: u32) -> Self {
        Reassembly {
            partials: Vec::new(),
            capacity: capacity.max(1),
            timeout,
        }
    }

    /// Slot for `key` and whether an older partial datagram was evicted to
    /// make room for it
    fn slot(&mut self, key: Key) -> (usize, bool) {
        if let Some(pos) = self.partials.iter().position(|p| p.key == key) {
            return (pos, false);
        }
        let mut evicted = false;
        if self.partials.len() >= self.capacity {
            if let Some(oldest) = (0..self.partials.len()).max_by_key(|&i| self.partials[i].age) {
                let partial = self.partials.remove(oldest);
                debug!("reassembly of id {} evicted", partial.key.2);
                evicted = true;
            }
        }
        self.partials.push(Partial {
            key,
            pieces: Vec::new(),
            total: None,
            age: 0,
        });
        (self.partials.len() - 1, evicted)
    }
}

impl IpState {
    /// Add a fragment; returns the whole payload once every piece is present
    pub(crate) fn reassemble(&mut self, packet: Packet, header: &Ipv4Header) -> Option<Packet> {
        let reassembly = self.reassembly.as_mut()?;
        let key = (header.src_addr, header.dst_addr, header.id, header.protocol);
        let offset = header.fragment_offset();
        let (pos, evicted) = reassembly.slot(key);
        if evicted {
            self.stats.receive_packets_dropped += 1;
        }
        let partial = &mut reassembly.partials[pos];
        if !header.more_fragments() {
            partial.total = Some(offset + packet.len());
        }
        partial.pieces.retain(|(o, _)| *o != offset);
        partial.pieces.push((offset, packet));
        trace!("fragment id {} offset {} stored", header.id, offset);
        if !partial.complete() {
            return None;
        }

        // pieces are sorted by offset once complete
        let partial = reassembly.partials.remove(pos);
        let total = partial.total.unwrap_or(0);
        let mut whole: Option<Packet> = None;
        let mut covered = 0;
        for (offset, mut piece) in partial.pieces {
            let end = (offset + piece.len()).min(total);
            if end <= covered {
                continue;
            }
            if offset < covered && piece.strip_front(covered - offset).is_err() {
                continue;
            }
            piece.truncate(end - covered.max(offset));
            covered = end;
            match whole.as_mut() {
                Some(head) => head.chain_append(piece),
                None => whole = Some(piece),
            }
        }
        trace!("datagram id {} reassembled, {} bytes", header.id, total);
        whole
    }

    pub(crate) fn reassembly_periodic(&mut self) {
        let Some(reassembly) = self.reassembly.as_mut() else {
            return;
        };
        let timeout = reassembly.timeout;
        let before = reassembly.partials.len();
        for partial in reassembly.partials.iter_mut() {
            partial.age += 1;
        }
        reassembly.partials.retain(|p| p.age < timeout);
        let expired = before - reassembly.partials.len();
        if expired > 0 {
            debug!("{} incomplete datagrams timed out", expired);
            self.stats.receive_packets_dropped += expired as u64;
        }
    }
}

impl Ip {
    /// Enable fragmentation of oversize output and reassembly of input
    pub fn fragment_enable(&self) -> Result<()> {
        self.locked(|s| {
            if s.reassembly.is_some() {
                return Err(NxError::AlreadyEnabled);
            }
            s.reassembly = Some(Reassembly::new(s.config.max_reassemblies, s.config.fragment_timeout));
            Ok(())
        })
    }

    /// Disable fragmentation; partially reassembled datagrams are released
    pub fn fragment_disable(&self) -> Result<()> {
        self.locked(|s| s.reassembly.take().map(|_| ()).ok_or(NxError::NotEnabled))
    }
}
