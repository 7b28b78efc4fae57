//! IPv6 neighbor cache (RFC 4861 section 7.3)
//!
//! A flat table of `nd_cache_size` slots scanned linearly. Like the ARP cache
//! this is pure bookkeeping: it returns packets to send and solicitations to
//! emit, and the caller does the transmitting.

use std::collections::VecDeque;
use std::net::Ipv6Addr;

use log::debug;

use crate::error::{NxError, Result};
use crate::network::MacAddress;
use crate::packet::Packet;

/// Reachability state of a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdState {
    Empty,
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
}

pub(crate) struct NdEntry {
    pub(crate) state: NdState,
    pub(crate) is_static: bool,
    pub(crate) ip: Ipv6Addr,
    pub(crate) mac: Option<MacAddress>,
    pub(crate) interface: usize,
    pub(crate) solicitations: u32,
    pub(crate) timer: u32,
    pub(crate) queue: VecDeque<Packet>,
    stamp: u64,
}

impl NdEntry {
    fn empty() -> Self {
        NdEntry {
            state: NdState::Empty,
            is_static: false,
            ip: Ipv6Addr::UNSPECIFIED,
            mac: None,
            interface: 0,
            solicitations: 0,
            timer: 0,
            queue: VecDeque::new(),
            stamp: 0,
        }
    }

    fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        *self = NdEntry::empty();
        dropped
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NdParams {
    pub max_queue_depth: usize,
    pub max_multicast_solicit: u32,
    pub max_unicast_solicit: u32,
    pub retrans_timer: u32,
    pub reachable_time: u32,
    pub delay_first_probe: u32,
}

pub(crate) enum NdLookup {
    Resolved(MacAddress, Packet),
    /// Queued; a multicast solicitation must go out if asked
    Pending { solicit: bool },
}

/// Solicitation the periodic pass must transmit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NdProbe {
    Multicast { ip: Ipv6Addr, interface: usize },
    Unicast { ip: Ipv6Addr, mac: MacAddress, interface: usize },
}

/// Packets released when a neighbor became known
pub(crate) struct NdDrained {
    pub mac: MacAddress,
    pub interface: usize,
    pub packets: Vec<Packet>,
}

pub(crate) struct NdCache {
    entries: Vec<NdEntry>,
    params: NdParams,
    clock: u64,
    pub(crate) packets_dropped: u64,
}

impl NdCache {
    pub(crate) fn new(size: usize, params: NdParams) -> Self {
        NdCache {
            entries: (0..size).map(|_| NdEntry::empty()).collect(),
            params,
            clock: 0,
            packets_dropped: 0,
        }
    }

    fn tick_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn find(&self, ip: Ipv6Addr) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.state != NdState::Empty && e.ip == ip)
    }

    pub(crate) fn entry(&self, idx: usize) -> &NdEntry {
        &self.entries[idx]
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.state != NdState::Empty).count()
    }

    fn oldest(&self, pred: impl Fn(&NdEntry) -> bool) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state != NdState::Empty && !e.is_static && pred(e))
            .min_by_key(|(_, e)| e.stamp)
            .map(|(idx, _)| idx)
    }

    /// Empty slot, else the oldest stale neighbor, else the oldest resolved one
    fn allocate(&mut self, ip: Ipv6Addr, interface: usize) -> Result<usize> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.state == NdState::Empty)
            .or_else(|| self.oldest(|e| e.state == NdState::Stale))
            .or_else(|| self.oldest(|e| e.state != NdState::Incomplete))
            .ok_or(NxError::NoMoreEntries)?;
        self.release(idx);
        let stamp = self.tick_stamp();
        let entry = &mut self.entries[idx];
        entry.ip = ip;
        entry.interface = interface;
        entry.stamp = stamp;
        Ok(idx)
    }

    fn release(&mut self, idx: usize) {
        self.packets_dropped += self.entries[idx].clear() as u64;
    }

    fn enqueue(&mut self, idx: usize, packet: Packet) {
        let depth = self.params.max_queue_depth;
        let entry = &mut self.entries[idx];
        entry.queue.push_back(packet);
        while entry.queue.len() > depth {
            entry.queue.pop_front();
            self.packets_dropped += 1;
        }
    }

    fn drained(&mut self, idx: usize) -> Option<NdDrained> {
        let entry = &mut self.entries[idx];
        let mac = entry.mac?;
        Some(NdDrained {
            mac,
            interface: entry.interface,
            packets: entry.queue.drain(..).collect(),
        })
    }

    pub(crate) fn resolve(&mut self, ip: Ipv6Addr, interface: usize, packet: Packet) -> Result<NdLookup> {
        if let Some(idx) = self.find(ip) {
            let delay = self.params.delay_first_probe;
            let entry = &mut self.entries[idx];
            return match (entry.state, entry.mac) {
                (NdState::Incomplete, _) | (_, None) => {
                    self.enqueue(idx, packet);
                    Ok(NdLookup::Pending { solicit: false })
                }
                (NdState::Stale, Some(mac)) if !entry.is_static => {
                    entry.state = NdState::Delay;
                    entry.timer = delay;
                    Ok(NdLookup::Resolved(mac, packet))
                }
                (_, Some(mac)) => Ok(NdLookup::Resolved(mac, packet)),
            };
        }
        let idx = self.allocate(ip, interface)?;
        let retrans = self.params.retrans_timer;
        let entry = &mut self.entries[idx];
        entry.state = NdState::Incomplete;
        entry.solicitations = 1;
        entry.timer = retrans;
        self.enqueue(idx, packet);
        Ok(NdLookup::Pending { solicit: true })
    }

    /// Apply a Neighbor Advertisement for `ip`
    pub(crate) fn advertisement(
        &mut self,
        ip: Ipv6Addr,
        mac: Option<MacAddress>,
        solicited: bool,
        override_flag: bool,
    ) -> Option<NdDrained> {
        let idx = self.find(ip)?;
        let reachable = self.params.reachable_time;
        let stamp = self.tick_stamp();
        let entry = &mut self.entries[idx];
        if entry.is_static {
            return None;
        }
        if entry.state == NdState::Incomplete {
            entry.mac = Some(mac?);
            entry.state = if solicited {
                NdState::Reachable
            } else {
                NdState::Stale
            };
            entry.timer = reachable;
            entry.stamp = stamp;
            debug!("nd: {} resolved to {:?}", ip, entry.mac);
            return self.drained(idx);
        }
        let changed = mac.is_some() && mac != entry.mac;
        if !override_flag && changed {
            if entry.state == NdState::Reachable {
                entry.state = NdState::Stale;
            }
            return None;
        }
        if let Some(mac) = mac {
            entry.mac = Some(mac);
        }
        entry.stamp = stamp;
        if solicited {
            entry.state = NdState::Reachable;
            entry.timer = reachable;
            entry.solicitations = 0;
        } else if changed {
            entry.state = NdState::Stale;
        }
        self.drained(idx)
    }

    /// Learn the sender of a Neighbor Solicitation
    pub(crate) fn solicitation_learn(&mut self, ip: Ipv6Addr, mac: MacAddress, interface: usize) -> Option<NdDrained> {
        let idx = match self.find(ip) {
            Some(idx) if self.entries[idx].is_static => return None,
            Some(idx) => idx,
            None => self.allocate(ip, interface).ok()?,
        };
        let stamp = self.tick_stamp();
        let entry = &mut self.entries[idx];
        if entry.mac != Some(mac) || entry.state == NdState::Empty || entry.state == NdState::Incomplete {
            entry.mac = Some(mac);
            entry.state = NdState::Stale;
        }
        entry.interface = interface;
        entry.stamp = stamp;
        self.drained(idx)
    }

    /// Create or overwrite a permanent entry
    pub(crate) fn set_static(&mut self, ip: Ipv6Addr, mac: MacAddress, interface: usize) -> Result<NdDrained> {
        let idx = match self.find(ip) {
            Some(idx) => idx,
            None => self.allocate(ip, interface)?,
        };
        let entry = &mut self.entries[idx];
        entry.is_static = true;
        entry.state = NdState::Reachable;
        entry.mac = Some(mac);
        entry.interface = interface;
        entry.timer = 0;
        Ok(NdDrained {
            mac,
            interface,
            packets: entry.queue.drain(..).collect(),
        })
    }

    pub(crate) fn delete(&mut self, ip: Ipv6Addr) -> Result<()> {
        let idx = self.find(ip).ok_or(NxError::EntryNotFound)?;
        self.release(idx);
        Ok(())
    }

    /// Clear the whole table
    pub(crate) fn invalidate(&mut self) {
        for idx in 0..self.entries.len() {
            self.release(idx);
        }
    }

    /// Delete exactly the entries bound to `interface`
    pub(crate) fn interface_entries_delete(&mut self, interface: usize) -> usize {
        let mut deleted = 0;
        for idx in 0..self.entries.len() {
            let entry = &self.entries[idx];
            if entry.state != NdState::Empty && entry.interface == interface {
                self.release(idx);
                deleted += 1;
            }
        }
        deleted
    }

    pub(crate) fn hardware_address_find(&self, ip: Ipv6Addr) -> Option<MacAddress> {
        self.find(ip).and_then(|idx| self.entries[idx].mac)
    }

    pub(crate) fn ip_address_find(&self, mac: MacAddress) -> Option<Ipv6Addr> {
        self.entries
            .iter()
            .find(|e| e.state != NdState::Empty && e.mac == Some(mac))
            .map(|e| e.ip)
    }

    /// One periodic pass over the dynamic entries
    pub(crate) fn age_tick(&mut self) -> Vec<NdProbe> {
        let p = self.params;
        let mut probes = Vec::new();
        for idx in 0..self.entries.len() {
            let entry = &mut self.entries[idx];
            if entry.is_static || entry.state == NdState::Empty || entry.state == NdState::Stale {
                continue;
            }
            if entry.timer > 0 {
                entry.timer -= 1;
            }
            if entry.timer > 0 {
                continue;
            }
            match entry.state {
                NdState::Incomplete if entry.solicitations >= p.max_multicast_solicit => {
                    debug!("nd: {} unresolved, dropping {} packets", entry.ip, entry.queue.len());
                    self.release(idx);
                }
                NdState::Incomplete => {
                    entry.solicitations += 1;
                    entry.timer = p.retrans_timer;
                    probes.push(NdProbe::Multicast {
                        ip: entry.ip,
                        interface: entry.interface,
                    });
                }
                NdState::Reachable => entry.state = NdState::Stale,
                NdState::Delay => {
                    entry.state = NdState::Probe;
                    entry.solicitations = 1;
                    entry.timer = p.retrans_timer;
                    if let Some(mac) = entry.mac {
                        probes.push(NdProbe::Unicast {
                            ip: entry.ip,
                            mac,
                            interface: entry.interface,
                        });
                    }
                }
                NdState::Probe if entry.solicitations >= p.max_unicast_solicit => {
                    debug!("nd: {} unreachable", entry.ip);
                    self.release(idx);
                }
                NdState::Probe => {
                    entry.solicitations += 1;
                    entry.timer = p.retrans_timer;
                    if let Some(mac) = entry.mac {
                        probes.push(NdProbe::Unicast {
                            ip: entry.ip,
                            mac,
                            interface: entry.interface,
                        });
                    }
                }
                NdState::Empty | NdState::Stale => {}
            }
        }
        probes
    }
}
