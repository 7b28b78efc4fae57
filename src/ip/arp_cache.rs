//! IPv4 address resolution cache
//!
//! Entries live in a fixed arena sized when ARP is enabled. Every entry is on
//! exactly one pool ring selected by its kind:
//!
//! - `free`: unused entries
//! - `dynamic`: learned entries in LRU order, head = least recently resolved
//! - `statics`: configured entries, never aged and never evicted
//!
//! Active entries are also on the circular chain of their hash bucket
//! `(addr + (addr >> 8)) & mask`, so lookups only walk one short chain. An
//! address appears at most once among the active entries.
//!
//! The cache is a plain data structure: it never talks to a driver. Methods
//! return what must be transmitted (queued packets, requests to send) and the
//! caller performs the I/O.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use log::{debug, trace};

use crate::error::{NxError, Result};
use crate::network::MacAddress;
use crate::packet::Packet;
use crate::ring::{Chained, Link, Ring};

/// Which pool ring an entry is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpEntryKind {
    Free,
    Dynamic,
    Static,
}

struct Bucket;
struct Pool;

pub(crate) struct ArpEntry {
    bucket: Link,
    pool: Link,
    pub(crate) ip: Ipv4Addr,
    /// None while the entry is unresolved
    pub(crate) mac: Option<MacAddress>,
    pub(crate) interface: usize,
    pub(crate) kind: ArpEntryKind,
    pub(crate) queue: VecDeque<Packet>,
    pub(crate) retries: u32,
    pub(crate) update_countdown: u32,
    pub(crate) expiration: u32,
}

impl ArpEntry {
    fn vacant() -> Self {
        ArpEntry {
            bucket: Link::default(),
            pool: Link::default(),
            ip: Ipv4Addr::UNSPECIFIED,
            mac: None,
            interface: 0,
            kind: ArpEntryKind::Free,
            queue: VecDeque::new(),
            retries: 0,
            update_countdown: 0,
            expiration: 0,
        }
    }
}

impl Chained<Bucket> for ArpEntry {
    fn link(&self) -> &Link {
        &self.bucket
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.bucket
    }
}

impl Chained<Pool> for ArpEntry {
    fn link(&self) -> &Link {
        &self.pool
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.pool
    }
}

/// Timing and bounds of the cache
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArpParams {
    pub update_rate: u32,
    pub expiration_rate: u32,
    pub max_retries: u32,
    pub max_queue_depth: usize,
    pub evict: bool,
}

/// Counters kept by the cache
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ArpStats {
    pub requests_sent: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub responses_received: u64,
    pub aged_entries: u64,
    pub invalid_messages: u64,
    pub packets_dropped: u64,
}

/// Outcome of resolving a next hop
pub(crate) enum ArpLookup {
    /// Transmit now
    Resolved(MacAddress, Packet),
    /// Queued on an unresolved entry; a request must go out if asked
    Pending { send_request: bool },
}

/// Request the periodic pass must transmit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArpProbe {
    pub ip: Ipv4Addr,
    pub interface: usize,
}

/// Packets released by a resolution, to be sent to `mac`
pub(crate) struct Drained {
    pub mac: MacAddress,
    pub interface: usize,
    pub packets: Vec<Packet>,
}

pub(crate) struct ArpCache {
    entries: Vec<ArpEntry>,
    buckets: Vec<Ring<Bucket>>,
    mask: usize,
    free: Ring<Pool>,
    dynamic: Ring<Pool>,
    statics: Ring<Pool>,
    params: ArpParams,
    pub(crate) stats: ArpStats,
}

impl ArpCache {
    /// `buckets` must be a power of two
    pub(crate) fn new(capacity: usize, buckets: usize, params: ArpParams) -> Result<Self> {
        if capacity == 0 || buckets == 0 || !buckets.is_power_of_two() {
            return Err(NxError::InvalidParameters);
        }
        let mut entries: Vec<ArpEntry> = (0..capacity).map(|_| ArpEntry::vacant()).collect();
        let mut free = Ring::new();
        for idx in 0..capacity {
            free.push_back(&mut entries, idx);
        }
        Ok(ArpCache {
            entries,
            buckets: (0..buckets).map(|_| Ring::new()).collect(),
            mask: buckets - 1,
            free,
            dynamic: Ring::new(),
            statics: Ring::new(),
            params,
            stats: ArpStats::default(),
        })
    }

    fn bucket_of(&self, ip: Ipv4Addr) -> usize {
        let addr = u32::from(ip);
        (addr.wrapping_add(addr >> 8) as usize) & self.mask
    }

    pub(crate) fn find(&self, ip: Ipv4Addr) -> Option<usize> {
        let bucket = &self.buckets[self.bucket_of(ip)];
        bucket.iter(&self.entries).find(|&idx| self.entries[idx].ip == ip)
    }

    pub(crate) fn entry(&self, idx: usize) -> &ArpEntry {
        &self.entries[idx]
    }

    pub(crate) fn dynamic_count(&self) -> usize {
        self.dynamic.len()
    }

    pub(crate) fn static_count(&self) -> usize {
        self.statics.len()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    fn pool_unlink(&mut self, idx: usize) {
        match self.entries[idx].kind {
            ArpEntryKind::Free => self.free.unlink(&mut self.entries, idx),
            ArpEntryKind::Dynamic => self.dynamic.unlink(&mut self.entries, idx),
            ArpEntryKind::Static => self.statics.unlink(&mut self.entries, idx),
        }
    }

    fn pool_push(&mut self, idx: usize, kind: ArpEntryKind) {
        self.entries[idx].kind = kind;
        match kind {
            ArpEntryKind::Free => self.free.push_back(&mut self.entries, idx),
            ArpEntryKind::Dynamic => self.dynamic.push_back(&mut self.entries, idx),
            ArpEntryKind::Static => self.statics.push_back(&mut self.entries, idx),
        }
    }

    /// Return an active entry to the free ring, releasing its queued packets
    fn release(&mut self, idx: usize) {
        let bucket = self.bucket_of(self.entries[idx].ip);
        self.buckets[bucket].unlink(&mut self.entries, idx);
        self.pool_unlink(idx);
        let entry = &mut self.entries[idx];
        self.stats.packets_dropped += entry.queue.len() as u64;
        entry.queue.clear();
        entry.mac = None;
        entry.ip = Ipv4Addr::UNSPECIFIED;
        entry.retries = 0;
        entry.update_countdown = 0;
        entry.expiration = 0;
        self.pool_push(idx, ArpEntryKind::Free);
    }

    /// Take an entry for `ip`, evicting the least recently resolved dynamic
    /// entry when none is free
    fn allocate(&mut self, ip: Ipv4Addr, interface: usize, kind: ArpEntryKind) -> Result<usize> {
        let idx = match self.free.head() {
            Some(idx) => idx,
            None if self.params.evict => match self.dynamic.head() {
                Some(victim) => {
                    debug!("arp: evicting {} for {}", self.entries[victim].ip, ip);
                    self.release(victim);
                    victim
                }
                None => return Err(NxError::NoMoreEntries),
            },
            None => return Err(NxError::NoMoreEntries),
        };
        self.free.unlink(&mut self.entries, idx);
        {
            let entry = &mut self.entries[idx];
            entry.ip = ip;
            entry.interface = interface;
            entry.mac = None;
            entry.retries = 0;
            entry.update_countdown = 0;
            entry.expiration = 0;
        }
        let bucket = self.bucket_of(ip);
        self.buckets[bucket].push_back(&mut self.entries, idx);
        self.pool_push(idx, kind);
        Ok(idx)
    }

    fn enqueue(&mut self, idx: usize, packet: Packet) {
        let depth = self.params.max_queue_depth;
        let entry = &mut self.entries[idx];
        entry.queue.push_back(packet);
        while entry.queue.len() > depth {
            entry.queue.pop_front();
            self.stats.packets_dropped += 1;
        }
    }

    fn drain(&mut self, idx: usize) -> Vec<Packet> {
        self.entries[idx].queue.drain(..).collect()
    }

    /// Resolve `ip` for `packet`, creating an unresolved entry on a miss
    pub(crate) fn resolve(&mut self, ip: Ipv4Addr, interface: usize, packet: Packet) -> Result<ArpLookup> {
        if let Some(idx) = self.find(ip) {
            return match self.entries[idx].mac {
                Some(mac) => Ok(ArpLookup::Resolved(mac, packet)),
                None => {
                    self.enqueue(idx, packet);
                    Ok(ArpLookup::Pending { send_request: false })
                }
            };
        }
        let idx = self.allocate(ip, interface, ArpEntryKind::Dynamic)?;
        self.entries[idx].update_countdown = self.params.update_rate;
        self.enqueue(idx, packet);
        trace!("arp: {} unresolved, queued", ip);
        Ok(ArpLookup::Pending { send_request: true })
    }

    /// Record `ip` at `mac` from network traffic.
    ///
    /// Static entries are left alone. A missing entry is created only when
    /// `create` is set. Returns the packets that were waiting on the address.
    pub(crate) fn learn(&mut self, ip: Ipv4Addr, mac: MacAddress, interface: usize, create: bool) -> Option<Drained> {
        let idx = match self.find(ip) {
            Some(idx) if self.entries[idx].kind == ArpEntryKind::Static => return None,
            Some(idx) => {
                self.dynamic.unlink(&mut self.entries, idx);
                self.dynamic.push_back(&mut self.entries, idx);
                idx
            }
            None if create => self.allocate(ip, interface, ArpEntryKind::Dynamic).ok()?,
            None => return None,
        };
        let expiration = self.params.expiration_rate;
        let entry = &mut self.entries[idx];
        entry.mac = Some(mac);
        entry.interface = interface;
        entry.retries = 0;
        entry.update_countdown = 0;
        entry.expiration = expiration;
        Some(Drained {
            mac,
            interface,
            packets: self.drain(idx),
        })
    }

    /// Pin `ip` to `mac`, promoting a dynamic entry with its queue intact
    pub(crate) fn bind_static(&mut self, ip: Ipv4Addr, mac: MacAddress, interface: usize) -> Result<Drained> {
        let idx = match self.find(ip) {
            Some(idx) => {
                if self.entries[idx].kind == ArpEntryKind::Dynamic {
                    self.dynamic.unlink(&mut self.entries, idx);
                    self.pool_push(idx, ArpEntryKind::Static);
                }
                idx
            }
            None => self.allocate(ip, interface, ArpEntryKind::Static)?,
        };
        let entry = &mut self.entries[idx];
        entry.mac = Some(mac);
        entry.interface = interface;
        entry.retries = 0;
        entry.update_countdown = 0;
        entry.expiration = 0;
        Ok(Drained {
            mac,
            interface,
            packets: self.drain(idx),
        })
    }

    /// Remove the static entry for `ip`; `mac` must match
    pub(crate) fn delete_static(&mut self, ip: Ipv4Addr, mac: MacAddress) -> Result<()> {
        match self.find(ip) {
            Some(idx)
                if self.entries[idx].kind == ArpEntryKind::Static
                    && self.entries[idx].mac == Some(mac) =>
            {
                self.release(idx);
                Ok(())
            }
            _ => Err(NxError::EntryNotFound),
        }
    }

    pub(crate) fn delete_static_all(&mut self) -> usize {
        let doomed = self.statics.indices(&self.entries);
        for &idx in &doomed {
            self.release(idx);
        }
        doomed.len()
    }

    /// Drop every dynamic entry along with its queued packets
    pub(crate) fn invalidate_dynamic(&mut self) -> usize {
        let doomed = self.dynamic.indices(&self.entries);
        for &idx in &doomed {
            self.release(idx);
        }
        doomed.len()
    }

    /// Remove the entry for `ip` whatever its kind
    pub(crate) fn delete(&mut self, ip: Ipv4Addr) -> Result<()> {
        let idx = self.find(ip).ok_or(NxError::EntryNotFound)?;
        self.release(idx);
        Ok(())
    }

    /// Remove every entry learned or configured on `interface`
    pub(crate) fn interface_purge(&mut self, interface: usize) -> usize {
        let mut doomed = self.dynamic.indices(&self.entries);
        doomed.extend(self.statics.indices(&self.entries));
        doomed.retain(|&idx| self.entries[idx].interface == interface);
        for &idx in &doomed {
            self.release(idx);
        }
        doomed.len()
    }

    pub(crate) fn hardware_address_find(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.find(ip).and_then(|idx| self.entries[idx].mac)
    }

    pub(crate) fn ip_address_find(&self, mac: MacAddress) -> Option<Ipv4Addr> {
        self.statics
            .iter(&self.entries)
            .chain(self.dynamic.iter(&self.entries))
            .find(|&idx| self.entries[idx].mac == Some(mac))
            .map(|idx| self.entries[idx].ip)
    }

    /// One periodic pass over the dynamic entries.
    ///
    /// Returns the requests to retransmit. Unresolved entries that used up
    /// their retries are purged with their queued packets.
    pub(crate) fn age_tick(&mut self) -> Vec<ArpProbe> {
        let mut probes = Vec::new();
        for idx in self.dynamic.indices(&self.entries) {
            let params = self.params;
            let entry = &mut self.entries[idx];
            match entry.mac {
                None => {
                    if entry.update_countdown > 0 {
                        entry.update_countdown -= 1;
                    }
                    if entry.update_countdown > 0 {
                        continue;
                    }
                    if entry.retries >= params.max_retries {
                        debug!(
                            "arp: {} unresolved after {} retries, dropping {} packets",
                            entry.ip,
                            entry.retries,
                            entry.queue.len()
                        );
                        self.release(idx);
                        continue;
                    }
                    entry.retries += 1;
                    entry.update_countdown = params.update_rate;
                    probes.push(ArpProbe {
                        ip: entry.ip,
                        interface: entry.interface,
                    });
                }
                Some(_) if entry.expiration > 0 => {
                    entry.expiration -= 1;
                    if entry.expiration == 0 {
                        entry.mac = None;
                        entry.retries = 0;
                        entry.update_countdown = params.update_rate;
                        self.stats.aged_entries += 1;
                        probes.push(ArpProbe {
                            ip: entry.ip,
                            interface: entry.interface,
                        });
                    }
                }
                Some(_) => {}
            }
        }
        probes
    }
}
