//! Packet pool and move-only packet buffers
//!
//! A pool preallocates a fixed number of equally sized buffers. Allocation
//! hands out a `Packet` that owns its buffer exclusively; dropping the packet
//! is the release and returns the buffer to the free list. Packets are never
//! shared: queues, sockets and drivers pass them by value.
//!
//! Data larger than one buffer travels as a chain. Headers always live in
//! the first buffer; `len` counts the whole chain while `data` only covers
//! the first buffer.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{NxError, Result};

/// Headroom reserved for the link header
pub const PHYSICAL_HEADER: usize = 16;
/// Headroom for a packet handed to the IP layer
pub const IP_PACKET: usize = PHYSICAL_HEADER + 40;
/// Headroom for a UDP payload
pub const UDP_PACKET: usize = IP_PACKET + 8;
/// Headroom for a TCP payload
pub const TCP_PACKET: usize = IP_PACKET + 20;
/// Headroom for an ICMP payload
pub const ICMP_PACKET: usize = IP_PACKET + 8;

struct PoolShared {
    name: String,
    payload_size: usize,
    total: usize,
    free: spin::Mutex<Vec<Vec<u8>>>,
    empty_requests: AtomicU64,
}

/// Fixed-count pool of packet buffers
#[derive(Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    pub total_packets: usize,
    pub free_packets: usize,
    pub empty_pool_requests: u64,
}

impl core::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketPool")
            .field("name", &self.shared.name)
            .field("payload_size", &self.shared.payload_size)
            .field("free", &self.available())
            .finish()
    }
}

impl PacketPool {
    /// Create a pool of `count` buffers of `payload_size` bytes each
    pub fn new(name: &str, payload_size: usize, count: usize) -> Self {
        let free = (0..count).map(|_| vec![0u8; payload_size]).collect();
        PacketPool {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                payload_size,
                total: count,
                free: spin::Mutex::new(free),
                empty_requests: AtomicU64::new(0),
            }),
        }
    }

    /// Take a buffer with `headroom` bytes reserved in front of the data
    pub fn allocate(&self, headroom: usize) -> Result<Packet> {
        if headroom > self.shared.payload_size {
            return Err(NxError::InvalidParameters);
        }
        let buf = self.shared.free.lock().pop();
        match buf {
            Some(buf) => Ok(Packet {
                buf,
                start: headroom,
                end: headroom,
                meta: PacketMeta::default(),
                pool: Some(self.shared.clone()),
                next: None,
            }),
            None => {
                self.shared.empty_requests.fetch_add(1, Ordering::Relaxed);
                Err(NxError::NoPacket)
            }
        }
    }

    /// Allocate and fill with `data`
    pub fn allocate_with(&self, headroom: usize, data: &[u8]) -> Result<Packet> {
        let mut packet = self.allocate(headroom)?;
        packet.append(data)?;
        Ok(packet)
    }

    /// Fill as many buffers as `data` needs, chained behind the first
    pub fn allocate_chain(&self, headroom: usize, data: &[u8]) -> Result<Packet> {
        let mut head = self.allocate(headroom)?;
        let first = data.len().min(head.tailroom());
        head.append(&data[..first])?;
        let mut rest = &data[first..];
        while !rest.is_empty() {
            let mut buffer = self.allocate(0)?;
            let n = rest.len().min(buffer.tailroom());
            if n == 0 {
                return Err(NxError::InvalidParameters);
            }
            buffer.append(&rest[..n])?;
            head.chain_append(buffer);
            rest = &rest[n..];
        }
        Ok(head)
    }

    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    pub fn payload_size(&self) -> usize {
        self.shared.payload_size
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            total_packets: self.shared.total,
            free_packets: self.available(),
            empty_pool_requests: self.shared.empty_requests.load(Ordering::Relaxed),
        }
    }
}

/// Addressing information recorded on receive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// Interface the packet arrived on or leaves through
    pub interface: Option<usize>,
    /// Source address of the datagram
    pub source: Option<IpAddr>,
    /// Destination address of the datagram
    pub destination: Option<IpAddr>,
    /// Transport source port, zero when not applicable
    pub source_port: u16,
    /// Transport protocol or IPv6 next header
    pub protocol: u8,
}

/// A buffer, or chain of buffers, owned by exactly one holder at a time
pub struct Packet {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    pool: Option<Arc<PoolShared>>,
    next: Option<Box<Packet>>,
    pub meta: PacketMeta,
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("buffers", &self.buffers().count())
            .field("headroom", &self.start)
            .field("meta", &self.meta)
            .finish()
    }
}

impl Packet {
    /// Bytes held in the first buffer
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    fn head_len(&self) -> usize {
        self.end - self.start
    }

    /// Length of the whole chain
    pub fn len(&self) -> usize {
        self.head_len() + self.next.as_ref().map_or(0, |next| next.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_chained(&self) -> bool {
        self.next.is_some()
    }

    /// Data of every buffer in chain order
    pub fn buffers(&self) -> impl Iterator<Item = &[u8]> {
        core::iter::successors(Some(self), |p| p.next.as_deref()).map(|p| p.data())
    }

    /// Link `tail` behind the last buffer; its metadata is discarded
    pub fn chain_append(&mut self, tail: Packet) {
        match self.next.as_mut() {
            Some(next) => next.chain_append(tail),
            None => self.next = Some(Box::new(tail)),
        }
    }

    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Free space behind the data of the last buffer
    pub fn tailroom(&self) -> usize {
        match self.next {
            Some(ref next) => next.tailroom(),
            None => self.buf.len() - self.end,
        }
    }

    /// Append bytes after the current data
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(next) = self.next.as_mut() {
            return next.append(bytes);
        }
        if bytes.len() > self.tailroom() {
            return Err(NxError::Overflow);
        }
        self.buf[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }

    /// Grow the data by `len` bytes at the front and return the new region
    pub fn prepend(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > self.start {
            return Err(NxError::Underflow);
        }
        self.start -= len;
        Ok(&mut self.buf[self.start..self.start + len])
    }

    /// Drop `len` bytes from the front (consumed header); headers never
    /// span buffers
    pub fn strip_front(&mut self, len: usize) -> Result<()> {
        if len > self.head_len() {
            return Err(NxError::PacketOffsetError);
        }
        self.start += len;
        Ok(())
    }

    /// Drop `len` bytes of data from the front of the chain; buffers that
    /// end up empty go back to the pool
    pub fn trim_front(&mut self, mut len: usize) -> Result<()> {
        if len > self.len() {
            return Err(NxError::PacketOffsetError);
        }
        while len >= self.head_len() {
            let Some(next) = self.next.take() else {
                break;
            };
            len -= self.head_len();
            let meta = self.meta;
            drop(core::mem::replace(self, *next));
            self.meta = meta;
        }
        self.start += len;
        Ok(())
    }

    /// Shorten the chain to `len` bytes, releasing buffers no longer needed
    pub fn truncate(&mut self, len: usize) {
        let head = self.head_len();
        if len <= head {
            self.end = self.start + len;
            self.next = None;
        } else if let Some(next) = self.next.as_mut() {
            next.truncate(len - head);
        }
    }

    /// Copy out data starting at `offset`, returning the number of bytes copied
    pub fn data_extract_offset(&self, offset: usize, out: &mut [u8]) -> Result<usize> {
        if offset > self.len() {
            return Err(NxError::PacketOffsetError);
        }
        let mut skip = offset;
        let mut copied = 0;
        for buffer in self.buffers() {
            if copied == out.len() {
                break;
            }
            if skip >= buffer.len() {
                skip -= buffer.len();
                continue;
            }
            let avail = &buffer[skip..];
            skip = 0;
            let n = avail.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&avail[..n]);
            copied += n;
        }
        Ok(copied)
    }

    /// Copy the whole payload; `out` must be large enough
    pub fn data_retrieve(&self, out: &mut [u8]) -> Result<usize> {
        let len = self.len();
        if out.len() < len {
            return Err(NxError::Overflow);
        }
        self.data_extract_offset(0, &mut out[..len])
    }

    /// The whole chain as one contiguous vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for buffer in self.buffers() {
            out.extend_from_slice(buffer);
        }
        out
    }

    /// Copy the data into fresh buffers from `pool`
    pub(crate) fn duplicate(&self, pool: &PacketPool, headroom: usize) -> Result<Packet> {
        let mut copy = match self.next {
            None => pool.allocate_with(headroom, self.data())?,
            Some(_) => pool.allocate_chain(headroom, &self.to_vec())?,
        };
        copy.meta = self.meta;
        Ok(copy)
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.free.lock().push(core::mem::take(&mut self.buf));
        }
    }
}
