//! Transport layer protocols implementation
//!
//! This module contains implementations for transport layer protocols:
//! - TCP: connection state machine, retransmission and congestion control
//! - UDP: datagram sockets with per-socket receive queues
//! - Raw: IP datagrams of protocols the stack does not handle itself
//!
//! Socket state lives in the owning IP instance, inside a `SocketTable`.
//! Application handles carry the slot index plus a generation, so a handle
//! to a deleted socket is recognized instead of aliasing its successor.
//!
//! The table threads two kinds of rings through its slots: one ring of every
//! created socket in creation order, and one ring per port hash bucket
//! holding the bound sockets. Sockets waiting for a busy port queue up in
//! arrival order and are handed the port when its last holder lets go.

pub mod raw;
pub mod tcp;
pub mod udp;

use std::collections::VecDeque;

use crate::error::{NxError, Result};
use crate::ring::{Chained, Link, Ring};

pub use tcp::{TcpHeader, TcpInfo, TcpOptions, TcpSendError, TcpSocket, TcpSocketInfo, TcpState};
pub use udp::{UdpHeader, UdpInfo, UdpOptions, UdpSocket, UdpSocketInfo};

/// Slot index plus the generation it was allocated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SocketId {
    index: usize,
    generation: u32,
}

/// Sockets whose bound port the table keeps in step with its chains
pub(crate) trait PortBound {
    fn port_slot(&mut self) -> &mut Option<u16>;
}

/// Chain marker: created-socket ring
pub(crate) struct Created;
/// Chain marker: bound-port bucket
pub(crate) struct Bound;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
    port: Option<u16>,
    created: Link,
    bound: Link,
}

impl<T> Chained<Created> for Slot<T> {
    fn link(&self) -> &Link {
        &self.created
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.created
    }
}

impl<T> Chained<Bound> for Slot<T> {
    fn link(&self) -> &Link {
        &self.bound
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.bound
    }
}

/// Socket storage with generation-checked handles and bound-port chains
pub(crate) struct SocketTable<T> {
    slots: Vec<Slot<T>>,
    created: Ring<Created>,
    ports: Vec<Ring<Bound>>,
    /// Sockets waiting for a busy port, oldest first
    bind_waiters: VecDeque<(SocketId, u16)>,
}

impl<T: PortBound> SocketTable<T> {
    /// `buckets` is rounded up to a power of two
    pub(crate) fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        SocketTable {
            slots: Vec::new(),
            created: Ring::new(),
            ports: (0..buckets).map(|_| Ring::new()).collect(),
            bind_waiters: VecDeque::new(),
        }
    }

    fn bucket(&self, port: u16) -> usize {
        let port = port as usize;
        (port + (port >> 8)) & (self.ports.len() - 1)
    }

    fn slot(&self, id: SocketId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index)
            .filter(|s| s.generation == id.generation && s.value.is_some())
    }

    fn id_at(&self, index: usize) -> SocketId {
        SocketId {
            index,
            generation: self.slots[index].generation,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> SocketId {
        let index = match self.slots.iter().position(|s| s.value.is_none()) {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation = slot.generation.wrapping_add(1);
                slot.value = Some(value);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                    port: None,
                    created: Link::default(),
                    bound: Link::default(),
                });
                self.slots.len() - 1
            }
        };
        self.created.push_back(&mut self.slots, index);
        self.id_at(index)
    }

    pub(crate) fn get(&self, id: SocketId) -> Option<&T> {
        self.slot(id).and_then(|s| s.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: SocketId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Take the socket out of the table, unbinding it first
    pub(crate) fn remove(&mut self, id: SocketId) -> Option<T> {
        self.slot(id)?;
        self.unbind(id);
        self.cancel_wait(id);
        self.created.unlink(&mut self.slots, id.index);
        self.slots[id.index].value.take()
    }

    /// Ids in creation order, for callers that mutate while walking
    pub(crate) fn ids(&self) -> Vec<SocketId> {
        self.created
            .iter(&self.slots)
            .map(|index| self.id_at(index))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.created.len()
    }

    /// Put `id` on the chain of `port`
    pub(crate) fn bind(&mut self, id: SocketId, port: u16) -> Result<()> {
        let slot = self.slot(id).ok_or(NxError::NotCreated)?;
        if slot.port.is_some() {
            return Err(NxError::AlreadyBound);
        }
        let bucket = self.bucket(port);
        self.ports[bucket].push_back(&mut self.slots, id.index);
        let slot = &mut self.slots[id.index];
        slot.port = Some(port);
        if let Some(value) = slot.value.as_mut() {
            *value.port_slot() = Some(port);
        }
        Ok(())
    }

    /// Take `id` off its port chain, returning the port it held
    pub(crate) fn unbind(&mut self, id: SocketId) -> Option<u16> {
        let port = self.slot(id)?.port?;
        let bucket = self.bucket(port);
        self.ports[bucket].unlink(&mut self.slots, id.index);
        let slot = &mut self.slots[id.index];
        slot.port = None;
        if let Some(value) = slot.value.as_mut() {
            *value.port_slot() = None;
        }
        Some(port)
    }

    /// Sockets bound to `port`, in bind order
    pub(crate) fn bound(&self, port: u16) -> impl Iterator<Item = SocketId> + '_ {
        self.ports[self.bucket(port)]
            .iter(&self.slots)
            .filter(move |&index| self.slots[index].port == Some(port))
            .map(move |index| self.id_at(index))
    }

    pub(crate) fn is_bound(&self, port: u16) -> bool {
        self.bound(port).next().is_some()
    }

    /// Queue `id` behind earlier waiters for `port`
    pub(crate) fn wait_for_port(&mut self, id: SocketId, port: u16) {
        if !self.is_waiting(id) {
            self.bind_waiters.push_back((id, port));
        }
    }

    pub(crate) fn is_waiting(&self, id: SocketId) -> bool {
        self.bind_waiters.iter().any(|(w, _)| *w == id)
    }

    pub(crate) fn cancel_wait(&mut self, id: SocketId) -> bool {
        let before = self.bind_waiters.len();
        self.bind_waiters.retain(|(w, _)| *w != id);
        self.bind_waiters.len() != before
    }

    /// Bind the oldest waiter for `port`; the caller has checked the port
    /// is free
    pub(crate) fn grant_waiter(&mut self, port: u16) -> Option<SocketId> {
        let pos = self.bind_waiters.iter().position(|(_, p)| *p == port)?;
        let (id, _) = self.bind_waiters.remove(pos)?;
        self.bind(id, port).ok()?;
        Some(id)
    }

    /// Unbind every socket and forget every waiter
    pub(crate) fn clear_bindings(&mut self) {
        for id in self.ids() {
            self.unbind(id);
        }
        self.bind_waiters.clear();
    }
}

impl<T> SocketTable<T> {
    /// Run `f` on every socket in creation order
    pub(crate) fn for_each_mut(&mut self, mut f: impl FnMut(SocketId, &mut T)) {
        let order = self.created.indices(&self.slots);
        for index in order {
            let slot = &mut self.slots[index];
            let id = SocketId {
                index,
                generation: slot.generation,
            };
            if let Some(value) = slot.value.as_mut() {
                f(id, value);
            }
        }
    }
}

/// Next free port at or after `*next`, wrapping within `first..=u16::MAX`
pub(crate) fn ephemeral_port(first: u16, next: &mut u16, in_use: impl Fn(u16) -> bool) -> Option<u16> {
    let span = (u16::MAX - first) as u32 + 1;
    if *next < first {
        *next = first;
    }
    for _ in 0..span {
        let candidate = *next;
        *next = if candidate == u16::MAX { first } else { candidate + 1 };
        if !in_use(candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sock {
        name: &'static str,
        port: Option<u16>,
    }

    impl PortBound for Sock {
        fn port_slot(&mut self) -> &mut Option<u16> {
            &mut self.port
        }
    }

    fn sock(name: &'static str) -> Sock {
        Sock { name, port: None }
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut table = SocketTable::new(4);
        let a = table.insert(sock("a"));
        assert_eq!(table.remove(a).map(|s| s.name), Some("a"));
        let b = table.insert(sock("b"));
        assert_eq!(a.index, b.index);
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b).map(|s| s.name), Some("b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_iteration_follows_creation_order() {
        let mut table = SocketTable::new(4);
        let a = table.insert(sock("a"));
        table.insert(sock("b"));
        table.remove(a);
        table.insert(sock("c"));
        let names: Vec<_> = table.ids().into_iter().map(|id| table.get(id).unwrap().name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_bound_chain_shares_bucket() {
        let mut table = SocketTable::new(4);
        let a = table.insert(sock("a"));
        let b = table.insert(sock("b"));
        let c = table.insert(sock("c"));
        // 80 and 84 hash to the same bucket of four
        table.bind(a, 80).unwrap();
        table.bind(b, 84).unwrap();
        table.bind(c, 80).unwrap();
        assert_eq!(table.bind(c, 81), Err(NxError::AlreadyBound));
        assert_eq!(table.get(a).unwrap().port, Some(80));
        assert_eq!(table.bound(80).collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(table.bound(84).collect::<Vec<_>>(), vec![b]);

        assert_eq!(table.unbind(a), Some(80));
        assert_eq!(table.get(a).unwrap().port, None);
        assert!(table.is_bound(80));
        table.remove(c);
        assert!(!table.is_bound(80));
        assert_eq!(table.unbind(a), None);
    }

    #[test]
    fn test_waiters_granted_in_arrival_order() {
        let mut table = SocketTable::new(8);
        let owner = table.insert(sock("owner"));
        let first = table.insert(sock("first"));
        let second = table.insert(sock("second"));
        table.bind(owner, 53).unwrap();
        table.wait_for_port(second, 53);
        table.wait_for_port(first, 53);
        table.wait_for_port(second, 53);

        table.unbind(owner);
        assert_eq!(table.grant_waiter(53), Some(second));
        assert_eq!(table.get(second).unwrap().port, Some(53));
        assert!(table.is_waiting(first));

        assert!(table.cancel_wait(first));
        assert_eq!(table.grant_waiter(53), None);
    }

    #[test]
    fn test_ephemeral_port_wraps_and_skips_used() {
        let mut next = u16::MAX;
        assert_eq!(ephemeral_port(0xFFFE, &mut next, |p| p == 0xFFFE), Some(u16::MAX));
        assert_eq!(ephemeral_port(0xFFFE, &mut next, |p| p == u16::MAX), Some(0xFFFE));
        assert_eq!(ephemeral_port(0xFFFE, &mut next, |_| true), None);
    }
}
