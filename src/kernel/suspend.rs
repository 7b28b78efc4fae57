//! Threads parked on a correlation key
//!
//! A `SuspensionList` keeps its waiters on a circular list in insertion order.
//! Registration happens while the caller still holds the IP mutex, so a reply
//! processed right after the mutex is released always finds the waiter. The
//! calling thread then parks on its own slot without holding any lock.
//!
//! Removal is the only synchronisation point: whoever unlinks a waiter under
//! the list lock owns its completion. A timeout that finds its node already
//! unlinked knows a resume is in flight and waits for the result instead of
//! unlinking a second time.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

use crate::error::{NxError, Result};
use crate::kernel::WaitOption;
use crate::ring::{Chained, Link, Ring};

struct Suspended;

struct Waiter<T> {
    result: Mutex<Option<Result<T>>>,
    cond: Condvar,
}

impl<T> Waiter<T> {
    fn new() -> Self {
        Waiter {
            result: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<T>) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(result);
        self.cond.notify_one();
    }

    fn wait_forever(&self) -> Result<T> {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// `None` when the deadline passed without a result
    fn wait_until(&self, deadline: Instant) -> Option<Result<T>> {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}

struct Node<T> {
    link: Link,
    key: u32,
    waiter: Option<Arc<Waiter<T>>>,
}

impl<T> Chained<Suspended> for Node<T> {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

struct Parked<T> {
    nodes: Vec<Node<T>>,
    vacant: Vec<usize>,
    ring: Ring<Suspended>,
}

impl<T> Parked<T> {
    fn take(&mut self, idx: usize) -> Option<Arc<Waiter<T>>> {
        self.ring.unlink(&mut self.nodes, idx);
        self.vacant.push(idx);
        self.nodes[idx].waiter.take()
    }
}

/// Waiters keyed by a correlation value, resumed first-match-first
pub struct SuspensionList<T> {
    inner: spin::Mutex<Parked<T>>,
}

impl<T> Default for SuspensionList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SuspensionList<T> {
    pub fn new() -> Self {
        SuspensionList {
            inner: spin::Mutex::new(Parked {
                nodes: Vec::new(),
                vacant: Vec::new(),
                ring: Ring::new(),
            }),
        }
    }

    /// Number of parked waiters
    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of the parked waiters in insertion order
    pub fn keys(&self) -> Vec<u32> {
        let parked = self.inner.lock();
        parked
            .ring
            .iter(&parked.nodes)
            .map(|idx| parked.nodes[idx].key)
            .collect()
    }

    /// Park a new waiter tagged with `key` at the tail
    pub fn register(self: &Arc<Self>, key: u32) -> WaitHandle<T> {
        let waiter = Arc::new(Waiter::new());
        let mut parked = self.inner.lock();
        let slot = match parked.vacant.pop() {
            Some(slot) => {
                parked.nodes[slot].key = key;
                parked.nodes[slot].waiter = Some(waiter.clone());
                slot
            }
            None => {
                parked.nodes.push(Node {
                    link: Link::default(),
                    key,
                    waiter: Some(waiter.clone()),
                });
                parked.nodes.len() - 1
            }
        };
        let Parked { nodes, ring, .. } = &mut *parked;
        ring.push_back(nodes, slot);
        drop(parked);
        WaitHandle {
            list: self.clone(),
            waiter,
            slot,
        }
    }

    /// Resume the first waiter whose key satisfies `matches`.
    ///
    /// Gives `result` back when nobody matched.
    pub fn resume_first<F>(&self, matches: F, result: Result<T>) -> core::result::Result<(), Result<T>>
    where
        F: Fn(u32) -> bool,
    {
        let waiter = {
            let mut parked = self.inner.lock();
            let found = parked
                .ring
                .iter(&parked.nodes)
                .find(|&idx| matches(parked.nodes[idx].key));
            match found {
                Some(idx) => parked.take(idx),
                None => None,
            }
        };
        match waiter {
            Some(waiter) => {
                waiter.complete(result);
                Ok(())
            }
            None => Err(result),
        }
    }

    /// Resume the oldest waiter regardless of key
    pub fn resume_one(&self, result: Result<T>) -> core::result::Result<(), Result<T>> {
        self.resume_first(|_| true, result)
    }

    /// Resume every waiter, each with a result produced by `make`
    pub fn resume_all<F>(&self, mut make: F) -> usize
    where
        F: FnMut() -> Result<T>,
    {
        let waiters: Vec<Arc<Waiter<T>>> = {
            let mut parked = self.inner.lock();
            let mut taken = Vec::new();
            while let Some(head) = parked.ring.head() {
                if let Some(waiter) = parked.take(head) {
                    taken.push(waiter);
                }
            }
            taken
        };
        let count = waiters.len();
        for waiter in waiters {
            waiter.complete(make());
        }
        count
    }

    /// Unlink `waiter` if it is still parked at `slot`.
    ///
    /// Returns false when a resume got there first.
    fn cleanup(&self, slot: usize, waiter: &Arc<Waiter<T>>) -> bool {
        let mut parked = self.inner.lock();
        let still_parked = parked.nodes[slot]
            .waiter
            .as_ref()
            .is_some_and(|w| Arc::ptr_eq(w, waiter));
        if still_parked {
            parked.take(slot);
        }
        still_parked
    }
}

/// A registered waiter, consumed by `wait`
pub struct WaitHandle<T> {
    list: Arc<SuspensionList<T>>,
    waiter: Arc<Waiter<T>>,
    slot: usize,
}

impl<T> WaitHandle<T> {
    /// Park the calling thread. On expiry the waiter is unlinked and
    /// `expired` is returned, unless a resume already claimed it.
    pub fn wait(self, option: WaitOption, expired: NxError) -> Result<T> {
        let deadline = match option {
            WaitOption::Forever => return self.waiter.wait_forever(),
            WaitOption::NoWait => Instant::now(),
            WaitOption::Timeout(limit) => Instant::now() + limit,
        };
        if let Some(result) = self.waiter.wait_until(deadline) {
            return result;
        }
        if self.list.cleanup(self.slot, &self.waiter) {
            Err(expired)
        } else {
            self.waiter.wait_forever()
        }
    }

    /// Withdraw without waiting
    pub fn cancel(self) {
        self.list.cleanup(self.slot, &self.waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn spin_until(list: &SuspensionList<u32>, n: usize) {
        for _ in 0..1000 {
            if list.len() == n {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("waiters never parked");
    }

    #[test]
    fn test_resume_matches_exactly_one() {
        let list = Arc::new(SuspensionList::<u32>::new());
        let handles: Vec<_> = (1..=4u32).map(|seq| (seq, list.register(seq))).collect();
        let threads: Vec<_> = handles
            .into_iter()
            .map(|(seq, h)| {
                thread::spawn(move || (seq, h.wait(WaitOption::from_millis(300), NxError::NoResponse)))
            })
            .collect();
        spin_until(&list, 4);

        assert!(list.resume_first(|k| k == 3, Ok(300)).is_ok());
        assert_eq!(list.len(), 3);
        assert_eq!(list.keys(), vec![1, 2, 4]);

        for t in threads {
            let (seq, result) = t.join().unwrap();
            if seq == 3 {
                assert_eq!(result, Ok(300));
            } else {
                assert_eq!(result, Err(NxError::NoResponse));
            }
        }
        assert!(list.is_empty());
    }

    #[test]
    fn test_no_match_returns_result() {
        let list = Arc::new(SuspensionList::<u32>::new());
        let h = list.register(7);
        assert_eq!(list.resume_first(|k| k == 8, Ok(1)), Err(Ok(1)));
        h.cancel();
        assert!(list.is_empty());
    }

    #[test]
    fn test_first_registered_wins_on_duplicate_keys() {
        let list = Arc::new(SuspensionList::<u32>::new());
        let first = list.register(5);
        let second = list.register(5);
        list.resume_first(|k| k == 5, Ok(1)).unwrap();
        assert_eq!(first.wait(WaitOption::NoWait, NxError::NoResponse), Ok(1));
        assert_eq!(
            second.wait(WaitOption::NoWait, NxError::NoResponse),
            Err(NxError::NoResponse)
        );
    }

    #[test]
    fn test_resume_after_unlink_is_not_doubled() {
        let list = Arc::new(SuspensionList::<u32>::new());
        let h = list.register(1);
        // resume claims the node first; the timed-out waiter must still see it
        list.resume_one(Ok(9)).unwrap();
        assert_eq!(h.wait(WaitOption::NoWait, NxError::NoResponse), Ok(9));
        assert_eq!(list.resume_one(Ok(10)), Err(Ok(10)));
    }

    #[test]
    fn test_resume_all() {
        let list = Arc::new(SuspensionList::<u32>::new());
        let a = list.register(1);
        let b = list.register(2);
        assert_eq!(list.resume_all(|| Err(NxError::WaitAborted)), 2);
        assert_eq!(a.wait(WaitOption::Forever, NxError::NoResponse), Err(NxError::WaitAborted));
        assert_eq!(b.wait(WaitOption::Forever, NxError::NoResponse), Err(NxError::WaitAborted));
    }

    #[test]
    fn test_slots_are_reused() {
        let list = Arc::new(SuspensionList::<u32>::new());
        let a = list.register(1);
        a.cancel();
        let b = list.register(2);
        assert_eq!(list.keys(), vec![2]);
        b.cancel();
    }
}
