//! Event flags waking the IP helper thread

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// Work items posted to the helper thread
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IpEvents: u32 {
        /// Slow periodic tick: ARP/ND aging, IGMP, reassembly timeouts
        const PERIODIC = 1 << 0;
        /// Fast tick: TCP retransmission and TIME_WAIT timers
        const TCP_FAST = 1 << 1;
        /// Packets waiting on the deferred receive queue
        const RECEIVE = 1 << 2;
        /// ARP packets waiting on the deferred ARP queue
        const ARP_RECEIVE = 1 << 3;
        /// RARP packets waiting on the deferred RARP queue
        const RARP_RECEIVE = 1 << 4;
        /// A driver asked for deferred processing
        const DRIVER_DEFERRED = 1 << 5;
        /// Stop the helper thread
        const SHUTDOWN = 1 << 31;
    }
}

/// Word of event bits with a blocking consumer
///
/// `set` never blocks for longer than the wake-up handshake and may be called
/// from driver receive paths. Only the helper thread consumes.
#[derive(Debug, Default)]
pub struct EventFlags {
    bits: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl EventFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR `events` into the word and wake the consumer
    pub fn set(&self, events: IpEvents) {
        self.bits.fetch_or(events.bits(), Ordering::AcqRel);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    /// Take and clear whatever is pending without blocking
    pub fn take(&self) -> IpEvents {
        IpEvents::from_bits_truncate(self.bits.swap(0, Ordering::AcqRel))
    }

    pub fn peek(&self) -> IpEvents {
        IpEvents::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    /// Block until any event is pending or `timeout` elapses, then take them
    pub fn wait(&self, timeout: Option<Duration>) -> IpEvents {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let pending = self.take();
            if !pending.is_empty() {
                return pending;
            }
            match timeout {
                Some(limit) => {
                    let (g, result) = self
                        .cond
                        .wait_timeout(guard, limit)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard = g;
                    if result.timed_out() {
                        return self.take();
                    }
                }
                None => {
                    guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}
