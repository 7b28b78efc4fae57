//! Deferred receive queues and the IP helper thread
//!
//! Driver receive paths never take the IP mutex. They push packets onto one
//! of three FIFOs guarded by spin locks and post an event bit. The helper
//! thread (or the application, when `IpConfig::helper_thread` is false) drains
//! the FIFOs and runs the timers under the IP mutex.
//!
//! Each drain loop pops a single packet per spin window, so a driver enqueuing
//! concurrently never waits behind protocol processing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{NxError, Result};
use crate::iface::driver::{DriverCommand, DriverRequest};
use crate::ip::{Ip, IpInner, IpState, MAX_INTERFACES};
use crate::kernel::{EventFlags, IpEvents};
use crate::network::{ethertype, EthernetHeader, ETHERNET_HEADER_LEN};
use crate::packet::{Packet, PacketPool, PHYSICAL_HEADER};

/// The half of an instance that receive paths may touch
pub(crate) struct Shared {
    pub(crate) pool: PacketPool,
    pub(crate) events: EventFlags,
    receive: spin::Mutex<VecDeque<Packet>>,
    arp: spin::Mutex<VecDeque<Packet>>,
    rarp: spin::Mutex<VecDeque<Packet>>,
    deferred_interfaces: AtomicU32,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn new(pool: PacketPool) -> Self {
        Shared {
            pool,
            events: EventFlags::new(),
            receive: spin::Mutex::new(VecDeque::new()),
            arp: spin::Mutex::new(VecDeque::new()),
            rarp: spin::Mutex::new(VecDeque::new()),
            deferred_interfaces: AtomicU32::new(0),
            running: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn queue(&self, events: IpEvents) -> Option<&spin::Mutex<VecDeque<Packet>>> {
        if events == IpEvents::RECEIVE {
            Some(&self.receive)
        } else if events == IpEvents::ARP_RECEIVE {
            Some(&self.arp)
        } else if events == IpEvents::RARP_RECEIVE {
            Some(&self.rarp)
        } else {
            None
        }
    }

    /// Append to a deferred FIFO and wake the helper
    pub(crate) fn enqueue(&self, event: IpEvents, packet: Packet) {
        if !self.is_running() {
            return;
        }
        if let Some(queue) = self.queue(event) {
            queue.lock().push_back(packet);
            self.events.set(event);
        }
    }

    fn dequeue(&self, event: IpEvents) -> Option<Packet> {
        self.queue(event).and_then(|q| q.lock().pop_front())
    }

    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.receive.lock().clear();
        self.arp.lock().clear();
        self.rarp.lock().clear();
        self.events.set(IpEvents::SHUTDOWN);
    }
}

/// Receive entry points handed to a link driver on `Initialize`.
///
/// Every method is safe to call from any thread, including a driver's
/// receive thread, and never blocks on the IP mutex.
#[derive(Clone)]
pub struct LinkReceiver {
    shared: Arc<Shared>,
}

impl LinkReceiver {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        LinkReceiver { shared }
    }

    /// Allocate a receive buffer with room for the link header
    pub fn allocate(&self) -> Result<Packet> {
        self.shared.pool.allocate(PHYSICAL_HEADER)
    }

    /// Queue an IPv4 or IPv6 datagram for the helper thread
    pub fn packet_deferred_receive(&self, packet: Packet) {
        self.shared.enqueue(IpEvents::RECEIVE, packet);
    }

    /// Queue an ARP packet for the helper thread
    pub fn arp_packet_deferred_receive(&self, packet: Packet) {
        self.shared.enqueue(IpEvents::ARP_RECEIVE, packet);
    }

    /// Queue a RARP packet for the helper thread
    pub fn rarp_packet_deferred_receive(&self, packet: Packet) {
        self.shared.enqueue(IpEvents::RARP_RECEIVE, packet);
    }

    /// Ask the helper thread to issue `DeferredProcessing` on `interface`
    pub fn driver_deferred_processing(&self, interface: usize) {
        if interface < MAX_INTERFACES {
            self.shared.deferred_interfaces.fetch_or(1 << interface, Ordering::AcqRel);
            self.shared.events.set(IpEvents::DRIVER_DEFERRED);
        }
    }

    /// Copy an Ethernet frame into a packet and queue it by ethertype
    pub fn ethernet_frame_receive(&self, interface: usize, frame: &[u8]) {
        let Some(header) = EthernetHeader::from_bytes(frame) else {
            trace!("runt frame on interface {}", interface);
            return;
        };
        let event = match header.ethertype {
            ethertype::IPV4 | ethertype::IPV6 => IpEvents::RECEIVE,
            ethertype::ARP => IpEvents::ARP_RECEIVE,
            ethertype::RARP => IpEvents::RARP_RECEIVE,
            other => {
                trace!("ethertype {:#06x} ignored", other);
                return;
            }
        };
        if let Some(packet) = self.copy_in(interface, &frame[ETHERNET_HEADER_LEN..]) {
            self.shared.enqueue(event, packet);
        }
    }

    /// Queue a bare IP datagram from a point-to-point link
    pub fn datagram_receive(&self, interface: usize, datagram: &[u8]) {
        if let Some(packet) = self.copy_in(interface, datagram) {
            self.shared.enqueue(IpEvents::RECEIVE, packet);
        }
    }

    fn copy_in(&self, interface: usize, bytes: &[u8]) -> Option<Packet> {
        if !self.shared.is_running() {
            return None;
        }
        let mut packet = self.allocate().ok()?;
        packet.append(bytes).ok()?;
        packet.meta.interface = Some(interface);
        Some(packet)
    }
}

impl Ip {
    /// Post the slow periodic event
    pub fn periodic_tick(&self) -> Result<()> {
        self.check()?;
        self.inner.shared.events.set(IpEvents::PERIODIC);
        Ok(())
    }

    /// Post the fast TCP timer event
    pub fn tcp_fast_tick(&self) -> Result<()> {
        self.check()?;
        self.inner.shared.events.set(IpEvents::TCP_FAST);
        Ok(())
    }

    /// Receive entry points, for drivers constructed after the instance
    pub fn link_receiver(&self) -> Result<LinkReceiver> {
        self.check()?;
        Ok(LinkReceiver::new(self.inner.shared.clone()))
    }

    /// Perform one helper pass over `events`
    pub fn process_events(&self, events: IpEvents) -> Result<()> {
        self.check()?;
        let shared = self.inner.shared.clone();
        if events.contains(IpEvents::DRIVER_DEFERRED) {
            let mask = shared.deferred_interfaces.swap(0, Ordering::AcqRel);
            for index in (0..MAX_INTERFACES).filter(|i| mask & (1 << i) != 0) {
                self.locked(|s| {
                    let mut request = DriverRequest::new(DriverCommand::DeferredProcessing, index);
                    if let Err(e) = s.driver_request(&mut request) {
                        warn!("interface {}: deferred processing failed: {}", index, e);
                    }
                    Ok(())
                })?;
            }
        }
        if events.contains(IpEvents::RECEIVE) {
            while let Some(packet) = shared.dequeue(IpEvents::RECEIVE) {
                self.locked(|s| {
                    s.packet_receive(packet);
                    Ok(())
                })?;
            }
        }
        if events.contains(IpEvents::ARP_RECEIVE) {
            while let Some(packet) = shared.dequeue(IpEvents::ARP_RECEIVE) {
                self.locked(|s| {
                    s.arp_packet_receive(packet);
                    Ok(())
                })?;
            }
        }
        if events.contains(IpEvents::RARP_RECEIVE) {
            while let Some(packet) = shared.dequeue(IpEvents::RARP_RECEIVE) {
                self.locked(|s| {
                    s.rarp_packet_receive(packet);
                    Ok(())
                })?;
            }
        }
        if events.contains(IpEvents::PERIODIC) {
            self.locked(|s| {
                s.periodic_pass();
                Ok(())
            })?;
        }
        if events.contains(IpEvents::TCP_FAST) {
            self.locked(|s| {
                s.tcp_fast_pass();
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Run helper passes until no event is pending
    pub fn process_pending(&self) -> Result<()> {
        loop {
            let events = self.inner.shared.events.take() - IpEvents::SHUTDOWN;
            if events.is_empty() {
                return Ok(());
            }
            self.process_events(events)?;
        }
    }
}

impl IpState {
    /// Slow timers, one pass per periodic tick
    pub(crate) fn periodic_pass(&mut self) {
        self.arp_periodic();
        self.rarp_periodic();
        self.ipv6_periodic();
        self.igmp_periodic();
        self.reassembly_periodic();
    }
}

fn helper_loop(me: Weak<IpInner>, shared: Arc<Shared>) {
    loop {
        let events = shared.events.wait(None);
        if events.contains(IpEvents::SHUTDOWN) || !shared.is_running() {
            break;
        }
        let Some(inner) = me.upgrade() else {
            break;
        };
        let ip = Ip { inner };
        if let Err(e) = ip.process_events(events) {
            debug!("helper pass stopped: {}", e);
            break;
        }
    }
    debug!("ip helper thread exiting");
}

fn timer_loop(me: Weak<IpInner>, shared: Arc<Shared>, fast: Duration, periodic: Duration) {
    let mut elapsed = Duration::ZERO;
    while shared.is_running() && me.strong_count() > 0 {
        thread::sleep(fast);
        elapsed += fast;
        let mut events = IpEvents::TCP_FAST;
        if elapsed >= periodic {
            elapsed = Duration::ZERO;
            events |= IpEvents::PERIODIC;
        }
        shared.events.set(events);
    }
}

/// Start the helper and timer threads of `ip`
pub(crate) fn spawn_threads(ip: &Ip) -> Result<Vec<JoinHandle<()>>> {
    let (fast, periodic) = ip.locked(|s| Ok((s.config.tcp_fast_interval, s.config.periodic_interval)))?;
    if fast.is_zero() {
        return Err(NxError::InvalidParameters);
    }
    let name = ip.name().to_string();
    let helper = {
        let me = Arc::downgrade(&ip.inner);
        let shared = ip.inner.shared.clone();
        thread::Builder::new()
            .name(format!("{}-helper", name))
            .spawn(move || helper_loop(me, shared))
            .map_err(|_| NxError::NotCreated)?
    };
    let timer = {
        let me = Arc::downgrade(&ip.inner);
        let shared = ip.inner.shared.clone();
        thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || timer_loop(me, shared, fast, periodic))
            .map_err(|_| NxError::NotCreated)?
    };
    Ok(vec![helper, timer])
}
