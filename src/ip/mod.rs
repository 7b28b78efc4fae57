//! The IP instance
//!
//! An `Ip` is a cheap handle onto one instance of the stack. All protocol
//! state of the instance sits in a single `IpState` behind a blocking mutex:
//! application threads, the helper thread and the periodic pass take it for
//! every operation, never for long, and never from a driver's receive path.
//!
//! Driver receive paths only touch the `Shared` half (deferred FIFOs under
//! spin locks plus the event word), see `helper`.
//!
//! Callbacks registered by the application are never run with the mutex
//! held. Code running under the lock pushes them with `IpState::defer` and
//! they run right after the lock is released, in order.

pub mod address;
pub mod arp;
pub(crate) mod arp_cache;
pub mod fragment;
pub mod helper;
pub mod icmp;
mod input;
pub mod ipv6;
pub mod multicast;
pub(crate) mod nd_cache;
mod output;
pub mod rarp;
pub mod route;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, info, warn};

use crate::config::IpConfig;
use crate::error::{NxError, Result};
use crate::iface::driver::{DriverCommand, DriverRequest, LinkDriver};
use crate::iface::interface::Interface;
use crate::kernel::{IpEvents, SuspensionList, WaitOption};
use crate::packet::{Packet, PacketPool};
use crate::transport::raw::RawLayer;
use crate::transport::tcp::TcpLayer;
use crate::transport::udp::UdpLayer;

use arp_cache::ArpCache;
use fragment::Reassembly;
use icmp::IcmpState;
use ipv6::Ipv6State;
use multicast::MulticastTable;
use rarp::RarpState;
use route::RouteTable;

pub use address::{AddressChangeNotify, InterfaceInfo, Ipv6AddressChangeNotify};
pub use arp::ArpInfo;
pub use helper::LinkReceiver;
pub use icmp::IcmpInfo;
pub use multicast::IgmpInfo;
pub use rarp::RarpInfo;

pub(crate) use helper::Shared;

/// Identity stamped into a live instance
const IP_ID: u32 = 0x4950_2020;
/// Smallest MTU an IPv4 link may report
pub(crate) const MIN_MTU: usize = 68;
/// Interfaces are tracked in 32-bit masks for deferred driver processing
pub(crate) const MAX_INTERFACES: usize = 32;

/// Work queued under the IP mutex and run after it is released
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

/// Instance-wide counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IpInfo {
    pub total_packets_sent: u64,
    pub total_bytes_sent: u64,
    pub total_packets_received: u64,
    pub total_bytes_received: u64,
    pub invalid_packets: u64,
    pub receive_packets_dropped: u64,
    pub receive_checksum_errors: u64,
    pub send_packets_dropped: u64,
    pub total_fragments_sent: u64,
    pub total_fragments_received: u64,
}

pub(crate) struct IpInner {
    id: AtomicU32,
    name: String,
    pub(crate) shared: Arc<Shared>,
    pub(crate) state: Mutex<IpState>,
    /// Signalled after every locked section; blocking services wait on it
    pub(crate) changed: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle onto an IP instance
#[derive(Clone)]
pub struct Ip {
    pub(crate) inner: Arc<IpInner>,
}

impl core::fmt::Debug for Ip {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ip").field("name", &self.inner.name).finish()
    }
}

/// Everything the IP mutex protects
pub(crate) struct IpState {
    pub(crate) config: IpConfig,
    pub(crate) pool: PacketPool,
    pub(crate) shared: Arc<Shared>,
    pub(crate) me: Weak<IpInner>,
    pub(crate) interfaces: Vec<Option<Interface>>,
    pub(crate) gateway: Option<Ipv4Addr>,
    pub(crate) routes: RouteTable,
    pub(crate) arp: Option<ArpCache>,
    pub(crate) rarp: Option<RarpState>,
    pub(crate) ipv6: Option<Ipv6State>,
    pub(crate) icmp: Option<IcmpState>,
    pub(crate) ping_waiters: Arc<SuspensionList<Packet>>,
    pub(crate) multicast: MulticastTable,
    pub(crate) reassembly: Option<Reassembly>,
    pub(crate) tcp: Option<TcpLayer>,
    pub(crate) udp: Option<UdpLayer>,
    pub(crate) raw: Option<RawLayer>,
    pub(crate) stats: IpInfo,
    pub(crate) packet_id: u16,
    pub(crate) address_change_notify: Option<AddressChangeNotify>,
    pub(crate) ipv6_address_change_notify: Option<Ipv6AddressChangeNotify>,
    deferred: Vec<Deferred>,
}

impl IpState {
    /// Run `work` after the IP mutex is released
    pub(crate) fn defer(&mut self, work: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(work));
    }

    /// Handle onto the owning instance, for callbacks
    pub(crate) fn handle(&self) -> Option<Ip> {
        self.me.upgrade().map(|inner| Ip { inner })
    }

    pub(crate) fn interface(&self, index: usize) -> Result<&Interface> {
        self.interfaces
            .get(index)
            .and_then(|i| i.as_ref())
            .ok_or(NxError::InvalidInterface)
    }

    pub(crate) fn interface_mut(&mut self, index: usize) -> Result<&mut Interface> {
        self.interfaces
            .get_mut(index)
            .and_then(|i| i.as_mut())
            .ok_or(NxError::InvalidInterface)
    }

    /// Attached, initialized interfaces
    pub(crate) fn live_interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter().flatten().filter(|i| i.valid)
    }

    /// Issue a driver request on `index`
    pub(crate) fn driver_request(&mut self, request: &mut DriverRequest) -> Result<()> {
        let driver: Arc<dyn LinkDriver> = self.interface(request.interface)?.driver.clone();
        driver.request(request)
    }

    /// Hand a packet to the driver of `index`
    pub(crate) fn driver_send(
        &mut self,
        interface: usize,
        command: DriverCommand,
        packet: Packet,
        mac: Option<crate::network::MacAddress>,
    ) -> Result<()> {
        let mut request = DriverRequest::new(command, interface).with_packet(packet);
        request.physical_address = mac;
        self.driver_request(&mut request)
    }

    pub(crate) fn next_packet_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.wrapping_add(1);
        self.packet_id
    }

    /// Bring up a driver on slot `index`
    pub(crate) fn interface_start(
        &mut self,
        index: usize,
        name: &str,
        ipv4: Option<(Ipv4Addr, Ipv4Addr)>,
        driver: Arc<dyn LinkDriver>,
    ) -> Result<()> {
        let slot = self.interfaces.get(index).ok_or(NxError::InvalidInterface)?;
        if slot.is_some() {
            return Err(NxError::DuplicateEntry);
        }
        let mut iface = Interface::new(index, name, driver.clone(), self.config.ipv6_addresses_per_interface);
        iface.ipv4 = ipv4;

        let mut request = DriverRequest::new(DriverCommand::Initialize, index);
        request.receiver = Some(LinkReceiver::new(self.shared.clone()));
        driver.request(&mut request)?;
        if let Some(mac) = request.physical_address {
            iface.mac = mac;
        }
        if let Some(mtu) = request.mtu {
            if mtu < MIN_MTU {
                warn!("interface {} ({}): mtu {} below {}", index, name, mtu, MIN_MTU);
                return Err(NxError::InvalidParameters);
            }
            iface.mtu = mtu;
        }
        driver.request(&mut DriverRequest::new(DriverCommand::Enable, index))?;
        let mut status = DriverRequest::new(DriverCommand::GetStatus, index);
        iface.link_up = driver.request(&mut status).map(|_| status.link_up).unwrap_or(true);
        iface.valid = true;
        debug!("interface {} ({}) up, mac {}, mtu {}", index, name, iface.mac, iface.mtu);
        self.interfaces[index] = Some(iface);
        Ok(())
    }

    fn take_deferred(&mut self) -> Vec<Deferred> {
        core::mem::take(&mut self.deferred)
    }
}

impl Ip {
    /// Create an instance with its primary interface.
    ///
    /// An unspecified `address` leaves the interface without IPv4 address,
    /// for RARP. Unless `config.helper_thread` is false the helper and timer
    /// threads are started.
    pub fn create(
        name: &str,
        pool: PacketPool,
        address: Ipv4Addr,
        mask: Ipv4Addr,
        driver: Arc<dyn LinkDriver>,
        config: IpConfig,
    ) -> Result<Ip> {
        if config.max_interfaces == 0 || config.max_interfaces > MAX_INTERFACES {
            return Err(NxError::InvalidParameters);
        }
        let shared = Arc::new(Shared::new(pool.clone()));
        let spawn = config.helper_thread;
        let inner = Arc::new_cyclic(|me: &Weak<IpInner>| IpInner {
            id: AtomicU32::new(IP_ID),
            name: name.to_string(),
            shared: shared.clone(),
            state: Mutex::new(IpState {
                interfaces: (0..config.max_interfaces).map(|_| None).collect(),
                routes: RouteTable::new(config.static_route_table_size),
                multicast: MulticastTable::new(config.max_multicast_groups),
                config,
                pool,
                shared: shared.clone(),
                me: me.clone(),
                gateway: None,
                arp: None,
                rarp: None,
                ipv6: None,
                icmp: None,
                ping_waiters: Arc::new(SuspensionList::new()),
                reassembly: None,
                tcp: None,
                udp: None,
                raw: None,
                stats: IpInfo::default(),
                packet_id: 0,
                address_change_notify: None,
                ipv6_address_change_notify: None,
                deferred: Vec::new(),
            }),
            changed: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });
        let ip = Ip { inner };

        let ipv4 = if address.is_unspecified() {
            None
        } else {
            Some((address, mask))
        };
        ip.locked(|s| s.interface_start(0, name, ipv4, driver))?;

        if spawn {
            let threads = helper::spawn_threads(&ip)?;
            *ip.inner.threads.lock().unwrap_or_else(PoisonError::into_inner) = threads;
        }
        info!("ip instance {} created", name);
        Ok(ip)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The pool packets of this instance are allocated from
    pub fn pool(&self) -> Result<PacketPool> {
        self.check()?;
        Ok(self.inner.shared.pool.clone())
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.id.load(Ordering::Acquire) == IP_ID
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(NxError::PtrError)
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, IpState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the guard, wake blocked services and run deferred callbacks
    fn release(&self, mut guard: MutexGuard<'_, IpState>) {
        let deferred = guard.take_deferred();
        drop(guard);
        self.inner.changed.notify_all();
        for work in deferred {
            work();
        }
    }

    /// Run `f` with the IP mutex held
    pub(crate) fn locked<R>(&self, f: impl FnOnce(&mut IpState) -> Result<R>) -> Result<R> {
        self.check()?;
        let mut guard = self.lock_state();
        let result = if self.is_alive() {
            f(&mut guard)
        } else {
            Err(NxError::PtrError)
        };
        self.release(guard);
        result
    }

    /// Suspend until `poll` produces a result.
    ///
    /// `poll` runs under the IP mutex each time the state changed. When the
    /// wait option runs out `expire` runs under the same lock and its status is
    /// returned. Instance deletion ends every wait with `WaitAborted`.
    pub(crate) fn block_on<R>(
        &self,
        wait: WaitOption,
        mut poll: impl FnMut(&mut IpState) -> Option<Result<R>>,
        expire: impl FnOnce(&mut IpState) -> NxError,
    ) -> Result<R> {
        self.check()?;
        let deadline = match wait {
            WaitOption::Timeout(limit) => Some(Instant::now() + limit),
            _ => None,
        };
        let mut guard = self.lock_state();
        let result = loop {
            if !self.is_alive() {
                break Err(NxError::WaitAborted);
            }
            if let Some(result) = poll(&mut guard) {
                break result;
            }
            match (wait, deadline) {
                (WaitOption::Forever, _) => {
                    guard = self.inner.changed.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
                (WaitOption::Timeout(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(expire(&mut guard));
                    }
                    let (g, _) = self
                        .inner
                        .changed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard = g;
                }
                _ => break Err(expire(&mut guard)),
            }
        };
        self.release(guard);
        result
    }

    /// Tear the instance down.
    ///
    /// Every TCP connection is reset, every socket unbound, every queued
    /// packet released, every suspended thread woken with `WaitAborted` and
    /// every driver uninitialized. The handle (and all clones) are dead
    /// afterwards.
    pub fn delete(&self) -> Result<()> {
        self.check()?;
        let mut guard = self.lock_state();
        if self.inner.id.swap(0, Ordering::AcqRel) != IP_ID {
            return Err(NxError::PtrError);
        }
        let state = &mut *guard;
        if let Some(mut tcp) = state.tcp.take() {
            for segment in tcp.abort_all() {
                let _ = state.tcp_segment_output(segment);
            }
        }
        if let Some(udp) = state.udp.as_mut() {
            udp.unbind_all();
        }
        state.udp = None;
        state.raw = None;
        state.arp = None;
        state.ipv6 = None;
        state.reassembly = None;
        state.ping_waiters.resume_all(|| Err(NxError::WaitAborted));
        for index in 0..state.interfaces.len() {
            if state.interfaces[index].is_some() {
                let mut request = DriverRequest::new(DriverCommand::Uninitialize, index);
                if let Err(e) = state.driver_request(&mut request) {
                    warn!("interface {}: uninitialize failed: {}", index, e);
                }
                state.interfaces[index] = None;
            }
        }
        state.deferred.clear();
        drop(guard);
        self.inner.changed.notify_all();

        self.inner.shared.shutdown();
        let threads = core::mem::take(&mut *self.inner.threads.lock().unwrap_or_else(PoisonError::into_inner));
        let me = thread::current().id();
        for handle in threads {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        info!("ip instance {} deleted", self.inner.name);
        Ok(())
    }

    pub fn info(&self) -> Result<IpInfo> {
        self.locked(|s| Ok(s.stats))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;

    pub(crate) fn instance(net: &VirtualNetwork, last: u8) -> Ip {
        let pool = PacketPool::new("test", 1600, 64);
        Ip::create(
            &format!("ip{}", last),
            pool,
            Ipv4Addr::new(10, 0, 0, last),
            Ipv4Addr::new(255, 255, 255, 0),
            net.link(),
            IpConfig::manual(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_reports_driver_mac() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        let info = ip.interface_info(0).unwrap();
        assert_eq!(info.mac.0[5], 1);
        assert_eq!(info.mtu, 1500);
        assert_eq!(ip.address().unwrap(), (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 0)));
    }

    #[test]
    fn test_interface_count_limited_to_mask_width() {
        let net = VirtualNetwork::new(1);
        for count in [0, MAX_INTERFACES + 1] {
            let config = IpConfig {
                max_interfaces: count,
                ..IpConfig::manual()
            };
            let result = Ip::create(
                "ip0",
                PacketPool::new("test", 1600, 8),
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(255, 255, 255, 0),
                net.link(),
                config,
            );
            assert_eq!(result.err(), Some(NxError::InvalidParameters));
        }
        let config = IpConfig {
            max_interfaces: MAX_INTERFACES,
            ..IpConfig::manual()
        };
        let ip = Ip::create(
            "ip1",
            PacketPool::new("test", 1600, 8),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            net.link(),
            config,
        )
        .unwrap();
        ip.delete().unwrap();
    }

    #[test]
    fn test_deleted_instance_rejects_calls() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        let other = ip.clone();
        ip.delete().unwrap();
        assert_eq!(other.info().unwrap_err(), NxError::PtrError);
        assert_eq!(ip.delete().unwrap_err(), NxError::PtrError);
    }

    #[test]
    fn test_callbacks_run_after_unlock() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        let probe = ip.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        ip.locked(|s| {
            s.defer(move || {
                // the mutex is free again, so a nested service call works
                tx.send(probe.info().is_ok()).unwrap();
            });
            Ok(())
        })
        .unwrap();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn test_block_on_no_wait_runs_expire() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        let result: Result<()> = ip.block_on(WaitOption::NoWait, |_| None, |_| NxError::NoResponse);
        assert_eq!(result, Err(NxError::NoResponse));
        let result = ip.block_on(WaitOption::from_millis(5), |_| None::<Result<()>>, |_| NxError::NotConnected);
        assert_eq!(result, Err(NxError::NotConnected));
    }
}
