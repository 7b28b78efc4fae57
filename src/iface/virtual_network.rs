//! In-memory Ethernet segment connecting IP instances
//!
//! `VirtualNetwork` is a hub: every frame a port transmits is copied to the
//! other enabled ports whose MAC (or joined multicast MAC) matches the
//! destination. Delivery goes through the receiving instance's deferred
//! receive entry points exactly like a hardware driver's receive interrupt.
//!
//! The hub can record every transmitted frame and drop frames selected by a
//! filter, which is how link loss is simulated.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;

use crate::error::{NxError, Result};
use crate::iface::driver::{DriverCommand, DriverRequest, LinkDriver};
use crate::ip::LinkReceiver;
use crate::network::{ethertype, EthernetHeader, MacAddress, ETHERNET_HEADER_LEN};

const VIRTUAL_MTU: usize = 1500;

/// Decides whether a frame is lost; true drops it
pub type DropFilter = Box<dyn Fn(&Frame) -> bool + Send + Sync>;

/// A frame as it appeared on the segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: MacAddress,
    pub destination: MacAddress,
    pub ethertype: u16,
    pub bytes: Vec<u8>,
}

impl Frame {
    /// Bytes after the Ethernet header
    pub fn payload(&self) -> &[u8] {
        &self.bytes[ETHERNET_HEADER_LEN..]
    }
}

struct Port {
    mac: MacAddress,
    interface: usize,
    receiver: Option<LinkReceiver>,
    enabled: bool,
    link_up: bool,
    multicast: Vec<MacAddress>,
}

impl Port {
    fn wants(&self, destination: MacAddress) -> bool {
        self.enabled
            && self.link_up
            && (destination == self.mac
                || destination.is_broadcast()
                || self.multicast.contains(&destination))
    }
}

struct Hub {
    id: u8,
    ports: spin::Mutex<Vec<Port>>,
    capture: spin::Mutex<Option<Vec<Frame>>>,
    filter: spin::Mutex<Option<DropFilter>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    mtu: AtomicUsize,
}

/// An in-memory Ethernet segment
#[derive(Clone)]
pub struct VirtualNetwork {
    hub: Arc<Hub>,
}

/// One attachment to a `VirtualNetwork`, used as an interface's driver
pub struct VirtualLink {
    hub: Arc<Hub>,
    port: usize,
}

impl VirtualNetwork {
    /// Create a segment; `id` becomes the fifth MAC octet of its ports
    pub fn new(id: u8) -> Self {
        VirtualNetwork {
            hub: Arc::new(Hub {
                id,
                ports: spin::Mutex::new(Vec::new()),
                capture: spin::Mutex::new(None),
                filter: spin::Mutex::new(None),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                mtu: AtomicUsize::new(VIRTUAL_MTU),
            }),
        }
    }

    /// Add a port and return its driver
    pub fn link(&self) -> Arc<VirtualLink> {
        let mut ports = self.hub.ports.lock();
        let port = ports.len();
        ports.push(Port {
            mac: MacAddress([0x02, 0x00, 0x00, 0x00, self.hub.id, port as u8 + 1]),
            interface: 0,
            receiver: None,
            enabled: false,
            link_up: true,
            multicast: Vec::new(),
        });
        Arc::new(VirtualLink {
            hub: self.hub.clone(),
            port,
        })
    }

    /// Start recording frames, discarding anything recorded before
    pub fn capture_start(&self) {
        *self.hub.capture.lock() = Some(Vec::new());
    }

    /// Take the frames recorded so far
    pub fn captured(&self) -> Vec<Frame> {
        match self.hub.capture.lock().as_mut() {
            Some(frames) => core::mem::take(frames),
            None => Vec::new(),
        }
    }

    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.hub.filter.lock() = Some(filter);
    }

    pub fn clear_drop_filter(&self) {
        *self.hub.filter.lock() = None;
    }

    /// Frames delivered to at least one port
    pub fn delivered(&self) -> u64 {
        self.hub.delivered.load(Ordering::Relaxed)
    }

    /// Frames removed by the drop filter
    pub fn dropped(&self) -> u64 {
        self.hub.dropped.load(Ordering::Relaxed)
    }

    /// MTU reported to interfaces initialized after this call
    pub fn set_mtu(&self, mtu: usize) {
        self.hub.mtu.store(mtu, Ordering::Relaxed);
    }
}

impl VirtualLink {
    pub fn mac(&self) -> MacAddress {
        self.hub.ports.lock()[self.port].mac
    }

    /// Simulate cable plug/unplug
    pub fn set_link_up(&self, up: bool) {
        self.hub.ports.lock()[self.port].link_up = up;
    }

    fn transmit(&self, request: &mut DriverRequest, ethertype: u16, destination: MacAddress) -> Result<()> {
        let mut packet = request.packet.take().ok_or(NxError::InvalidPacket)?;
        let source = self.mac();
        let header = EthernetHeader {
            destination,
            source,
            ethertype,
        };
        header.write(packet.prepend(ETHERNET_HEADER_LEN)?);
        let frame = Frame {
            source,
            destination,
            ethertype,
            bytes: packet.to_vec(),
        };
        drop(packet);

        if let Some(filter) = self.hub.filter.lock().as_ref() {
            if filter(&frame) {
                self.hub.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("virtual link {}: frame to {} dropped", source, destination);
                return Ok(());
            }
        }
        if let Some(frames) = self.hub.capture.lock().as_mut() {
            frames.push(frame.clone());
        }

        let targets: Vec<(usize, LinkReceiver)> = {
            let ports = self.hub.ports.lock();
            ports
                .iter()
                .enumerate()
                .filter(|(i, p)| *i != self.port && p.wants(destination))
                .filter_map(|(_, p)| p.receiver.clone().map(|r| (p.interface, r)))
                .collect()
        };
        if !targets.is_empty() {
            self.hub.delivered.fetch_add(1, Ordering::Relaxed);
        }
        for (interface, receiver) in targets {
            receiver.ethernet_frame_receive(interface, &frame.bytes);
        }
        Ok(())
    }
}

fn datagram_ethertype(request: &DriverRequest) -> u16 {
    match request.packet.as_ref().and_then(|p| p.data().first()) {
        Some(b) if b >> 4 == 6 => ethertype::IPV6,
        _ => ethertype::IPV4,
    }
}

impl LinkDriver for VirtualLink {
    fn request(&self, request: &mut DriverRequest) -> Result<()> {
        match request.command {
            DriverCommand::Initialize => {
                let mut ports = self.hub.ports.lock();
                let port = &mut ports[self.port];
                port.interface = request.interface;
                port.receiver = request.receiver.take();
                request.physical_address = Some(port.mac);
                request.mtu = Some(self.hub.mtu.load(Ordering::Relaxed));
                Ok(())
            }
            DriverCommand::Enable => {
                self.hub.ports.lock()[self.port].enabled = true;
                Ok(())
            }
            DriverCommand::Disable => {
                self.hub.ports.lock()[self.port].enabled = false;
                Ok(())
            }
            DriverCommand::Uninitialize => {
                let mut ports = self.hub.ports.lock();
                let port = &mut ports[self.port];
                port.enabled = false;
                port.receiver = None;
                port.multicast.clear();
                Ok(())
            }
            DriverCommand::Send => {
                let destination = request.physical_address.unwrap_or(MacAddress::BROADCAST);
                let ethertype = datagram_ethertype(request);
                self.transmit(request, ethertype, destination)
            }
            DriverCommand::Broadcast => {
                let ethertype = datagram_ethertype(request);
                self.transmit(request, ethertype, MacAddress::BROADCAST)
            }
            DriverCommand::ArpSend => self.transmit(request, ethertype::ARP, MacAddress::BROADCAST),
            DriverCommand::ArpResponseSend => {
                let destination = request.physical_address.unwrap_or(MacAddress::BROADCAST);
                self.transmit(request, ethertype::ARP, destination)
            }
            DriverCommand::RarpSend => self.transmit(request, ethertype::RARP, MacAddress::BROADCAST),
            DriverCommand::MulticastJoin => {
                let mac = request.physical_address.ok_or(NxError::InvalidParameters)?;
                let mut ports = self.hub.ports.lock();
                let port = &mut ports[self.port];
                if !port.multicast.contains(&mac) {
                    port.multicast.push(mac);
                }
                Ok(())
            }
            DriverCommand::MulticastLeave => {
                let mac = request.physical_address.ok_or(NxError::InvalidParameters)?;
                self.hub.ports.lock()[self.port].multicast.retain(|m| *m != mac);
                Ok(())
            }
            DriverCommand::GetStatus => {
                request.link_up = self.hub.ports.lock()[self.port].link_up;
                Ok(())
            }
            DriverCommand::DeferredProcessing => Ok(()),
        }
    }
}
