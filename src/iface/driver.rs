//! Link driver contract
//!
//! The IP instance talks to every interface through one entry point,
//! `LinkDriver::request`, carrying a command and its in/out fields. Requests
//! are issued with the IP mutex held, so a driver must not block and must not
//! call back into any IP service other than the `LinkReceiver` entry points it
//! was handed on `Initialize`.

use std::fmt;

use crate::error::Result;
use crate::ip::LinkReceiver;
use crate::network::MacAddress;
use crate::packet::Packet;

/// Operation requested from a link driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCommand {
    /// Bring up the hardware; the driver reports its MAC and MTU
    Initialize,
    /// Start accepting and delivering frames
    Enable,
    /// Stop delivering frames
    Disable,
    /// Release the hardware
    Uninitialize,
    /// Transmit an IP datagram to `physical_address`
    Send,
    /// Transmit an IP datagram to the link broadcast address
    Broadcast,
    /// Transmit an ARP request (broadcast)
    ArpSend,
    /// Transmit an ARP reply to `physical_address`
    ArpResponseSend,
    /// Transmit a RARP request (broadcast)
    RarpSend,
    /// Accept frames sent to the multicast `physical_address`
    MulticastJoin,
    /// Stop accepting frames sent to the multicast `physical_address`
    MulticastLeave,
    /// Report the link state in `link_up`
    GetStatus,
    /// Perform work the driver deferred from its receive path
    DeferredProcessing,
}

/// One request to a link driver
pub struct DriverRequest {
    pub command: DriverCommand,
    /// Interface index the request is for
    pub interface: usize,
    /// Datagram to transmit, owned by the driver once handed over
    pub packet: Option<Packet>,
    /// Destination or multicast MAC; set by the driver on `Initialize`
    pub physical_address: Option<MacAddress>,
    /// Link MTU, set by the driver on `Initialize`
    pub mtu: Option<usize>,
    /// Link state, set by the driver on `GetStatus`
    pub link_up: bool,
    /// Receive entry points, present on `Initialize`
    pub receiver: Option<LinkReceiver>,
}

impl DriverRequest {
    pub fn new(command: DriverCommand, interface: usize) -> Self {
        DriverRequest {
            command,
            interface,
            packet: None,
            physical_address: None,
            mtu: None,
            link_up: false,
            receiver: None,
        }
    }

    pub fn with_packet(mut self, packet: Packet) -> Self {
        self.packet = Some(packet);
        self
    }

    pub fn with_address(mut self, mac: MacAddress) -> Self {
        self.physical_address = Some(mac);
        self
    }
}

impl fmt::Debug for DriverRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRequest")
            .field("command", &self.command)
            .field("interface", &self.interface)
            .field("packet", &self.packet.as_ref().map(|p| p.len()))
            .field("physical_address", &self.physical_address)
            .finish()
    }
}

/// A network device the stack can drive
pub trait LinkDriver: Send + Sync {
    /// Execute one request. Must not block.
    fn request(&self, request: &mut DriverRequest) -> Result<()>;

    /// False for point-to-point links where ARP and ND are skipped
    fn address_mapping_needed(&self) -> bool {
        true
    }
}
