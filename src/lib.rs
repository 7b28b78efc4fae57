//! A dual-stack TCP/IP stack for embedded-style systems
//!
//! This library provides:
//! - IPv4 and IPv6 with ARP, RARP and Neighbor Discovery
//! - ICMP/ICMPv6 echo, IGMPv2 multicast, IPv4 fragmentation
//! - TCP, UDP and raw IP services on per-instance socket tables
//! - A link driver contract with an in-memory segment and a TUN driver
//!
//! Each `Ip` instance owns its interfaces, caches and sockets. A helper
//! thread drains the deferred receive queues and runs the timers, or the
//! application drives it by hand with `Ip::process_pending`.

pub mod config;
pub mod error;
pub mod iface;
pub mod ip;
pub mod kernel;
pub mod network;
pub mod packet;
pub(crate) mod ring;
pub mod transport;

// Re-export commonly used types
pub use config::IpConfig;
pub use error::{NxError, Result};
pub use iface::{DriverCommand, DriverRequest, Frame, LinkDriver, VirtualLink, VirtualNetwork};
pub use ip::route::StaticRoute;
pub use ip::{Ip, IpInfo, LinkReceiver};
pub use kernel::WaitOption;
pub use network::MacAddress;
pub use packet::{Packet, PacketPool};
pub use transport::tcp::{ListenCallback, TcpNotify};
pub use transport::{TcpOptions, TcpSocket, TcpState, UdpOptions, UdpSocket};
