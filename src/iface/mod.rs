//! Network interface abstraction layer
//!
//! This module provides the link side of the stack:
//! - Interface records owned by an IP instance
//! - The link driver contract
//! - An in-memory Ethernet segment for tests and demos
//! - A TUN device driver (feature `tun`)

pub mod driver;
pub mod interface;
#[cfg(feature = "tun")]
pub mod tun;
pub mod virtual_network;

// Re-export commonly used items
pub use driver::{DriverCommand, DriverRequest, LinkDriver};
pub use interface::{Interface, Ipv6AddressOrigin, Ipv6AddressState, Ipv6Entry};
#[cfg(feature = "tun")]
pub use tun::TunDriver;
pub use virtual_network::{DropFilter, Frame, VirtualLink, VirtualNetwork};
