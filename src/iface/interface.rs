//! Network interface owned by an IP instance
//!
//! An interface binds a link driver to the addresses the instance answers on:
//! - an optional IPv4 address and mask
//! - a fixed number of IPv6 address slots
//! - the link-layer address reported by the driver

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::iface::driver::LinkDriver;
use crate::network::ipv4::Ipv4Utils;
use crate::network::ipv6::prefix_match;
use crate::network::MacAddress;

/// Lifecycle of an IPv6 address slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6AddressState {
    /// Configured but not yet usable as a source
    Tentative,
    /// Usable for sending and receiving
    Valid,
}

/// Where an IPv6 address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6AddressOrigin {
    LinkLocal,
    Manual,
    Autoconfigured,
}

/// One configured IPv6 address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Entry {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub state: Ipv6AddressState,
    pub origin: Ipv6AddressOrigin,
}

/// A physical (or virtual) network interface
pub struct Interface {
    pub index: usize,
    pub name: String,
    pub mtu: usize,
    pub mac: MacAddress,
    pub ipv4: Option<(Ipv4Addr, Ipv4Addr)>,
    pub ipv6: Vec<Option<Ipv6Entry>>,
    pub driver: Arc<dyn LinkDriver>,
    /// Set once the driver finished initialization
    pub valid: bool,
    /// False for point-to-point links that need no ARP/ND
    pub address_mapping_needed: bool,
    pub link_up: bool,
}

impl Interface {
    pub fn new(index: usize, name: &str, driver: Arc<dyn LinkDriver>, ipv6_slots: usize) -> Self {
        let address_mapping_needed = driver.address_mapping_needed();
        Interface {
            index,
            name: name.to_string(),
            mtu: 1500,
            mac: MacAddress::ZERO,
            ipv4: None,
            ipv6: vec![None; ipv6_slots],
            driver,
            valid: false,
            address_mapping_needed,
            link_up: false,
        }
    }

    pub fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.ipv4.map(|(addr, _)| addr)
    }

    /// Check if `dst` is our address or a broadcast we accept
    pub fn accepts_ipv4(&self, dst: Ipv4Addr) -> bool {
        if dst.is_broadcast() {
            return true;
        }
        match self.ipv4 {
            Some((addr, mask)) => dst == addr || Ipv4Utils::is_broadcast_for(dst, addr, mask),
            None => false,
        }
    }

    /// Check if `dst` is on the directly attached subnet
    pub fn on_link_ipv4(&self, dst: Ipv4Addr) -> bool {
        match self.ipv4 {
            Some((addr, mask)) => Ipv4Utils::same_network(addr, dst, mask),
            None => false,
        }
    }

    pub fn ipv6_valid(&self) -> impl Iterator<Item = &Ipv6Entry> {
        self.ipv6
            .iter()
            .flatten()
            .filter(|e| e.state == Ipv6AddressState::Valid)
    }

    pub fn has_ipv6(&self, addr: Ipv6Addr) -> bool {
        self.ipv6.iter().flatten().any(|e| e.address == addr)
    }

    /// Check if `dst` matches the prefix of one of our addresses
    pub fn on_link_ipv6(&self, dst: Ipv6Addr) -> bool {
        self.ipv6_valid()
            .any(|e| prefix_match(e.address, dst, e.prefix_len))
    }

    /// Source address for `dst`: same-prefix first, then any valid one
    pub fn ipv6_source_for(&self, dst: Ipv6Addr) -> Option<Ipv6Addr> {
        self.ipv6_valid()
            .find(|e| prefix_match(e.address, dst, e.prefix_len))
            .or_else(|| self.ipv6_valid().next())
            .map(|e| e.address)
    }
}
