//! Interface table and address services

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{NxError, Result};
use crate::iface::driver::{DriverCommand, DriverRequest, LinkDriver};
use crate::ip::{Ip, IpState};
use crate::network::MacAddress;

/// Called with the interface index after its IPv4 address changed
pub type AddressChangeNotify = Arc<dyn Fn(&Ip, usize) + Send + Sync>;

/// What happened to an IPv6 address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6AddressEvent {
    /// Passed duplicate address detection (or skipped it)
    Valid,
    /// Removed by the application
    Deleted,
    /// Another node already owns it; removed
    DuplicateDetected,
}

/// Called after an IPv6 address of `interface` changed state
pub type Ipv6AddressChangeNotify = Arc<dyn Fn(&Ip, Ipv6AddressEvent, usize, Ipv6Addr) + Send + Sync>;

/// Snapshot of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: MacAddress,
    pub mtu: usize,
    pub ipv4_address: Ipv4Addr,
    pub ipv4_mask: Ipv4Addr,
    pub link_up: bool,
    pub address_mapping_needed: bool,
}

impl IpState {
    pub(crate) fn address_changed(&mut self, interface: usize) {
        if let (Some(notify), Some(ip)) = (self.address_change_notify.clone(), self.handle()) {
            self.defer(move || notify(&ip, interface));
        }
    }

    pub(crate) fn ipv6_address_changed(&mut self, event: Ipv6AddressEvent, interface: usize, address: Ipv6Addr) {
        if let (Some(notify), Some(ip)) = (self.ipv6_address_change_notify.clone(), self.handle()) {
            self.defer(move || notify(&ip, event, interface, address));
        }
    }

    fn interface_address_assign(&mut self, interface: usize, address: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        let iface = self.interface_mut(interface)?;
        iface.ipv4 = if address.is_unspecified() {
            None
        } else {
            Some((address, mask))
        };
        info!("interface {} address {}/{}", interface, address, mask);
        self.address_changed(interface);
        Ok(())
    }
}

impl Ip {
    /// Attach a secondary interface; returns its index
    pub fn interface_attach(
        &self,
        name: &str,
        address: Ipv4Addr,
        mask: Ipv4Addr,
        driver: Arc<dyn LinkDriver>,
    ) -> Result<usize> {
        self.locked(|s| {
            let index = s
                .interfaces
                .iter()
                .position(|i| i.is_none())
                .ok_or(NxError::NoMoreEntries)?;
            let ipv4 = if address.is_unspecified() {
                None
            } else {
                Some((address, mask))
            };
            s.interface_start(index, name, ipv4, driver)?;
            if s.ipv6.is_some() {
                s.ipv6_interface_start(index)?;
            }
            Ok(index)
        })
    }

    /// Detach a secondary interface.
    ///
    /// Its ARP and neighbor entries, routes and group memberships go with
    /// it; packets queued on them are released.
    pub fn interface_detach(&self, index: usize) -> Result<()> {
        self.locked(|s| {
            if index == 0 {
                return Err(NxError::InvalidInterface);
            }
            s.interface(index)?;
            let purged = s.arp.as_mut().map_or(0, |arp| arp.interface_purge(index));
            s.ipv6_interface_purge(index);
            s.routes.interface_purge(index);
            s.multicast.interface_purge(index);
            for command in [DriverCommand::Disable, DriverCommand::Uninitialize] {
                if let Err(e) = s.driver_request(&mut DriverRequest::new(command, index)) {
                    warn!("interface {}: {:?} failed: {}", index, command, e);
                }
            }
            s.interfaces[index] = None;
            debug!("interface {} detached, {} arp entries purged", index, purged);
            Ok(())
        })
    }

    pub fn interface_info(&self, index: usize) -> Result<InterfaceInfo> {
        self.locked(|s| {
            let iface = s.interface(index)?;
            let (ipv4_address, ipv4_mask) = iface.ipv4.unwrap_or((Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED));
            Ok(InterfaceInfo {
                name: iface.name.clone(),
                mac: iface.mac,
                mtu: iface.mtu,
                ipv4_address,
                ipv4_mask,
                link_up: iface.link_up,
                address_mapping_needed: iface.address_mapping_needed,
            })
        })
    }

    /// Address and mask of the primary interface
    pub fn address(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        self.interface_address_get(0)
    }

    pub fn address_set(&self, address: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        self.interface_address_set(0, address, mask)
    }

    pub fn interface_address_get(&self, index: usize) -> Result<(Ipv4Addr, Ipv4Addr)> {
        self.locked(|s| {
            Ok(s
                .interface(index)?
                .ipv4
                .unwrap_or((Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)))
        })
    }

    /// Change the address of `index`; the unspecified address removes it
    pub fn interface_address_set(&self, index: usize, address: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        self.locked(|s| s.interface_address_assign(index, address, mask))
    }

    /// Set the default gateway, which must be on one of our subnets
    pub fn gateway_address_set(&self, gateway: Ipv4Addr) -> Result<()> {
        self.locked(|s| {
            if !s.live_interfaces().any(|i| i.on_link_ipv4(gateway)) {
                return Err(NxError::IpAddressError);
            }
            s.gateway = Some(gateway);
            Ok(())
        })
    }

    pub fn gateway_address_get(&self) -> Result<Ipv4Addr> {
        self.locked(|s| s.gateway.ok_or(NxError::NotEnabled))
    }

    /// Install (or with `None` remove) the IPv4 address change callback
    pub fn address_change_notify(&self, notify: Option<AddressChangeNotify>) -> Result<()> {
        self.locked(|s| {
            s.address_change_notify = notify;
            Ok(())
        })
    }

    pub fn ipv6_address_change_notify(&self, notify: Option<Ipv6AddressChangeNotify>) -> Result<()> {
        self.locked(|s| {
            s.ipv6_address_change_notify = notify;
            Ok(())
        })
    }

    /// Ask the driver whether the link is up
    pub fn link_status(&self, index: usize) -> Result<bool> {
        self.locked(|s| {
            let mut request = DriverRequest::new(DriverCommand::GetStatus, index);
            s.driver_request(&mut request)?;
            s.interface_mut(index)?.link_up = request.link_up;
            Ok(request.link_up)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;
    use std::sync::mpsc;

    #[test]
    fn test_address_change_notified_after_unlock() {
        let net = VirtualNetwork::new(8);
        let ip = instance(&net, 1);
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        ip.address_change_notify(Some(Arc::new(move |ip: &Ip, interface| {
            let address = ip.interface_address_get(interface).unwrap().0;
            tx.lock().unwrap().send((interface, address)).unwrap();
        })))
        .unwrap();
        ip.address_set(Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(255, 255, 255, 0))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), (0, Ipv4Addr::new(10, 0, 0, 50)));
    }

    #[test]
    fn test_attach_detach_purges_arp() {
        let net = VirtualNetwork::new(8);
        let ip = instance(&net, 1);
        ip.arp_enable(8).unwrap();
        let index = ip
            .interface_attach("eth1", Ipv4Addr::new(10, 1, 0, 1), Ipv4Addr::new(255, 255, 0, 0), net.link())
            .unwrap();
        assert_eq!(index, 1);
        let peer = Ipv4Addr::new(10, 1, 0, 9);
        ip.arp_static_entry_create(peer, MacAddress([2, 0, 0, 0, 9, 9])).unwrap();
        assert!(ip.arp_hardware_address_find(peer).is_ok());

        ip.interface_detach(index).unwrap();
        assert_eq!(ip.arp_hardware_address_find(peer), Err(NxError::EntryNotFound));
        assert_eq!(ip.interface_info(index), Err(NxError::InvalidInterface));
        assert_eq!(ip.interface_detach(0), Err(NxError::InvalidInterface));
    }

    #[test]
    fn test_link_status_follows_driver() {
        let net = VirtualNetwork::new(8);
        let link = net.link();
        let ip = Ip::create(
            "ls",
            crate::packet::PacketPool::new("ls", 256, 4),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            link.clone(),
            crate::config::IpConfig::manual(),
        )
        .unwrap();
        assert!(ip.link_status(0).unwrap());
        link.set_link_up(false);
        assert!(!ip.link_status(0).unwrap());
        assert!(!ip.interface_info(0).unwrap().link_up);
    }

    #[test]
    fn test_gateway_must_be_on_link() {
        let net = VirtualNetwork::new(8);
        let ip = instance(&net, 1);
        assert_eq!(ip.gateway_address_set(Ipv4Addr::new(192, 168, 0, 1)), Err(NxError::IpAddressError));
        ip.gateway_address_set(Ipv4Addr::new(10, 0, 0, 254)).unwrap();
        assert_eq!(ip.gateway_address_get().unwrap(), Ipv4Addr::new(10, 0, 0, 254));
    }
}
