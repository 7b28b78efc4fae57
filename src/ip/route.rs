//! Route selection
//!
//! Lookup order for IPv4: limited broadcast, multicast, one of our own
//! addresses, directed broadcast, directly attached subnet, static routes by
//! longest prefix, default gateway. IPv6 has no static table: link-local and
//! on-prefix destinations are direct, everything else goes to a default
//! router.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::debug;

use crate::error::{NxError, Result};
use crate::ip::{Ip, IpState};
use crate::network::ipv4::Ipv4Utils;
use crate::network::ipv6::is_link_local;

/// How a datagram leaves the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteKind {
    /// Addressed to ourselves, looped back
    Local,
    Broadcast,
    Multicast,
    /// Next hop is the destination itself
    Direct,
    /// Next hop is a router
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Route {
    pub interface: usize,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub next_hop: IpAddr,
    pub kind: RouteKind,
}

/// A configured IPv4 static route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRoute {
    pub network: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub next_hop: Ipv4Addr,
    pub interface: usize,
}

impl StaticRoute {
    fn covers(&self, dst: Ipv4Addr) -> bool {
        Ipv4Utils::same_network(self.network, dst, self.mask)
    }
}

pub(crate) struct RouteTable {
    routes: Vec<StaticRoute>,
    capacity: usize,
}

impl RouteTable {
    pub(crate) fn new(capacity: usize) -> Self {
        RouteTable {
            routes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn add(&mut self, route: StaticRoute) -> Result<()> {
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.network == route.network && r.mask == route.mask)
        {
            *existing = route;
            return Ok(());
        }
        if self.routes.len() >= self.capacity {
            return Err(NxError::NoMoreEntries);
        }
        self.routes.push(route);
        Ok(())
    }

    fn delete(&mut self, network: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        let before = self.routes.len();
        self.routes.retain(|r| !(r.network == network && r.mask == mask));
        if self.routes.len() == before {
            Err(NxError::EntryNotFound)
        } else {
            Ok(())
        }
    }

    /// Longest matching prefix
    fn lookup(&self, dst: Ipv4Addr) -> Option<&StaticRoute> {
        self.routes
            .iter()
            .filter(|r| r.covers(dst))
            .max_by_key(|r| u32::from(r.mask).count_ones())
    }

    pub(crate) fn interface_purge(&mut self, interface: usize) {
        self.routes.retain(|r| r.interface != interface);
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }
}

impl IpState {
    /// Pick interface, source and next hop for `dst`.
    ///
    /// `hint` restricts the choice to one interface.
    pub(crate) fn route(&self, dst: IpAddr, hint: Option<usize>) -> Result<Route> {
        if let Some(index) = hint {
            self.interface(index)?;
        }
        match dst {
            IpAddr::V4(dst) => self.route_v4(dst, hint),
            IpAddr::V6(dst) => self.route_v6(dst, hint),
        }
    }

    fn candidates(&self, hint: Option<usize>) -> impl Iterator<Item = &crate::iface::Interface> {
        self.live_interfaces()
            .filter(move |i| hint.map_or(true, |h| h == i.index))
    }

    fn route_v4(&self, dst: Ipv4Addr, hint: Option<usize>) -> Result<Route> {
        let make = |iface: &crate::iface::Interface, next_hop: Ipv4Addr, kind: RouteKind| Route {
            interface: iface.index,
            source: IpAddr::V4(iface.ipv4_address().unwrap_or(Ipv4Addr::UNSPECIFIED)),
            destination: IpAddr::V4(dst),
            next_hop: IpAddr::V4(next_hop),
            kind,
        };

        if dst.is_broadcast() || dst.is_multicast() {
            let kind = if dst.is_broadcast() {
                RouteKind::Broadcast
            } else {
                RouteKind::Multicast
            };
            let iface = self
                .candidates(hint)
                .find(|i| i.ipv4.is_some())
                .or_else(|| self.candidates(hint).next())
                .ok_or(NxError::IpAddressError)?;
            return Ok(make(iface, dst, kind));
        }
        if let Some(iface) = self.live_interfaces().find(|i| i.ipv4_address() == Some(dst)) {
            return Ok(make(iface, dst, RouteKind::Local));
        }
        if let Some(iface) = self.candidates(hint).find(|i| i.accepts_ipv4(dst)) {
            return Ok(make(iface, dst, RouteKind::Broadcast));
        }
        if let Some(iface) = self.candidates(hint).find(|i| i.on_link_ipv4(dst)) {
            return Ok(make(iface, dst, RouteKind::Direct));
        }
        if let Some(route) = self.routes.lookup(dst) {
            if let Some(iface) = self.candidates(hint).find(|i| i.index == route.interface) {
                return Ok(make(iface, route.next_hop, RouteKind::Gateway));
            }
        }
        if let Some(gateway) = self.gateway {
            if let Some(iface) = self.candidates(hint).find(|i| i.on_link_ipv4(gateway)) {
                return Ok(make(iface, gateway, RouteKind::Gateway));
            }
        }
        Err(NxError::IpAddressError)
    }

    fn route_v6(&self, dst: Ipv6Addr, hint: Option<usize>) -> Result<Route> {
        let routers = self.ipv6.as_ref().ok_or(NxError::NotEnabled)?;
        let make = |iface: &crate::iface::Interface, next_hop: Ipv6Addr, kind: RouteKind| -> Result<Route> {
            let source = iface.ipv6_source_for(dst).ok_or(NxError::IpAddressError)?;
            Ok(Route {
                interface: iface.index,
                source: IpAddr::V6(source),
                destination: IpAddr::V6(dst),
                next_hop: IpAddr::V6(next_hop),
                kind,
            })
        };

        if dst.is_multicast() {
            let iface = self
                .candidates(hint)
                .find(|i| i.ipv6_valid().next().is_some())
                .ok_or(NxError::IpAddressError)?;
            return make(iface, dst, RouteKind::Multicast);
        }
        if let Some(iface) = self
            .live_interfaces()
            .find(|i| i.ipv6_valid().any(|e| e.address == dst))
        {
            return make(iface, dst, RouteKind::Local);
        }
        if is_link_local(dst) {
            let iface = self.candidates(hint).next().ok_or(NxError::IpAddressError)?;
            return make(iface, dst, RouteKind::Direct);
        }
        if let Some(iface) = self.candidates(hint).find(|i| i.on_link_ipv6(dst)) {
            return make(iface, dst, RouteKind::Direct);
        }
        for router in routers.routers.iter() {
            if let Some(iface) = self.candidates(hint).find(|i| i.index == router.interface) {
                return make(iface, router.address, RouteKind::Gateway);
            }
        }
        Err(NxError::IpAddressError)
    }
}

impl Ip {
    /// Add or replace a route to `network`/`mask` through `next_hop`
    pub fn static_route_add(&self, network: Ipv4Addr, mask: Ipv4Addr, next_hop: Ipv4Addr) -> Result<()> {
        self.locked(|s| {
            let interface = s
                .live_interfaces()
                .find(|i| i.on_link_ipv4(next_hop))
                .map(|i| i.index)
                .ok_or(NxError::IpAddressError)?;
            let network = Ipv4Addr::from(u32::from(network) & u32::from(mask));
            s.routes.add(StaticRoute {
                network,
                mask,
                next_hop,
                interface,
            })?;
            debug!("route {}/{} via {} added", network, u32::from(mask).count_ones(), next_hop);
            Ok(())
        })
    }

    pub fn static_route_delete(&self, network: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        self.locked(|s| {
            let network = Ipv4Addr::from(u32::from(network) & u32::from(mask));
            s.routes.delete(network, mask)
        })
    }

    /// Number of static routes configured
    pub fn static_route_count(&self) -> Result<usize> {
        self.locked(|s| Ok(s.routes.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::VirtualNetwork;
    use crate::ip::tests::instance;

    #[test]
    fn test_route_order() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.gateway_address_set(Ipv4Addr::new(10, 0, 0, 254)).unwrap();
        ip.static_route_add(
            Ipv4Addr::new(172, 16, 0, 0),
            Ipv4Addr::new(255, 255, 0, 0),
            Ipv4Addr::new(10, 0, 0, 200),
        )
        .unwrap();

        let route = |dst: Ipv4Addr| ip.locked(|s| s.route(IpAddr::V4(dst), None)).unwrap();
        assert_eq!(route(Ipv4Addr::new(10, 0, 0, 1)).kind, RouteKind::Local);
        assert_eq!(route(Ipv4Addr::new(10, 0, 0, 255)).kind, RouteKind::Broadcast);
        assert_eq!(route(Ipv4Addr::new(224, 0, 0, 9)).kind, RouteKind::Multicast);
        assert_eq!(route(Ipv4Addr::new(10, 0, 0, 7)).kind, RouteKind::Direct);
        let via = route(Ipv4Addr::new(172, 16, 3, 4));
        assert_eq!(via.kind, RouteKind::Gateway);
        assert_eq!(via.next_hop, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200)));
        let default = route(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(default.next_hop, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254)));
    }

    #[test]
    fn test_unreachable_without_gateway() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        let result = ip.locked(|s| s.route(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), None));
        assert_eq!(result.unwrap_err(), NxError::IpAddressError);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        ip.static_route_add(Ipv4Addr::new(172, 16, 0, 0), Ipv4Addr::new(255, 240, 0, 0), Ipv4Addr::new(10, 0, 0, 2))
            .unwrap();
        ip.static_route_add(Ipv4Addr::new(172, 16, 5, 0), Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::new(10, 0, 0, 3))
            .unwrap();
        let route = ip
            .locked(|s| s.route(IpAddr::V4(Ipv4Addr::new(172, 16, 5, 9)), None))
            .unwrap();
        assert_eq!(route.next_hop, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));
        ip.static_route_delete(Ipv4Addr::new(172, 16, 5, 0), Ipv4Addr::new(255, 255, 255, 0))
            .unwrap();
        assert_eq!(
            ip.static_route_delete(Ipv4Addr::new(172, 16, 5, 0), Ipv4Addr::new(255, 255, 255, 0)),
            Err(NxError::EntryNotFound)
        );
    }

    #[test]
    fn test_next_hop_must_be_on_link() {
        let net = VirtualNetwork::new(1);
        let ip = instance(&net, 1);
        assert_eq!(
            ip.static_route_add(Ipv4Addr::new(172, 16, 0, 0), Ipv4Addr::new(255, 255, 0, 0), Ipv4Addr::new(9, 9, 9, 9)),
            Err(NxError::IpAddressError)
        );
    }
}
