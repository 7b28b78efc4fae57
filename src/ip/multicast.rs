//! IPv4 multicast membership and IGMPv2
//!
//! Groups are reference counted per interface. The first join programs the
//! driver with the 01:00:5e mapped MAC and, with IGMP enabled, sends an
//! unsolicited report. The last leave removes the driver filter and sends a
//! leave message to 224.0.0.2. Queries mark memberships for a report on the
//! next periodic pass; a report heard from another member cancels ours.

use std::net::{IpAddr, Ipv4Addr};

use log::{debug, trace, warn};

use crate::error::{NxError, Result};
use crate::iface::driver::{DriverCommand, DriverRequest};
use crate::ip::{Ip, IpState};
use crate::network::igmp::{ALL_HOSTS, ALL_ROUTERS, IGMP_V1_MEMBERSHIP_REPORT, IGMP_V2_MEMBERSHIP_REPORT};
use crate::network::{protocol, IgmpMessage, MacAddress};
use crate::packet::{Packet, IP_PACKET};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IgmpInfo {
    pub reports_sent: u64,
    pub queries_received: u64,
    pub checksum_errors: u64,
    pub current_groups_joined: usize,
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    group: Ipv4Addr,
    interface: usize,
    count: u32,
    report_pending: bool,
}

pub(crate) struct MulticastTable {
    groups: Vec<Membership>,
    capacity: usize,
    igmp: bool,
    stats: IgmpInfo,
}

impl MulticastTable {
    pub(crate) fn new(capacity: usize) -> Self {
        MulticastTable {
            groups: Vec::with_capacity(capacity),
            capacity,
            igmp: false,
            stats: IgmpInfo::default(),
        }
    }

    pub(crate) fn igmp_enabled(&self) -> bool {
        self.igmp
    }

    /// True when datagrams for `group` are wanted on `interface`
    pub(crate) fn accepts(&self, group: Ipv4Addr, interface: usize) -> bool {
        group == ALL_HOSTS || self.position(group, interface).is_some()
    }

    fn position(&self, group: Ipv4Addr, interface: usize) -> Option<usize> {
        self.groups
            .iter()
            .position(|m| m.group == group && m.interface == interface)
    }

    pub(crate) fn interface_purge(&mut self, interface: usize) {
        self.groups.retain(|m| m.interface != interface);
    }
}

impl IpState {
    fn igmp_send(&mut self, message: IgmpMessage, destination: Ipv4Addr, interface: usize) {
        let packet = match self.pool.allocate_with(IP_PACKET, &message.serialize()) {
            Ok(packet) => packet,
            Err(_) => return,
        };
        let route = match self.route(IpAddr::V4(destination), Some(interface)) {
            Ok(route) => route,
            Err(e) => {
                debug!("igmp: no route for {}: {}", destination, e);
                return;
            }
        };
        let mut options = self.datagram_options(IpAddr::V4(destination), protocol::IGMP);
        options.ttl = 1;
        if self.send_datagram(packet, &route, options).is_ok() && message.msg_type == IGMP_V2_MEMBERSHIP_REPORT {
            self.multicast.stats.reports_sent += 1;
        }
    }

    fn multicast_filter(&mut self, interface: usize, group: Ipv4Addr, join: bool) -> Result<()> {
        let command = if join {
            DriverCommand::MulticastJoin
        } else {
            DriverCommand::MulticastLeave
        };
        let mut request = DriverRequest::new(command, interface).with_address(MacAddress::from_ipv4_multicast(group));
        self.driver_request(&mut request)
    }

    pub(crate) fn igmp_receive(&mut self, packet: Packet) {
        let interface = packet.meta.interface.unwrap_or(0);
        let message = match IgmpMessage::parse(packet.data()) {
            Ok(message) => message,
            Err(_) => {
                self.multicast.stats.checksum_errors += 1;
                return;
            }
        };
        if message.is_query() {
            self.multicast.stats.queries_received += 1;
            for m in self.multicast.groups.iter_mut().filter(|m| m.interface == interface) {
                if message.group.is_unspecified() || message.group == m.group {
                    m.report_pending = true;
                }
            }
            trace!("igmp: query for {} on interface {}", message.group, interface);
        } else if matches!(message.msg_type, IGMP_V1_MEMBERSHIP_REPORT | IGMP_V2_MEMBERSHIP_REPORT) {
            if let Some(pos) = self.multicast.position(message.group, interface) {
                self.multicast.groups[pos].report_pending = false;
            }
        }
    }

    /// Send the reports queries asked for
    pub(crate) fn igmp_periodic(&mut self) {
        if !self.multicast.igmp {
            return;
        }
        let due: Vec<(Ipv4Addr, usize)> = self
            .multicast
            .groups
            .iter_mut()
            .filter(|m| m.report_pending)
            .map(|m| {
                m.report_pending = false;
                (m.group, m.interface)
            })
            .collect();
        for (group, interface) in due {
            self.igmp_send(IgmpMessage::report(group), group, interface);
        }
    }

    fn multicast_join_on(&mut self, group: Ipv4Addr, interface: usize) -> Result<()> {
        if !group.is_multicast() {
            return Err(NxError::IpAddressError);
        }
        self.interface(interface)?;
        if let Some(pos) = self.multicast.position(group, interface) {
            self.multicast.groups[pos].count += 1;
            return Ok(());
        }
        if self.multicast.groups.len() >= self.multicast.capacity {
            return Err(NxError::NoMoreEntries);
        }
        self.multicast_filter(interface, group, true)?;
        self.multicast.groups.push(Membership {
            group,
            interface,
            count: 1,
            report_pending: false,
        });
        debug!("joined {} on interface {}", group, interface);
        if self.multicast.igmp && group != ALL_HOSTS {
            self.igmp_send(IgmpMessage::report(group), group, interface);
        }
        Ok(())
    }

    fn multicast_leave_on(&mut self, group: Ipv4Addr, interface: Option<usize>) -> Result<()> {
        let pos = self
            .multicast
            .groups
            .iter()
            .position(|m| m.group == group && interface.map_or(true, |i| i == m.interface))
            .ok_or(NxError::EntryNotFound)?;
        let membership = &mut self.multicast.groups[pos];
        membership.count -= 1;
        if membership.count > 0 {
            return Ok(());
        }
        let interface = membership.interface;
        self.multicast.groups.remove(pos);
        if let Err(e) = self.multicast_filter(interface, group, false) {
            warn!("interface {}: removing filter for {} failed: {}", interface, group, e);
        }
        debug!("left {} on interface {}", group, interface);
        if self.multicast.igmp && group != ALL_HOSTS {
            self.igmp_send(IgmpMessage::leave(group), ALL_ROUTERS, interface);
        }
        Ok(())
    }
}

impl Ip {
    pub fn igmp_enable(&self) -> Result<()> {
        self.locked(|s| {
            if s.multicast.igmp {
                return Err(NxError::AlreadyEnabled);
            }
            s.multicast.igmp = true;
            Ok(())
        })
    }

    /// Join `group` on the primary interface
    pub fn multicast_join(&self, group: Ipv4Addr) -> Result<()> {
        self.locked(|s| s.multicast_join_on(group, 0))
    }

    pub fn multicast_interface_join(&self, group: Ipv4Addr, interface: usize) -> Result<()> {
        self.locked(|s| s.multicast_join_on(group, interface))
    }

    /// Drop one reference to `group`, on whichever interface joined it first
    pub fn multicast_leave(&self, group: Ipv4Addr) -> Result<()> {
        self.locked(|s| s.multicast_leave_on(group, None))
    }

    pub fn multicast_interface_leave(&self, group: Ipv4Addr, interface: usize) -> Result<()> {
        self.locked(|s| s.multicast_leave_on(group, Some(interface)))
    }

    pub fn igmp_info(&self) -> Result<IgmpInfo> {
        self.locked(|s| {
            if !s.multicast.igmp {
                return Err(NxError::NotEnabled);
            }
            Ok(IgmpInfo {
                current_groups_joined: s.multicast.groups.len(),
                ..s.multicast.stats
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::IpConfig;
    use crate::iface::{LinkDriver, VirtualLink, VirtualNetwork};
    use crate::ip::tests::instance;
    use crate::packet::PacketPool;
    use crate::network::ipv4::IPV4_HEADER_LEN;
    use crate::network::Ipv4Header;

    fn igmp_of(frame: &crate::iface::Frame) -> (Ipv4Header, IgmpMessage) {
        let header = Ipv4Header::from_bytes(frame.payload()).unwrap();
        let message = IgmpMessage::parse(&frame.payload()[IPV4_HEADER_LEN..]).unwrap();
        (header, message)
    }

    #[test]
    fn test_join_reports_once_and_leave_at_zero() {
        let net = VirtualNetwork::new(4);
        let ip = instance(&net, 1);
        ip.igmp_enable().unwrap();
        net.capture_start();
        let group = Ipv4Addr::new(239, 1, 2, 3);
        ip.multicast_join(group).unwrap();
        ip.multicast_join(group).unwrap();

        let frames = net.captured();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].destination, MacAddress([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03]));
        let (header, message) = igmp_of(&frames[0]);
        assert_eq!(header.ttl, 1);
        assert_eq!(message, IgmpMessage::report(group));

        ip.multicast_leave(group).unwrap();
        assert!(net.captured().is_empty());
        ip.multicast_leave(group).unwrap();
        let frames = net.captured();
        assert_eq!(frames.len(), 1);
        let (header, message) = igmp_of(&frames[0]);
        assert_eq!(header.dst_addr, ALL_ROUTERS);
        assert_eq!(message, IgmpMessage::leave(group));
        assert_eq!(ip.multicast_leave(group), Err(NxError::EntryNotFound));
        assert_eq!(ip.igmp_info().unwrap().reports_sent, 1);
    }

    struct LeaveRefused(Arc<VirtualLink>);

    impl LinkDriver for LeaveRefused {
        fn request(&self, request: &mut DriverRequest) -> Result<()> {
            match request.command {
                DriverCommand::MulticastLeave => Err(NxError::NotSupported),
                _ => self.0.request(request),
            }
        }
    }

    #[test]
    fn test_leave_completes_when_driver_refuses_filter_removal() {
        let net = VirtualNetwork::new(4);
        let ip = Ip::create(
            "ip1",
            PacketPool::new("test", 1600, 64),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Arc::new(LeaveRefused(net.link())),
            IpConfig::manual(),
        )
        .unwrap();
        ip.igmp_enable().unwrap();
        let group = Ipv4Addr::new(239, 4, 4, 4);
        ip.multicast_join(group).unwrap();
        net.capture_start();

        ip.multicast_leave(group).unwrap();
        let frames = net.captured();
        assert_eq!(frames.len(), 1);
        assert_eq!(igmp_of(&frames[0]).1, IgmpMessage::leave(group));
        assert_eq!(ip.multicast_leave(group), Err(NxError::EntryNotFound));
    }

    #[test]
    fn test_group_table_limit() {
        let net = VirtualNetwork::new(4);
        let ip = instance(&net, 1);
        for i in 0..7 {
            ip.multicast_join(Ipv4Addr::new(239, 0, 0, i + 1)).unwrap();
        }
        assert_eq!(ip.multicast_join(Ipv4Addr::new(239, 0, 0, 99)), Err(NxError::NoMoreEntries));
        assert_eq!(ip.multicast_join(Ipv4Addr::new(10, 0, 0, 1)), Err(NxError::IpAddressError));
    }

    #[test]
    fn test_query_answered_on_next_periodic_pass() {
        let net = VirtualNetwork::new(4);
        let ip = instance(&net, 1);
        ip.igmp_enable().unwrap();
        let group = Ipv4Addr::new(239, 9, 9, 9);
        ip.multicast_join(group).unwrap();
        net.capture_start();

        let query = IgmpMessage {
            msg_type: crate::network::igmp::IGMP_MEMBERSHIP_QUERY,
            max_response_time: 100,
            group: Ipv4Addr::UNSPECIFIED,
        };
        let receiver = ip.link_receiver().unwrap();
        let mut packet = ip.pool().unwrap().allocate_with(IP_PACKET, &query.serialize()).unwrap();
        Ipv4Header::new(0, 8, 7, 0, 1, protocol::IGMP, Ipv4Addr::new(10, 0, 0, 254), ALL_HOSTS)
            .write(packet.prepend(IPV4_HEADER_LEN).unwrap());
        packet.meta.interface = Some(0);
        receiver.packet_deferred_receive(packet);
        ip.process_pending().unwrap();
        assert!(net.captured().is_empty());

        ip.periodic_tick().unwrap();
        ip.process_pending().unwrap();
        let frames = net.captured();
        assert_eq!(frames.len(), 1);
        assert_eq!(igmp_of(&frames[0]).1, IgmpMessage::report(group));
        assert_eq!(ip.igmp_info().unwrap().queries_received, 1);
    }
}
