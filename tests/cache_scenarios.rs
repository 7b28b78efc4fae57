mod common;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use common::{host, MASK};
use duonet::{IpConfig, MacAddress, NxError, VirtualNetwork};

const IP_HEADROOM: usize = 56;

fn unanswered(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

/// Send a raw datagram that needs `dst` resolved first
fn resolve(ip: &duonet::Ip, dst: Ipv4Addr) {
    let packet = ip.pool().unwrap().allocate_with(IP_HEADROOM, b"probe").unwrap();
    ip.raw_send(packet, IpAddr::V4(dst), 253, 0).unwrap();
}

#[test]
fn arp_exhaustion_evicts_oldest_dynamic() {
    let net = VirtualNetwork::new(51);
    let a = host(&net, 1, IpConfig::manual());
    a.ip.arp_enable(4).unwrap();
    a.ip.raw_enable().unwrap();
    let pinned = MacAddress([0x02, 0, 0, 0, 0x51, 0x99]);
    a.ip.arp_static_entry_create(unanswered(100), pinned).unwrap();

    for last in 10..14 {
        resolve(&a.ip, unanswered(last));
    }

    let info = a.ip.arp_info().unwrap();
    assert_eq!(info.static_entries, 1);
    assert_eq!(info.dynamic_entries, 3);
    assert_eq!(info.requests_sent, 4);
    assert_eq!(a.ip.arp_entry_delete(unanswered(10)), Err(NxError::EntryNotFound));
    assert_eq!(a.ip.arp_hardware_address_find(unanswered(100)), Ok(pinned));
    a.ip.arp_entry_delete(unanswered(13)).unwrap();
}

#[test]
fn arp_exhaustion_without_eviction_drops() {
    let net = VirtualNetwork::new(52);
    let config = IpConfig {
        arp_evict: false,
        ..IpConfig::manual()
    };
    let a = host(&net, 1, config);
    a.ip.arp_enable(4).unwrap();
    a.ip.raw_enable().unwrap();
    let pinned = MacAddress([0x02, 0, 0, 0, 0x52, 0x99]);
    a.ip.arp_static_entry_create(unanswered(100), pinned).unwrap();
    let free = a.ip.pool().unwrap().available();

    for last in 10..14 {
        resolve(&a.ip, unanswered(last));
    }

    let info = a.ip.arp_info().unwrap();
    assert_eq!(info.dynamic_entries, 3);
    assert_eq!(a.ip.info().unwrap().send_packets_dropped, 1);
    assert_eq!(a.ip.arp_hardware_address_find(unanswered(100)), Ok(pinned));
    // three datagrams wait for resolution, the fourth went back to the pool
    assert_eq!(a.ip.pool().unwrap().available(), free - 3);
    assert_eq!(a.ip.arp_dynamic_entries_invalidate(), Ok(3));
    assert_eq!(a.ip.pool().unwrap().available(), free);
}

#[test]
fn interface_detach_purges_only_its_neighbors() {
    let lan = VirtualNetwork::new(53);
    let backbone = VirtualNetwork::new(54);
    let a = host(&lan, 1, IpConfig::manual());
    a.ip.ipv6_enable().unwrap();
    let second = a
        .ip
        .interface_attach("backbone", Ipv4Addr::new(10, 1, 0, 1), MASK, backbone.link())
        .unwrap();
    assert_eq!(second, 1);

    let neighbor = |n: u16| Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, n);
    let mac = |n: u8| MacAddress([0x02, 0, 0, 0, 0x53, n]);
    for n in 1..=2 {
        a.ip.nd_cache_entry_set(neighbor(n), 0, mac(n as u8)).unwrap();
    }
    for n in 11..=13 {
        a.ip.nd_cache_entry_set(neighbor(n), second, mac(n as u8)).unwrap();
    }
    let before = a.ip.nd_cache_entries().unwrap();

    a.ip.interface_detach(second).unwrap();

    assert_eq!(a.ip.nd_cache_entries().unwrap(), before - 3);
    for n in 1..=2 {
        assert_eq!(a.ip.nd_cache_hardware_address_find(neighbor(n)), Ok(mac(n as u8)));
    }
    for n in 11..=13 {
        assert_eq!(a.ip.nd_cache_hardware_address_find(neighbor(n)), Err(NxError::EntryNotFound));
    }
    assert!(a.ip.interface_info(second).is_err());
    assert_eq!(a.ip.interface_detach(0), Err(NxError::InvalidInterface));
}

#[test]
fn ping_between_threaded_hosts() {
    let net = VirtualNetwork::new(55);
    let a = host(&net, 1, IpConfig::default());
    let b = host(&net, 2, IpConfig::default());
    for h in [&a, &b] {
        h.ip.arp_enable(8).unwrap();
        h.ip.icmp_enable().unwrap();
    }

    let reply = a
        .ip
        .ping(Ipv4Addr::new(10, 0, 0, 2), b"are you there", duonet::WaitOption::from_millis(3000))
        .unwrap();
    assert_eq!(reply.data(), b"are you there");
    assert_eq!(reply.meta.source, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
    drop(reply);

    assert_eq!(
        a.ip.ping(Ipv4Addr::new(10, 0, 0, 9), b"nobody", duonet::WaitOption::from_millis(200))
            .unwrap_err(),
        NxError::NoResponse
    );

    a.ip.delete().unwrap();
    b.ip.delete().unwrap();
}
