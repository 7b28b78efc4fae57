#![allow(dead_code)]

use std::net::Ipv4Addr;

use duonet::{Ip, IpConfig, MacAddress, PacketPool, VirtualNetwork};

pub const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

pub struct Host {
    pub ip: Ip,
    pub mac: MacAddress,
}

/// 10.0.0.`last` on `net`, helper threads as `config` says
pub fn host(net: &VirtualNetwork, last: u8, config: IpConfig) -> Host {
    host_with_buffers(net, last, config, 1600)
}

/// Like `host`, with pool buffers of `buffer_size` bytes
pub fn host_with_buffers(net: &VirtualNetwork, last: u8, config: IpConfig, buffer_size: usize) -> Host {
    let link = net.link();
    let mac = link.mac();
    let ip = Ip::create(
        &format!("host{}", last),
        PacketPool::new(&format!("pool{}", last), buffer_size, 64),
        Ipv4Addr::new(10, 0, 0, last),
        MASK,
        link,
        config,
    )
    .unwrap();
    Host { ip, mac }
}

/// Two manually driven hosts with ARP and TCP, each knowing the other's MAC
pub fn manual_pair(net: &VirtualNetwork) -> (Host, Host) {
    let a = host(net, 1, IpConfig::manual());
    let b = host(net, 2, IpConfig::manual());
    for (me, peer, last) in [(&a, &b, 2), (&b, &a, 1)] {
        me.ip.arp_enable(8).unwrap();
        me.ip.tcp_enable().unwrap();
        me.ip.arp_dynamic_entry_set(Ipv4Addr::new(10, 0, 0, last), peer.mac).unwrap();
    }
    (a, b)
}

pub fn settle(hosts: &[&Host]) {
    for _ in 0..8 {
        for h in hosts {
            h.ip.process_pending().unwrap();
        }
    }
}
