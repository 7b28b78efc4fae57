//! Tunables of an IP instance
//!
//! Every field has the default the stack was designed around. Counts are in
//! periodic ticks unless the name says otherwise: ARP, ND, IGMP and reassembly
//! timers run on the slow periodic tick, TCP timers on the fast tick.

use std::time::Duration;

/// Configuration of an IP instance
#[derive(Debug, Clone)]
pub struct IpConfig {
    /// Maximum number of physical interfaces, 1 to 32
    pub max_interfaces: usize,
    /// Spawn the helper and timer threads on create
    pub helper_thread: bool,
    /// Slow periodic tick (ARP/ND aging, IGMP, reassembly)
    pub periodic_interval: Duration,
    /// Fast tick driving TCP timers
    pub tcp_fast_interval: Duration,
    /// Default time-to-live for outgoing IPv4 datagrams
    pub default_ttl: u8,

    /// Number of ARP hash buckets, a power of two
    pub arp_table_size: usize,
    /// Ticks between ARP request retransmissions
    pub arp_update_rate: u32,
    /// Ticks before a resolved dynamic entry is re-probed, zero disables
    pub arp_expiration_rate: u32,
    /// Requests sent before an unresolved entry is purged
    pub arp_max_retries: u32,
    /// Packets queued on one unresolved entry
    pub arp_max_queue_depth: usize,
    /// Evict the least recently resolved dynamic entry when the cache is full
    pub arp_evict: bool,

    /// Neighbor cache slots
    pub nd_cache_size: usize,
    /// Packets queued on one incomplete neighbor
    pub nd_max_queue_depth: usize,
    /// Multicast solicitations before an incomplete neighbor is dropped
    pub nd_max_multicast_solicit: u32,
    /// Unicast probes before an unreachable neighbor is dropped
    pub nd_max_unicast_solicit: u32,
    /// Ticks between solicitations
    pub nd_retrans_timer: u32,
    /// Ticks a confirmed neighbor stays reachable
    pub nd_reachable_time: u32,
    /// Ticks spent in DELAY before probing
    pub nd_delay_first_probe: u32,
    /// Periodic ticks an address stays tentative, zero skips DAD
    pub nd_dad_transmits: u32,
    /// IPv6 addresses per interface
    pub ipv6_addresses_per_interface: usize,
    /// Default IPv6 routers
    pub ipv6_default_routers: usize,
    /// Hop limit for outgoing IPv6 datagrams
    pub default_hop_limit: u8,

    /// Static routes
    pub static_route_table_size: usize,
    /// IPv4 multicast groups
    pub max_multicast_groups: usize,
    /// Ticks an incomplete datagram is kept for reassembly
    pub fragment_timeout: u32,
    /// Datagrams under reassembly at once
    pub max_reassemblies: usize,
    /// Raw receive queue depth
    pub raw_queue_max: usize,

    /// Default TCP window
    pub tcp_window_size: u32,
    /// Default MSS when the peer does not announce one
    pub tcp_default_mss: u16,
    /// Initial retransmission timeout in fast ticks
    pub tcp_timeout_rate: u32,
    /// Upper bound on one retransmission timeout in fast ticks
    pub tcp_max_timeout: u32,
    /// Retransmissions before the connection is reset
    pub tcp_max_retries: u32,
    /// Backoff shift applied per retry
    pub tcp_retry_shift: u32,
    /// Unacknowledged segments per socket
    pub tcp_transmit_queue_max: usize,
    /// Fast ticks spent in TIME_WAIT
    pub tcp_time_wait_ticks: u32,
    /// SYNs queued on a listener without a ready socket
    pub tcp_listen_queue_max: usize,
    /// Bound-port hash buckets per protocol, a power of two
    pub port_table_size: usize,
    /// First ephemeral port
    pub first_ephemeral_port: u16,

    /// Default UDP receive queue depth
    pub udp_queue_max: usize,
}

impl Default for IpConfig {
    fn default() -> Self {
        IpConfig {
            max_interfaces: 4,
            helper_thread: true,
            periodic_interval: Duration::from_secs(1),
            tcp_fast_interval: Duration::from_millis(100),
            default_ttl: 128,

            arp_table_size: 32,
            arp_update_rate: 10,
            arp_expiration_rate: 0,
            arp_max_retries: 18,
            arp_max_queue_depth: 4,
            arp_evict: true,

            nd_cache_size: 16,
            nd_max_queue_depth: 4,
            nd_max_multicast_solicit: 3,
            nd_max_unicast_solicit: 3,
            nd_retrans_timer: 1,
            nd_reachable_time: 30,
            nd_delay_first_probe: 5,
            nd_dad_transmits: 1,
            ipv6_addresses_per_interface: 3,
            ipv6_default_routers: 8,
            default_hop_limit: 255,

            static_route_table_size: 8,
            max_multicast_groups: 7,
            fragment_timeout: 60,
            max_reassemblies: 4,
            raw_queue_max: 20,

            tcp_window_size: 8192,
            tcp_default_mss: 536,
            tcp_timeout_rate: 10,
            tcp_max_timeout: 640,
            tcp_max_retries: 10,
            tcp_retry_shift: 1,
            tcp_transmit_queue_max: 20,
            tcp_time_wait_ticks: 20,
            tcp_listen_queue_max: 5,
            port_table_size: 32,
            first_ephemeral_port: 0xC000,

            udp_queue_max: 16,
        }
    }
}

impl IpConfig {
    /// Configuration for an application that drives the helper pass itself
    pub fn manual() -> Self {
        IpConfig {
            helper_thread: false,
            ..IpConfig::default()
        }
    }
}
