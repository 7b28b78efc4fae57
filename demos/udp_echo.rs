//! UDP echo server on a TUN device
//!
//! The host side of `tun0` gets 10.0.0.254/24, the stack answers as
//! 10.0.0.1 on port 7:
//!
//! ```sh
//! sudo cargo run --example udp_echo --features tun
//! echo hello | nc -u 10.0.0.1 7
//! ```

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use duonet::iface::TunDriver;
use duonet::{Ip, IpConfig, NxError, PacketPool, UdpOptions, UdpSocket, WaitOption};

mod utils;
use utils::network::configure_interface;

fn to_io(e: NxError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn main() -> io::Result<()> {
    let port = 7;
    let driver = TunDriver::open("tun0")?;
    let tun_name = driver.name().to_string();

    let ip = Ip::create(
        "udp-echo",
        PacketPool::new("udp-echo", 1536, 64),
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(255, 255, 255, 0),
        Arc::new(driver),
        IpConfig::default(),
    )
    .map_err(to_io)?;
    configure_interface(&tun_name, "10.0.0.254/24")?;
    ip.icmp_enable().map_err(to_io)?;
    ip.udp_enable().map_err(to_io)?;

    let socket = UdpSocket::create(&ip, "echo", UdpOptions::default()).map_err(to_io)?;
    socket.bind(port, WaitOption::NoWait).map_err(to_io)?;
    println!("UDP echo listening on 10.0.0.1:{}", port);

    loop {
        let packet = socket.receive(WaitOption::Forever).map_err(to_io)?;
        let (source, source_port, _) = Ip::udp_packet_info_extract(&packet).map_err(to_io)?;
        println!(
            "{} bytes from {}:{}: {:?}",
            packet.len(),
            source,
            source_port,
            String::from_utf8_lossy(packet.data())
        );
        if let Err(e) = socket.send(packet, source, source_port) {
            eprintln!("Failed to send reply: {}", e);
        }
    }
}
