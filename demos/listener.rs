//! TCP echo server on a TUN device
//!
//! Accepts one connection at a time on 10.0.0.1:7 and echoes everything
//! back until the peer closes:
//!
//! ```sh
//! sudo cargo run --example listener --features tun
//! nc 10.0.0.1 7
//! ```
//!
//! Root privileges are required to create and configure the TUN device.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use duonet::iface::TunDriver;
use duonet::{Ip, IpConfig, NxError, PacketPool, TcpOptions, TcpSocket, WaitOption};

mod utils;
use utils::network::configure_interface;

fn to_io(e: NxError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn serve(socket: &TcpSocket) -> duonet::Result<()> {
    socket.server_socket_accept(WaitOption::Forever)?;
    let (peer, peer_port) = socket.peer_info()?;
    println!("Connection from {}:{}", peer, peer_port);
    loop {
        match socket.receive(WaitOption::Forever) {
            Ok(packet) => {
                println!("Echoing {} bytes", packet.len());
                socket.send(packet, WaitOption::from_millis(5000))?;
            }
            Err(NxError::NotConnected) => break,
            Err(e) => return Err(e),
        }
    }
    let _ = socket.disconnect(WaitOption::from_millis(2000));
    println!("Connection from {}:{} closed", peer, peer_port);
    Ok(())
}

fn main() -> io::Result<()> {
    let port = 7;
    let driver = TunDriver::open("tun0")?;
    let tun_name = driver.name().to_string();
    println!("TUN device created: {}", tun_name);

    let ip = Ip::create(
        "listener",
        PacketPool::new("listener", 1536, 128),
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(255, 255, 255, 0),
        Arc::new(driver),
        IpConfig::default(),
    )
    .map_err(to_io)?;
    configure_interface(&tun_name, "10.0.0.254/24")?;
    ip.icmp_enable().map_err(to_io)?;
    ip.tcp_enable().map_err(to_io)?;

    let socket = TcpSocket::create(&ip, "echo", TcpOptions::default()).map_err(to_io)?;
    ip.tcp_server_socket_listen(port, &socket, 0, None).map_err(to_io)?;
    println!("TCP echo listening on 10.0.0.1:{}", port);

    loop {
        if let Err(e) = serve(&socket) {
            eprintln!("Connection failed: {}", e);
        }
        socket.server_socket_unaccept().map_err(to_io)?;
        ip.tcp_server_socket_relisten(port, &socket).map_err(to_io)?;
    }
}
