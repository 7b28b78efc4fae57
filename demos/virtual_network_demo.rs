//! Two stacks on an in-memory Ethernet segment
//!
//! Shows address resolution, echo and a TCP transfer between two IP
//! instances without any operating system networking:
//!
//! ```sh
//! cargo run --example virtual_network_demo
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::thread;

use duonet::{Ip, IpConfig, PacketPool, TcpOptions, TcpSocket, VirtualNetwork, WaitOption};

fn host(net: &VirtualNetwork, last: u8) -> duonet::Result<Ip> {
    let ip = Ip::create(
        &format!("host{}", last),
        PacketPool::new("demo", 1536, 64),
        Ipv4Addr::new(10, 0, 0, last),
        Ipv4Addr::new(255, 255, 255, 0),
        net.link(),
        IpConfig::default(),
    )?;
    ip.arp_enable(16)?;
    ip.icmp_enable()?;
    ip.tcp_enable()?;
    Ok(ip)
}

fn main() -> duonet::Result<()> {
    println!("Starting Virtual Network Demo...");
    let net = VirtualNetwork::new(0);
    let client = host(&net, 1)?;
    let server = host(&net, 2)?;

    let reply = client.ping(Ipv4Addr::new(10, 0, 0, 2), b"hello", WaitOption::from_millis(1000))?;
    println!("Ping reply: {:?}", String::from_utf8_lossy(reply.data()));
    drop(reply);

    let listener = TcpSocket::create(&server, "server", TcpOptions::default())?;
    server.tcp_server_socket_listen(80, &listener, 0, None)?;
    let handle = thread::spawn(move || -> duonet::Result<usize> {
        listener.server_socket_accept(WaitOption::from_millis(2000))?;
        let mut received = 0;
        while let Ok(packet) = listener.receive(WaitOption::from_millis(2000)) {
            received += packet.len();
        }
        listener.disconnect(WaitOption::from_millis(2000))?;
        Ok(received)
    });

    let socket = TcpSocket::create(&client, "client", TcpOptions::default())?;
    let port = socket.client_socket_bind(0, WaitOption::NoWait)?;
    socket.client_socket_connect(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80, WaitOption::from_millis(2000))?;
    println!("Connected from port {}", port);

    for chunk in 0..4u8 {
        let packet = client.pool()?.allocate_with(duonet::packet::TCP_PACKET, &[chunk; 1000])?;
        socket.send(packet, WaitOption::from_millis(2000))?;
    }
    socket.disconnect(WaitOption::from_millis(2000))?;

    match handle.join() {
        Ok(Ok(received)) => println!("Server received {} bytes", received),
        Ok(Err(e)) => println!("Server failed: {}", e),
        Err(_) => println!("Server thread panicked"),
    }
    println!("Client TCP counters: {:?}", client.tcp_info()?);
    println!("Segment: {} frames delivered, {} dropped", net.delivered(), net.dropped());

    client.delete()?;
    server.delete()?;
    Ok(())
}
