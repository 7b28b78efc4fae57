use std::io;
use std::process::Command;

fn ip_command(args: &[&str]) -> io::Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("`ip {}` failed", args.join(" ")),
        ));
    }
    Ok(())
}

/// Give the host side of the TUN device an address and bring it up
pub fn configure_interface(iface_name: &str, ip_cidr: &str) -> io::Result<()> {
    ip_command(&["addr", "add", ip_cidr, "dev", iface_name])?;
    ip_command(&["link", "set", "up", "dev", iface_name])?;
    println!(
        "Interface {} configured with IP {} and brought up",
        iface_name, ip_cidr
    );
    Ok(())
}
