//! Link driver over a Linux TUN device
//!
//! A TUN device carries bare IP datagrams, so the interface is point-to-point:
//! no link header, no ARP and no Neighbor Discovery. A reader thread started
//! on `Initialize` pushes every datagram into the deferred receive queue.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use tun_tap::{Iface, Mode};

use crate::error::{NxError, Result};
use crate::iface::driver::{DriverCommand, DriverRequest, LinkDriver};
use crate::ip::LinkReceiver;
use crate::network::MacAddress;

const TUN_MTU: usize = 1500;

/// Driver for a TUN device
pub struct TunDriver {
    iface: Arc<Iface>,
    running: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
}

impl TunDriver {
    /// Open (or create) the TUN device `name`
    pub fn open(name: &str) -> io::Result<Self> {
        let iface = Iface::without_packet_info(name, Mode::Tun)?;
        Ok(TunDriver {
            iface: Arc::new(iface),
            running: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Name the kernel assigned to the device
    pub fn name(&self) -> &str {
        self.iface.name()
    }

    fn spawn_reader(&self, interface: usize, receiver: LinkReceiver) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let iface = self.iface.clone();
        let running = self.running.clone();
        let enabled = self.enabled.clone();
        thread::Builder::new()
            .name(format!("tun-{}", self.iface.name()))
            .spawn(move || {
                let mut buf = vec![0u8; TUN_MTU + 4];
                while running.load(Ordering::Acquire) {
                    let n = match iface.recv(&mut buf) {
                        Ok(n) => n,
                        Err(e) => {
                            warn!("tun receive failed: {}", e);
                            break;
                        }
                    };
                    if !enabled.load(Ordering::Acquire) || n == 0 {
                        continue;
                    }
                    receiver.datagram_receive(interface, &buf[..n]);
                }
                debug!("tun reader stopped");
            })
            .map(|_| ())
            .map_err(|_| NxError::DriverError)
    }
}

impl LinkDriver for TunDriver {
    fn request(&self, request: &mut DriverRequest) -> Result<()> {
        match request.command {
            DriverCommand::Initialize => {
                let receiver = request.receiver.take().ok_or(NxError::InvalidParameters)?;
                request.physical_address = Some(MacAddress::ZERO);
                request.mtu = Some(TUN_MTU);
                self.spawn_reader(request.interface, receiver)
            }
            DriverCommand::Enable => {
                self.enabled.store(true, Ordering::Release);
                Ok(())
            }
            DriverCommand::Disable => {
                self.enabled.store(false, Ordering::Release);
                Ok(())
            }
            DriverCommand::Uninitialize => {
                self.enabled.store(false, Ordering::Release);
                self.running.store(false, Ordering::Release);
                Ok(())
            }
            DriverCommand::Send | DriverCommand::Broadcast => {
                let packet = request.packet.take().ok_or(NxError::InvalidPacket)?;
                self.iface
                    .send(&packet.to_vec())
                    .map(|_| ())
                    .map_err(|_| NxError::DriverError)
            }
            DriverCommand::GetStatus => {
                request.link_up = self.enabled.load(Ordering::Acquire);
                Ok(())
            }
            DriverCommand::MulticastJoin
            | DriverCommand::MulticastLeave
            | DriverCommand::DeferredProcessing => Ok(()),
            DriverCommand::ArpSend | DriverCommand::ArpResponseSend | DriverCommand::RarpSend => {
                Err(NxError::NotSupported)
            }
        }
    }

    fn address_mapping_needed(&self) -> bool {
        false
    }
}
