//! Link-layer and driver seam.
//!
//! The authenticator talks to the wireless driver only through [`Driver`]:
//! EAPOL frames go out through `send_eapol`, key and station control goes
//! through `request`. [`LinkDriver`] is the raw-socket implementation.

use std::io;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::ethernet::{EtherType, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet_base::MacAddr;
use portauth_core::station::{ETH_P_PAE, ETH_P_PREAUTH};
use portauth_core::BssConfig;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// IEEE 802.1X PAE group address.
pub const PAE_GROUP_ADDR: MacAddr = MacAddr(0x01, 0x80, 0xc2, 0x00, 0x00, 0x03);
const ETH_HDR_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTarget {
    Broadcast,
    Station(MacAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverRequest {
    SetKey { target: KeyTarget, index: u8, key: Vec<u8> },
    SetPairwiseMasterKey { addr: MacAddr, pmk: Vec<u8> },
    SetIdleTimeout { addr: MacAddr, timeout: u32 },
    SetAuthorized { addr: MacAddr, authorized: bool },
    /// Use the shared (broadcast) key as the station's pairwise key.
    CopySharedKey { addr: MacAddr },
    Deauthenticate { addr: MacAddr },
}

impl DriverRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DriverRequest::SetKey { .. } => "set-key",
            DriverRequest::SetPairwiseMasterKey { .. } => "set-pmk",
            DriverRequest::SetIdleTimeout { .. } => "set-idle-timeout",
            DriverRequest::SetAuthorized { .. } => "set-authorized",
            DriverRequest::CopySharedKey { .. } => "copy-shared-key",
            DriverRequest::Deauthenticate { .. } => "deauthenticate",
        }
    }
}

pub trait Driver: Send {
    /// Sends an EAPOL frame (without Ethernet header) to `dst`.
    fn send_eapol(&mut self, bss: usize, dst: MacAddr, ethertype: u16, frame: &[u8]) -> io::Result<()>;

    fn request(&mut self, bss: usize, request: DriverRequest) -> io::Result<()>;
}

/// An EAPOL frame received on one of the BSS interfaces.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub bss: usize,
    pub src: MacAddr,
    pub ethertype: u16,
    pub data: Vec<u8>,
}

struct Link {
    ifname: String,
    own_addr: MacAddr,
    tx: Box<dyn DataLinkSender>,
}

/// pnet datalink channels, one per BSS.
pub struct LinkDriver {
    links: Vec<Link>,
}

impl LinkDriver {
    /// Opens a channel on every BSS interface and starts a reader thread for
    /// each. Returns the driver and the MAC address used on each BSS.
    pub fn open(bss: &[BssConfig], frames: mpsc::Sender<RxFrame>) -> Result<(Self, Vec<MacAddr>)> {
        let interfaces = datalink::interfaces();
        let mut links = Vec::with_capacity(bss.len());

        for (index, conf) in bss.iter().enumerate() {
            let interface = interfaces
                .iter()
                .find(|iface: &&NetworkInterface| iface.name == conf.ifname)
                .ok_or_else(|| anyhow!("interface {} not found", conf.ifname))?;
            let own_addr = conf
                .own_addr
                .or(interface.mac)
                .ok_or_else(|| anyhow!("no MAC address for interface {}", conf.ifname))?;

            let mut channel_config = datalink::Config::default();
            channel_config.read_timeout = Some(Duration::from_millis(100));

            let (tx, rx) = match datalink::channel(interface, channel_config) {
                Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
                Ok(_) => bail!("unhandled channel type on {}", conf.ifname),
                Err(e) => bail!("failed to open datalink channel on {}: {}", conf.ifname, e),
            };
            info!("Listening for EAPOL on {} ({})", conf.ifname, own_addr);

            spawn_reader(index, conf.ifname.clone(), own_addr, rx, frames.clone());
            links.push(Link {
                ifname: conf.ifname.clone(),
                own_addr,
                tx,
            });
        }

        let addrs = links.iter().map(|l| l.own_addr).collect();
        Ok((Self { links }, addrs))
    }

    fn link(&mut self, bss: usize) -> io::Result<&mut Link> {
        self.links
            .get_mut(bss)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no BSS {}", bss)))
    }
}

fn spawn_reader(
    bss: usize,
    ifname: String,
    own_addr: MacAddr,
    mut rx: Box<dyn DataLinkReceiver>,
    frames: mpsc::Sender<RxFrame>,
) {
    thread::spawn(move || loop {
        match rx.next() {
            Ok(packet) => {
                let Some(eth) = EthernetPacket::new(packet) else {
                    continue;
                };
                let ethertype = eth.get_ethertype().0;
                if ethertype != ETH_P_PAE && ethertype != ETH_P_PREAUTH {
                    continue;
                }
                let dst = eth.get_destination();
                if dst != own_addr && dst != PAE_GROUP_ADDR {
                    continue;
                }
                let frame = RxFrame {
                    bss,
                    src: eth.get_source(),
                    ethertype,
                    data: eth.payload().to_vec(),
                };
                if frames.blocking_send(frame).is_err() {
                    debug!("EAPOL receiver for {} closed", ifname);
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::TimedOut {
                    error!("An error occurred while reading from {}: {}", ifname, e);
                }
            }
        }
    });
}

impl Driver for LinkDriver {
    fn send_eapol(&mut self, bss: usize, dst: MacAddr, ethertype: u16, frame: &[u8]) -> io::Result<()> {
        let link = self.link(bss)?;
        let mut buf = vec![0u8; ETH_HDR_LEN + frame.len()];
        let mut eth = MutableEthernetPacket::new(&mut buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame buffer too small"))?;
        eth.set_destination(dst);
        eth.set_source(link.own_addr);
        eth.set_ethertype(EtherType(ethertype));
        eth.set_payload(frame);

        match link.tx.send_to(eth.packet(), None) {
            Some(result) => result,
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("failed to send on {}", link.ifname),
            )),
        }
    }

    fn request(&mut self, bss: usize, request: DriverRequest) -> io::Result<()> {
        let link = self.link(bss)?;
        // A plain Ethernet link has no key or station control; the requests
        // are only reported.
        match &request {
            DriverRequest::SetAuthorized { addr, authorized } => {
                info!("{}: station {} {}", link.ifname, addr, if *authorized { "authorized" } else { "unauthorized" });
            }
            DriverRequest::Deauthenticate { addr } => {
                warn!("{}: cannot deauthenticate {} on a wired port", link.ifname, addr);
            }
            other => debug!("{}: driver request {} not supported", link.ifname, other.name()),
        }
        Ok(())
    }
}
