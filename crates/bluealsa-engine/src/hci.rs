//! HCI helpers: adapter enumeration, SCO socket management and the
//! handful of raw HCI commands the engine needs.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bluealsa_core::{BdAddr, Error, Result};

use crate::sys;

pub const BTPROTO_HCI: libc::c_int = 1;
pub const BTPROTO_SCO: libc::c_int = 2;
pub const BTPROTO_RFCOMM: libc::c_int = 3;

pub const SOL_HCI: libc::c_int = 0;
pub const SOL_SCO: libc::c_int = 17;
pub const SOL_BLUETOOTH: libc::c_int = 274;

pub const BT_DEFER_SETUP: libc::c_int = 7;
pub const BT_VOICE: libc::c_int = 11;
pub const BT_VOICE_TRANSPARENT: u16 = 0x0003;

const SCO_OPTIONS: libc::c_int = 1;
const HCI_FILTER: libc::c_int = 2;

const HCIGETDEVLIST: libc::c_ulong = 0x800448d2;
const HCIGETDEVINFO: libc::c_ulong = 0x800448d3;

/// Company identifier of Broadcom, whose controllers need the SCO
/// routing quirk.
pub const COMPID_BROADCOM: u16 = 15;

#[repr(C)]
struct SockaddrSco {
    family: libc::sa_family_t,
    bdaddr: [u8; 6],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct HciDevReq {
    dev_id: u16,
    dev_opt: u32,
}

const HCI_MAX_DEV: usize = 16;

#[repr(C)]
struct HciDevListReq {
    dev_num: u16,
    dev_req: [HciDevReq; HCI_MAX_DEV],
}

#[repr(C)]
struct HciDevStats {
    err_rx: u32,
    err_tx: u32,
    cmd_tx: u32,
    evt_rx: u32,
    acl_tx: u32,
    acl_rx: u32,
    sco_tx: u32,
    sco_rx: u32,
    byte_rx: u32,
    byte_tx: u32,
}

#[repr(C)]
struct HciDevInfo {
    dev_id: u16,
    name: [u8; 8],
    bdaddr: [u8; 6],
    flags: u32,
    dev_type: u8,
    features: [u8; 8],
    pkt_type: u32,
    link_policy: u32,
    link_mode: u32,
    acl_mtu: u16,
    acl_pkts: u16,
    sco_mtu: u16,
    sco_pkts: u16,
    stat: HciDevStats,
}

impl Default for HciDevInfo {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// One local controller as reported by the kernel.
#[derive(Debug, Clone)]
pub struct HciDevice {
    pub dev_id: u16,
    pub name: String,
    pub address: BdAddr,
}

fn hci_control_socket() -> Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(libc::AF_BLUETOOTH, libc::SOCK_RAW | libc::SOCK_CLOEXEC, BTPROTO_HCI)
    };
    if fd < 0 {
        return Err(Error::Hci(io::Error::last_os_error().to_string()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Enumerate local adapters.
pub fn enumerate() -> Result<Vec<HciDevice>> {
    let sock = hci_control_socket()?;
    let mut list = HciDevListReq {
        dev_num: HCI_MAX_DEV as u16,
        dev_req: [HciDevReq { dev_id: 0, dev_opt: 0 }; HCI_MAX_DEV],
    };
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), HCIGETDEVLIST, &mut list as *mut _) };
    if ret < 0 {
        return Err(Error::Hci(io::Error::last_os_error().to_string()));
    }

    let mut devices = Vec::new();
    for req in list.dev_req.iter().take(list.dev_num as usize) {
        if let Ok(info) = device_info(sock.as_raw_fd(), req.dev_id) {
            devices.push(info);
        }
    }
    Ok(devices)
}

/// Query a single adapter by id.
pub fn info(dev_id: u16) -> Result<HciDevice> {
    let sock = hci_control_socket()?;
    device_info(sock.as_raw_fd(), dev_id)
}

fn device_info(sock: RawFd, dev_id: u16) -> Result<HciDevice> {
    let mut info = HciDevInfo { dev_id, ..HciDevInfo::default() };
    let ret = unsafe { libc::ioctl(sock, HCIGETDEVINFO, &mut info as *mut _) };
    if ret < 0 {
        return Err(Error::Hci(io::Error::last_os_error().to_string()));
    }
    let len = info.name.iter().position(|&b| b == 0).unwrap_or(info.name.len());
    Ok(HciDevice {
        dev_id,
        name: String::from_utf8_lossy(&info.name[..len]).into_owned(),
        address: BdAddr::from_le_bytes(info.bdaddr),
    })
}

/// Open an SCO socket bound to the given adapter.
pub fn sco_open(dev_id: u16) -> Result<OwnedFd> {
    let local = info(dev_id)?;
    let fd = unsafe {
        libc::socket(libc::AF_BLUETOOTH, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, BTPROTO_SCO)
    };
    if fd < 0 {
        return Err(Error::Hci(io::Error::last_os_error().to_string()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = SockaddrSco {
        family: libc::AF_BLUETOOTH as libc::sa_family_t,
        bdaddr: local.address.to_le_bytes(),
    };
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<SockaddrSco>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Hci(format!("SCO bind: {}", io::Error::last_os_error())));
    }
    Ok(fd)
}

/// Establish an outgoing SCO link to `peer`; `transparent` selects the
/// transparent air mode required by mSBC.
pub fn sco_connect(dev_id: u16, peer: BdAddr, transparent: bool) -> Result<OwnedFd> {
    let fd = sco_open(dev_id)?;
    if transparent {
        let voice: u16 = BT_VOICE_TRANSPARENT;
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_BLUETOOTH,
                BT_VOICE,
                &voice as *const _ as *const libc::c_void,
                std::mem::size_of::<u16>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Hci(format!("BT_VOICE: {}", io::Error::last_os_error())));
        }
    }
    let addr = SockaddrSco {
        family: libc::AF_BLUETOOTH as libc::sa_family_t,
        bdaddr: peer.to_le_bytes(),
    };
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<SockaddrSco>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Hci(format!("SCO connect: {}", io::Error::last_os_error())));
    }
    Ok(fd)
}

/// Accept a deferred SCO connection from a listening socket; returns the
/// link and the peer address.
pub fn sco_accept(listen_fd: RawFd) -> Result<(OwnedFd, BdAddr)> {
    let mut addr = SockaddrSco { family: 0, bdaddr: [0; 6] };
    let mut len = std::mem::size_of::<SockaddrSco>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(Error::Hci(format!("SCO accept: {}", io::Error::last_os_error())));
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, BdAddr::from_le_bytes(addr.bdaddr)))
}

/// Enable deferred connection setup on a listening SCO socket, so that
/// accept returns before audio flows.
pub fn sco_defer_setup(fd: RawFd) -> Result<()> {
    let defer: u32 = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_BLUETOOTH,
            BT_DEFER_SETUP,
            &defer as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Hci(format!("BT_DEFER_SETUP: {}", io::Error::last_os_error())));
    }
    Ok(())
}

/// Switch an SCO socket to transparent air mode (mSBC).
pub fn sco_voice_transparent(fd: RawFd) -> Result<()> {
    let voice: u16 = BT_VOICE_TRANSPARENT;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_BLUETOOTH,
            BT_VOICE,
            &voice as *const _ as *const libc::c_void,
            std::mem::size_of::<u16>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Hci(format!("BT_VOICE: {}", io::Error::last_os_error())));
    }
    Ok(())
}

/// Read the SCO MTU negotiated on a connected socket.
pub fn sco_mtu(fd: RawFd) -> Result<u16> {
    #[repr(C)]
    struct ScoOptions {
        mtu: u16,
    }
    let mut options = ScoOptions { mtu: 0 };
    let mut len = std::mem::size_of::<ScoOptions>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            SOL_SCO,
            SCO_OPTIONS,
            &mut options as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(Error::Hci(format!("SCO_OPTIONS: {}", io::Error::last_os_error())));
    }
    Ok(options.mtu)
}

/// Raw HCI command channel bound to one adapter, used for the version
/// query and vendor commands.
struct HciChannel {
    fd: OwnedFd,
}

impl HciChannel {
    fn open(dev_id: u16) -> Result<Self> {
        let fd = hci_control_socket()?;

        // Pass through only command-complete events.
        #[repr(C)]
        struct HciFilter {
            type_mask: u32,
            event_mask: [u32; 2],
            opcode: u16,
        }
        let filter = HciFilter {
            type_mask: 1 << 0x04,          // HCI_EVENT_PKT
            event_mask: [1 << 0x0e, 0],    // EVT_CMD_COMPLETE
            opcode: 0,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                &filter as *const _ as *const libc::c_void,
                std::mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Hci(format!("HCI_FILTER: {}", io::Error::last_os_error())));
        }

        #[repr(C)]
        struct SockaddrHci {
            family: libc::sa_family_t,
            dev: u16,
            channel: u16,
        }
        let addr = SockaddrHci {
            family: libc::AF_BLUETOOTH as libc::sa_family_t,
            dev: dev_id,
            channel: 0, // HCI_CHANNEL_RAW
        };
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Hci(format!("HCI bind: {}", io::Error::last_os_error())));
        }
        Ok(HciChannel { fd })
    }

    /// Issue one command and wait for its command-complete parameters.
    fn request(&self, ogf: u16, ocf: u16, params: &[u8], timeout_ms: i32) -> Result<Vec<u8>> {
        let opcode: u16 = (ogf << 10) | (ocf & 0x03ff);
        let mut packet = Vec::with_capacity(4 + params.len());
        packet.push(0x01); // HCI_COMMAND_PKT
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(params);
        sys::write(self.fd.as_raw_fd(), &packet)?;

        let mut fds = [sys::pollfd(self.fd.as_raw_fd(), libc::POLLIN)];
        loop {
            if sys::poll(&mut fds, timeout_ms)? == 0 {
                return Err(Error::Hci("HCI request timed out".into()));
            }
            let mut buf = [0u8; 260];
            let len = sys::read(self.fd.as_raw_fd(), &mut buf)?;
            // Event packet: type, event, plen, ncmd, opcode, status, data.
            if len < 7 || buf[0] != 0x04 || buf[1] != 0x0e {
                continue;
            }
            let replied = u16::from_le_bytes([buf[4], buf[5]]);
            if replied != opcode {
                continue;
            }
            if buf[6] != 0 {
                return Err(Error::Hci(format!("HCI command failed: status {:#04x}", buf[6])));
            }
            return Ok(buf[7..len].to_vec());
        }
    }
}

/// Manufacturer id from Read_Local_Version_Information.
pub fn local_version_manufacturer(dev_id: u16) -> Result<u16> {
    let channel = HciChannel::open(dev_id)?;
    let params = channel.request(0x04, 0x0001, &[], 1000)?;
    if params.len() < 8 {
        return Err(Error::Hci("short version response".into()));
    }
    Ok(u16::from_le_bytes([params[4], params[5]]))
}

/// Broadcom SCO PCM routing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcmScoRouting {
    pub routing: u8,
    pub clock_rate: u8,
    pub frame_type: u8,
    pub sync_mode: u8,
    pub clock_mode: u8,
}

/// Routing value that delivers SCO via the HCI transport.
pub const BCM_ROUTING_TRANSPORT: u8 = 1;

const BCM_OGF_VENDOR: u16 = 0x3f;
const BCM_OCF_READ_SCO_PCM: u16 = 0x001d;
const BCM_OCF_WRITE_SCO_PCM: u16 = 0x001c;

/// Read the current SCO routing of a Broadcom controller.
pub fn bcm_read_sco_routing(dev_id: u16) -> Result<BcmScoRouting> {
    let channel = HciChannel::open(dev_id)?;
    let params = channel.request(BCM_OGF_VENDOR, BCM_OCF_READ_SCO_PCM, &[], 1000)?;
    if params.len() < 5 {
        return Err(Error::Hci("short SCO PCM response".into()));
    }
    Ok(BcmScoRouting {
        routing: params[0],
        clock_rate: params[1],
        frame_type: params[2],
        sync_mode: params[3],
        clock_mode: params[4],
    })
}

/// Rewrite the SCO routing of a Broadcom controller.
pub fn bcm_write_sco_routing(dev_id: u16, routing: &BcmScoRouting) -> Result<()> {
    let channel = HciChannel::open(dev_id)?;
    let params = [
        routing.routing,
        routing.clock_rate,
        routing.frame_type,
        routing.sync_mode,
        routing.clock_mode,
    ];
    channel.request(BCM_OGF_VENDOR, BCM_OCF_WRITE_SCO_PCM, &params, 1000)?;
    Ok(())
}
