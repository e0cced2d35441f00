//! Thin seam over the kernel interfaces the datapath needs directly:
//! sysctl writes, bridge and tun/tap ioctls, interface flags, SO_MARK.
//!
//! Everything goes through the [`System`] trait so the rule graph can be
//! exercised in tests without root; [`RealSystem`] is the production
//! implementation.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use cidr::Ipv4Inet;
use thiserror::Error;

use crate::mac::MacAddress;

/// Pinned eBPF object implementing WebRTC (DTLS/STUN) detection for QoS.
/// Presence of the pin is how support is probed; the program itself is
/// installed by a separate loader.
pub const WEBRTC_MATCHER_PIN_PATH: &str = "/sys/fs/bpf/patchpanel/match_dtls_srtp";

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("interface name {0} too long")]
    InterfaceNameTooLong(String),
}

/// Sysctl knobs written by the datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysNet {
    Ipv4Forward,
    Ipv6Forward,
    Ipv6ProxyNdp,
    Ipv6Disable,
    ConntrackHelper,
    /// Takes the interface name as suffix.
    Ipv4RouteLocalnet,
}

impl SysNet {
    pub fn path(self, ifname: Option<&str>) -> String {
        match self {
            SysNet::Ipv4Forward => "/proc/sys/net/ipv4/ip_forward".to_string(),
            SysNet::Ipv6Forward => "/proc/sys/net/ipv6/conf/all/forwarding".to_string(),
            SysNet::Ipv6ProxyNdp => "/proc/sys/net/ipv6/conf/all/proxy_ndp".to_string(),
            SysNet::Ipv6Disable => "/proc/sys/net/ipv6/conf/all/disable_ipv6".to_string(),
            SysNet::ConntrackHelper => "/proc/sys/net/netfilter/nf_conntrack_helper".to_string(),
            SysNet::Ipv4RouteLocalnet => format!(
                "/proc/sys/net/ipv4/conf/{}/route_localnet",
                ifname.unwrap_or_default()
            ),
        }
    }
}

/// Virtual device flavor for [`System::create_tuntap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Tun,
    Tap,
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMode::Tun => write!(f, "tun"),
            DeviceMode::Tap => write!(f, "tap"),
        }
    }
}

pub trait System {
    fn sysnet_set(
        &self,
        target: SysNet,
        value: &str,
        ifname: Option<&str>,
    ) -> Result<(), SystemError>;

    fn ifindex(&self, ifname: &str) -> Result<u32, SystemError>;

    fn create_bridge(&self, ifname: &str) -> Result<(), SystemError>;
    fn destroy_bridge(&self, ifname: &str) -> Result<(), SystemError>;
    fn add_to_bridge(&self, br_ifname: &str, ifname: &str) -> Result<(), SystemError>;

    /// Creates a persistent tun/tap device and returns the actual kernel
    /// assigned name. `name_template` may contain a `%d` placeholder; an
    /// empty template lets the kernel pick. On any sub-step failure the
    /// half-created device is unwound.
    fn create_tuntap(
        &self,
        name_template: &str,
        mac_addr: Option<MacAddress>,
        ipv4_cidr: Option<Ipv4Inet>,
        user: Option<&str>,
        mode: DeviceMode,
    ) -> Result<String, SystemError>;

    /// `setsockopt(SO_MARK)` on a client-supplied socket.
    fn set_socket_mark(&self, fd: RawFd, mark: u32) -> Result<(), SystemError>;

    /// Whether the pinned WebRTC-detection BPF object is available.
    fn is_ebpf_enabled(&self) -> bool;
}

// Bridge and tuntap ioctls not exported by libc.
const SIOCBRADDBR: libc::c_ulong = 0x89a0;
const SIOCBRDELBR: libc::c_ulong = 0x89a1;
const SIOCBRADDIF: libc::c_ulong = 0x89a2;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const TUNSETOWNER: libc::c_ulong = 0x4004_54cc;
const IFF_TUN: i16 = 0x0001;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;

#[derive(Default)]
pub struct RealSystem;

impl RealSystem {
    pub fn new() -> RealSystem {
        RealSystem
    }
}

fn control_socket() -> Result<OwnedFd, SystemError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn interface_request(ifname: &str) -> Result<libc::ifreq, SystemError> {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = ifname.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        return Err(SystemError::InterfaceNameTooLong(ifname.to_string()));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn ioctl<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> Result<(), SystemError> {
    loop {
        let ret = unsafe { libc::ioctl(fd, request as _, arg) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err.into());
        }
    }
}

fn uid_for_user(user: &str) -> Result<libc::uid_t, SystemError> {
    let name = CString::new(user).map_err(|_| SystemError::UnknownUser(user.to_string()))?;
    let pwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if pwd.is_null() {
        return Err(SystemError::UnknownUser(user.to_string()));
    }
    Ok(unsafe { (*pwd).pw_uid })
}

fn sockaddr_in(addr: std::net::Ipv4Addr) -> libc::sockaddr {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr.s_addr = u32::from(addr).to_be();
    unsafe { std::mem::transmute(sin) }
}

impl System for RealSystem {
    fn sysnet_set(
        &self,
        target: SysNet,
        value: &str,
        ifname: Option<&str>,
    ) -> Result<(), SystemError> {
        let path = target.path(ifname);
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.write_all(value.as_bytes())?;
        Ok(())
    }

    fn ifindex(&self, ifname: &str) -> Result<u32, SystemError> {
        let name = CString::new(ifname)
            .map_err(|_| SystemError::InterfaceNotFound(ifname.to_string()))?;
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(SystemError::InterfaceNotFound(ifname.to_string()));
        }
        Ok(index)
    }

    fn create_bridge(&self, ifname: &str) -> Result<(), SystemError> {
        let sock = control_socket()?;
        let name = CString::new(ifname)
            .map_err(|_| SystemError::InterfaceNameTooLong(ifname.to_string()))?;
        ioctl(sock.as_raw_fd(), SIOCBRADDBR, name.as_ptr().cast_mut())
    }

    fn destroy_bridge(&self, ifname: &str) -> Result<(), SystemError> {
        let sock = control_socket()?;
        let name = CString::new(ifname)
            .map_err(|_| SystemError::InterfaceNameTooLong(ifname.to_string()))?;
        ioctl(sock.as_raw_fd(), SIOCBRDELBR, name.as_ptr().cast_mut())
    }

    fn add_to_bridge(&self, br_ifname: &str, ifname: &str) -> Result<(), SystemError> {
        let sock = control_socket()?;
        let mut ifr = interface_request(br_ifname)?;
        ifr.ifr_ifru.ifru_ifindex = self.ifindex(ifname)? as libc::c_int;
        ioctl(sock.as_raw_fd(), SIOCBRADDIF, &mut ifr)
    }

    fn create_tuntap(
        &self,
        name_template: &str,
        mac_addr: Option<MacAddress>,
        ipv4_cidr: Option<Ipv4Inet>,
        user: Option<&str>,
        mode: DeviceMode,
    ) -> Result<String, SystemError> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;
        let mut ifr = interface_request(name_template)?;
        ifr.ifr_ifru.ifru_flags = match mode {
            DeviceMode::Tun => IFF_TUN | IFF_NO_PI,
            DeviceMode::Tap => IFF_TAP | IFF_NO_PI,
        };
        // A `%d` template is resolved by the kernel; ifr_name holds the
        // actual interface name afterwards.
        ioctl(dev.as_raw_fd(), TUNSETIFF, &mut ifr)?;
        let ifname: String = ifr
            .ifr_name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8 as char)
            .collect();

        ioctl(dev.as_raw_fd(), TUNSETPERSIST, 1usize as *mut libc::c_void)?;

        // Past this point the device outlives the fd; unwind it on any
        // later failure by clearing persistence before the fd closes.
        let unwind = |error: SystemError| -> SystemError {
            let _ = ioctl(dev.as_raw_fd(), TUNSETPERSIST, std::ptr::null_mut::<libc::c_void>());
            error
        };

        if let Some(user) = user {
            let uid = uid_for_user(user).map_err(unwind)?;
            ioctl(dev.as_raw_fd(), TUNSETOWNER, uid as usize as *mut libc::c_void)
                .map_err(unwind)?;
        }

        let sock = control_socket().map_err(unwind)?;
        if let Some(cidr) = ipv4_cidr {
            let mut addr_req = interface_request(&ifname).map_err(unwind)?;
            addr_req.ifr_ifru.ifru_addr = sockaddr_in(cidr.address());
            ioctl(sock.as_raw_fd(), libc::SIOCSIFADDR, &mut addr_req).map_err(unwind)?;

            let mut mask_req = interface_request(&ifname).map_err(unwind)?;
            mask_req.ifr_ifru.ifru_netmask = sockaddr_in(cidr.mask());
            ioctl(sock.as_raw_fd(), libc::SIOCSIFNETMASK, &mut mask_req).map_err(unwind)?;
        }

        if let Some(mac) = mac_addr {
            let mut hw_req = interface_request(&ifname).map_err(unwind)?;
            let hwaddr = unsafe { &mut hw_req.ifr_ifru.ifru_hwaddr };
            hwaddr.sa_family = libc::ARPHRD_ETHER;
            for (dst, src) in hwaddr.sa_data.iter_mut().zip(mac.octets()) {
                *dst = src as libc::c_char;
            }
            ioctl(sock.as_raw_fd(), libc::SIOCSIFHWADDR, &mut hw_req).map_err(unwind)?;
        }

        let mut flags_req = interface_request(&ifname).map_err(unwind)?;
        ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut flags_req).map_err(unwind)?;
        unsafe {
            flags_req.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as i16;
        }
        ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &mut flags_req).map_err(unwind)?;

        Ok(ifname)
    }

    fn set_socket_mark(&self, fd: RawFd, mark: u32) -> Result<(), SystemError> {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                (&mark as *const u32).cast(),
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn is_ebpf_enabled(&self) -> bool {
        Path::new(WEBRTC_MATCHER_PIN_PATH).exists()
    }
}
