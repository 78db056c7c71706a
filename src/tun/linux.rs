//! Linux tun plumbing: /dev/net/tun plus the ifreq ioctl family.

use std::{
    fs::OpenOptions,
    io,
    net::{Ipv4Addr, Ipv6Addr},
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
};

use libc::{c_int, c_short, c_ulong};

use super::{TunDevice, TunOptions};

const IFNAMSIZ: usize = 16;

const TUNSETIFF: c_ulong = 0x4004_54ca;
const TUNSETPERSIST: c_ulong = 0x4004_54cb;
const TUNSETOWNER: c_ulong = 0x4004_54cc;
const TUNSETGROUP: c_ulong = 0x4004_54ce;

const SIOCGIFFLAGS: c_ulong = 0x8913;
const SIOCSIFFLAGS: c_ulong = 0x8914;
const SIOCSIFADDR: c_ulong = 0x8916;
const SIOCSIFDSTADDR: c_ulong = 0x8918;
const SIOCSIFMTU: c_ulong = 0x8922;
const SIOCGIFINDEX: c_ulong = 0x8933;
const SIOCDIFADDR: c_ulong = 0x8936;
const SIOCADDRT: c_ulong = 0x890B;
const SIOCDELRT: c_ulong = 0x890C;

const IFF_TUN: c_short = 0x0001;
const IFF_NO_PI: c_short = 0x1000;

#[repr(C)]
#[allow(dead_code)]
union IfrData {
    flags: c_short,
    ifindex: c_int,
    mtu: c_int,
    addr: libc::sockaddr,
    dstaddr: libc::sockaddr,
    _pad: [u8; 24],
}

#[repr(C)]
struct Ifreq {
    name: [u8; IFNAMSIZ],
    data: IfrData,
}

impl Ifreq {
    fn with_name(name: &str) -> io::Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() >= IFNAMSIZ {
            return Err(io::Error::other(format!(
                "interface name too long: {}",
                name
            )));
        }

        let mut ifr: Self = unsafe { std::mem::zeroed() };
        ifr.name[..bytes.len()].copy_from_slice(bytes);
        Ok(ifr)
    }

    fn name(&self) -> String {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }
}

/// `struct in6_ifreq`, the IPv6 counterpart of ifreq.
#[repr(C)]
#[allow(dead_code)]
struct In6Ifreq {
    addr: libc::in6_addr,
    prefixlen: u32,
    ifindex: c_int,
}

/// `struct in6_rtmsg` for SIOCADDRT/SIOCDELRT on an IPv6 socket.
#[repr(C)]
#[allow(dead_code)]
struct In6Rtmsg {
    dst: libc::in6_addr,
    src: libc::in6_addr,
    gateway: libc::in6_addr,
    type_: u32,
    dst_len: u16,
    src_len: u16,
    metric: u32,
    info: c_ulong,
    flags: u32,
    ifindex: c_int,
}

fn ioctl<T>(fd: RawFd, request: c_ulong, arg: *mut T) -> io::Result<()> {
    if unsafe { libc::ioctl(fd, request as _, arg) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn control_socket(family: c_int) -> io::Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr = libc::in_addr {
        // The kernel wants network byte order here.
        s_addr: u32::from(addr).to_be(),
    };

    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

fn in6_addr(addr: Ipv6Addr) -> libc::in6_addr {
    libc::in6_addr {
        s6_addr: addr.octets(),
    }
}

fn ifindex(ctl: &OwnedFd, name: &str) -> io::Result<c_int> {
    let mut ifr = Ifreq::with_name(name)?;
    ioctl(ctl.as_raw_fd(), SIOCGIFINDEX, &mut ifr)?;
    Ok(unsafe { ifr.data.ifindex })
}

/// Open a fresh device from the `<prefix>%d` template, drop any
/// persistence flag and hand ownership to the configured uid/gid.
pub(super) fn open_device(options: &TunOptions) -> Result<TunDevice, io::Error> {
    let fd: OwnedFd = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open("/dev/net/tun")?
        .into();

    let mut ifr = Ifreq::with_name(&format!("{}%d", options.device_prefix))?;
    ifr.data.flags = IFF_TUN | IFF_NO_PI;

    ioctl(fd.as_raw_fd(), TUNSETIFF, &mut ifr)?;
    let name = ifr.name();

    // Devices from earlier runs may linger as persistent; ours never are.
    ioctl(fd.as_raw_fd(), TUNSETPERSIST, std::ptr::null_mut::<c_int>())?;

    if let Some(uid) = options.uid {
        ioctl(fd.as_raw_fd(), TUNSETOWNER, uid as usize as *mut c_int)?;
    }

    if let Some(gid) = options.gid {
        if let Err(error) = ioctl(fd.as_raw_fd(), TUNSETGROUP, gid as usize as *mut c_int) {
            // Kernels without group support answer EINVAL.
            if error.raw_os_error() != Some(libc::EINVAL) {
                return Err(error);
            }

            log::info!("{}: TUNSETGROUP: {}", name, error);
        }
    }

    Ok(TunDevice { name, fd })
}

pub(super) fn set_ipv4(name: &str, local: Ipv4Addr, remote: Ipv4Addr) -> io::Result<()> {
    let ctl = control_socket(libc::AF_INET)?;

    let mut ifr = Ifreq::with_name(name)?;
    ifr.data.addr = sockaddr_in(local);
    ioctl(ctl.as_raw_fd(), SIOCSIFADDR, &mut ifr)?;

    let mut ifr = Ifreq::with_name(name)?;
    ifr.data.dstaddr = sockaddr_in(remote);
    ioctl(ctl.as_raw_fd(), SIOCSIFDSTADDR, &mut ifr)?;

    bring_up(&ctl, name)
}

pub(super) fn set_ipv6(
    name: &str,
    local: Ipv6Addr,
    remote: Ipv6Addr,
    prefix: u8,
) -> io::Result<()> {
    let ctl = control_socket(libc::AF_INET6)?;
    let ifindex = ifindex(&ctl, name)?;

    let mut ifr6 = In6Ifreq {
        addr: in6_addr(local),
        prefixlen: 128,
        ifindex,
    };
    ioctl(ctl.as_raw_fd(), SIOCSIFADDR, &mut ifr6)?;

    // Host route to the peer; the IPv6 route ioctls take in6_rtmsg.
    let mut rt6: In6Rtmsg = unsafe { std::mem::zeroed() };
    rt6.dst = in6_addr(remote);
    rt6.dst_len = prefix as u16;
    rt6.metric = 1;
    rt6.ifindex = ifindex;
    ioctl(ctl.as_raw_fd(), SIOCADDRT, &mut rt6)?;

    bring_up(&ctl, name)
}

pub(super) fn reset_ipv4(name: &str, local: Ipv4Addr) -> io::Result<()> {
    let ctl = control_socket(libc::AF_INET)?;

    let mut ifr = Ifreq::with_name(name)?;
    ifr.data.addr = sockaddr_in(local);
    ioctl(ctl.as_raw_fd(), SIOCDIFADDR, &mut ifr)
}

pub(super) fn reset_ipv6(name: &str, local: Ipv6Addr, remote: Ipv6Addr) -> io::Result<()> {
    let ctl = control_socket(libc::AF_INET6)?;
    let ifindex = ifindex(&ctl, name)?;

    let mut ifr6 = In6Ifreq {
        addr: in6_addr(local),
        prefixlen: 128,
        ifindex,
    };
    ioctl(ctl.as_raw_fd(), SIOCDIFADDR, &mut ifr6)?;

    let mut rt6: In6Rtmsg = unsafe { std::mem::zeroed() };
    rt6.dst = in6_addr(remote);
    rt6.dst_len = 128;
    rt6.metric = 1;
    rt6.ifindex = ifindex;
    ioctl(ctl.as_raw_fd(), SIOCDELRT, &mut rt6)
}

pub(super) fn set_mtu(name: &str, mtu: u16) -> io::Result<()> {
    let ctl = control_socket(libc::AF_INET)?;

    let mut ifr = Ifreq::with_name(name)?;
    ifr.data.mtu = mtu as c_int;
    ioctl(ctl.as_raw_fd(), SIOCSIFMTU, &mut ifr)
}

/// Linux removes the interface when the last descriptor closes.
pub(super) fn destroy_device(_name: &str) {}

fn bring_up(ctl: &OwnedFd, name: &str) -> io::Result<()> {
    let mut ifr = Ifreq::with_name(name)?;
    ioctl(ctl.as_raw_fd(), SIOCGIFFLAGS, &mut ifr)?;

    let flags = unsafe { ifr.data.flags };
    ifr.data.flags = flags | libc::IFF_UP as c_short | libc::IFF_RUNNING as c_short;
    ioctl(ctl.as_raw_fd(), SIOCSIFFLAGS, &mut ifr)
}
