//! BSD tun plumbing: /dev/tun iteration, interface create/rename/destroy
//! and the alias-style address ioctls.

use std::{
    fs::OpenOptions,
    io,
    net::{Ipv4Addr, Ipv6Addr},
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::fs::{MetadataExt, OpenOptionsExt},
    },
};

use libc::{c_int, c_short, c_ulong};

use super::{TunDevice, TunOptions};

const IFNAMSIZ: usize = 16;

/// How many name collisions a rename tolerates before giving up.
const RENAME_RETRIES: u32 = 1024;

#[repr(C)]
#[allow(dead_code)]
union IfrData {
    flags: c_short,
    data: *mut libc::c_char,
    addr: libc::sockaddr,
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
}

/// `struct in_aliasreq` for SIOCAIFADDR.
#[repr(C)]
#[allow(dead_code)]
struct InAliasreq {
    name: [u8; IFNAMSIZ],
    addr: libc::sockaddr_in,
    dstaddr: libc::sockaddr_in,
    mask: libc::sockaddr_in,
    vhid: c_int,
}

/// `struct in6_aliasreq` for SIOCAIFADDR_IN6.
#[repr(C)]
#[allow(dead_code)]
struct In6Aliasreq {
    name: [u8; IFNAMSIZ],
    addr: libc::sockaddr_in6,
    dstaddr: libc::sockaddr_in6,
    mask: libc::sockaddr_in6,
    flags: c_int,
    vltime: u32,
    pltime: u32,
    expire: libc::time_t,
    preferred: libc::time_t,
}

fn ioctl<T>(fd: RawFd, request: c_ulong, arg: *mut T) -> io::Result<()> {
    if unsafe { libc::ioctl(fd, request as _, arg) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn control_socket(family: c_int) -> io::Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_len = size_of::<libc::sockaddr_in>() as u8;
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    sin
}

fn sockaddr_in6(addr: Ipv6Addr) -> libc::sockaddr_in6 {
    let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sin6.sin6_len = size_of::<libc::sockaddr_in6>() as u8;
    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sin6.sin6_addr = libc::in6_addr {
        s6_addr: addr.octets(),
    };
    sin6
}

/// Open `/dev/tun`, or iterate `/dev/tunN` (creating devices on the way
/// where the kernel supports it), recover the assigned name, switch the
/// device to point-to-point IP mode and rename it to the configured
/// prefix.
pub(super) fn open_device(options: &TunOptions) -> Result<TunDevice, io::Error> {
    let fd = match open_any_tun()? {
        Some(fd) => fd,
        None => return Err(io::Error::other("no available tun device")),
    };

    // The device node name is the interface name.
    let metadata = std::fs::metadata(format!("/dev/fd/{}", fd.as_raw_fd()))?;
    let name = devname(metadata.rdev())?;

    setup_mode(&fd, &name);

    let name = rename_device(&name, options).unwrap_or(name);
    Ok(TunDevice { name, fd })
}

fn open_any_tun() -> io::Result<Option<OwnedFd>> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open("/dev/tun")
    {
        Ok(file) => return Ok(Some(file.into())),
        Err(error) => {
            log::debug!(
                "cannot open /dev/tun; falling back to iteration: {}",
                error
            );
        }
    }

    for unit in 0..255 {
        let path = format!("/dev/tun{}", unit);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
        {
            Ok(file) => return Ok(Some(file.into())),
            Err(_) => {
                // The device may not exist yet; ask the kernel to create
                // it, then retry the open.
                if create_interface(&format!("tun{}", unit)).is_ok() {
                    if let Ok(file) = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .custom_flags(libc::O_CLOEXEC)
                        .open(&path)
                    {
                        return Ok(Some(file.into()));
                    }
                }
            }
        }
    }

    Ok(None)
}

fn create_interface(name: &str) -> io::Result<()> {
    let ctl = control_socket(libc::AF_INET)?;
    let mut ifr = Ifreq::with_name(name)?;
    ioctl(ctl.as_raw_fd(), libc::SIOCIFCREATE as c_ulong, &mut ifr)
}

fn devname(rdev: u64) -> io::Result<String> {
    let name = unsafe { libc::devname(rdev as libc::dev_t, libc::S_IFCHR) };
    if name.is_null() {
        return Err(io::Error::other("devname failed for tun device"));
    }

    Ok(unsafe { std::ffi::CStr::from_ptr(name) }
        .to_string_lossy()
        .into_owned())
}

/// Point-to-point, multicast, no link-layer framing, and the 4-byte
/// address-family head where the kernel supports it. Mode failures are
/// logged and tolerated like the other platform quirks here.
fn setup_mode(fd: &OwnedFd, name: &str) {
    #[cfg(not(target_os = "openbsd"))]
    {
        let mut mode: c_int = libc::IFF_POINTOPOINT | libc::IFF_MULTICAST;
        if let Err(error) = ioctl(fd.as_raw_fd(), libc::TUNSIFMODE as c_ulong, &mut mode) {
            log::error!("{}: TUNSIFMODE: {}", name, error);
        }

        let mut link: c_int = 0;
        if let Err(error) = ioctl(fd.as_raw_fd(), libc::TUNSLMODE as c_ulong, &mut link) {
            log::error!("{}: TUNSLMODE: {}", name, error);
        }

        let mut head: c_int = 1;
        if let Err(error) = ioctl(fd.as_raw_fd(), libc::TUNSIFHEAD as c_ulong, &mut head) {
            log::error!("{}: TUNSIFHEAD: {}", name, error);
        }
    }

    #[cfg(target_os = "openbsd")]
    {
        let _ = (fd, name);
    }
}

/// Rename the kernel-assigned device to `<prefix><n>`, probing past name
/// collisions. Platforms without a rename ioctl keep the kernel name.
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
fn rename_device(name: &str, options: &TunOptions) -> Option<String> {
    use std::sync::atomic::Ordering;

    let ctl = control_socket(libc::AF_INET).ok()?;
    let base = options.next_unit.fetch_add(1, Ordering::Relaxed);

    for attempt in 0..RENAME_RETRIES {
        let wanted = format!("{}{}", options.device_prefix, base + attempt);
        if wanted.len() >= IFNAMSIZ {
            log::error!("tun name truncation: {}; adjust the device option", wanted);
            return None;
        }

        let mut ifr = match Ifreq::with_name(name) {
            Ok(ifr) => ifr,
            Err(_) => return None,
        };

        let mut wanted_c = wanted.clone().into_bytes();
        wanted_c.push(0);
        ifr.data.data = wanted_c.as_mut_ptr() as *mut libc::c_char;

        match ioctl(ctl.as_raw_fd(), libc::SIOCSIFNAME as c_ulong, &mut ifr) {
            Ok(()) => return Some(wanted),
            Err(error) => {
                if error.raw_os_error() == Some(libc::EEXIST) {
                    continue;
                }

                log::warn!("error renaming interface {} to {}: {}", name, wanted, error);
                return None;
            }
        }
    }

    None
}

#[cfg(not(any(target_os = "freebsd", target_os = "dragonfly")))]
fn rename_device(name: &str, _options: &TunOptions) -> Option<String> {
    log::debug!("no interface rename on this platform, keeping {}", name);
    None
}

pub(super) fn set_ipv4(name: &str, local: Ipv4Addr, remote: Ipv4Addr) -> io::Result<()> {
    let ctl = control_socket(libc::AF_INET)?;

    let mut req: InAliasreq = unsafe { std::mem::zeroed() };
    req.name[..name.len()].copy_from_slice(name.as_bytes());
    req.addr = sockaddr_in(local);
    req.dstaddr = sockaddr_in(remote);
    req.mask = sockaddr_in(Ipv4Addr::BROADCAST);

    ioctl(ctl.as_raw_fd(), libc::SIOCAIFADDR as c_ulong, &mut req)?;
    bring_up(&ctl, name)
}

pub(super) fn set_ipv6(
    name: &str,
    local: Ipv6Addr,
    remote: Ipv6Addr,
    prefix: u8,
) -> io::Result<()> {
    const ND6_INFINITE_LIFETIME: u32 = u32::MAX;

    let ctl = control_socket(libc::AF_INET6)?;

    let mut req: In6Aliasreq = unsafe { std::mem::zeroed() };
    req.name[..name.len()].copy_from_slice(name.as_bytes());
    req.addr = sockaddr_in6(local);
    req.dstaddr = sockaddr_in6(remote);
    req.mask = sockaddr_in6(
        service::ip_util::ipv6_prefix_to_mask(prefix)
            .unwrap_or(Ipv6Addr::from(u128::MAX)),
    );
    req.vltime = ND6_INFINITE_LIFETIME;
    req.pltime = ND6_INFINITE_LIFETIME;

    ioctl(ctl.as_raw_fd(), libc::SIOCAIFADDR_IN6 as c_ulong, &mut req)?;
    bring_up(&ctl, name)
}

pub(super) fn reset_ipv4(name: &str, local: Ipv4Addr) -> io::Result<()> {
    let ctl = control_socket(libc::AF_INET)?;

    let mut ifr = Ifreq::with_name(name)?;
    ifr.data.addr =
        unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sockaddr_in(local)) };
    ioctl(ctl.as_raw_fd(), libc::SIOCDIFADDR as c_ulong, &mut ifr)
}

pub(super) fn reset_ipv6(name: &str, local: Ipv6Addr, _remote: Ipv6Addr) -> io::Result<()> {
    #[repr(C)]
    struct In6Ifreq {
        name: [u8; IFNAMSIZ],
        addr: libc::sockaddr_in6,
    }

    let ctl = control_socket(libc::AF_INET6)?;

    let mut ifr6: In6Ifreq = unsafe { std::mem::zeroed() };
    ifr6.name[..name.len()].copy_from_slice(name.as_bytes());
    ifr6.addr = sockaddr_in6(local);
    ioctl(ctl.as_raw_fd(), libc::SIOCDIFADDR_IN6 as c_ulong, &mut ifr6)
}

pub(super) fn set_mtu(name: &str, mtu: u16) -> io::Result<()> {
    #[repr(C)]
    #[allow(dead_code)]
    union IfrMtu {
        mtu: c_int,
        _pad: [u8; 24],
    }

    #[repr(C)]
    struct IfreqMtu {
        name: [u8; IFNAMSIZ],
        data: IfrMtu,
    }

    let ctl = control_socket(libc::AF_INET)?;

    let mut ifr: IfreqMtu = unsafe { std::mem::zeroed() };
    ifr.name[..name.len()].copy_from_slice(name.as_bytes());
    ifr.data.mtu = mtu as c_int;
    ioctl(ctl.as_raw_fd(), libc::SIOCSIFMTU as c_ulong, &mut ifr)
}

/// The interface outlives the descriptor here, so destroy it explicitly.
pub(super) fn destroy_device(name: &str) {
    let Ok(ctl) = control_socket(libc::AF_INET) else {
        return;
    };

    let Ok(mut ifr) = Ifreq::with_name(name) else {
        return;
    };

    if let Err(error) = ioctl(ctl.as_raw_fd(), libc::SIOCIFDESTROY as c_ulong, &mut ifr) {
        log::error!("{}: error destroying interface: {}", name, error);
    }
}

fn bring_up(ctl: &OwnedFd, name: &str) -> io::Result<()> {
    let mut ifr = Ifreq::with_name(name)?;
    ioctl(ctl.as_raw_fd(), libc::SIOCGIFFLAGS as c_ulong, &mut ifr)?;

    let flags = unsafe { ifr.data.flags };
    ifr.data.flags = flags | libc::IFF_UP as c_short | libc::IFF_RUNNING as c_short;
    ioctl(ctl.as_raw_fd(), libc::SIOCSIFFLAGS as c_ulong, &mut ifr)
}
