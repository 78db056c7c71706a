//! Per-session tun device lifecycle.
//!
//! The supervisor provisions one point-to-point device per accepted
//! session: lease addresses, open the device, configure both families,
//! bring it up, and hand the descriptor to the worker. Every step after
//! the lease acquisition can fail, and a failure must leave no trace; the
//! lease guard and the owned descriptor roll everything back on the way
//! out.
//!
//! Platform differences (ioctl sets, device naming, packet framing) live
//! behind the `os` module; the lifecycle API up here is single-shape.

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
#[path = "tun/bsd.rs"]
mod os;

#[cfg(target_os = "linux")]
#[path = "tun/linux.rs"]
mod os;

use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
};

use libc::c_void;

use service::lease::{IpLease, LeaseError, LeasePools};

use crate::proc::Proc;

#[derive(Debug)]
pub enum TunError {
    /// Neither family ended up with a configured address.
    NoAddress,
    Lease(LeaseError),
    Os(io::Error),
}

impl std::error::Error for TunError {}

impl std::fmt::Display for TunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for TunError {
    fn from(value: io::Error) -> Self {
        Self::Os(value)
    }
}

impl From<LeaseError> for TunError {
    fn from(value: LeaseError) -> Self {
        Self::Lease(value)
    }
}

/// Device creation parameters, cut from the server config.
#[derive(Debug, Default)]
pub struct TunOptions {
    /// Name template prefix; devices come out as `<prefix><n>`.
    pub device_prefix: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtu: u16,
    /// Next unit number tried when the platform renames devices by hand.
    pub next_unit: std::sync::atomic::AtomicU32,
}

/// An open tun device. Dropping it closes the descriptor; the interface
/// itself is destroyed by [`close_tun`] on platforms that need it.
pub struct TunDevice {
    pub name: String,
    pub fd: OwnedFd,
}

/// Returns leased addresses to their pools unless disarmed.
struct LeaseGuard<'a> {
    pools: &'a mut LeasePools,
    v4: Option<IpLease>,
    v6: Option<IpLease>,
    armed: bool,
}

impl<'a> LeaseGuard<'a> {
    fn new(pools: &'a mut LeasePools, v4: Option<IpLease>, v6: Option<IpLease>) -> Self {
        Self {
            pools,
            v4,
            v6,
            armed: true,
        }
    }

    /// Give the IPv6 lease back immediately, keeping the rest armed.
    fn drop_v6(&mut self) {
        if let Some(lease) = self.v6.take() {
            self.pools.remove_ip_lease(&lease);
        }
    }

    fn disarm(mut self) -> (Option<IpLease>, Option<IpLease>) {
        self.armed = false;
        (self.v4.take(), self.v6.take())
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            for lease in self.v4.take().into_iter().chain(self.v6.take()) {
                self.pools.remove_ip_lease(&lease);
            }
        }
    }
}

/// Provision the tunnel of one session: leases, device, addresses, up.
///
/// On success the device and leases are stored in the proc record. On any
/// failure all side effects are undone and the record is untouched, except
/// that an IPv6 configuration failure alone only costs the session its
/// IPv6 side.
pub fn open_tun(
    pools: &mut LeasePools,
    options: &TunOptions,
    proc: &mut Proc,
    static_v4: Option<Ipv4Addr>,
) -> Result<(), TunError> {
    let (v4, v6) = pools.get_ip_leases(static_v4, None)?;
    let mut guard = LeaseGuard::new(pools, v4, v6);

    let device = os::open_device(options)?;
    set_cloexec(&device.fd)?;

    if device.name.is_empty() {
        log::error!("tun device with no name");
        return Err(TunError::Os(io::Error::other("tun device with no name")));
    }

    if let Some(lease) = &guard.v4 {
        if let (IpAddr::V4(local), IpAddr::V4(remote)) = (lease.local, lease.remote) {
            os::set_ipv4(&device.name, local, remote)?;
        }
    }

    if let Some(lease) = guard.v6 {
        if let (IpAddr::V6(local), IpAddr::V6(remote)) = (lease.local, lease.remote) {
            // IPv6 failure alone does not kill the session; the lease goes
            // straight back and the session continues IPv4-only.
            if let Err(error) = os::set_ipv6(&device.name, local, remote, lease.prefix) {
                log::error!("{}: error setting IPv6: {}", device.name, error);
                guard.drop_v6();
            }
        }
    }

    if guard.v4.is_none() && guard.v6.is_none() {
        log::error!("{}: could not set any IP", device.name);
        return Err(TunError::NoAddress);
    }

    os::set_mtu(&device.name, options.mtu)?;

    let (v4, v6) = guard.disarm();
    log::debug!("assigning tun device {}", device.name);

    proc.ipv4 = v4;
    proc.ipv6 = v6;
    proc.tun = Some(device);

    Ok(())
}

/// Close a session's device. On platforms where closing the descriptor
/// does not remove the interface, destroy it explicitly.
pub fn close_tun(proc: &mut Proc) {
    if let Some(device) = proc.tun.take() {
        drop(device.fd);
        os::destroy_device(&device.name);
    }
}

/// Strip the session's addresses off the device ahead of close. Errors
/// are logged, not fatal: the interface is going away either way.
pub fn reset_tun(proc: &Proc) {
    let Some(device) = &proc.tun else {
        return;
    };

    if let Some(IpAddr::V4(local)) = proc.ipv4.as_ref().map(|it| it.local) {
        if let Err(error) = os::reset_ipv4(&device.name, local) {
            log::debug!("{}: removing IPv4: {}", device.name, error);
        }
    }

    if let Some(lease) = &proc.ipv6 {
        if let (IpAddr::V6(local), IpAddr::V6(remote)) = (lease.local, lease.remote) {
            if let Err(error) = os::reset_ipv6(&device.name, local, remote) {
                log::debug!("{}: removing IPv6: {}", device.name, error);
            }
        }
    }
}

/// Apply the MTU a worker negotiated with its client.
pub fn set_tun_mtu(proc: &Proc, mtu: u16) -> Result<(), TunError> {
    let Some(device) = &proc.tun else {
        return Ok(());
    };

    os::set_mtu(&device.name, mtu)?;
    Ok(())
}

/// Address family of an IP packet, from the version nibble of its first
/// byte.
///
/// # Test
///
/// ```
/// use vpn_server::tun::af_for_packet;
///
/// assert_eq!(af_for_packet(0x45), Some(libc::AF_INET));
/// assert_eq!(af_for_packet(0x60), Some(libc::AF_INET6));
/// assert_eq!(af_for_packet(0x00), None);
/// assert_eq!(af_for_packet(0xf0), None);
/// ```
pub fn af_for_packet(first: u8) -> Option<libc::c_int> {
    match first >> 4 {
        4 => Some(libc::AF_INET),
        6 => Some(libc::AF_INET6),
        _ => None,
    }
}

/// Tun packet I/O.
///
/// Some kernels expect every datagram on a tun device to be prefixed with
/// a 4-byte address family in network order; on those, writes prepend the
/// family picked from the packet's version nibble and reads strip it.
/// Packets with an unknown version are dropped, logged once per framer.
#[derive(Default)]
pub struct TunFramer {
    complained: bool,
}

impl TunFramer {
    /// True when this platform frames tun datagrams with an AF prefix.
    pub const HAS_AF_PREFIX: bool = cfg!(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ));

    pub fn write(&mut self, fd: BorrowedFd, packet: &[u8]) -> io::Result<usize> {
        let Some(af) = packet.first().copied().and_then(af_for_packet) else {
            if !self.complained {
                self.complained = true;
                log::error!(
                    "tun write: unknown packet (len {}) received {:02x?}",
                    packet.len(),
                    &packet[..packet.len().min(4)]
                );
            }

            return Err(io::Error::from(io::ErrorKind::InvalidData));
        };

        if !Self::HAS_AF_PREFIX {
            return write_all(fd, packet);
        }

        let head = (af as u32).to_be_bytes();
        let iov = [
            libc::iovec {
                iov_base: head.as_ptr() as *mut c_void,
                iov_len: head.len(),
            },
            libc::iovec {
                iov_base: packet.as_ptr() as *mut c_void,
                iov_len: packet.len(),
            },
        ];

        let n = unsafe { libc::writev(fd.as_raw_fd(), iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok((n as usize).saturating_sub(head.len()))
    }

    pub fn read(&mut self, fd: BorrowedFd, buf: &mut [u8]) -> io::Result<usize> {
        if !Self::HAS_AF_PREFIX {
            let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }

            return Ok(n as usize);
        }

        let mut head = [0u8; 4];
        let mut iov = [
            libc::iovec {
                iov_base: head.as_mut_ptr() as *mut c_void,
                iov_len: head.len(),
            },
            libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut c_void,
                iov_len: buf.len(),
            },
        ];

        let n = unsafe { libc::readv(fd.as_raw_fd(), iov.as_mut_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok((n as usize).saturating_sub(head.len()))
    }
}

fn write_all(fd: BorrowedFd, buf: &[u8]) -> io::Result<usize> {
    let mut done = 0;

    while done < buf.len() {
        let n = unsafe {
            libc::write(
                fd.as_raw_fd(),
                buf[done..].as_ptr() as *const c_void,
                buf.len() - done,
            )
        };

        if n < 0 {
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(error),
            }
        }

        done += n as usize;
    }

    Ok(done)
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn af_detection_uses_the_version_nibble() {
        for first in 0x40..0x50u8 {
            assert_eq!(af_for_packet(first), Some(libc::AF_INET));
        }

        for first in 0x60..0x70u8 {
            assert_eq!(af_for_packet(first), Some(libc::AF_INET6));
        }

        assert_eq!(af_for_packet(0x50), None);
        assert_eq!(af_for_packet(0xff), None);
    }

    #[test]
    fn unknown_packets_complain_once() {
        // A pipe stands in for the device; the garbage packet is rejected
        // before any write happens.
        let mut framer = TunFramer::default();

        use std::os::fd::{AsFd, FromRawFd};

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = unsafe {
            (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))
        };

        let garbage = [0x00u8, 1, 2, 3];
        assert!(framer.write(write_fd.as_fd(), &garbage).is_err());
        assert!(framer.write(write_fd.as_fd(), &garbage).is_err());
        assert!(framer.complained);

        drop(read_fd);
    }
}
