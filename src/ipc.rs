//! Framed command transport between the processes.
//!
//! Frames are `u8 cmd | u32le length | body` (see the codec crate) over
//! unix SOCK_STREAM sockets, with at most one file descriptor per message
//! passed as `SCM_RIGHTS` ancillary data. The transport is synchronous
//! request/reply per peer pair; every blocking receive carries a deadline
//! supplied by the caller.
//!
//! EINTR and EAGAIN are retried inside these primitives; everything else
//! surfaces as an [`IpcError`] for the event loop to act on.

use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use libc::{c_int, c_void};
use serde::{Serialize, de::DeserializeOwned};
use zeroize::Zeroizing;

use codec::{Command, HEADER_SIZE, decode_header, encode_header};

#[derive(Debug)]
pub enum IpcError {
    /// The peer closed its end of the socket.
    PeerTerminated,
    /// The caller-supplied deadline passed without data.
    TimedOut,
    /// Unexpected command byte, oversize body or malformed ancillary
    /// data. Fatal for the connection it happened on.
    BadCommand,
    Codec(codec::Error),
    Os(io::Error),
}

impl std::error::Error for IpcError {}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for IpcError {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<io::Error> for IpcError {
    fn from(value: io::Error) -> Self {
        Self::Os(value)
    }
}

/// Send one frame, optionally passing a descriptor along with it.
///
/// Header, body and ancillary data go out in a single `sendmsg`, so the
/// receiver always finds the descriptor attached to the header read.
pub fn send_msg<T: Serialize>(
    sock: &impl AsRawFd,
    cmd: Command,
    msg: Option<&T>,
    pass_fd: Option<BorrowedFd>,
) -> Result<(), IpcError> {
    let body = match msg {
        Some(msg) => codec::pack(msg)?,
        None => Zeroizing::new(Vec::new()),
    };

    let header = encode_header(cmd, body.len() as u32);

    let mut iov = [
        libc::iovec {
            iov_base: header.as_ptr() as *mut c_void,
            iov_len: header.len(),
        },
        libc::iovec {
            iov_base: body.as_ptr() as *mut c_void,
            iov_len: body.len(),
        },
    ];

    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<c_int>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = iov.as_mut_ptr();
    hdr.msg_iovlen = (if body.is_empty() { 1 } else { 2 }) as _;

    if let Some(fd) = pass_fd {
        hdr.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
        hdr.msg_controllen = cmsg_space as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&hdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<c_int>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut c_int, fd.as_raw_fd());
        }
    }

    loop {
        let n = unsafe { libc::sendmsg(sock.as_raw_fd(), &hdr, 0) };
        if n >= 0 {
            return Ok(());
        }

        let error = io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::EINTR) {
            return Err(IpcError::Os(error));
        }
    }
}

/// Send a frame that has no body.
pub fn send_empty(sock: &impl AsRawFd, cmd: Command) -> Result<(), IpcError> {
    send_msg::<()>(sock, cmd, None, None)
}

/// Relay an already-packed body under the given command. Used when a
/// frame was consumed off one socket and continues to another.
pub fn send_raw(sock: &impl AsRawFd, cmd: Command, body: &[u8]) -> Result<(), IpcError> {
    force_write(sock.as_raw_fd(), &encode_header(cmd, body.len() as u32))?;
    force_write(sock.as_raw_fd(), body)
}

/// Receive one frame: command, raw body, and the passed descriptor when
/// one rode along. The descriptor is owned from the moment it is read, so
/// every error path below closes it.
pub fn recv_msg_data(
    sock: &impl AsRawFd,
    timeout: Duration,
) -> Result<(Command, Zeroizing<Vec<u8>>, Option<OwnedFd>), IpcError> {
    let fd = sock.as_raw_fd();
    wait_readable(fd, timeout)?;

    let mut header = [0u8; HEADER_SIZE];
    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<c_int>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: header.as_mut_ptr() as *mut c_void,
        iov_len: header.len(),
    };

    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    hdr.msg_controllen = cmsg_space as _;

    let n = loop {
        let n = unsafe { libc::recvmsg(fd, &mut hdr, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }

        let error = io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::EINTR) {
            return Err(IpcError::Os(error));
        }
    };

    if n == 0 {
        return Err(IpcError::PeerTerminated);
    }

    let passed = unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&hdr);
        if !cmsg.is_null() && (*cmsg).cmsg_len as usize > 0 {
            if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
                log::error!("recvmsg returned invalid ancillary type");
                return Err(IpcError::BadCommand);
            }

            Some(OwnedFd::from_raw_fd(std::ptr::read_unaligned(
                libc::CMSG_DATA(cmsg) as *const c_int,
            )))
        } else {
            None
        }
    };

    // A stream read may return short of the five header bytes.
    if n < HEADER_SIZE {
        read_exact_timeout(fd, &mut header[n..], timeout)?;
    }

    let (cmd, length) = decode_header(&header).map_err(|_| IpcError::BadCommand)?;

    let mut body = Zeroizing::new(vec![0u8; length]);
    read_exact_timeout(fd, &mut body, timeout)?;

    Ok((cmd, body, passed))
}

/// Full round trip: receive a frame, insist on the expected command and
/// unpack its body.
pub fn recv_msg<T: DeserializeOwned>(
    sock: &impl AsRawFd,
    expected: Command,
    timeout: Duration,
) -> Result<(T, Option<OwnedFd>), IpcError> {
    let (cmd, body, passed) = recv_msg_data(sock, timeout)?;
    if cmd != expected {
        log::error!("expected '{}', received '{}'", expected, cmd);
        return Err(IpcError::BadCommand);
    }

    Ok((codec::unpack(&body)?, passed))
}

/// Splice one message from one socket to another, rewriting the command
/// byte. The body is copied through without being unpacked.
pub fn forward_msg(
    input: &impl AsRawFd,
    in_cmd: Command,
    output: &impl AsRawFd,
    out_cmd: Command,
    timeout: Duration,
) -> Result<(), IpcError> {
    let in_fd = input.as_raw_fd();
    wait_readable(in_fd, timeout)?;

    let mut header = [0u8; HEADER_SIZE];
    read_exact_timeout(in_fd, &mut header, timeout)?;

    let (cmd, length) = decode_header(&header).map_err(|_| IpcError::BadCommand)?;
    if cmd != in_cmd {
        log::error!("expected '{}', received '{}'", in_cmd, cmd);
        return Err(IpcError::BadCommand);
    }

    force_write(output.as_raw_fd(), &encode_header(out_cmd, length as u32))?;

    let mut left = length;
    let mut buf = Zeroizing::new([0u8; 1024]);
    while left > 0 {
        let chunk = left.min(buf.len());
        read_exact_timeout(in_fd, &mut buf[..chunk], timeout)?;
        force_write(output.as_raw_fd(), &buf[..chunk])?;
        left -= chunk;
    }

    Ok(())
}

/// Block until the descriptor is readable or the deadline passes.
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<(), IpcError> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as c_int) };
        if n > 0 {
            return Ok(());
        }

        if n == 0 {
            return Err(IpcError::TimedOut);
        }

        let error = io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::EINTR) {
            return Err(IpcError::Os(error));
        }
    }
}

fn read_exact_timeout(fd: RawFd, buf: &mut [u8], timeout: Duration) -> Result<(), IpcError> {
    let mut done = 0;

    while done < buf.len() {
        wait_readable(fd, timeout)?;

        let n = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut c_void,
                buf.len() - done,
            )
        };

        if n == 0 {
            return Err(IpcError::PeerTerminated);
        }

        if n < 0 {
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(IpcError::Os(error)),
            }
        }

        done += n as usize;
    }

    Ok(())
}

fn force_write(fd: RawFd, buf: &[u8]) -> Result<(), IpcError> {
    let mut done = 0;

    while done < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[done..].as_ptr() as *const c_void,
                buf.len() - done,
            )
        };

        if n == 0 {
            return Err(IpcError::PeerTerminated);
        }

        if n < 0 {
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(IpcError::Os(error)),
            }
        }

        done += n as usize;
    }

    Ok(())
}
