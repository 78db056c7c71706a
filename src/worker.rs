//! Worker-side client of the command protocol.
//!
//! A worker is forked per connection and talks to the supervisor over one
//! socket pair. The TLS handshake and packet pumping live elsewhere; what
//! is here is everything a worker says and hears on the command channel:
//! driving authentication through the security module, presenting the
//! session cookie, receiving the tun descriptor, and reporting state.

use std::{os::fd::OwnedFd, os::unix::net::UnixStream, time::Duration};

use codec::{
    Command,
    message::{
        AuthCookieRep, AuthCookieReq, CliStats, DisconnectReason, ReplyStatus, ResumeDelete,
        ResumeFetch, ResumeFetchRep, ResumeStore, SecAuthCont, SecAuthInit, SecAuthReply,
        SessionInfo, Sid, TrafficStats, TunMtu,
    },
};

use crate::ipc::{self, IpcError};

pub struct WorkerChannel {
    sock: UnixStream,
    timeout: Duration,
}

impl WorkerChannel {
    pub fn new(sock: UnixStream, timeout: Duration) -> Self {
        Self { sock, timeout }
    }

    pub fn sock(&self) -> &UnixStream {
        &self.sock
    }

    /// Begin authentication; the supervisor relays this to the security
    /// module and the reply back.
    pub fn auth_init(&self, msg: &SecAuthInit) -> Result<SecAuthReply, IpcError> {
        ipc::send_msg(&self.sock, Command::SecAuthInit, Some(msg), None)?;
        Ok(ipc::recv_msg::<SecAuthReply>(&self.sock, Command::SecAuthReply, self.timeout)?.0)
    }

    /// Answer the current authentication prompt.
    pub fn auth_cont(&self, sid: Sid, password: &str) -> Result<SecAuthReply, IpcError> {
        let msg = SecAuthCont {
            sid,
            password: password.to_string(),
        };

        ipc::send_msg(&self.sock, Command::SecAuthCont, Some(&msg), None)?;
        Ok(ipc::recv_msg::<SecAuthReply>(&self.sock, Command::SecAuthReply, self.timeout)?.0)
    }

    /// Present the client's cookie. On success the reply carries the
    /// session's addresses and the tun device descriptor rides along.
    pub fn auth_cookie(&self, sid: Sid) -> Result<(AuthCookieRep, Option<OwnedFd>), IpcError> {
        let msg = AuthCookieReq { sid };

        ipc::send_msg(&self.sock, Command::AuthCookieReq, Some(&msg), None)?;
        let (reply, tun_fd) =
            ipc::recv_msg::<AuthCookieRep>(&self.sock, Command::AuthCookieRep, self.timeout)?;

        if reply.status == ReplyStatus::Ok && tun_fd.is_none() {
            log::error!("cookie accepted but no tun descriptor arrived");
            return Err(IpcError::BadCommand);
        }

        Ok((reply, tun_fd))
    }

    /// Handshake metadata for the supervisor's bookkeeping.
    pub fn send_session_info(&self, user_agent: &str, hostname: &str) -> Result<(), IpcError> {
        let msg = SessionInfo {
            user_agent: user_agent.to_string(),
            hostname: hostname.to_string(),
        };

        ipc::send_msg(&self.sock, Command::SessionInfo, Some(&msg), None)
    }

    /// The tunnel MTU negotiated with the client.
    pub fn send_tun_mtu(&self, mtu: u16) -> Result<(), IpcError> {
        ipc::send_msg(&self.sock, Command::TunMtu, Some(&TunMtu { mtu }), None)
    }

    /// Final traffic totals, sent on the way out.
    pub fn send_cli_stats(
        &self,
        sid: Sid,
        stats: TrafficStats,
        reason: DisconnectReason,
    ) -> Result<(), IpcError> {
        let msg = CliStats { sid, stats, reason };

        ipc::send_msg(&self.sock, Command::SecCliStats, Some(&msg), None)
    }

    /// Cache a TLS resume ticket with the supervisor.
    pub fn resume_store(&self, session_id: &[u8], data: &[u8]) -> Result<(), IpcError> {
        let msg = ResumeStore {
            session_id: session_id.to_vec(),
            data: data.to_vec(),
        };

        ipc::send_msg(&self.sock, Command::ResumeStoreReq, Some(&msg), None)
    }

    /// Fetch a cached resume ticket; `None` when the cache has nothing.
    pub fn resume_fetch(&self, session_id: &[u8]) -> Result<Option<Vec<u8>>, IpcError> {
        let msg = ResumeFetch {
            session_id: session_id.to_vec(),
        };

        ipc::send_msg(&self.sock, Command::ResumeFetchReq, Some(&msg), None)?;
        let (reply, _) =
            ipc::recv_msg::<ResumeFetchRep>(&self.sock, Command::ResumeFetchRep, self.timeout)?;

        Ok(match reply.status {
            ReplyStatus::Ok => Some(reply.data),
            ReplyStatus::Failed => None,
        })
    }

    pub fn resume_delete(&self, session_id: &[u8]) -> Result<(), IpcError> {
        let msg = ResumeDelete {
            session_id: session_id.to_vec(),
        };

        ipc::send_msg(&self.sock, Command::ResumeDeleteReq, Some(&msg), None)
    }

    /// Drain one supervisor-initiated command, if any is pending within
    /// the deadline. `UdpFd` hands over a socket for the datagram channel;
    /// `Terminate` means close up shop at the next loop iteration.
    pub fn poll_command(&self, timeout: Duration) -> Result<WorkerEvent, IpcError> {
        let (cmd, _, fd) = match ipc::recv_msg_data(&self.sock, timeout) {
            Ok(it) => it,
            Err(IpcError::TimedOut) => return Ok(WorkerEvent::Idle),
            Err(error) => return Err(error),
        };

        match cmd {
            Command::Terminate => Ok(WorkerEvent::Terminate),
            Command::UdpFd => match fd {
                Some(fd) => Ok(WorkerEvent::UdpFd(fd)),
                None => {
                    log::error!("udp fd command without a descriptor");
                    Err(IpcError::BadCommand)
                }
            },
            _ => {
                log::error!("worker: unexpected command '{}'", cmd);
                Err(IpcError::BadCommand)
            }
        }
    }
}

pub enum WorkerEvent {
    Idle,
    Terminate,
    UdpFd(OwnedFd),
}
