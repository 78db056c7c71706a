//! Message bodies of the inter-process protocol.
//!
//! One struct per command that carries a body; commands without one
//! (`Terminate`, `SecmReload`, ...) send an empty frame. Every field here is
//! wire contract, see the crate notes on stability.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::safeid::calc_safe_id;

/// Size of a session identifier in bytes.
pub const SID_SIZE: usize = 16;

/// An opaque session identifier.
///
/// Randomly generated by the security module, unique among live sessions,
/// and returned to the client inside its cookie. The raw bytes are a
/// credential: logs must only ever see [`Sid::safe_id`], and `Debug` prints
/// that form for the same reason.
///
/// # Test
///
/// ```
/// use vpn_server_codec::message::Sid;
///
/// let sid = Sid([0u8; 16]);
///
/// assert_eq!(sid.safe_id(), "4SnyfFEDvFzES83woV4WDURQZv8=");
/// assert_eq!(format!("{:?}", sid), "Sid(4SnyfFEDvFzES83woV4WDURQZv8=)");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sid(pub [u8; SID_SIZE]);

impl Sid {
    /// The log-safe, non-reversible form of this identifier.
    pub fn safe_id(&self) -> String {
        calc_safe_id(&self.0)
    }
}

impl std::fmt::Debug for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sid({})", self.safe_id())
    }
}

/// Where a session stands in the authentication chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    Inactive,
    Init,
    Cont,
    Completed,
    Failed,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Inactive => "pre-auth",
            Self::Init | Self::Cont => "authenticating",
            Self::Completed => "authenticated",
            Self::Failed => "auth failed",
        })
    }
}

/// Why a worker stopped serving its client. Drives the dormancy decision
/// the security module takes when a session's last worker goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Unspecified,
    UserDisconnect,
    ServerDisconnect,
    IdleTimeout,
    DpdTimeout,
    Error,
    SessionTimeout,
}

impl std::fmt::Display for DisconnectReason {
    /// # Test
    ///
    /// ```
    /// use vpn_server_codec::message::DisconnectReason;
    ///
    /// assert_eq!(DisconnectReason::UserDisconnect.to_string(), "user disconnected");
    /// assert_eq!(DisconnectReason::SessionTimeout.to_string(), "session timeout");
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unspecified => "unspecified",
            Self::UserDisconnect => "user disconnected",
            Self::ServerDisconnect => "server disconnected",
            Self::IdleTimeout => "idle timeout",
            Self::DpdTimeout => "DPD timeout",
            Self::Error => "unspecified error",
            Self::SessionTimeout => "session timeout",
        })
    }
}

/// Outcome carried by reply messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    Failed,
}

/// Point-to-point IPv4 assignment of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease4 {
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
    pub prefix: u8,
}

/// Point-to-point IPv6 assignment of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease6 {
    pub local: Ipv6Addr,
    pub remote: Ipv6Addr,
    pub prefix: u8,
}

/// Session traffic totals as reported by a worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub uptime: u64,
}

/// Worker -> supervisor: resume a session from the cookie the client
/// presented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCookieReq {
    pub sid: Sid,
}

/// Supervisor -> worker: the resolved session. Accompanied by the tun
/// device fd when `status` is `Ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCookieRep {
    pub status: ReplyStatus,
    pub username: String,
    pub vhost: String,
    pub tun_name: String,
    pub ipv4: Option<Lease4>,
    pub ipv6: Option<Lease6>,
    pub mtu: u16,
    pub motd: Option<String>,
}

impl AuthCookieRep {
    /// The failure shape: no session data beyond the status.
    pub fn failed() -> Self {
        Self {
            status: ReplyStatus::Failed,
            username: String::new(),
            vhost: String::new(),
            tun_name: String::new(),
            ipv4: None,
            ipv6: None,
            mtu: 0,
            motd: None,
        }
    }
}

/// Worker -> security module: start authenticating a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecAuthInit {
    pub vhost: String,
    pub username: String,
    pub remote_ip: String,
    pub user_agent: String,
    pub worker_pid: u32,
}

/// Worker -> security module: next step of the authentication chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecAuthCont {
    pub sid: Sid,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthRc {
    Ok,
    /// More steps required; `msg` tells the client what to supply.
    Continue,
    Failed,
}

/// Security module -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecAuthReply {
    pub rc: AuthRc,
    pub sid: Option<Sid>,
    pub msg: Option<String>,
}

/// Supervisor -> security module: a worker presented `sid`, bind it.
/// Addresses are not assigned yet at this point; they follow with the
/// close/accounting messages once the tunnel is provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpen {
    pub sid: Sid,
}

/// Supervisor -> security module: the worker serving `sid` went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClose {
    pub sid: Sid,
    pub reason: DisconnectReason,
    pub stats: TrafficStats,
    /// Addresses the session had assigned, for the accounting record.
    pub ipv4: Option<Lease4>,
    pub ipv6: Option<Lease6>,
}

/// Security module -> supervisor: result of a session open/close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReply {
    pub status: ReplyStatus,
    pub username: String,
    pub vhost: String,
    pub motd: Option<String>,
}

/// Interim accounting push for a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPush {
    pub sid: Sid,
    pub stats: TrafficStats,
}

/// Worker -> security module: traffic totals at disconnect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliStats {
    pub sid: Sid,
    pub stats: TrafficStats,
    pub reason: DisconnectReason,
}

/// Ask the peer to penalize an address (`BanIp` towards workers,
/// `SecmBanIp` from the security module to the supervisor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanIp {
    pub ip: IpAddr,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanIpReply {
    pub banned: bool,
}

/// Worker -> supervisor: metadata learned during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_agent: String,
    pub hostname: String,
}

/// Worker -> supervisor: the negotiated tunnel MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunMtu {
    pub mtu: u16,
}

/// Worker -> supervisor: cache a TLS session ticket for resumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeStore {
    pub session_id: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeFetch {
    pub session_id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeFetchRep {
    pub status: ReplyStatus,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDelete {
    pub session_id: Vec<u8>,
}

/// Private-key operation proxied into the security module; the reply
/// reuses the same command with the transformed data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOp {
    pub vhost: String,
    pub data: Vec<u8>,
}

/// One live session as listed to the admin surface. Only the safe id
/// leaves the security module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieEntry {
    pub safe_id: String,
    pub username: String,
    pub vhost: String,
    pub state: AuthState,
    pub remote_ip: String,
    pub in_use: u32,
    pub expires: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCookiesReply {
    pub cookies: Vec<CookieEntry>,
}
