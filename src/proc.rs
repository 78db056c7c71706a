//! Per-worker bookkeeping held by the supervisor.

use std::{net::SocketAddr, os::unix::net::UnixStream};

use ahash::AHashMap;

use codec::message::{DisconnectReason, Sid, TrafficStats};
use service::lease::IpLease;

use crate::tun::TunDevice;

/// One forked worker and everything the supervisor holds on its behalf.
///
/// The tun device and the leases live exactly as long as this record: they
/// are provisioned when the worker's session is accepted and released in
/// teardown.
pub struct Proc {
    pub pid: i32,
    /// Supervisor side of the worker's command socket.
    pub sock: UnixStream,
    pub remote_addr: SocketAddr,
    pub sid: Option<Sid>,
    pub username: String,
    pub vhost: String,
    pub user_agent: String,
    pub hostname: String,
    pub tun: Option<TunDevice>,
    pub ipv4: Option<IpLease>,
    pub ipv6: Option<IpLease>,
    pub stats: TrafficStats,
    pub connected_at: u64,
    pub discon_reason: DisconnectReason,
}

impl Proc {
    pub fn new(pid: i32, sock: UnixStream, remote_addr: SocketAddr, now: u64) -> Self {
        Self {
            pid,
            sock,
            remote_addr,
            sid: None,
            username: String::new(),
            vhost: String::new(),
            user_agent: String::new(),
            hostname: String::new(),
            tun: None,
            ipv4: None,
            ipv6: None,
            stats: TrafficStats::default(),
            connected_at: now,
            discon_reason: DisconnectReason::Unspecified,
        }
    }
}

/// Worker records keyed by child pid.
#[derive(Default)]
pub struct ProcTable {
    procs: AHashMap<i32, Proc>,
}

impl ProcTable {
    pub fn insert(&mut self, proc: Proc) {
        self.procs.insert(proc.pid, proc);
    }

    pub fn get(&self, pid: i32) -> Option<&Proc> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: i32) -> Option<&mut Proc> {
        self.procs.get_mut(&pid)
    }

    pub fn remove(&mut self, pid: i32) -> Option<Proc> {
        self.procs.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn pids(&self) -> Vec<i32> {
        self.procs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        self.procs.values()
    }
}
