//! The main supervisor process.
//!
//! Accepts client connections, gates them through the ban engine, forks
//! one worker per admitted connection and owns everything the workers and
//! the security module must not: the listener sockets, the ban database,
//! the lease pools, the tun devices and the resume cache. All state moves
//! over the command transport; the loop below is the only place the
//! supervisor blocks.

use std::{
    io,
    net::{IpAddr, SocketAddr, TcpListener, TcpStream},
    os::fd::{AsFd, AsRawFd},
    os::unix::net::UnixStream,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};

use codec::{
    Command,
    message::{
        AuthCookieRep, AuthCookieReq, BanIp, BanIpReply, CliStats, ReplyStatus, ResumeDelete,
        ResumeFetch, ResumeFetchRep, ResumeStore, SessionClose, SessionInfo, SessionOpen,
        SessionReply, StatsPush, TrafficStats, TunMtu,
    },
};
use service::{
    ban::BanDb,
    lease::{AddrPool, LeasePools},
};

use crate::{
    config::Config,
    ipc::{self, IpcError},
    proc::{Proc, ProcTable},
    resume::ResumeCache,
    statistics::{Statistics, Stats},
    tun::{self, TunOptions},
    unix_now,
    worker::{WorkerChannel, WorkerEvent},
};

/// Poll deadline of the supervisor loop; maintenance runs at this pace
/// when nothing else happens.
const MAINTENANCE_TICK: Duration = Duration::from_secs(30);

pub struct Supervisor {
    config: Arc<Config>,
    secmod: UnixStream,
    listeners: Vec<TcpListener>,
    procs: ProcTable,
    bans: BanDb,
    pools: LeasePools,
    resume: ResumeCache,
    statistics: Statistics,
    tun_options: TunOptions,
    timeout: Duration,
    last_maintenance: u64,
}

/// Run the supervisor until the fleet shuts down. An error from the
/// security module socket is fatal: without it there is no key material
/// and no session database.
pub fn run(config: Arc<Config>, secmod: UnixStream, statistics: Statistics) -> Result<()> {
    Supervisor::new(config, secmod, statistics)?.event_loop()
}

impl Supervisor {
    pub fn new(config: Arc<Config>, secmod: UnixStream, statistics: Statistics) -> Result<Self> {
        let mut listeners = Vec::with_capacity(config.server.listen.len());
        for addr in &config.server.listen {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("binding {}", addr))?;
            listener.set_nonblocking(true)?;
            listeners.push(listener);

            log::info!("listening on {}", addr);
        }

        let tun_options = TunOptions {
            device_prefix: config.server.device.clone(),
            uid: config.server.uid,
            gid: config.server.gid,
            mtu: config.network.mtu,
            ..TunOptions::default()
        };

        Ok(Self {
            bans: BanDb::new(config.ban.as_ban_config()),
            pools: build_pools(&config)?,
            resume: ResumeCache::new(config.timeouts.resume),
            timeout: Duration::from_secs(config.timeouts.secmod),
            last_maintenance: unix_now(),
            procs: ProcTable::default(),
            statistics,
            tun_options,
            listeners,
            secmod,
            config,
        })
    }

    fn event_loop(&mut self) -> Result<()> {
        loop {
            let pids = self.procs.pids();

            let mut pfds = Vec::with_capacity(self.listeners.len() + 1 + pids.len());
            for listener in &self.listeners {
                pfds.push(libc::pollfd {
                    fd: listener.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            pfds.push(libc::pollfd {
                fd: self.secmod.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });

            for pid in &pids {
                if let Some(proc) = self.procs.get(*pid) {
                    pfds.push(libc::pollfd {
                        fd: proc.sock.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    });
                }
            }

            let n = unsafe {
                libc::poll(
                    pfds.as_mut_ptr(),
                    pfds.len() as _,
                    MAINTENANCE_TICK.as_millis() as _,
                )
            };

            if n < 0 {
                let error = io::Error::last_os_error();
                if error.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }

                return Err(error.into());
            }

            if n > 0 {
                let secmod_slot = self.listeners.len();

                for (slot, pfd) in pfds.iter().enumerate() {
                    if pfd.revents == 0 {
                        continue;
                    }

                    if slot < secmod_slot {
                        self.accept_clients(slot);
                    } else if slot == secmod_slot {
                        self.handle_secmod()?;
                    } else {
                        let pid = pids[slot - secmod_slot - 1];
                        self.handle_worker(pid);
                    }
                }
            }

            let now = unix_now();
            if n == 0 || now >= self.last_maintenance + MAINTENANCE_TICK.as_secs() {
                self.maintenance(now);
            }
        }
    }

    /// Drain one listener: ban-gate each connection, fork a worker for
    /// the admitted ones.
    fn accept_clients(&mut self, slot: usize) {
        loop {
            let (stream, peer) = match self.listeners[slot].accept() {
                Ok(it) => it,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    log::error!("accept: {}", error);
                    return;
                }
            };

            // Banned peers get a plain close, no reply of any kind.
            if self.bans.check(peer.ip(), unix_now()) {
                drop(stream);
                continue;
            }

            if let Err(error) = self.fork_worker(stream, peer) {
                log::error!("cannot fork worker for {}: {}", peer, error);
            }
        }
    }

    fn fork_worker(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (parent_sock, child_sock) = UnixStream::pair()?;

        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error().into()),
            0 => {
                drop(parent_sock);
                self.run_worker_child(child_sock, stream)
            }
            pid => {
                drop(child_sock);
                drop(stream);

                log::debug!("forked worker {} for {}", pid, peer);
                self.procs
                    .insert(Proc::new(pid, parent_sock, peer, unix_now()));

                Ok(())
            }
        }
    }

    /// The child side of the fork. The TLS stack drives the command
    /// channel from here once it has a handshake: auth through
    /// [`WorkerChannel::auth_init`]/[`auth_cont`], then the cookie
    /// presentation that brings back the tun descriptor. Without it the
    /// child parks on the channel until it is terminated.
    ///
    /// [`auth_cont`]: WorkerChannel::auth_cont
    fn run_worker_child(&self, sock: UnixStream, client: TcpStream) -> ! {
        // The child exits with process::exit, which skips destructors, so
        // the inherited supervisor descriptors are closed by hand. The
        // security module socket matters most: holding it open would keep
        // the module alive past a supervisor crash.
        unsafe {
            libc::close(self.secmod.as_raw_fd());
            for listener in &self.listeners {
                libc::close(listener.as_raw_fd());
            }
            for proc in self.procs.iter() {
                libc::close(proc.sock.as_raw_fd());
            }
        }

        let channel = WorkerChannel::new(sock, self.timeout);
        if let Err(error) = worker_child_loop(&channel) {
            log::debug!("worker: channel closed: {}", error);
        }

        drop(client);
        std::process::exit(0);
    }

    /// A command initiated by the security module. Only the ban requests
    /// originate there; anything else on this socket outside a reply
    /// window is a protocol violation.
    fn handle_secmod(&mut self) -> Result<()> {
        let (cmd, body, _) = match ipc::recv_msg_data(&self.secmod, self.timeout) {
            Ok(it) => it,
            Err(IpcError::PeerTerminated) => {
                return Err(anyhow!("security module went away, shutting down"));
            }
            Err(error) => return Err(error.into()),
        };

        match cmd {
            Command::SecmBanIp => {
                let msg: BanIp = codec::unpack(&body)?;
                let banned = self.bans.record(msg.ip, msg.score, unix_now());

                ipc::send_msg(
                    &self.secmod,
                    Command::SecmBanIpReply,
                    Some(&BanIpReply { banned }),
                    None,
                )?;
            }
            _ => return Err(anyhow!("unexpected command '{}' from sec-mod", cmd)),
        }

        Ok(())
    }

    /// One command from a worker, or its exit.
    fn handle_worker(&mut self, pid: i32) {
        let Some(proc) = self.procs.get(pid) else {
            return;
        };

        let (cmd, body, _) = match ipc::recv_msg_data(&proc.sock, self.timeout) {
            Ok(it) => it,
            Err(IpcError::PeerTerminated) => {
                self.teardown_worker(pid);
                return;
            }
            Err(error) => {
                log::error!("worker {}: {}", pid, error);
                self.teardown_worker(pid);
                return;
            }
        };

        log::debug!("worker {}: received '{}'", pid, cmd);

        if let Err(error) = self.dispatch_worker(pid, cmd, &body) {
            log::error!("worker {}: '{}' failed: {}", pid, cmd, error);
            self.teardown_worker(pid);
        }
    }

    fn dispatch_worker(&mut self, pid: i32, cmd: Command, body: &[u8]) -> Result<()> {
        match cmd {
            // Authentication steps pass through to the security module;
            // the supervisor only splices the reply back.
            Command::SecAuthInit | Command::SecAuthCont => {
                ipc::send_raw(&self.secmod, cmd, body)?;

                let proc = self
                    .procs
                    .get(pid)
                    .ok_or_else(|| anyhow!("no record for worker {}", pid))?;
                ipc::forward_msg(
                    &self.secmod,
                    Command::SecAuthReply,
                    &proc.sock,
                    Command::SecAuthReply,
                    self.timeout,
                )?;
            }
            Command::AuthCookieReq => {
                let msg: AuthCookieReq = codec::unpack(body)?;
                self.cookie_auth(pid, msg)?;
            }
            Command::SessionInfo => {
                let msg: SessionInfo = codec::unpack(body)?;
                if let Some(proc) = self.procs.get_mut(pid) {
                    proc.user_agent = msg.user_agent;
                    proc.hostname = msg.hostname;
                }
            }
            Command::TunMtu => {
                let msg: TunMtu = codec::unpack(body)?;
                if let Some(proc) = self.procs.get_mut(pid) {
                    tun::set_tun_mtu(proc, msg.mtu)?;
                }
            }
            Command::SecCliStats => {
                let msg: CliStats = codec::unpack(body)?;
                if let Some(proc) = self.procs.get_mut(pid) {
                    proc.stats = msg.stats;
                    proc.discon_reason = msg.reason;

                    if let Some(sid) = proc.sid {
                        self.statistics.send(
                            &sid.safe_id(),
                            &[
                                Stats::ReceivedBytes(msg.stats.bytes_in as usize),
                                Stats::SendBytes(msg.stats.bytes_out as usize),
                            ],
                        );
                    }
                }

                // Accounting interest lives in the security module.
                ipc::send_raw(&self.secmod, Command::SecCliStats, body)?;
            }
            Command::ResumeStoreReq => {
                let msg: ResumeStore = codec::unpack(body)?;
                self.resume.store(&msg.session_id, &msg.data, unix_now());
            }
            Command::ResumeFetchReq => {
                let msg: ResumeFetch = codec::unpack(body)?;
                let reply = match self.resume.fetch(&msg.session_id, unix_now()) {
                    Some(data) => ResumeFetchRep {
                        status: ReplyStatus::Ok,
                        data: data.to_vec(),
                    },
                    None => ResumeFetchRep {
                        status: ReplyStatus::Failed,
                        data: Vec::new(),
                    },
                };

                let proc = self
                    .procs
                    .get(pid)
                    .ok_or_else(|| anyhow!("no record for worker {}", pid))?;
                ipc::send_msg(&proc.sock, Command::ResumeFetchRep, Some(&reply), None)?;
            }
            Command::ResumeDeleteReq => {
                let msg: ResumeDelete = codec::unpack(body)?;
                self.resume.delete(&msg.session_id);
            }
            Command::BanIp => {
                let msg: BanIp = codec::unpack(body)?;
                let banned = self.bans.record(msg.ip, msg.score, unix_now());

                let proc = self
                    .procs
                    .get(pid)
                    .ok_or_else(|| anyhow!("no record for worker {}", pid))?;
                ipc::send_msg(
                    &proc.sock,
                    Command::BanIpReply,
                    Some(&BanIpReply { banned }),
                    None,
                )?;
            }
            _ => return Err(anyhow!("unexpected command '{}'", cmd)),
        }

        Ok(())
    }

    /// Resolve a presented cookie with the security module and, when it
    /// holds, provision the tunnel and hand its descriptor to the worker.
    fn cookie_auth(&mut self, pid: i32, msg: AuthCookieReq) -> Result<()> {
        let open = SessionOpen { sid: msg.sid };
        ipc::send_msg(&self.secmod, Command::SecmSessionOpen, Some(&open), None)?;

        let (reply, _) = ipc::recv_msg::<SessionReply>(
            &self.secmod,
            Command::SecmSessionReply,
            self.timeout,
        )?;

        if reply.status != ReplyStatus::Ok {
            let proc = self
                .procs
                .get(pid)
                .ok_or_else(|| anyhow!("no record for worker {}", pid))?;
            ipc::send_msg(
                &proc.sock,
                Command::AuthCookieRep,
                Some(&AuthCookieRep::failed()),
                None,
            )?;
            return Ok(());
        }

        let static_v4 = self.config.static_ipv4(&reply.vhost, &reply.username);
        let mtu = self.tun_options.mtu;

        let proc = self
            .procs
            .get_mut(pid)
            .ok_or_else(|| anyhow!("no record for worker {}", pid))?;
        proc.sid = Some(msg.sid);
        proc.username = reply.username.clone();
        proc.vhost = reply.vhost.clone();

        if let Err(error) = tun::open_tun(&mut self.pools, &self.tun_options, proc, static_v4) {
            log::error!("cannot provision a tunnel for worker {}: {}", pid, error);

            // The session stays dormant in the security module until it
            // expires; this connection however is done.
            ipc::send_msg(
                &proc.sock,
                Command::AuthCookieRep,
                Some(&AuthCookieRep::failed()),
                None,
            )?;
            self.close_session(pid);
            return Ok(());
        }

        let Some(device) = proc.tun.as_ref() else {
            return Err(anyhow!("tunnel provisioning left no device"));
        };
        let cookie_rep = AuthCookieRep {
            status: ReplyStatus::Ok,
            username: reply.username,
            vhost: reply.vhost,
            tun_name: device.name.clone(),
            ipv4: proc.ipv4.as_ref().and_then(|lease| lease.as_lease4()),
            ipv6: proc.ipv6.as_ref().and_then(|lease| lease.as_lease6()),
            mtu,
            motd: reply.motd,
        };

        ipc::send_msg(
            &proc.sock,
            Command::AuthCookieRep,
            Some(&cookie_rep),
            Some(device.fd.as_fd()),
        )?;

        // The worker owns the descriptor now; the supervisor's copy only
        // existed to pass it on.
        tun::close_tun(proc);

        log::info!(
            "worker {}: session for user '{}' connected, device {}",
            pid,
            cookie_rep.username,
            cookie_rep.tun_name
        );

        Ok(())
    }

    /// Tell the security module the worker's session is done.
    fn close_session(&mut self, pid: i32) {
        let Some(proc) = self.procs.get_mut(pid) else {
            return;
        };

        let Some(sid) = proc.sid.take() else {
            return;
        };

        let uptime = unix_now().saturating_sub(proc.connected_at);
        let close = SessionClose {
            sid,
            reason: proc.discon_reason,
            stats: TrafficStats {
                uptime,
                ..proc.stats
            },
            ipv4: proc.ipv4.as_ref().and_then(|lease| lease.as_lease4()),
            ipv6: proc.ipv6.as_ref().and_then(|lease| lease.as_lease6()),
        };

        let result = ipc::send_msg(&self.secmod, Command::SecmSessionClose, Some(&close), None)
            .and_then(|_| {
                ipc::recv_msg::<SessionReply>(
                    &self.secmod,
                    Command::SecmSessionReply,
                    self.timeout,
                )
            });

        if let Err(error) = result {
            log::error!("session close for worker {}: {}", pid, error);
        }
    }

    /// Release everything a worker held: session, tun device, leases,
    /// and finally the zombie.
    fn teardown_worker(&mut self, pid: i32) {
        self.close_session(pid);

        let Some(mut proc) = self.procs.remove(pid) else {
            return;
        };

        tun::reset_tun(&proc);
        tun::close_tun(&mut proc);

        for lease in proc.ipv4.take().into_iter().chain(proc.ipv6.take()) {
            self.pools.remove_ip_lease(&lease);
        }

        unsafe {
            libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG);
        }

        log::info!(
            "worker {} exited ({}), {} clients remain",
            pid,
            proc.discon_reason,
            self.procs.len()
        );
    }

    /// Push interim stats for live sessions and sweep the timed tables.
    fn maintenance(&mut self, now: u64) {
        self.last_maintenance = now;

        self.bans.reap(now);
        self.resume.reap(now);

        // Collect any zombies the socket-close path has not reaped yet.
        unsafe {
            while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
        }

        for proc in self.procs.iter() {
            let Some(sid) = proc.sid else {
                continue;
            };

            let push = StatsPush {
                sid,
                stats: TrafficStats {
                    uptime: now.saturating_sub(proc.connected_at),
                    ..proc.stats
                },
            };

            if let Err(error) = ipc::send_msg(&self.secmod, Command::SecmStats, Some(&push), None)
            {
                log::error!("stats push: {}", error);
                break;
            }
        }

        let totals = self.statistics.total();
        log::debug!(
            "maintenance: {} clients, {} bans, {} cached tickets, traffic in/out {}/{}",
            self.procs.len(),
            self.bans.len(),
            self.resume.len(),
            totals.received_bytes,
            totals.send_bytes,
        );
    }
}

fn build_pools(config: &Config) -> Result<LeasePools> {
    let reserved = config.network.dns.clone();

    let v4 = match config.network.ipv4()? {
        Some((network, prefix)) => Some(
            AddrPool::new(IpAddr::V4(network), prefix, &reserved)
                .map_err(|error| anyhow!("ipv4 pool: {}", error))?,
        ),
        None => None,
    };

    let v6 = match config.network.ipv6()? {
        Some((network, prefix)) => Some(
            AddrPool::new(IpAddr::V6(network), prefix, &reserved)
                .map_err(|error| anyhow!("ipv6 pool: {}", error))?,
        ),
        None => None,
    };

    Ok(LeasePools { v4, v6 })
}

/// What a freshly forked worker does until the TLS stack takes over the
/// channel: wait for supervisor commands and obey the terminate.
fn worker_child_loop(channel: &WorkerChannel) -> Result<(), IpcError> {
    loop {
        match channel.poll_command(MAINTENANCE_TICK)? {
            WorkerEvent::Idle => continue,
            WorkerEvent::UdpFd(fd) => {
                log::debug!("worker: received the datagram channel socket");
                drop(fd);
            }
            WorkerEvent::Terminate => return Ok(()),
        }
    }
}
