//! The security module: the privileged sibling of the supervisor.
//!
//! It owns the session database and drives authentication; the supervisor
//! only ever holds opaque session identifiers. The module runs a
//! single-threaded loop over one socket to the supervisor, dispatching
//! commands and reaping expired sessions between them. It is forked
//! before the supervisor drops privileges and deliberately shares no
//! memory with it.

use std::{collections::HashMap, net::IpAddr, os::unix::net::UnixStream, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};

use codec::{
    Command,
    message::{
        AuthRc, AuthState, BanIp, BanIpReply, CliStats, CookieEntry, KeyOp, ListCookiesReply,
        ReplyStatus, SecAuthCont, SecAuthInit, SecAuthReply, SessionClose, SessionOpen,
        SessionReply, StatsPush,
    },
};
use service::{
    AcctHandler,
    session::{ExpireOutcome, MAX_AUTH_ATTEMPTS, SessionDb},
};

use crate::{
    config::{Config, DEFAULT_VHOST},
    ipc::{self, IpcError},
    unix_now,
};

/// How often the session reaper runs when the supervisor is quiet.
const MAINTENANCE_TICK: Duration = Duration::from_secs(30);

/// Password prompt sent while the chain wants another step.
const PASSWORD_PROMPT: &str = "Please enter your password.";

/// Authentication backend seam. RADIUS/PAM-style integrations implement
/// this; the built-in backend answers from the config's credential table.
pub trait AuthBackend: Send {
    /// The expected password of a user, or `None` when unknown.
    fn password(&self, vhost: &str, username: &str) -> Option<String>;
}

/// The config-table backend: static credentials checked first, nothing
/// else consulted.
pub struct StaticAuth {
    credentials: HashMap<String, String>,
}

impl StaticAuth {
    pub fn new(config: &Config) -> Self {
        Self {
            credentials: config.auth.static_credentials.clone(),
        }
    }
}

impl AuthBackend for StaticAuth {
    fn password(&self, _vhost: &str, username: &str) -> Option<String> {
        self.credentials.get(username).cloned()
    }
}

/// Private-key operations proxied from workers. The TLS side owns the
/// actual keys; without it there is nothing to sign with.
pub trait KeyOps: Send {
    fn sign(&self, vhost: &str, data: &[u8]) -> Option<Vec<u8>>;
    fn decrypt(&self, vhost: &str, data: &[u8]) -> Option<Vec<u8>>;
}

/// Placeholder used until a TLS backend registers key material.
pub struct NoKeys;

impl KeyOps for NoKeys {
    fn sign(&self, vhost: &str, _data: &[u8]) -> Option<Vec<u8>> {
        log::warn!("sign request but no key material loaded for vhost '{}'", vhost);
        None
    }

    fn decrypt(&self, vhost: &str, _data: &[u8]) -> Option<Vec<u8>> {
        log::warn!(
            "decrypt request but no key material loaded for vhost '{}'",
            vhost
        );
        None
    }
}

pub struct SecMod<A, H> {
    config: Arc<Config>,
    db: SessionDb,
    auth: A,
    acct: H,
    keys: Box<dyn KeyOps>,
    timeout: Duration,
}

impl<A, H> SecMod<A, H>
where
    A: AuthBackend,
    H: AcctHandler,
{
    pub fn new(config: Arc<Config>, auth: A, acct: H) -> Self {
        let timeout = Duration::from_secs(config.timeouts.secmod);

        Self {
            config,
            db: SessionDb::new(),
            auth,
            acct,
            keys: Box::new(NoKeys),
            timeout,
        }
    }

    pub fn with_keys(mut self, keys: Box<dyn KeyOps>) -> Self {
        self.keys = keys;
        self
    }

    /// The module's event loop: serve commands until the supervisor goes
    /// away or sends a terminate.
    pub fn run(mut self, sock: UnixStream) -> Result<()> {
        log::info!("sec-mod: running (pid {})", std::process::id());

        loop {
            match ipc::recv_msg_data(&sock, MAINTENANCE_TICK) {
                Ok((cmd, body, _)) => {
                    if !self.dispatch(&sock, cmd, &body)? {
                        break;
                    }
                }
                Err(IpcError::TimedOut) => self.maintenance(),
                Err(IpcError::PeerTerminated) => {
                    log::info!("sec-mod: supervisor went away, exiting");
                    break;
                }
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, sock: &UnixStream, cmd: Command, body: &[u8]) -> Result<bool> {
        log::debug!("sec-mod: received '{}'", cmd);

        match cmd {
            Command::SecAuthInit => {
                let msg: SecAuthInit = codec::unpack(body)?;
                let reply = self.auth_init(msg);
                ipc::send_msg(sock, Command::SecAuthReply, Some(&reply), None)?;
            }
            Command::SecAuthCont => {
                let msg: SecAuthCont = codec::unpack(body)?;
                let (reply, ban) = self.auth_cont(msg);
                ipc::send_msg(sock, Command::SecAuthReply, Some(&reply), None)?;

                // Punish the source only after the worker has its verdict;
                // the supervisor is back in its loop by now and serves the
                // ban round trip.
                if let Some(ban) = ban {
                    ipc::send_msg(sock, Command::SecmBanIp, Some(&ban), None)?;
                    let (reply, _) =
                        ipc::recv_msg::<BanIpReply>(sock, Command::SecmBanIpReply, self.timeout)?;
                    if reply.banned {
                        log::info!("offending address {} is now banned", ban.ip);
                    }
                }
            }
            Command::SecmSessionOpen => {
                let msg: SessionOpen = codec::unpack(body)?;
                let reply = self.session_open(msg);
                ipc::send_msg(sock, Command::SecmSessionReply, Some(&reply), None)?;
            }
            Command::SecmSessionClose => {
                let msg: SessionClose = codec::unpack(body)?;
                let reply = self.session_close(msg);
                ipc::send_msg(sock, Command::SecmSessionReply, Some(&reply), None)?;
            }
            Command::SecmStats => {
                let msg: StatsPush = codec::unpack(body)?;
                if let Some(entry) = self.db.find(&msg.sid) {
                    self.acct.session_stats(&entry.acct, &msg.stats);
                }
            }
            Command::SecCliStats => {
                let msg: CliStats = codec::unpack(body)?;
                if let Some(entry) = self.db.find(&msg.sid) {
                    self.acct.session_stats(&entry.acct, &msg.stats);
                }
            }
            Command::SecSign | Command::SecDecrypt => {
                let msg: KeyOp = codec::unpack(body)?;
                let data = match cmd {
                    Command::SecSign => self.keys.sign(&msg.vhost, &msg.data),
                    _ => self.keys.decrypt(&msg.vhost, &msg.data),
                };

                let reply = KeyOp {
                    vhost: msg.vhost,
                    data: data.unwrap_or_default(),
                };
                ipc::send_msg(sock, cmd, Some(&reply), None)?;
            }
            Command::SecmReload => {
                self.reload();
                ipc::send_empty(sock, Command::SecmReloadReply)?;
            }
            Command::SecmListCookies => {
                let reply = self.list_cookies();
                ipc::send_msg(sock, Command::SecmListCookiesReply, Some(&reply), None)?;
            }
            Command::Terminate => {
                log::info!("sec-mod: terminate received");
                return Ok(false);
            }
            _ => {
                return Err(anyhow!("sec-mod: unexpected command '{}'", cmd));
            }
        }

        Ok(true)
    }

    fn auth_init(&mut self, msg: SecAuthInit) -> SecAuthReply {
        let now = unix_now();
        let vhost_name = if msg.vhost.is_empty() {
            DEFAULT_VHOST
        } else {
            &msg.vhost
        };

        let vhost = self.config.vhost_params(vhost_name);
        let entry = match self
            .db
            .create(vhost, &msg.remote_ip, msg.worker_pid, now)
        {
            Ok(entry) => entry,
            Err(error) => {
                log::error!("failed creating a session entry: {}", error);
                return SecAuthReply {
                    rc: AuthRc::Failed,
                    sid: None,
                    msg: None,
                };
            }
        };

        entry.acct.username = msg.username;
        entry.acct.user_agent = msg.user_agent;

        log::info!(
            "auth init for user '{}' from {} session={}",
            entry.acct.username,
            entry.acct.remote_ip,
            entry.acct.safe_id
        );

        SecAuthReply {
            rc: AuthRc::Continue,
            sid: Some(entry.sid),
            msg: Some(PASSWORD_PROMPT.to_string()),
        }
    }

    fn auth_cont(&mut self, msg: SecAuthCont) -> (SecAuthReply, Option<BanIp>) {
        let now = unix_now();
        let points = self.config.ban.ban_points_wrong_password;

        let Some(entry) = self.db.find_mut(&msg.sid) else {
            log::warn!("auth cont with an unknown session identifier");
            return (
                SecAuthReply {
                    rc: AuthRc::Failed,
                    sid: None,
                    msg: None,
                },
                None,
            );
        };

        if !matches!(entry.state, AuthState::Init | AuthState::Cont) {
            log::warn!(
                "auth cont in state '{}' session={}",
                entry.state,
                entry.acct.safe_id
            );
            return (
                SecAuthReply {
                    rc: AuthRc::Failed,
                    sid: None,
                    msg: None,
                },
                None,
            );
        }

        entry.state = AuthState::Cont;
        entry.attempts += 1;
        entry.last_modified = now;

        let expected = self
            .auth
            .password(&entry.vhost.name, &entry.acct.username);

        if expected.as_deref() == Some(msg.password.as_str()) {
            entry.state = AuthState::Completed;
            entry.method_index += 1;
            entry.msg = entry.vhost.motd.clone();

            log::info!(
                "user '{}' authenticated session={}",
                entry.acct.username,
                entry.acct.safe_id
            );

            return (
                SecAuthReply {
                    rc: AuthRc::Ok,
                    sid: Some(entry.sid),
                    msg: entry.msg.clone(),
                },
                None,
            );
        }

        if entry.attempts >= MAX_AUTH_ATTEMPTS {
            entry.state = AuthState::Failed;

            log::info!(
                "authentication failed for user '{}' session={}",
                entry.acct.username,
                entry.acct.safe_id
            );

            let ban = entry
                .acct
                .remote_ip
                .parse::<IpAddr>()
                .ok()
                .map(|ip| BanIp { ip, score: points });

            return (
                SecAuthReply {
                    rc: AuthRc::Failed,
                    sid: None,
                    msg: None,
                },
                ban,
            );
        }

        (
            SecAuthReply {
                rc: AuthRc::Continue,
                sid: Some(entry.sid),
                msg: Some(PASSWORD_PROMPT.to_string()),
            },
            None,
        )
    }

    fn session_open(&mut self, msg: SessionOpen) -> SessionReply {
        let now = unix_now();

        let Some(entry) = self.db.open(&msg.sid, now) else {
            log::info!("cookie rejected: unknown, expired or not authenticated");
            return SessionReply {
                status: ReplyStatus::Failed,
                username: String::new(),
                vhost: String::new(),
                motd: None,
            };
        };

        log::info!(
            "session opened for user '{}' session={} (in use: {})",
            entry.acct.username,
            entry.acct.safe_id,
            entry.in_use
        );

        let reply = SessionReply {
            status: ReplyStatus::Ok,
            username: entry.acct.username.clone(),
            vhost: entry.vhost.name.clone(),
            motd: entry.msg.clone(),
        };

        if entry.in_use == 1 {
            let acct = entry.acct.clone();
            self.acct.open_session(&acct);
        }

        reply
    }

    fn session_close(&mut self, msg: SessionClose) -> SessionReply {
        let now = unix_now();

        let acct = match self.db.find_mut(&msg.sid) {
            Some(entry) => {
                // Record the addresses for the accounting stop event.
                entry.acct.ipv4 = msg.ipv4.map(|lease| lease.remote.to_string());
                entry.acct.ipv6 = msg.ipv6.map(|lease| lease.remote.to_string());
                entry.acct.our_ip = msg
                    .ipv4
                    .map(|lease| lease.local.to_string())
                    .or_else(|| msg.ipv6.map(|lease| lease.local.to_string()));

                entry.acct.clone()
            }
            None => {
                log::warn!("session close for an unknown session identifier");
                return SessionReply {
                    status: ReplyStatus::Failed,
                    username: String::new(),
                    vhost: String::new(),
                    motd: None,
                };
            }
        };

        let outcome = self.db.expire(&msg.sid, msg.reason, now);
        if !matches!(outcome, ExpireOutcome::StillInUse) {
            self.acct.close_session(&acct, &msg.stats, msg.reason);
        }

        SessionReply {
            status: ReplyStatus::Ok,
            username: acct.username,
            vhost: String::new(),
            motd: None,
        }
    }

    fn list_cookies(&self) -> ListCookiesReply {
        ListCookiesReply {
            cookies: self
                .db
                .iter()
                .map(|entry| CookieEntry {
                    safe_id: entry.acct.safe_id.clone(),
                    username: entry.acct.username.clone(),
                    vhost: entry.vhost.name.clone(),
                    state: entry.state,
                    remote_ip: entry.acct.remote_ip.clone(),
                    in_use: entry.in_use,
                    expires: entry.exptime,
                })
                .collect(),
        }
    }

    fn reload(&mut self) {
        let Some(source) = self.config.source.clone() else {
            log::warn!("reload requested but the config has no backing file");
            return;
        };

        match std::fs::read_to_string(&source)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(toml::from_str::<Config>(&raw)?))
        {
            Ok(mut config) => match config.validate() {
                Ok(()) => {
                    config.source = Some(source);
                    self.config = Arc::new(config);
                    log::info!("sec-mod: configuration reloaded");
                }
                Err(error) => log::error!("reload rejected: {}", error),
            },
            Err(error) => log::error!("reload failed: {}", error),
        }
    }

    fn maintenance(&mut self) {
        let removed = self.db.reap(unix_now());
        if !removed.is_empty() {
            log::info!("reaped {} expired sessions", removed.len());
        }
    }
}
