//! The session database owned by the security module.
//!
//! Sessions are keyed by a random 16-byte identifier that doubles as the
//! client's cookie. An entry outlives the workers bound to it: when the last
//! worker disconnects the entry usually stays dormant so the client can
//! resume with its cookie, and a periodic reap removes entries whose expiry
//! passed while dormant.

use std::{collections::hash_map::Entry, sync::Arc};

use ahash::{HashMap, HashMapExt};
use rand::Rng;

use codec::message::{AuthState, DisconnectReason, SID_SIZE, Sid};

/// Grace added on top of every expiry computation. Covers clients that
/// disconnect and immediately reconnect during roaming.
pub const AUTH_SLACK_TIME: u64 = 20;

/// How many times a colliding identifier is redrawn before giving up.
pub const SID_RETRIES: usize = 4;

/// How many wrong credentials a session may present before it fails.
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// The slice of virtual-host configuration the session database needs.
/// Entries hold a shared handle to the vhost they were created under.
#[derive(Debug, Clone)]
pub struct VhostParams {
    pub name: String,
    /// How long a dormant session stays resumable, in seconds.
    pub cookie_timeout: u64,
    /// When unset, server-initiated disconnects destroy the session
    /// immediately instead of leaving it dormant.
    pub persistent_cookies: bool,
    pub motd: Option<String>,
}

/// Accounting identity of a session. Everything here may appear in logs
/// and accounting records; that is why it carries the safe id and not the
/// session identifier.
#[derive(Debug, Clone)]
pub struct AcctInfo {
    pub safe_id: String,
    pub username: String,
    pub remote_ip: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub our_ip: Option<String>,
    pub user_agent: String,
    pub worker_pid: u32,
}

#[derive(Debug)]
pub struct ClientEntry {
    pub sid: Sid,
    pub acct: AcctInfo,
    pub state: AuthState,
    /// Position in the vhost's authentication method chain.
    pub method_index: usize,
    pub attempts: u32,
    pub created: u64,
    /// Absolute expiry. Never decreases while `in_use > 0`.
    pub exptime: u64,
    pub last_modified: u64,
    /// Number of workers currently bound to this session; 0 means dormant.
    pub in_use: u32,
    pub discon_reason: DisconnectReason,
    pub vhost: Arc<VhostParams>,
    pub msg: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    /// The generator kept hitting live identifiers.
    RngCollision,
    /// A fixed identifier is already present.
    InsertCollision,
}

impl std::error::Error for SessionError {}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What `expire` did with the entry once its worker count dropped.
#[derive(Debug)]
pub enum ExpireOutcome {
    NotFound,
    /// Other workers still hold the session.
    StillInUse,
    /// Dormant and resumable until `exptime`.
    Dormant,
    /// Destroyed; the entry is handed back for accounting.
    Deleted(ClientEntry),
}

/// Session database: identifier to entry, O(1) lookup.
///
/// All time-dependent operations take `now` (UNIX seconds) explicitly; the
/// security module passes wall time, tests pass literals.
///
/// # Test
///
/// ```
/// use std::sync::Arc;
/// use vpn_server_service::session::*;
///
/// let vhost = Arc::new(VhostParams {
///     name: "default".to_string(),
///     cookie_timeout: 300,
///     persistent_cookies: true,
///     motd: None,
/// });
///
/// let mut db = SessionDb::default();
///
/// let sid = db.create(vhost, "192.0.2.1", 1000, 100).unwrap().sid;
///
/// assert!(db.find(&sid).is_some());
/// assert_eq!(db.find(&sid).unwrap().exptime, 100 + 300 + AUTH_SLACK_TIME);
/// assert_eq!(db.len(), 1);
/// ```
#[derive(Default)]
pub struct SessionDb {
    entries: HashMap<Sid, ClientEntry>,
}

impl SessionDb {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(1024),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create an entry under a fresh random identifier.
    ///
    /// The identifier is drawn from the OS-seeded CSPRNG and checked for
    /// uniqueness against the live set; after [`SID_RETRIES`] redraws the
    /// call fails rather than loop forever on a broken generator.
    pub fn create(
        &mut self,
        vhost: Arc<VhostParams>,
        remote_ip: &str,
        worker_pid: u32,
        now: u64,
    ) -> Result<&mut ClientEntry, SessionError> {
        let mut sid = make_sid();
        let mut retries = SID_RETRIES;

        while self.entries.contains_key(&sid) {
            if retries == 0 {
                log::error!("could not generate a unique session identifier");
                return Err(SessionError::RngCollision);
            }

            retries -= 1;
            sid = make_sid();
        }

        self.insert(sid, vhost, remote_ip, worker_pid, now)
    }

    /// Create an entry under a caller-chosen identifier. Used when state is
    /// restored deterministically and by tests that need a pinned cookie.
    pub fn create_with_sid(
        &mut self,
        sid: Sid,
        vhost: Arc<VhostParams>,
        remote_ip: &str,
        worker_pid: u32,
        now: u64,
    ) -> Result<&mut ClientEntry, SessionError> {
        self.insert(sid, vhost, remote_ip, worker_pid, now)
    }

    fn insert(
        &mut self,
        sid: Sid,
        vhost: Arc<VhostParams>,
        remote_ip: &str,
        worker_pid: u32,
        now: u64,
    ) -> Result<&mut ClientEntry, SessionError> {
        let exptime = now + vhost.cookie_timeout + AUTH_SLACK_TIME;

        match self.entries.entry(sid) {
            Entry::Occupied(_) => Err(SessionError::InsertCollision),
            Entry::Vacant(vacant) => Ok(vacant.insert(ClientEntry {
                sid,
                acct: AcctInfo {
                    safe_id: sid.safe_id(),
                    username: String::new(),
                    remote_ip: remote_ip.to_string(),
                    ipv4: None,
                    ipv6: None,
                    our_ip: None,
                    user_agent: String::new(),
                    worker_pid,
                },
                state: AuthState::Init,
                method_index: 0,
                attempts: 0,
                created: now,
                exptime,
                last_modified: now,
                in_use: 0,
                discon_reason: DisconnectReason::Unspecified,
                vhost,
                msg: None,
            })),
        }
    }

    pub fn find(&self, sid: &Sid) -> Option<&ClientEntry> {
        self.entries.get(sid)
    }

    pub fn find_mut(&mut self, sid: &Sid) -> Option<&mut ClientEntry> {
        self.entries.get_mut(sid)
    }

    /// Unlink and return an entry. Callers tear down any per-user auth
    /// state before dropping the returned value.
    pub fn delete(&mut self, sid: &Sid) -> Option<ClientEntry> {
        self.entries.remove(sid)
    }

    /// Bind one more worker to a completed session.
    ///
    /// Fails when the identifier is unknown, authentication never
    /// completed, or the entry already expired. Expiry never moves
    /// backwards here, which keeps it monotone while the session is bound.
    pub fn open(&mut self, sid: &Sid, now: u64) -> Option<&mut ClientEntry> {
        let entry = self.entries.get_mut(sid)?;
        if entry.state != AuthState::Completed || now >= entry.exptime {
            return None;
        }

        entry.in_use += 1;
        entry.exptime = entry
            .exptime
            .max(now + entry.vhost.cookie_timeout + AUTH_SLACK_TIME);
        entry.last_modified = now;

        Some(entry)
    }

    /// Drop one worker binding and apply the dormancy policy when the count
    /// reaches zero:
    ///
    /// 1. without persistent cookies, server-initiated and session-timeout
    ///    disconnects destroy the entry immediately;
    /// 2. a user disconnect keeps the entry only briefly, since some
    ///    clients disconnect with the intention to reconnect seconds later;
    /// 3. anything else leaves the entry dormant for a full cookie lifetime.
    ///
    /// # Test
    ///
    /// ```
    /// use std::sync::Arc;
    /// use codec::message::{AuthState, DisconnectReason};
    /// use vpn_server_service::session::*;
    ///
    /// let vhost = Arc::new(VhostParams {
    ///     name: "default".to_string(),
    ///     cookie_timeout: 300,
    ///     persistent_cookies: false,
    ///     motd: None,
    /// });
    ///
    /// let mut db = SessionDb::default();
    /// let sid = {
    ///     let entry = db.create(vhost, "192.0.2.1", 1000, 100).unwrap();
    ///     entry.state = AuthState::Completed;
    ///     entry.sid
    /// };
    ///
    /// db.open(&sid, 110).unwrap();
    ///
    /// // A server disconnect without persistent cookies removes the entry.
    /// let outcome = db.expire(&sid, DisconnectReason::ServerDisconnect, 120);
    /// assert!(matches!(outcome, ExpireOutcome::Deleted(_)));
    /// assert!(db.find(&sid).is_none());
    /// ```
    pub fn expire(&mut self, sid: &Sid, reason: DisconnectReason, now: u64) -> ExpireOutcome {
        let Some(entry) = self.entries.get_mut(sid) else {
            return ExpireOutcome::NotFound;
        };

        if entry.in_use > 0 {
            entry.in_use -= 1;
        } else {
            log::warn!(
                "expire on unbound session {}",
                entry.acct.safe_id
            );
        }

        entry.discon_reason = reason;
        entry.last_modified = now;

        if entry.in_use > 0 {
            return ExpireOutcome::StillInUse;
        }

        let persistent = entry.vhost.persistent_cookies;
        if !persistent
            && matches!(
                reason,
                DisconnectReason::ServerDisconnect | DisconnectReason::SessionTimeout
            )
        {
            log::info!(
                "invalidating session of user '{}' session={}",
                entry.acct.username,
                entry.acct.safe_id
            );

            return match self.entries.remove(sid) {
                Some(entry) => ExpireOutcome::Deleted(entry),
                None => ExpireOutcome::NotFound,
            };
        }

        if reason == DisconnectReason::UserDisconnect {
            if !persistent || now + AUTH_SLACK_TIME >= entry.exptime {
                entry.exptime = now + AUTH_SLACK_TIME;
            }
        } else {
            entry.exptime = now + entry.vhost.cookie_timeout + AUTH_SLACK_TIME;
        }

        log::info!(
            "temporarily closing session for {} session={}",
            entry.acct.username,
            entry.acct.safe_id
        );

        ExpireOutcome::Dormant
    }

    /// Remove every dormant entry whose expiry has passed, returning the
    /// removed entries for accounting.
    pub fn reap(&mut self, now: u64) -> Vec<ClientEntry> {
        let expired = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.in_use == 0 && now >= entry.exptime)
            .map(|(sid, _)| *sid)
            .collect::<Vec<_>>();

        expired
            .into_iter()
            .filter_map(|sid| self.entries.remove(&sid))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientEntry> {
        self.entries.values()
    }
}

/// Draw a random session identifier from the OS-seeded CSPRNG.
fn make_sid() -> Sid {
    let mut sid = [0u8; SID_SIZE];
    rand::rng().fill(&mut sid);

    Sid(sid)
}
