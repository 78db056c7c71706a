//! Ban engine owned by the supervisor.
//!
//! Abusive peers accumulate points; crossing the configured threshold bans
//! the address until its expiry. Scoring decays by zeroing: once a full
//! reset window passes without the score being touched, the next record
//! starts from zero again.

use std::net::IpAddr;

use ahash::{HashMap, HashMapExt};

/// Scoring parameters. `max_ban_score == 0` disables the engine entirely.
#[derive(Debug, Clone)]
pub struct BanConfig {
    pub max_ban_score: u32,
    /// Window after which an untouched score resets to zero, in seconds.
    pub ban_reset_time: u64,
    /// How long a ban lasts once imposed, in seconds.
    pub min_reauth_time: u64,
    /// Points added for the mere act of connecting.
    pub ban_points_connect: u32,
    /// Points added for a failed credential attempt.
    pub ban_points_wrong_password: u32,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            max_ban_score: 80,
            ban_reset_time: 1200,
            min_reauth_time: 300,
            ban_points_connect: 1,
            ban_points_wrong_password: 10,
        }
    }
}

/// Normalized ban key. IPv6 sources are collapsed to their /64: a single
/// subscriber usually controls the whole prefix, and tracking individual
/// addresses would let them dodge the score.
///
/// # Test
///
/// ```
/// use vpn_server_service::ban::BanKey;
///
/// let a = BanKey::from_addr("2001:db8::1".parse().unwrap());
/// let b = BanKey::from_addr("2001:db8::ffff:ffff".parse().unwrap());
/// let c = BanKey::from_addr("2001:db9::1".parse().unwrap());
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BanKey {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl BanKey {
    pub fn from_addr(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::V4(v4.octets()),
            IpAddr::V6(v6) => {
                let mut octets = v6.octets();
                octets[8..].fill(0);
                Self::V6(octets)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BanEntry {
    pub score: u32,
    pub last_reset: u64,
    pub expires: u64,
}

/// Address to score, O(1) lookup. Time flows in through `now` (UNIX
/// seconds) on every operation.
pub struct BanDb {
    config: BanConfig,
    entries: HashMap<BanKey, BanEntry>,
}

impl BanDb {
    pub fn new(config: BanConfig) -> Self {
        Self {
            config,
            entries: HashMap::with_capacity(1024),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ip: IpAddr) -> Option<&BanEntry> {
        self.entries.get(&BanKey::from_addr(ip))
    }

    /// Add points against an address; returns whether it is now banned.
    ///
    /// A banned address does not get its expiry pushed further out by more
    /// failed attempts, otherwise a peer that keeps polling the server
    /// would never be unbanned.
    ///
    /// # Test
    ///
    /// ```
    /// use vpn_server_service::ban::{BanConfig, BanDb};
    ///
    /// let mut db = BanDb::new(BanConfig {
    ///     max_ban_score: 100,
    ///     ban_reset_time: 3600,
    ///     min_reauth_time: 300,
    ///     ..BanConfig::default()
    /// });
    ///
    /// let ip = "10.0.0.1".parse().unwrap();
    ///
    /// assert!(!db.record(ip, 40, 0));
    /// assert!(!db.record(ip, 40, 1));
    /// assert!(db.record(ip, 40, 2));
    ///
    /// // Banned at t=2 with the expiry frozen at 2 + 300.
    /// assert_eq!(db.get(ip).unwrap().expires, 302);
    /// assert!(db.record(ip, 40, 50));
    /// assert_eq!(db.get(ip).unwrap().expires, 302);
    /// ```
    pub fn record(&mut self, ip: IpAddr, points: u32, now: u64) -> bool {
        if self.config.max_ban_score == 0 {
            return false;
        }

        let key = BanKey::from_addr(ip);
        let entry = self.entries.entry(key).or_insert(BanEntry {
            score: 0,
            last_reset: now,
            expires: 0,
        });

        // A fresh entry has last_reset == now, so only stale scores reset.
        if now > entry.last_reset + self.config.ban_reset_time {
            entry.score = 0;
            entry.last_reset = now;
        }

        if entry.score < self.config.max_ban_score {
            entry.expires = now + self.config.min_reauth_time;
        }

        entry.score += points;

        if entry.score >= self.config.max_ban_score {
            log::info!(
                "added IP '{}' (with score {}) to ban list, will be reset at {}",
                ip,
                entry.score,
                entry.expires
            );
            true
        } else {
            log::debug!(
                "added {} points (total {}) for IP '{}' to ban list",
                points,
                entry.score,
                ip
            );
            false
        }
    }

    /// Lift a ban: the entry survives with a zeroed score and expiry.
    pub fn unban(&mut self, ip: IpAddr) -> bool {
        let key = BanKey::from_addr(ip);
        match self.entries.get_mut(&key) {
            Some(entry) => {
                log::info!("unbanning IP '{}'", ip);
                entry.score = 0;
                entry.expires = 0;
                true
            }
            None => false,
        }
    }

    /// Admission gate for a new connection: charges the connect points,
    /// then rejects when the address is inside a live ban.
    ///
    /// # Test
    ///
    /// ```
    /// use vpn_server_service::ban::{BanConfig, BanDb};
    ///
    /// let mut db = BanDb::new(BanConfig {
    ///     max_ban_score: 100,
    ///     ..BanConfig::default()
    /// });
    ///
    /// let ip = "192.0.2.7".parse().unwrap();
    ///
    /// assert!(!db.check(ip, 0));
    /// db.record(ip, 100, 0);
    /// assert!(db.check(ip, 1));
    /// ```
    pub fn check(&mut self, ip: IpAddr, now: u64) -> bool {
        if self.config.max_ban_score == 0 {
            return false;
        }

        self.record(ip, self.config.ban_points_connect, now);

        if let Some(entry) = self.entries.get(&BanKey::from_addr(ip)) {
            if now > entry.expires {
                return false;
            }

            if entry.score >= self.config.max_ban_score {
                log::info!("rejected connection from banned IP: {}", ip);
                return true;
            }
        }

        false
    }

    /// Drop entries whose ban lifted and whose reset window passed.
    pub fn reap(&mut self, now: u64) {
        let reset_time = self.config.ban_reset_time;
        self.entries
            .retain(|_, entry| !(now >= entry.expires && now > entry.last_reset + reset_time));
    }

    pub fn config(&self) -> &BanConfig {
        &self.config
    }
}
