//! IP lease allocation for point-to-point tunnels.
//!
//! Each session gets a distinct (local, remote) address pair per family,
//! drawn from the configured pool. The pool is a bucketed bitmap scanned
//! from a random starting point, so assignments are hard to guess while
//! allocation stays O(pool size / 64) in the worst case.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ahash::{HashSet, HashSetExt};
use rand::Rng;

use codec::message::{Lease4, Lease6};

/// Hard cap on tracked addresses per family. A /64 pool does not need
/// sixteen quintillion bitmap bits; allocation simply never reaches past
/// this many hosts above the network base.
pub const MAX_POOL_ADDRS: usize = 65536;

#[derive(Debug, PartialEq, Eq)]
pub enum LeaseError {
    BadNetwork,
    Exhausted,
}

impl std::error::Error for LeaseError {}

impl std::fmt::Display for LeaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of claiming a specific address from a pool.
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// The address was free and is now marked in-use.
    Claimed,
    /// The address is reserved or already leased.
    Conflict,
    /// The address is not covered by this pool; nothing to track.
    Outside,
}

/// One address lease of a session. `remote_tracked` is false only for
/// statically configured addresses outside the pool, which the pool never
/// accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpLease {
    pub local: IpAddr,
    pub remote: IpAddr,
    pub prefix: u8,
    pub remote_tracked: bool,
}

impl IpLease {
    pub fn as_lease4(&self) -> Option<Lease4> {
        match (self.local, self.remote) {
            (IpAddr::V4(local), IpAddr::V4(remote)) => Some(Lease4 {
                local,
                remote,
                prefix: self.prefix,
            }),
            _ => None,
        }
    }

    pub fn as_lease6(&self) -> Option<Lease6> {
        match (self.local, self.remote) {
            (IpAddr::V6(local), IpAddr::V6(remote)) => Some(Lease6 {
                local,
                remote,
                prefix: self.prefix,
            }),
            _ => None,
        }
    }
}

/// Assignable address pool for one family.
///
/// A bit marks an address as taken; free addresses are found by scanning
/// for the first low bit from a random bucket onwards. The network
/// address, the broadcast address (IPv4) and any caller-listed addresses
/// (server tunnel endpoints, DNS) are pre-marked and can never be leased
/// or restored.
///
/// # Test
///
/// ```
/// use vpn_server_service::lease::AddrPool;
///
/// let mut pool = AddrPool::new("10.200.0.0".parse().unwrap(), 24, &[]).unwrap();
///
/// // .0 is the network address, so deterministic scans start at .1.
/// assert_eq!(pool.alloc(Some(0)).unwrap().to_string(), "10.200.0.1");
/// assert_eq!(pool.alloc(Some(0)).unwrap().to_string(), "10.200.0.2");
/// assert_eq!(pool.allocated(), 2);
///
/// pool.restore("10.200.0.1".parse().unwrap());
/// assert_eq!(pool.alloc(Some(0)).unwrap().to_string(), "10.200.0.1");
/// ```
pub struct AddrPool {
    network: u128,
    prefix: u8,
    is_v6: bool,
    size: usize,
    buckets: Vec<u64>,
    reserved: HashSet<usize>,
    allocated: usize,
}

impl AddrPool {
    pub fn new(network: IpAddr, prefix: u8, reserved: &[IpAddr]) -> Result<Self, LeaseError> {
        let is_v6 = network.is_ipv6();
        let addr_bits: u32 = if is_v6 { 128 } else { 32 };
        if prefix as u32 > addr_bits - 2 {
            return Err(LeaseError::BadNetwork);
        }

        let host_bits = addr_bits - prefix as u32;
        let host_count = if host_bits as usize >= usize::BITS as usize {
            MAX_POOL_ADDRS
        } else {
            (1usize << host_bits).min(MAX_POOL_ADDRS)
        };

        // Host bits in the configured address are ignored.
        let base = addr_to_bits(network) >> host_bits << host_bits;

        let mut pool = Self {
            network: base,
            prefix,
            is_v6,
            size: host_count,
            buckets: vec![0; host_count.div_ceil(64)],
            reserved: HashSet::with_capacity(reserved.len() + 2),
            allocated: 0,
        };

        pool.reserve(0);
        if !is_v6 && host_count == 1usize << host_bits {
            pool.reserve(host_count - 1);
        }

        for addr in reserved {
            if let Some(position) = pool.position_of(*addr) {
                pool.reserve(position);
            }
        }

        Ok(pool)
    }

    fn reserve(&mut self, position: usize) {
        if self.reserved.insert(position) {
            self.set_bit(position, true);
        }
    }

    fn set_bit(&mut self, position: usize, high: bool) {
        let mask = 1u64 << (63 - position % 64);
        let bucket = &mut self.buckets[position / 64];
        if high {
            *bucket |= mask;
        } else {
            *bucket &= !mask;
        }
    }

    fn bit(&self, position: usize) -> bool {
        self.buckets[position / 64] & (1u64 << (63 - position % 64)) != 0
    }

    /// Addresses this pool can hand out.
    pub fn capacity(&self) -> usize {
        self.size - self.reserved.len()
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Bitmap position of an address, when the pool covers it.
    fn position_of(&self, addr: IpAddr) -> Option<usize> {
        if addr.is_ipv6() != self.is_v6 {
            return None;
        }

        let offset = addr_to_bits(addr).checked_sub(self.network)?;
        if offset >= self.size as u128 {
            return None;
        }

        Some(offset as usize)
    }

    fn addr_at(&self, position: usize) -> IpAddr {
        let bits = self.network + position as u128;
        if self.is_v6 {
            IpAddr::V6(Ipv6Addr::from(bits))
        } else {
            IpAddr::V4(Ipv4Addr::from(bits as u32))
        }
    }

    /// Lease a free address, scanning from the given bucket or a random
    /// one. Returns `None` when the pool is exhausted.
    pub fn alloc(&mut self, start: Option<usize>) -> Option<IpAddr> {
        let buckets = self.buckets.len();
        let start = start.unwrap_or_else(|| rand::rng().random_range(0..buckets));

        for step in 0..buckets {
            let offset = (start + step) % buckets;
            let bucket = self.buckets[offset];
            if bucket == u64::MAX {
                continue;
            }

            // First low bit from the top; everything above it is taken.
            let position = offset * 64 + bucket.leading_ones() as usize;
            if position >= self.size {
                continue;
            }

            self.set_bit(position, true);
            self.allocated += 1;
            return Some(self.addr_at(position));
        }

        None
    }

    /// Lease a distinct (local, remote) pair.
    pub fn alloc_pair(&mut self) -> Option<(IpAddr, IpAddr)> {
        let local = self.alloc(None)?;
        match self.alloc(None) {
            Some(remote) => Some((local, remote)),
            None => {
                self.restore(local);
                None
            }
        }
    }

    /// Mark a caller-chosen address as leased.
    ///
    /// # Test
    ///
    /// ```
    /// use vpn_server_service::lease::{AddrPool, Claim};
    ///
    /// let dns = "10.200.0.53".parse().unwrap();
    /// let mut pool = AddrPool::new("10.200.0.0".parse().unwrap(), 24, &[dns]).unwrap();
    ///
    /// assert_eq!(pool.claim("10.200.0.9".parse().unwrap()), Claim::Claimed);
    /// assert_eq!(pool.claim("10.200.0.9".parse().unwrap()), Claim::Conflict);
    /// assert_eq!(pool.claim(dns), Claim::Conflict);
    /// assert_eq!(pool.claim("172.16.0.1".parse().unwrap()), Claim::Outside);
    /// ```
    pub fn claim(&mut self, addr: IpAddr) -> Claim {
        let Some(position) = self.position_of(addr) else {
            return Claim::Outside;
        };

        if self.reserved.contains(&position) || self.bit(position) {
            return Claim::Conflict;
        }

        self.set_bit(position, true);
        self.allocated += 1;
        Claim::Claimed
    }

    /// Return a leased address to the pool. Reserved addresses and
    /// addresses outside the pool are ignored.
    pub fn restore(&mut self, addr: IpAddr) {
        let Some(position) = self.position_of(addr) else {
            return;
        };

        if self.reserved.contains(&position) || !self.bit(position) {
            return;
        }

        self.set_bit(position, false);
        self.allocated -= 1;
    }
}

/// The per-family pools of one virtual host.
pub struct LeasePools {
    pub v4: Option<AddrPool>,
    pub v6: Option<AddrPool>,
}

impl LeasePools {
    /// Lease addresses for a new session, one pair per configured family.
    ///
    /// A statically configured address bypasses the pool but still
    /// conflict-checks against it; on conflict the pool takes over and the
    /// static assignment is dropped with a warning. Failure of one family
    /// is tolerated as long as the other provides addresses; failure of
    /// both refuses the session.
    pub fn get_ip_leases(
        &mut self,
        static_v4: Option<Ipv4Addr>,
        static_v6: Option<Ipv6Addr>,
    ) -> Result<(Option<IpLease>, Option<IpLease>), LeaseError> {
        let v4 = match &mut self.v4 {
            Some(pool) => lease_from(pool, static_v4.map(IpAddr::V4)),
            None => None,
        };

        let v6 = match &mut self.v6 {
            Some(pool) => lease_from(pool, static_v6.map(IpAddr::V6)),
            None => None,
        };

        if v4.is_none() && v6.is_none() {
            return Err(LeaseError::Exhausted);
        }

        Ok((v4, v6))
    }

    /// Return a session's addresses to their pool.
    pub fn remove_ip_lease(&mut self, lease: &IpLease) {
        let pool = match (lease.local.is_ipv6(), &mut self.v4, &mut self.v6) {
            (false, Some(pool), _) => pool,
            (true, _, Some(pool)) => pool,
            _ => return,
        };

        pool.restore(lease.local);
        if lease.remote_tracked {
            pool.restore(lease.remote);
        }
    }
}

fn lease_from(pool: &mut AddrPool, static_addr: Option<IpAddr>) -> Option<IpLease> {
    let local = pool.alloc(None)?;

    let (remote, remote_tracked) = match static_addr {
        Some(addr) => match pool.claim(addr) {
            Claim::Claimed => (addr, true),
            Claim::Outside => (addr, false),
            Claim::Conflict => {
                log::warn!(
                    "static address {} conflicts with a leased address, falling back to the pool",
                    addr
                );

                match pool.alloc(None) {
                    Some(addr) => (addr, true),
                    None => {
                        pool.restore(local);
                        return None;
                    }
                }
            }
        },
        None => match pool.alloc(None) {
            Some(addr) => (addr, true),
            None => {
                pool.restore(local);
                return None;
            }
        },
    };

    Some(IpLease {
        local,
        remote,
        prefix: pool.prefix(),
        remote_tracked,
    })
}

fn addr_to_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}
