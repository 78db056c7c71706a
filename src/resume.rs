//! TLS session-ticket cache backing the workers' `RESUME_*` commands.
//!
//! Workers store the tickets their TLS stack mints and fetch them back
//! when a client attempts an abbreviated handshake against a different
//! worker. The cache is bounded and entries expire; ticket bytes are
//! wiped when evicted.

use ahash::AHashMap;
use zeroize::Zeroizing;

/// Longest accepted ticket key.
pub const MAX_SESSION_ID_SIZE: usize = 64;

/// Longest accepted ticket payload.
pub const MAX_RESUME_DATA_SIZE: usize = 4096;

/// Hard cap on cached tickets; store requests past it are dropped.
pub const MAX_CACHED_TICKETS: usize = 4096;

struct CachedTicket {
    data: Zeroizing<Vec<u8>>,
    stored_at: u64,
}

pub struct ResumeCache {
    entries: AHashMap<Vec<u8>, CachedTicket>,
    lifetime: u64,
}

impl ResumeCache {
    pub fn new(lifetime: u64) -> Self {
        Self {
            entries: AHashMap::with_capacity(1024),
            lifetime,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache a ticket. Oversize or flood requests are ignored, not errors:
    /// resumption is an optimization and the worker proceeds either way.
    pub fn store(&mut self, session_id: &[u8], data: &[u8], now: u64) {
        if session_id.is_empty()
            || session_id.len() > MAX_SESSION_ID_SIZE
            || data.len() > MAX_RESUME_DATA_SIZE
            || self.entries.len() >= MAX_CACHED_TICKETS
        {
            return;
        }

        self.entries.insert(
            session_id.to_vec(),
            CachedTicket {
                data: Zeroizing::new(data.to_vec()),
                stored_at: now,
            },
        );
    }

    pub fn fetch(&self, session_id: &[u8], now: u64) -> Option<&[u8]> {
        let ticket = self.entries.get(session_id)?;
        if now >= ticket.stored_at + self.lifetime {
            return None;
        }

        Some(&ticket.data)
    }

    pub fn delete(&mut self, session_id: &[u8]) {
        self.entries.remove(session_id);
    }

    /// Drop expired tickets.
    pub fn reap(&mut self, now: u64) {
        let lifetime = self.lifetime;
        self.entries
            .retain(|_, ticket| now < ticket.stored_at + lifetime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_fetch_delete() {
        let mut cache = ResumeCache::new(3600);

        cache.store(b"session", b"ticket", 0);
        assert_eq!(cache.fetch(b"session", 10), Some(b"ticket".as_slice()));
        assert_eq!(cache.fetch(b"other", 10), None);

        cache.delete(b"session");
        assert_eq!(cache.fetch(b"session", 10), None);
    }

    #[test]
    fn tickets_expire() {
        let mut cache = ResumeCache::new(60);

        cache.store(b"session", b"ticket", 0);
        assert!(cache.fetch(b"session", 59).is_some());
        assert!(cache.fetch(b"session", 60).is_none());

        cache.reap(60);
        assert!(cache.is_empty());
    }

    #[test]
    fn oversize_requests_are_ignored() {
        let mut cache = ResumeCache::new(60);

        cache.store(&[0u8; MAX_SESSION_ID_SIZE + 1], b"ticket", 0);
        cache.store(b"session", &vec![0u8; MAX_RESUME_DATA_SIZE + 1], 0);
        cache.store(b"", b"ticket", 0);

        assert!(cache.is_empty());
    }
}
