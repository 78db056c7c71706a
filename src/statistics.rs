use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-session traffic counters.
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use vpn_server::statistics::*;
    ///
    /// let counts = Counts {
    ///     received_bytes: Count::default(),
    ///     send_bytes: Count::default(),
    ///     received_pkts: Count::default(),
    ///     send_pkts: Count::default(),
    /// };
    ///
    /// counts.add(&Stats::ReceivedBytes(1));
    /// assert_eq!(counts.received_bytes.get(), 1);
    ///
    /// counts.add(&Stats::SendPkts(1));
    /// assert_eq!(counts.send_pkts.get(), 1);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
        }
    }
}

impl Counts<Count> {
    fn new() -> Self {
        Self {
            received_bytes: Count::default(),
            send_bytes: Count::default(),
            received_pkts: Count::default(),
            send_pkts: Count::default(),
        }
    }
}

/// Session traffic statistics, keyed by the session's safe id. The totals
/// survive session teardown; per-session rows come and go with the
/// sessions they track.
#[derive(Clone)]
pub struct Statistics {
    sessions: Arc<RwLock<AHashMap<String, Counts<Count>>>>,
    total: Arc<Counts<Count>>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(AHashMap::with_capacity(1024))),
            total: Arc::new(Counts::new()),
        }
    }
}

impl Statistics {
    /// Add a session to the watch list.
    ///
    /// # Example
    ///
    /// ```
    /// use vpn_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register("safe-id".to_string());
    /// assert_eq!(statistics.get("safe-id").is_some(), true);
    /// ```
    pub fn register(&self, safe_id: String) {
        self.sessions.write().insert(safe_id, Counts::new());
    }

    /// Remove a session from the watch list.
    pub fn unregister(&self, safe_id: &str) {
        self.sessions.write().remove(safe_id);
    }

    /// Report traffic for one session; totals are updated along the way.
    ///
    /// # Example
    ///
    /// ```
    /// use vpn_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register("safe-id".to_string());
    /// statistics.send("safe-id", &[Stats::ReceivedBytes(100)]);
    ///
    /// assert_eq!(statistics.get("safe-id").unwrap().received_bytes, 100);
    /// assert_eq!(statistics.total().received_bytes, 100);
    /// ```
    pub fn send(&self, safe_id: &str, reports: &[Stats]) {
        for report in reports {
            self.total.add(report);
        }

        if let Some(counts) = self.sessions.read().get(safe_id) {
            for report in reports {
                counts.add(report);
            }
        }
    }

    pub fn get(&self, safe_id: &str) -> Option<Counts<usize>> {
        self.sessions.read().get(safe_id).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_bytes: counts.send_bytes.get(),
            send_pkts: counts.send_pkts.get(),
        })
    }

    pub fn total(&self) -> Counts<usize> {
        Counts {
            received_bytes: self.total.received_bytes.get(),
            received_pkts: self.total.received_pkts.get(),
            send_bytes: self.total.send_bytes.get(),
            send_pkts: self.total.send_pkts.get(),
        }
    }
}
