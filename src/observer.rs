use codec::message::{DisconnectReason, TrafficStats};
use service::{AcctHandler, session::AcctInfo};

use crate::statistics::Statistics;

/// The built-in accounting sink: structured log lines plus the statistics
/// table. A RADIUS integration would replace this with one that talks to
/// its server; the events are the same.
#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl AcctHandler for Observer {
    fn open_session(&self, acct: &AcctInfo) {
        log::info!(
            "session opened: user={:?}, session={}, remote={}, ipv4={:?}, ipv6={:?}",
            acct.username,
            acct.safe_id,
            acct.remote_ip,
            acct.ipv4,
            acct.ipv6,
        );

        self.statistics.register(acct.safe_id.clone());
    }

    fn session_stats(&self, acct: &AcctInfo, stats: &TrafficStats) {
        log::debug!(
            "session interim update: session={}, in={}, out={}, uptime={}",
            acct.safe_id,
            stats.bytes_in,
            stats.bytes_out,
            stats.uptime,
        );
    }

    fn close_session(&self, acct: &AcctInfo, stats: &TrafficStats, reason: DisconnectReason) {
        log::info!(
            "session closed: user={:?}, session={}, reason={}, in={}, out={}, uptime={}",
            acct.username,
            acct.safe_id,
            reason,
            stats.bytes_in,
            stats.bytes_out,
            stats.uptime,
        );

        self.statistics.unregister(&acct.safe_id);
    }
}
