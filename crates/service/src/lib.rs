pub mod ban;
pub mod ip_util;
pub mod lease;
pub mod session;

use codec::message::{DisconnectReason, TrafficStats};

use self::session::AcctInfo;

/// Accounting backend seam.
///
/// The security module reports session lifecycle events through this trait;
/// a RADIUS or external accounting integration implements it, the default
/// deployment just logs. Implementations only ever see the safe id, never
/// the session identifier itself.
pub trait AcctHandler: Send {
    /// A session finished authentication and was bound by its first worker.
    #[allow(unused_variables)]
    fn open_session(&self, acct: &AcctInfo) {}

    /// Interim traffic update for a live session.
    #[allow(unused_variables)]
    fn session_stats(&self, acct: &AcctInfo, stats: &TrafficStats) {}

    /// The session is gone: its last worker disconnected and the entry was
    /// either made dormant or destroyed.
    #[allow(unused_variables)]
    fn close_session(&self, acct: &AcctInfo, stats: &TrafficStats, reason: DisconnectReason) {}
}
