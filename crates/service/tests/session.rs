use std::sync::Arc;

use anyhow::Result;
use codec::message::{AuthState, DisconnectReason, Sid};
use vpn_server_service::session::{
    AUTH_SLACK_TIME, ExpireOutcome, SessionDb, SessionError, VhostParams,
};

fn vhost(persistent: bool) -> Arc<VhostParams> {
    Arc::new(VhostParams {
        name: "default".to_string(),
        cookie_timeout: 300,
        persistent_cookies: persistent,
        motd: None,
    })
}

#[test]
fn identifiers_are_unique_and_log_safe() -> Result<()> {
    let mut db = SessionDb::new();
    let mut sids = Vec::with_capacity(64);

    for i in 0..64 {
        let entry = db.create(vhost(true), "192.0.2.1", 1000 + i, 0)?;
        assert_eq!(entry.acct.safe_id, entry.sid.safe_id());
        sids.push(entry.sid);
    }

    sids.sort_by_key(|sid| sid.0);
    sids.dedup();
    assert_eq!(sids.len(), 64);
    assert_eq!(db.len(), 64);

    Ok(())
}

#[test]
fn fixed_identifier_collides_once() -> Result<()> {
    let mut db = SessionDb::new();
    let sid = Sid([1u8; 16]);

    db.create_with_sid(sid, vhost(true), "192.0.2.1", 1, 0)?;

    assert_eq!(
        db.create_with_sid(sid, vhost(true), "192.0.2.1", 2, 0)
            .err(),
        Some(SessionError::InsertCollision)
    );

    Ok(())
}

#[test]
fn cookie_resume_round_trip() -> Result<()> {
    let mut sid = Sid([0u8; 16]);
    sid.0[15] = 1;

    let mut db = SessionDb::new();
    {
        let entry = db.create_with_sid(sid, vhost(false), "192.0.2.9", 77, 1000)?;
        entry.state = AuthState::Completed;
        entry.acct.username = "alice".to_string();
    }

    // The worker presents the cookie: the entry binds and stays bound.
    {
        let entry = db.open(&sid, 1010).unwrap();
        assert_eq!(entry.in_use, 1);
        assert_eq!(entry.acct.username, "alice");
    }

    // A user disconnect makes it dormant with at most the slack grace,
    // since some clients disconnect intending to reconnect right away.
    let outcome = db.expire(&sid, DisconnectReason::UserDisconnect, 1020);
    assert!(matches!(outcome, ExpireOutcome::Dormant));

    let entry = db.find(&sid).unwrap();
    assert_eq!(entry.in_use, 0);
    assert_eq!(entry.exptime, 1020 + AUTH_SLACK_TIME);

    Ok(())
}

#[test]
fn expiry_is_monotone_while_bound() -> Result<()> {
    let sid = Sid([2u8; 16]);
    let mut db = SessionDb::new();

    db.create_with_sid(sid, vhost(true), "192.0.2.1", 1, 0)?
        .state = AuthState::Completed;

    let first = db.open(&sid, 10).unwrap().exptime;
    let second = db.open(&sid, 5).unwrap().exptime;

    assert!(second >= first);
    assert_eq!(db.find(&sid).unwrap().in_use, 2);

    Ok(())
}

#[test]
fn server_disconnect_without_persistent_cookies_destroys() -> Result<()> {
    for reason in [
        DisconnectReason::ServerDisconnect,
        DisconnectReason::SessionTimeout,
    ] {
        let sid = Sid([3u8; 16]);
        let mut db = SessionDb::new();

        db.create_with_sid(sid, vhost(false), "192.0.2.1", 1, 0)?
            .state = AuthState::Completed;
        db.open(&sid, 1).unwrap();

        assert!(matches!(
            db.expire(&sid, reason, 2),
            ExpireOutcome::Deleted(_)
        ));
        assert!(db.find(&sid).is_none());
    }

    Ok(())
}

#[test]
fn other_disconnects_leave_a_full_dormancy_window() -> Result<()> {
    let sid = Sid([4u8; 16]);
    let mut db = SessionDb::new();

    db.create_with_sid(sid, vhost(false), "192.0.2.1", 1, 0)?
        .state = AuthState::Completed;
    db.open(&sid, 100).unwrap();

    assert!(matches!(
        db.expire(&sid, DisconnectReason::IdleTimeout, 200),
        ExpireOutcome::Dormant
    ));
    assert_eq!(
        db.find(&sid).unwrap().exptime,
        200 + 300 + AUTH_SLACK_TIME
    );

    Ok(())
}

#[test]
fn open_rejects_expired_and_unauthenticated_entries() -> Result<()> {
    let sid = Sid([5u8; 16]);
    let mut db = SessionDb::new();

    db.create_with_sid(sid, vhost(true), "192.0.2.1", 1, 0)?;

    // Authentication never completed.
    assert!(db.open(&sid, 1).is_none());

    db.find_mut(&sid).unwrap().state = AuthState::Completed;
    let exptime = db.find(&sid).unwrap().exptime;

    // Past expiry the cookie is dead even though the entry still exists.
    assert!(db.open(&sid, exptime).is_none());
    assert!(db.open(&sid, exptime - 1).is_some());

    Ok(())
}

#[test]
fn reap_removes_expired_dormant_entries_only() -> Result<()> {
    let mut db = SessionDb::new();

    let dormant = Sid([6u8; 16]);
    let bound = Sid([7u8; 16]);

    db.create_with_sid(dormant, vhost(true), "192.0.2.1", 1, 0)?;
    db.create_with_sid(bound, vhost(true), "192.0.2.2", 2, 0)?
        .state = AuthState::Completed;
    db.open(&bound, 1).unwrap();

    let horizon = db.find(&bound).unwrap().exptime + 1;
    let removed = db.reap(horizon);

    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].sid, dormant);
    assert!(db.find(&bound).is_some());

    Ok(())
}
