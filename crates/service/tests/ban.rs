use std::net::IpAddr;

use vpn_server_service::ban::{BanConfig, BanDb, BanKey};

fn config() -> BanConfig {
    BanConfig {
        max_ban_score: 100,
        ban_reset_time: 3600,
        min_reauth_time: 300,
        ban_points_connect: 0,
        ban_points_wrong_password: 10,
    }
}

#[test]
fn accumulation_freezes_expiry_once_banned() {
    let mut db = BanDb::new(config());
    let ip: IpAddr = "10.0.0.1".parse().unwrap();

    assert!(!db.record(ip, 40, 100));
    assert!(!db.record(ip, 40, 110));
    assert!(!db.check(ip, 110));
    assert_eq!(db.get(ip).unwrap().score, 80);

    // Third strike crosses the threshold; the expiry set by this call is
    // final.
    assert!(db.record(ip, 40, 110));
    assert!(db.check(ip, 120));
    assert_eq!(db.get(ip).unwrap().expires, 110 + 300);

    // Polling while banned must not push the unban time forward.
    assert!(db.record(ip, 40, 200));
    assert!(db.record(ip, 40, 250));
    assert_eq!(db.get(ip).unwrap().expires, 110 + 300);

    // The ban lifts once the expiry passes.
    assert!(!db.check(ip, 500));
}

#[test]
fn ipv6_sources_collapse_to_their_prefix() {
    let mut db = BanDb::new(config());
    let a: IpAddr = "2001:db8::1".parse().unwrap();
    let b: IpAddr = "2001:db8::ffff:ffff".parse().unwrap();

    assert!(!db.record(a, 60, 0));
    assert!(db.record(b, 60, 0));

    assert_eq!(db.len(), 1);
    assert_eq!(db.get(a).unwrap().score, 120);
    assert_eq!(BanKey::from_addr(a), BanKey::from_addr(b));

    // A different /64 is its own entry.
    let c: IpAddr = "2001:db8:0:1::1".parse().unwrap();
    assert!(!db.record(c, 60, 0));
    assert_eq!(db.len(), 2);
}

#[test]
fn score_resets_after_the_window() {
    let mut db = BanDb::new(config());
    let ip: IpAddr = "10.0.0.2".parse().unwrap();

    assert!(!db.record(ip, 50, 0));
    assert_eq!(db.get(ip).unwrap().score, 50);

    // One second past the reset window the old accumulation is gone.
    assert!(!db.record(ip, 10, 3601));
    let entry = *db.get(ip).unwrap();
    assert_eq!(entry.score, 10);
    assert_eq!(entry.last_reset, 3601);
}

#[test]
fn unban_clears_score_and_expiry() {
    let mut db = BanDb::new(config());
    let ip: IpAddr = "10.0.0.3".parse().unwrap();

    db.record(ip, 200, 0);
    assert!(db.check(ip, 1));

    assert!(db.unban(ip));

    let entry = *db.get(ip).unwrap();
    assert_eq!(entry.score, 0);
    assert_eq!(entry.expires, 0);

    assert!(!db.check(ip, 2));

    assert!(!db.unban("10.9.9.9".parse().unwrap()));
}

#[test]
fn disabled_engine_never_bans() {
    let mut db = BanDb::new(BanConfig {
        max_ban_score: 0,
        ..config()
    });
    let ip: IpAddr = "10.0.0.4".parse().unwrap();

    assert!(!db.record(ip, 1_000_000, 0));
    assert!(!db.check(ip, 0));
    assert!(db.is_empty());
}

#[test]
fn reap_needs_both_windows_to_pass() {
    let mut db = BanDb::new(config());
    let ip: IpAddr = "10.0.0.5".parse().unwrap();

    db.record(ip, 10, 0);

    // Expired ban but live reset window: kept.
    db.reap(1000);
    assert_eq!(db.len(), 1);

    // Both passed: gone.
    db.reap(3601);
    assert!(db.is_empty());
}
