//! The full supervisor-facing protocol of the security module, driven
//! over a real socket pair: authentication chain, ban notification,
//! cookie bind/unbind, list-cookies and terminate.

use std::{os::unix::net::UnixStream, sync::Arc, thread, time::Duration};

use anyhow::Result;
use codec::{
    Command,
    message::{
        AuthRc, BanIp, BanIpReply, DisconnectReason, Lease4, ListCookiesReply, ReplyStatus,
        SecAuthCont, SecAuthInit, SecAuthReply, SessionClose, SessionOpen, SessionReply, Sid,
        TrafficStats,
    },
};
use vpn_server::{
    config::Config,
    ipc,
    observer::Observer,
    secmod::{SecMod, StaticAuth},
    statistics::Statistics,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_secmod() -> Result<(UnixStream, thread::JoinHandle<Result<()>>)> {
    let config: Config = toml::from_str(
        r#"
        [auth.static-credentials]
        alice = "wonderland"
        "#,
    )?;

    let config = Arc::new(config);
    let secmod = SecMod::new(
        config.clone(),
        StaticAuth::new(&config),
        Observer::new(Statistics::default()),
    );

    let (supervisor, module) = UnixStream::pair()?;
    let handle = thread::spawn(move || secmod.run(module));

    Ok((supervisor, handle))
}

fn auth_init(sock: &UnixStream, username: &str) -> Result<SecAuthReply> {
    let msg = SecAuthInit {
        vhost: String::new(),
        username: username.to_string(),
        remote_ip: "203.0.113.9".to_string(),
        user_agent: "test client".to_string(),
        worker_pid: 1234,
    };

    ipc::send_msg(sock, Command::SecAuthInit, Some(&msg), None)?;
    Ok(ipc::recv_msg::<SecAuthReply>(sock, Command::SecAuthReply, TIMEOUT)?.0)
}

fn auth_cont(sock: &UnixStream, sid: Sid, password: &str) -> Result<SecAuthReply> {
    let msg = SecAuthCont {
        sid,
        password: password.to_string(),
    };

    ipc::send_msg(sock, Command::SecAuthCont, Some(&msg), None)?;
    Ok(ipc::recv_msg::<SecAuthReply>(sock, Command::SecAuthReply, TIMEOUT)?.0)
}

#[test]
fn full_session_lifecycle_over_the_wire() -> Result<()> {
    let (sock, handle) = start_secmod()?;

    // Authenticate with the static credentials.
    let reply = auth_init(&sock, "alice")?;
    assert_eq!(reply.rc, AuthRc::Continue);
    assert!(reply.msg.is_some());
    let sid = reply.sid.expect("init mints a session identifier");

    let reply = auth_cont(&sock, sid, "wonderland")?;
    assert_eq!(reply.rc, AuthRc::Ok);
    assert_eq!(reply.sid, Some(sid));

    // The worker reconnects and presents the cookie.
    ipc::send_msg(
        &sock,
        Command::SecmSessionOpen,
        Some(&SessionOpen { sid }),
        None,
    )?;
    let (reply, _) =
        ipc::recv_msg::<SessionReply>(&sock, Command::SecmSessionReply, TIMEOUT)?;
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.username, "alice");

    // The session shows up in the cookie listing, bound once.
    ipc::send_empty(&sock, Command::SecmListCookies)?;
    let (listing, _) =
        ipc::recv_msg::<ListCookiesReply>(&sock, Command::SecmListCookiesReply, TIMEOUT)?;
    assert_eq!(listing.cookies.len(), 1);
    assert_eq!(listing.cookies[0].username, "alice");
    assert_eq!(listing.cookies[0].in_use, 1);
    assert_eq!(listing.cookies[0].safe_id, sid.safe_id());

    // Worker goes away; the session turns dormant.
    let close = SessionClose {
        sid,
        reason: DisconnectReason::UserDisconnect,
        stats: TrafficStats {
            bytes_in: 1000,
            bytes_out: 2000,
            uptime: 60,
        },
        ipv4: Some(Lease4 {
            local: "10.200.0.1".parse()?,
            remote: "10.200.0.2".parse()?,
            prefix: 24,
        }),
        ipv6: None,
    };

    ipc::send_msg(&sock, Command::SecmSessionClose, Some(&close), None)?;
    let (reply, _) =
        ipc::recv_msg::<SessionReply>(&sock, Command::SecmSessionReply, TIMEOUT)?;
    assert_eq!(reply.status, ReplyStatus::Ok);

    ipc::send_empty(&sock, Command::SecmListCookies)?;
    let (listing, _) =
        ipc::recv_msg::<ListCookiesReply>(&sock, Command::SecmListCookiesReply, TIMEOUT)?;
    assert_eq!(listing.cookies[0].in_use, 0);

    // A dormant session resumes with the same cookie.
    ipc::send_msg(
        &sock,
        Command::SecmSessionOpen,
        Some(&SessionOpen { sid }),
        None,
    )?;
    let (reply, _) =
        ipc::recv_msg::<SessionReply>(&sock, Command::SecmSessionReply, TIMEOUT)?;
    assert_eq!(reply.status, ReplyStatus::Ok);

    ipc::send_empty(&sock, Command::Terminate)?;
    handle.join().unwrap()?;

    Ok(())
}

#[test]
fn failed_authentication_reports_the_offender() -> Result<()> {
    let (sock, handle) = start_secmod()?;

    let reply = auth_init(&sock, "mallory")?;
    let sid = reply.sid.expect("init mints a session identifier");

    // Two wrong answers keep the chain going.
    assert_eq!(auth_cont(&sock, sid, "guess-1")?.rc, AuthRc::Continue);
    assert_eq!(auth_cont(&sock, sid, "guess-2")?.rc, AuthRc::Continue);

    // The third exhausts the attempts: a failure reply, followed by a ban
    // request for the source address.
    assert_eq!(auth_cont(&sock, sid, "guess-3")?.rc, AuthRc::Failed);

    let (ban, _) = ipc::recv_msg::<BanIp>(&sock, Command::SecmBanIp, TIMEOUT)?;
    assert_eq!(ban.ip, "203.0.113.9".parse::<std::net::IpAddr>()?);
    assert!(ban.score > 0);

    ipc::send_msg(
        &sock,
        Command::SecmBanIpReply,
        Some(&BanIpReply { banned: true }),
        None,
    )?;

    // A failed session cannot be bound.
    ipc::send_msg(
        &sock,
        Command::SecmSessionOpen,
        Some(&SessionOpen { sid }),
        None,
    )?;
    let (reply, _) =
        ipc::recv_msg::<SessionReply>(&sock, Command::SecmSessionReply, TIMEOUT)?;
    assert_eq!(reply.status, ReplyStatus::Failed);

    ipc::send_empty(&sock, Command::Terminate)?;
    handle.join().unwrap()?;

    Ok(())
}

#[test]
fn unknown_cookies_are_rejected() -> Result<()> {
    let (sock, handle) = start_secmod()?;

    ipc::send_msg(
        &sock,
        Command::SecmSessionOpen,
        Some(&SessionOpen {
            sid: Sid([0x42; 16]),
        }),
        None,
    )?;

    let (reply, _) =
        ipc::recv_msg::<SessionReply>(&sock, Command::SecmSessionReply, TIMEOUT)?;
    assert_eq!(reply.status, ReplyStatus::Failed);

    ipc::send_empty(&sock, Command::Terminate)?;
    handle.join().unwrap()?;

    Ok(())
}
