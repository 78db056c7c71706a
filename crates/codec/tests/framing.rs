use anyhow::Result;
use vpn_server_codec::{
    Command, Error, HEADER_SIZE, MAX_BODY_SIZE, decode_header, encode_header,
    message::{
        AuthCookieRep, AuthCookieReq, CliStats, DisconnectReason, Lease4, Lease6, ReplyStatus,
        SecAuthReply, SessionClose, SessionOpen, Sid, TrafficStats,
    },
    pack, unpack,
};

#[test]
fn header_round_trip_every_command() -> Result<()> {
    for byte in 0u8..=255 {
        let Ok(cmd) = Command::try_from(byte) else {
            continue;
        };

        let hdr = encode_header(cmd, 1234);
        assert_eq!(hdr.len(), HEADER_SIZE);
        assert_eq!(decode_header(&hdr)?, (cmd, 1234));
        assert_eq!(u8::from(cmd), byte);
    }

    Ok(())
}

#[test]
fn header_rejects_oversize_body() {
    let mut hdr = encode_header(Command::SessionInfo, 0);
    hdr[1..].copy_from_slice(&((MAX_BODY_SIZE as u32 + 1).to_le_bytes()));

    assert!(matches!(decode_header(&hdr), Err(Error::Oversize)));
}

#[test]
fn message_round_trips() -> Result<()> {
    let sid = Sid([7u8; 16]);

    let req = AuthCookieReq { sid };
    assert_eq!(unpack::<AuthCookieReq>(&pack(&req)?)?, req);

    let rep = AuthCookieRep {
        status: ReplyStatus::Ok,
        username: "alice".to_string(),
        vhost: "default".to_string(),
        tun_name: "vpns3".to_string(),
        ipv4: Some(Lease4 {
            local: "10.200.0.1".parse()?,
            remote: "10.200.0.2".parse()?,
            prefix: 24,
        }),
        ipv6: Some(Lease6 {
            local: "fda9:4efe:7e3b:3::1".parse()?,
            remote: "fda9:4efe:7e3b:3::2".parse()?,
            prefix: 64,
        }),
        mtu: 1420,
        motd: Some("welcome".to_string()),
    };
    assert_eq!(unpack::<AuthCookieRep>(&pack(&rep)?)?, rep);

    let open = SessionOpen { sid };
    assert_eq!(unpack::<SessionOpen>(&pack(&open)?)?, open);

    let close = SessionClose {
        sid,
        reason: DisconnectReason::IdleTimeout,
        stats: TrafficStats {
            bytes_in: 1 << 40,
            bytes_out: 42,
            uptime: 3600,
        },
        ipv4: rep.ipv4,
        ipv6: None,
    };
    assert_eq!(unpack::<SessionClose>(&pack(&close)?)?, close);

    let stats = CliStats {
        sid,
        stats: close.stats,
        reason: DisconnectReason::UserDisconnect,
    };
    assert_eq!(unpack::<CliStats>(&pack(&stats)?)?, stats);

    Ok(())
}

#[test]
fn empty_body_messages() -> Result<()> {
    // Commands without a payload travel as a bare header; the unit type
    // packs to zero bytes.
    let body = pack(&())?;

    assert!(body.is_empty());
    unpack::<()>(&body)?;

    Ok(())
}

#[test]
fn sid_never_leaks_through_debug() {
    let sid = Sid([0xaa; 16]);
    let rendered = format!("{:?}", sid);

    // The raw bytes (0xaa = 170) must not show up, only the safe form.
    assert!(rendered.starts_with("Sid("));
    assert!(!rendered.contains("170"));
    assert_eq!(rendered, format!("Sid({})", sid.safe_id()));
}

#[test]
fn auth_reply_without_session() -> Result<()> {
    let rep = SecAuthReply {
        rc: vpn_server_codec::message::AuthRc::Failed,
        sid: None,
        msg: None,
    };

    assert_eq!(unpack::<SecAuthReply>(&pack(&rep)?)?, rep);

    Ok(())
}
