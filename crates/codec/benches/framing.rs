use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use vpn_server_codec::{
    Command, decode_header, encode_header,
    message::{AuthCookieRep, Lease4, ReplyStatus, Sid},
    pack, unpack,
};

fn criterion_benchmark(c: &mut Criterion) {
    let rep = AuthCookieRep {
        status: ReplyStatus::Ok,
        username: "alice".to_string(),
        vhost: "default".to_string(),
        tun_name: "vpns0".to_string(),
        ipv4: Some(Lease4 {
            local: "10.200.0.1".parse().unwrap(),
            remote: "10.200.0.2".parse().unwrap(),
            prefix: 24,
        }),
        ipv6: None,
        mtu: 1420,
        motd: None,
    };

    let body = pack(&rep).unwrap();
    let hdr = encode_header(Command::AuthCookieRep, body.len() as u32);

    let mut framing_criterion = c.benchmark_group("framing");

    framing_criterion.throughput(Throughput::Elements(1));
    framing_criterion.bench_function("encode_auth_cookie_rep", |bencher| {
        bencher.iter(|| {
            let body = pack(&rep).unwrap();
            encode_header(Command::AuthCookieRep, body.len() as u32);
        })
    });

    framing_criterion.bench_function("decode_auth_cookie_rep", |bencher| {
        bencher.iter(|| {
            decode_header(&hdr).unwrap();
            unpack::<AuthCookieRep>(&body).unwrap();
        })
    });

    framing_criterion.finish();

    let sid = Sid([0u8; 16]);
    let mut safeid_criterion = c.benchmark_group("safeid");

    safeid_criterion.throughput(Throughput::Elements(1));
    safeid_criterion.bench_function("calc_safe_id", |bencher| {
        bencher.iter(|| sid.safe_id())
    });

    safeid_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
