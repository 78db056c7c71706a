use std::net::IpAddr;

use anyhow::Result;
use vpn_server_service::lease::{AddrPool, LeaseError, LeasePools};

fn pools() -> Result<LeasePools> {
    let dns: IpAddr = "10.200.0.53".parse()?;

    Ok(LeasePools {
        v4: Some(AddrPool::new("10.200.0.0".parse()?, 24, &[dns])?),
        v6: Some(AddrPool::new("fda9:4efe:7e3b:3::".parse()?, 64, &[])?),
    })
}

#[test]
fn leases_are_distinct_pairs_per_family() -> Result<()> {
    let mut pools = pools()?;

    let (v4, v6) = pools.get_ip_leases(None, None)?;
    let v4 = v4.unwrap();
    let v6 = v6.unwrap();

    assert_ne!(v4.local, v4.remote);
    assert_ne!(v6.local, v6.remote);
    assert!(v4.local.is_ipv4() && v4.remote.is_ipv4());
    assert!(v6.local.is_ipv6() && v6.remote.is_ipv6());
    assert_eq!(v4.prefix, 24);
    assert_eq!(v6.prefix, 64);

    Ok(())
}

#[test]
fn release_restores_the_pool_exactly() -> Result<()> {
    let mut pools = pools()?;

    let before_v4 = pools.v4.as_ref().unwrap().allocated();
    let before_v6 = pools.v6.as_ref().unwrap().allocated();

    let (v4, v6) = pools.get_ip_leases(None, None)?;
    assert_eq!(pools.v4.as_ref().unwrap().allocated(), before_v4 + 2);
    assert_eq!(pools.v6.as_ref().unwrap().allocated(), before_v6 + 2);

    pools.remove_ip_lease(&v4.unwrap());
    pools.remove_ip_lease(&v6.unwrap());

    assert_eq!(pools.v4.as_ref().unwrap().allocated(), before_v4);
    assert_eq!(pools.v6.as_ref().unwrap().allocated(), before_v6);

    Ok(())
}

#[test]
fn reserved_addresses_are_never_leased() -> Result<()> {
    let dns: IpAddr = "10.200.0.53".parse()?;
    let mut pool = AddrPool::new("10.200.0.0".parse()?, 24, &[dns])?;

    let mut leased = Vec::new();
    while let Some(addr) = pool.alloc(Some(0)) {
        leased.push(addr);
    }

    // 256 hosts minus network, broadcast and the DNS reservation.
    assert_eq!(leased.len(), 253);
    assert_eq!(pool.capacity(), 253);
    assert!(!leased.contains(&dns));
    assert!(!leased.contains(&"10.200.0.0".parse()?));
    assert!(!leased.contains(&"10.200.0.255".parse()?));

    // Restoring a reserved address must not free it.
    pool.restore(dns);
    assert!(pool.alloc(Some(0)).is_none());

    Ok(())
}

#[test]
fn static_address_bypasses_the_pool_but_conflict_checks() -> Result<()> {
    let mut pools = pools()?;

    let wanted = "10.200.0.77".parse()?;
    let (v4, _) = pools.get_ip_leases(Some(wanted), None)?;
    let v4 = v4.unwrap();

    // Whether the random local draw happened to take the static address or
    // not, it must be in use afterwards, and a granted static assignment is
    // always pool-tracked.
    use vpn_server_service::lease::Claim;
    assert_eq!(
        pools.v4.as_mut().unwrap().claim(IpAddr::V4(wanted)),
        Claim::Conflict
    );
    if v4.remote == IpAddr::V4(wanted) {
        assert!(v4.remote_tracked);
    }

    // An address some other session holds conflicts deterministically and
    // the pool takes over.
    let held = "10.200.0.99".parse()?;
    assert_eq!(pools.v4.as_mut().unwrap().claim(held), Claim::Claimed);

    let (again, _) = pools.get_ip_leases(Some("10.200.0.99".parse()?), None)?;
    let again = again.unwrap();
    assert_ne!(again.remote, held);
    assert!(again.remote_tracked);

    // A static address outside the pool is taken as-is and never tracked.
    let outside = "172.16.1.9".parse()?;
    let (lease, _) = pools.get_ip_leases(Some(outside), None)?;
    let lease = lease.unwrap();
    assert_eq!(lease.remote, IpAddr::V4(outside));
    assert!(!lease.remote_tracked);

    let allocated = pools.v4.as_ref().unwrap().allocated();
    pools.remove_ip_lease(&lease);
    assert_eq!(pools.v4.as_ref().unwrap().allocated(), allocated - 1);

    Ok(())
}

#[test]
fn exhaustion_of_both_families_refuses_the_session() -> Result<()> {
    // A /30 has exactly two usable hosts: one pair, then nothing.
    let mut pools = LeasePools {
        v4: Some(AddrPool::new("10.9.0.0".parse()?, 30, &[])?),
        v6: None,
    };

    let (first, _) = pools.get_ip_leases(None, None)?;
    let first = first.unwrap();

    assert_eq!(pools.get_ip_leases(None, None), Err(LeaseError::Exhausted));

    // After release the pair is allocatable again.
    pools.remove_ip_lease(&first);
    assert!(pools.get_ip_leases(None, None)?.0.is_some());

    Ok(())
}

#[test]
fn one_family_failing_keeps_the_other() -> Result<()> {
    let mut pools = LeasePools {
        v4: Some(AddrPool::new("10.9.0.0".parse()?, 30, &[])?),
        v6: Some(AddrPool::new("fda9:4efe:7e3b:3::".parse()?, 64, &[])?),
    };

    // Drain the tiny IPv4 pool.
    pools.get_ip_leases(None, None)?;

    let (v4, v6) = pools.get_ip_leases(None, None)?;
    assert!(v4.is_none());
    assert!(v6.is_some());

    Ok(())
}
