//! Prefix and netmask conversions used by config parsing (pool networks
//! are accepted in either spelling) and the platform address plumbing.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Netmask of an IPv4 prefix length.
///
/// # Test
///
/// ```
/// use vpn_server_service::ip_util::ipv4_prefix_to_mask;
///
/// assert_eq!(ipv4_prefix_to_mask(32).unwrap().to_string(), "255.255.255.255");
/// assert_eq!(ipv4_prefix_to_mask(24).unwrap().to_string(), "255.255.255.0");
/// assert_eq!(ipv4_prefix_to_mask(0).unwrap().to_string(), "0.0.0.0");
/// assert!(ipv4_prefix_to_mask(33).is_none());
/// ```
pub fn ipv4_prefix_to_mask(prefix: u8) -> Option<Ipv4Addr> {
    if prefix > 32 {
        return None;
    }

    Some(Ipv4Addr::from(match prefix {
        0 => 0,
        _ => u32::MAX << (32 - prefix as u32),
    }))
}

/// Prefix length of a contiguous IPv4 netmask.
pub fn ipv4_mask_to_prefix(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    if bits.leading_ones() + bits.trailing_zeros() != 32 {
        return None;
    }

    Some(bits.leading_ones() as u8)
}

/// Netmask of an IPv6 prefix length.
pub fn ipv6_prefix_to_mask(prefix: u8) -> Option<Ipv6Addr> {
    if prefix > 128 {
        return None;
    }

    Some(Ipv6Addr::from(match prefix {
        0 => 0,
        _ => u128::MAX << (128 - prefix as u32),
    }))
}

/// Rewrite a `network/netmask` route into `network/prefix` form. Routes
/// already in prefix form pass through unchanged.
///
/// # Test
///
/// ```
/// use vpn_server_service::ip_util::ipv4_route_to_cidr;
///
/// assert_eq!(
///     ipv4_route_to_cidr("192.168.5.0/255.255.255.0").unwrap(),
///     "192.168.5.0/24"
/// );
/// assert_eq!(ipv4_route_to_cidr("10.0.0.0/8").unwrap(), "10.0.0.0/8");
/// assert!(ipv4_route_to_cidr("10.0.0.0/255.0.255.0").is_none());
/// ```
pub fn ipv4_route_to_cidr(route: &str) -> Option<String> {
    let (network, suffix) = route.split_once('/')?;
    network.parse::<Ipv4Addr>().ok()?;

    let prefix = match suffix.parse::<Ipv4Addr>() {
        Ok(mask) => ipv4_mask_to_prefix(mask)?,
        Err(_) => {
            let prefix = suffix.parse::<u8>().ok()?;
            if prefix > 32 {
                return None;
            }

            prefix
        }
    };

    Some(format!("{}/{}", network, prefix))
}

/// Rewrite a `network/prefix` route into `network/netmask` form, the
/// inverse of [`ipv4_route_to_cidr`]. Routes already in netmask form pass
/// through unchanged.
///
/// # Test
///
/// ```
/// use vpn_server_service::ip_util::ipv4_cidr_to_route;
///
/// assert_eq!(
///     ipv4_cidr_to_route("192.168.5.0/24").unwrap(),
///     "192.168.5.0/255.255.255.0"
/// );
/// assert_eq!(
///     ipv4_cidr_to_route("10.0.0.0/255.0.0.0").unwrap(),
///     "10.0.0.0/255.0.0.0"
/// );
/// assert!(ipv4_cidr_to_route("192.168.5.0/33").is_none());
/// ```
pub fn ipv4_cidr_to_route(cidr: &str) -> Option<String> {
    let (network, suffix) = cidr.split_once('/')?;
    network.parse::<Ipv4Addr>().ok()?;

    let mask = match suffix.parse::<Ipv4Addr>() {
        Ok(mask) => {
            // Reject non-contiguous masks even when passing through.
            ipv4_mask_to_prefix(mask)?;
            mask
        }
        Err(_) => ipv4_prefix_to_mask(suffix.parse::<u8>().ok()?)?,
    };

    Some(format!("{}/{}", network, mask))
}
