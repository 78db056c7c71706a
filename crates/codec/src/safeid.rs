use aws_lc_rs::digest;
use base64::{Engine, prelude::BASE64_STANDARD};

/// One-way, log-safe form of an opaque identifier.
///
/// Session identifiers are credentials and must never appear in logs or
/// accounting records; what appears instead is the base64 of a SHA-1 of the
/// identifier. SHA-1 is fine here: the goal is one-wayness of a random
/// 16-byte input, not collision resistance.
///
/// # Test
///
/// ```
/// use vpn_server_codec::safeid::calc_safe_id;
///
/// assert_eq!(calc_safe_id(&[0u8; 16]), "4SnyfFEDvFzES83woV4WDURQZv8=");
/// assert_eq!(calc_safe_id(b"abc"), "qZk+NkcGgWq6PiVxeFDCbJzQ2J0=");
///
/// let mut sid = [0u8; 16];
/// sid[15] = 1;
/// assert_eq!(calc_safe_id(&sid), "iGhckNSsnSS+dZW6I6yQ06Br1HQ=");
/// ```
pub fn calc_safe_id(data: &[u8]) -> String {
    let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data);
    BASE64_STANDARD.encode(digest.as_ref())
}
