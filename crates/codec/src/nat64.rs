//! NAT64 address embedding.
//!
//! [RFC 6052]: https://tools.ietf.org/html/rfc6052
//!
//! NAT64 gateways translate between IPv6-only and IPv4-only hosts by
//! embedding the IPv4 address in the low 32 bits of an IPv6 address under a
//! designated prefix ([RFC 6052]). A monitored call often shows the same
//! flow under both forms, so stream matching has to treat a NAT64 address
//! and its embedded IPv4 as the same endpoint.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::Direction;

/// Returns true when the address carries one of the recognized NAT64
/// prefixes: `64:ff9b::` (well-known, RFC 6052), `64:ff9b:1::` (local use)
/// or `2001:db8:64::` (documentation).
///
/// # Example
///
/// ```
/// use std::net::IpAddr;
/// use call_monitor_codec::nat64::is_nat64;
///
/// let addr: IpAddr = "64:ff9b::c000:201".parse().unwrap();
/// assert!(is_nat64(&addr));
///
/// let addr: IpAddr = "2001:db8::1".parse().unwrap();
/// assert!(!is_nat64(&addr));
/// ```
pub fn is_nat64(addr: &IpAddr) -> bool {
    let IpAddr::V6(v6) = addr else {
        return false;
    };

    matches_prefix(v6)
}

fn matches_prefix(v6: &Ipv6Addr) -> bool {
    let s = v6.segments();

    // 64:ff9b::/96 and 64:ff9b:1::/96.
    if s[0] == 0x64 && s[1] == 0xff9b && (s[2] == 0 || s[2] == 1) && s[3..6] == [0, 0, 0] {
        return true;
    }

    // 2001:db8:64::/96, the documentation prefix used by lab setups.
    s[0] == 0x2001 && s[1] == 0xdb8 && s[2] == 0x64 && s[3..6] == [0, 0, 0]
}

/// Extracts the IPv4 address embedded in the last 32 bits of a NAT64
/// address. Returns `None` for anything that is not NAT64.
///
/// # Example
///
/// ```
/// use std::net::IpAddr;
/// use call_monitor_codec::nat64::embedded_ipv4;
///
/// let addr: IpAddr = "2001:db8:64::c0a8:101".parse().unwrap();
/// assert_eq!(embedded_ipv4(&addr), Some("192.168.1.1".parse().unwrap()));
/// ```
pub fn embedded_ipv4(addr: &IpAddr) -> Option<Ipv4Addr> {
    let IpAddr::V6(v6) = addr else {
        return None;
    };

    if !matches_prefix(v6) {
        return None;
    }

    let s = v6.segments();
    Some(Ipv4Addr::new(
        (s[6] >> 8) as u8,
        (s[6] & 0xff) as u8,
        (s[7] >> 8) as u8,
        (s[7] & 0xff) as u8,
    ))
}

/// Address equality modulo NAT64 translation.
///
/// Two addresses match when they are equal outright, or when reducing the
/// NAT64 side(s) to the embedded IPv4 makes them equal. The relation is
/// reflexive, symmetric and transitive over the address set, which the
/// stream table relies on.
///
/// # Example
///
/// ```
/// use std::net::IpAddr;
/// use call_monitor_codec::nat64::endpoints_match;
///
/// let translated: IpAddr = "64:ff9b::c0a8:101".parse().unwrap();
/// let plain: IpAddr = "192.168.1.1".parse().unwrap();
///
/// assert!(endpoints_match(&translated, &plain));
/// assert!(endpoints_match(&plain, &translated));
/// ```
pub fn endpoints_match(a: &IpAddr, b: &IpAddr) -> bool {
    if a == b {
        return true;
    }

    let reduced_a = embedded_ipv4(a).map(IpAddr::V4).unwrap_or(*a);
    let reduced_b = embedded_ipv4(b).map(IpAddr::V4).unwrap_or(*b);
    reduced_a == reduced_b
}

/// Classifies a packet's direction from NAT64 inspection of its endpoints.
pub fn direction_hint(src: &IpAddr, dst: &IpAddr) -> Direction {
    match (is_nat64(src), is_nat64(dst)) {
        (true, false) => Direction::Incoming,
        (false, true) => Direction::Outgoing,
        _ => Direction::Unknown,
    }
}
