//! Text-form domain name helpers: anchoring, label arithmetic and the
//! reverse-lookup (arpa) forms. Wire-form encoding lives in `packet`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Maximum assembled name length on the wire, per RFC 1035 §2.3.4.
pub const MAX_NAME_LEN: usize = 255;
/// Maximum single label length.
pub const MAX_LABEL_LEN: usize = 63;

/// Append a trailing dot, making the name absolute. Idempotent; the empty
/// name anchors to the root `.`.
pub fn anchor(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Drop the leftmost label of an anchored name. `a.b.c.` becomes `b.c.`,
/// `com.` becomes the root `.`, and the root itself has nothing left to cut.
pub fn cleave(name: &str) -> Option<&str> {
    if name == "." || name.is_empty() {
        return None;
    }
    match name.find('.') {
        Some(dot) if dot + 1 < name.len() => Some(&name[dot + 1..]),
        Some(_) => Some("."),
        None => Some("."),
    }
}

/// Iterate the non-empty labels of a name in order.
pub fn labels(name: &str) -> impl Iterator<Item = &str> {
    name.split('.').filter(|l| !l.is_empty())
}

/// Case-insensitive name equality, ignoring anchoring.
pub fn eq(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Number of interior dots, i.e. dots that separate labels. The anchoring
/// dot does not count.
pub fn ndots(name: &str) -> usize {
    name.trim_end_matches('.').matches('.').count()
}

/// Lowercased anchored form, used as a lookup key.
pub fn key(name: &str) -> String {
    anchor(name).to_ascii_lowercase()
}

/// The reverse-lookup owner name for an address: octets reversed under
/// `in-addr.arpa.` for IPv4, nibbles reversed under `ip6.arpa.` for IPv6.
pub fn arpa(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => arpa_v4(v4),
        IpAddr::V6(v6) => arpa_v6(v6),
    }
}

pub fn arpa_v4(addr: Ipv4Addr) -> String {
    let o = addr.octets();
    format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
}

pub fn arpa_v6(addr: Ipv6Addr) -> String {
    let mut out = String::with_capacity(73);
    for byte in addr.octets().iter().rev() {
        out.push(char::from_digit((byte & 0xF) as u32, 16).unwrap());
        out.push('.');
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap());
        out.push('.');
    }
    out.push_str("ip6.arpa.");
    out
}
