//! Stateless admission checks: which peers may connect and which programs
//! `oscmd` may run.

use std::net::IpAddr;

/// Normalize IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to plain IPv4
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Check if a remote address may connect.
///
/// An empty allowlist admits everyone. IPv4-mapped IPv6 peers match their
/// IPv4 form, so a dual-stack listener behaves like an IPv4 one.
pub fn remote_address_allowed(addr: IpAddr, allowlist: &[IpAddr]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let addr = canonical(addr);
    allowlist.iter().any(|allowed| canonical(*allowed) == addr)
}

/// Check if a program name is on the `oscmd` whitelist (exact match)
pub fn command_allowed(name: &str, whitelist: &[String]) -> bool {
    whitelist.iter().any(|allowed| allowed == name)
}
