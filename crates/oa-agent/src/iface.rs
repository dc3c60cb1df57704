//! Interface and broadcast-address selection at boot:
//! prefer the interface whose IPv4 lies in `NETWORK_ADDRESS`, otherwise the
//! interface backing the default route; the broadcast address is the
//! selected interface's subnet broadcast, or `255.255.255.255` if it can't
//! be computed.

use std::net::{IpAddr, Ipv4Addr};

/// Parses `a.b.c.d/nn` and returns `(network, broadcast)` for that prefix.
fn cidr_broadcast(cidr: &str) -> Option<(Ipv4Addr, u32, Ipv4Addr)> {
    let (addr, len) = cidr.split_once('/')?;
    let network: Ipv4Addr = addr.parse().ok()?;
    let prefix_len: u32 = len.parse().ok()?;
    if prefix_len > 32 {
        return None;
    }
    let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
    let network_bits = u32::from(network) & mask;
    let broadcast_bits = network_bits | !mask;
    Some((Ipv4Addr::from(network_bits), prefix_len, Ipv4Addr::from(broadcast_bits)))
}

fn in_network(ip: Ipv4Addr, network_cidr: &str) -> bool {
    let Some((network, prefix_len, _)) = cidr_broadcast(network_cidr) else {
        return false;
    };
    let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
    u32::from(ip) & mask == u32::from(network) & mask
}

fn broadcast_for(_ip: Ipv4Addr, addr: &if_addrs::Interface) -> Ipv4Addr {
    if let if_addrs::IfAddr::V4(v4) = &addr.addr {
        if let Some(bcast) = v4.broadcast {
            return bcast;
        }
        let mask = u32::from(v4.netmask);
        let network_bits = u32::from(v4.ip) & mask;
        let broadcast_bits = network_bits | !mask;
        return Ipv4Addr::from(broadcast_bits);
    }
    Ipv4Addr::new(255, 255, 255, 255)
}

/// Picks the network interface this agent binds to. Falls back to the
/// first non-loopback IPv4 interface when no `NETWORK_ADDRESS` is
/// configured or none matches.
pub fn select_interface(network_address: Option<&str>) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let addrs = if_addrs::get_if_addrs().ok()?;
    let v4_addrs: Vec<_> = addrs
        .iter()
        .filter(|a| !a.is_loopback())
        .filter_map(|a| match &a.addr {
            if_addrs::IfAddr::V4(_) => Some(a),
            _ => None,
        })
        .collect();

    let chosen = network_address
        .and_then(|cidr| v4_addrs.iter().find(|a| in_network(a.ip_v4().unwrap(), cidr)))
        .or_else(|| v4_addrs.first())?;

    let ip = chosen.ip_v4()?;
    Some((ip, broadcast_for(ip, chosen)))
}

trait IfAddrExt {
    fn ip_v4(&self) -> Option<Ipv4Addr>;
}

impl IfAddrExt for if_addrs::Interface {
    fn ip_v4(&self) -> Option<Ipv4Addr> {
        match self.addr {
            if_addrs::IfAddr::V4(ref v4) => Some(v4.ip),
            _ => None,
        }
    }
}

/// Parses a broadcast `IpAddr` wrapper for callers that only need the
/// fallback constant (`oa-agent`'s `PROTOCOL_SEND_TO = NONE` path never
/// calls [`select_interface`] at all).
pub fn fallback_broadcast() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_broadcast_computes_slash_24() {
        let (network, _, bcast) = cidr_broadcast("10.0.0.5/24").unwrap();
        assert_eq!(network, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(bcast, Ipv4Addr::new(10, 0, 0, 255));
    }

    #[test]
    fn in_network_matches_prefix() {
        assert!(in_network(Ipv4Addr::new(10, 0, 0, 42), "10.0.0.0/24"));
        assert!(!in_network(Ipv4Addr::new(10, 0, 1, 42), "10.0.0.0/24"));
    }

    #[test]
    fn fallback_broadcast_is_limited_broadcast() {
        assert_eq!(fallback_broadcast(), IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)));
    }
}
