use std::net::{IpAddr, Ipv4Addr};

/// A non-loopback IPv4 interface address with its netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanInterface {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl LanInterface {
    pub fn contains(&self, other: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.ip) & mask == u32::from(other) & mask
    }
}

/// Enumerate the host's non-loopback IPv4 interfaces. Enumeration failures
/// yield an empty list.
pub fn lan_ipv4_interfaces() -> Vec<LanInterface> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => Some(LanInterface {
                    ip: v4.ip,
                    netmask: v4.netmask,
                }),
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

/// Addresses a querier at `querier` may be told about: only those on the
/// querier's own subnet. A querier on this host sees every LAN address.
pub fn addresses_for_querier(interfaces: &[LanInterface], querier: IpAddr) -> Vec<Ipv4Addr> {
    match querier {
        IpAddr::V4(v4) if v4.is_loopback() => interfaces.iter().map(|i| i.ip).collect(),
        IpAddr::V4(v4) => interfaces
            .iter()
            .filter(|i| i.contains(v4))
            .map(|i| i.ip)
            .collect(),
        IpAddr::V6(_) => Vec::new(),
    }
}
