use minikit_core::Result;
use std::net::Ipv4Addr;

/// IPv4 addresses assigned to host interfaces.
#[cfg(unix)]
pub fn host_ipv4_addresses() -> Result<Vec<Ipv4Addr>> {
    use std::net::SocketAddrV4;

    let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
    Ok(addrs
        .filter_map(|ifaddr| {
            let sin = *ifaddr.address?.as_sockaddr_in()?;
            Some(*SocketAddrV4::from(sin).ip())
        })
        .collect())
}

#[cfg(not(unix))]
pub fn host_ipv4_addresses() -> Result<Vec<Ipv4Addr>> {
    Ok(Vec::new())
}

pub fn host_has_address(ip: Ipv4Addr) -> Result<bool> {
    Ok(host_ipv4_addresses()?.contains(&ip))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_a_host_address() {
        assert!(host_has_address(Ipv4Addr::LOCALHOST).unwrap());
    }

    #[test]
    fn documentation_range_is_not() {
        assert!(!host_has_address(Ipv4Addr::new(192, 0, 2, 77)).unwrap());
    }
}
