//! ISC dhcpd lease files, as written by VMware's `vmnet-dhcpd`.

use crate::mac;
use minikit_core::{Error, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// NAT network lease file for the current host OS.
pub fn default_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/var/db/vmware/vmnet-dhcpd-vmnet8.leases")
    } else if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\VMware\vmnetdhcp.leases")
    } else {
        PathBuf::from("/etc/vmware/vmnet8/dhcpd/dhcpd.leases")
    }
}

struct Lease<'a> {
    ip: &'a str,
    ends: String,
    hw: Option<&'a str>,
}

/// `ends 4 2016/05/19 23:37:37;` → `2016/05/19 23:37:37`, which orders
/// lexicographically.
fn timestamp(value: &str) -> String {
    let value = value.trim_end_matches(';');
    let mut parts = value.split_whitespace();
    let first = parts.next().unwrap_or_default();
    if first.len() == 1 {
        parts.collect::<Vec<_>>().join(" ")
    } else {
        value.to_string()
    }
}

/// Address of the lease for `mac` with the latest `ends`.
pub fn find_ip(path: &Path, contents: &str, mac_addr: &str) -> Result<Option<Ipv4Addr>> {
    let wanted = mac::canonical(mac_addr)?;
    let mut best: Option<(String, Ipv4Addr)> = None;
    let mut current: Option<Lease<'_>> = None;

    for line in contents.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("lease ")
            && let Some(ip) = rest.strip_suffix('{')
        {
            current = Some(Lease {
                ip: ip.trim(),
                ends: String::new(),
                hw: None,
            });
        } else if line == "}" {
            let Some(lease) = current.take() else {
                continue;
            };
            let Some(hw) = lease.hw else { continue };
            if !mac::canonical(hw).is_ok_and(|found| found == wanted) {
                continue;
            }
            let ip: Ipv4Addr = lease.ip.parse().map_err(|_| Error::MalformedLeases {
                path: path.to_path_buf(),
                reason: format!("invalid lease address '{}'", lease.ip),
            })?;
            if best.as_ref().is_none_or(|(ends, _)| lease.ends >= *ends) {
                best = Some((lease.ends, ip));
            }
        } else if let Some(lease) = current.as_mut() {
            if let Some(ends) = line.strip_prefix("ends ") {
                lease.ends = timestamp(ends);
            } else if let Some(hw) = line.strip_prefix("hardware ethernet ") {
                lease.hw = Some(hw.trim_end_matches(';'));
            }
        }
    }
    Ok(best.map(|(_, ip)| ip))
}

pub async fn lookup(path: &Path, mac_addr: &str) -> Result<Option<Ipv4Addr>> {
    super::lookup(path, mac_addr, find_ip).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASES: &str = r#"# All times in this file are in UTC (GMT), not your local timezone.
lease 192.168.2.128 {
	starts 4 2016/05/19 23:07:37;
	ends 4 2016/05/19 23:37:37;
	hardware ethernet 00:0c:29:8f:2d:64;
	client-hostname "minikit";
}
lease 192.168.2.131 {
	starts 5 2016/05/20 09:00:00;
	ends 5 2016/05/20 09:30:00;
	hardware ethernet 00:0c:29:8f:2d:64;
}
lease 192.168.2.140 {
	starts 6 2016/05/21 09:00:00;
	ends 6 2016/05/21 09:30:00;
	hardware ethernet 00:0c:29:00:00:01;
}
"#;

    #[test]
    fn latest_end_wins() {
        let ip = find_ip(Path::new("leases"), LEASES, "00:0C:29:8F:2D:64").unwrap();
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 2, 131)));
    }

    #[test]
    fn unknown_mac_has_no_lease() {
        let ip = find_ip(Path::new("leases"), LEASES, "00:0c:29:ff:ff:ff").unwrap();
        assert_eq!(ip, None);
    }

    #[test]
    fn strips_weekday_from_timestamps() {
        assert_eq!(timestamp("4 2016/05/19 23:37:37;"), "2016/05/19 23:37:37");
        assert_eq!(timestamp("never;"), "never");
    }
}
