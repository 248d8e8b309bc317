//! macOS `bootpd` lease database (`/var/db/dhcpd_leases`).
//!
//! ```text
//! {
//! 	name=minikit
//! 	ip_address=192.168.64.3
//! 	hw_address=1,5a:94:ef:e4:c:ee
//! 	identifier=1,5a:94:ef:e4:c:ee
//! 	lease=0x65a1b2c3
//! }
//! ```

use crate::mac;
use minikit_core::{Error, Result};
use std::net::Ipv4Addr;
use std::path::Path;

pub const DEFAULT_PATH: &str = "/var/db/dhcpd_leases";

#[derive(Debug, Default)]
struct Entry<'a> {
    ip: Option<&'a str>,
    hw: Option<&'a str>,
    lease: u64,
}

fn matches(hw: &str, wanted: &str) -> bool {
    // `1,` is the ARP hardware type prefix.
    let addr = hw.split_once(',').map_or(hw, |(_, addr)| addr);
    mac::canonical(addr).is_ok_and(|found| found == wanted)
}

/// Address of the newest lease held by `mac`.
pub fn find_ip(path: &Path, contents: &str, mac_addr: &str) -> Result<Option<Ipv4Addr>> {
    let wanted = mac::canonical(mac_addr)?;
    let mut best: Option<(u64, Ipv4Addr)> = None;
    let mut entry: Option<Entry<'_>> = None;

    for line in contents.lines().map(str::trim) {
        match line {
            "{" => entry = Some(Entry::default()),
            "}" => {
                let Some(done) = entry.take() else { continue };
                let (Some(ip), Some(hw)) = (done.ip, done.hw) else {
                    continue;
                };
                if !matches(hw, &wanted) {
                    continue;
                }
                let ip: Ipv4Addr = ip.parse().map_err(|_| Error::MalformedLeases {
                    path: path.to_path_buf(),
                    reason: format!("invalid ip_address '{ip}'"),
                })?;
                if best.is_none_or(|(lease, _)| done.lease >= lease) {
                    best = Some((done.lease, ip));
                }
            }
            _ => {
                let (Some(current), Some((key, value))) = (entry.as_mut(), line.split_once('='))
                else {
                    continue;
                };
                match key {
                    "ip_address" => current.ip = Some(value),
                    "hw_address" => current.hw = Some(value),
                    "lease" => {
                        current.lease = u64::from_str_radix(value.trim_start_matches("0x"), 16)
                            .unwrap_or_default();
                    }
                    _ => {}
                }
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

    const LEASES: &str = "{\n\
        \tname=old\n\
        \tip_address=192.168.64.2\n\
        \thw_address=1,5a:94:ef:e4:c:ee\n\
        \tidentifier=1,5a:94:ef:e4:c:ee\n\
        \tlease=0x5f000000\n\
        }\n\
        {\n\
        \tname=other\n\
        \tip_address=192.168.64.9\n\
        \thw_address=1,12:34:56:78:9a:bc\n\
        \tlease=0x7f000000\n\
        }\n\
        {\n\
        \tname=minikit\n\
        \tip_address=192.168.64.3\n\
        \thw_address=1,5a:94:ef:e4:c:ee\n\
        \tlease=0x65a1b2c3\n\
        }\n";

    fn find(mac: &str) -> Option<Ipv4Addr> {
        find_ip(Path::new(DEFAULT_PATH), LEASES, mac).unwrap()
    }

    #[test]
    fn newest_lease_for_mac_wins() {
        assert_eq!(find("5a:94:ef:e4:0c:ee"), Some(Ipv4Addr::new(192, 168, 64, 3)));
    }

    #[test]
    fn other_macs_are_ignored() {
        assert_eq!(find("12:34:56:78:9a:bc"), Some(Ipv4Addr::new(192, 168, 64, 9)));
        assert_eq!(find("00:00:00:00:00:01"), None);
    }

    #[test]
    fn invalid_ip_for_wanted_mac_is_malformed() {
        let contents = "{\n ip_address=not-an-ip\n hw_address=1,a:b:c:d:e:f\n}\n";
        let err = find_ip(Path::new("leases"), contents, "0a:0b:0c:0d:0e:0f").unwrap_err();
        assert!(matches!(err, Error::MalformedLeases { .. }));
    }

    #[tokio::test]
    async fn missing_file_has_no_lease() {
        let dir = tempfile::tempdir().unwrap();
        let ip = lookup(&dir.path().join("dhcpd_leases"), "5a:94:ef:e4:0c:ee")
            .await
            .unwrap();
        assert_eq!(ip, None);
    }

    #[tokio::test]
    async fn lookup_reads_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), LEASES).unwrap();
        let ip = lookup(file.path(), "5a:94:ef:e4:0c:ee").await.unwrap();
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 64, 3)));
    }
}
