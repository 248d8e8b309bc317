//! Parallels Desktop shared-network lease table.
//!
//! Each line maps an address to `"expiry,duration,mac,client-id"`, with
//! the MAC as twelve lowercase hex digits.

use crate::mac;
use minikit_core::{Error, Result};
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::Path;

pub const DEFAULT_PATH: &str = "/Library/Preferences/Parallels/parallels_dhcp_leases";

/// Address of the lease with the most recent start (`expiry - duration`).
/// Among equal starts, the later line wins.
pub fn find_ip(path: &Path, contents: &str, mac_addr: &str) -> Result<Option<Ipv4Addr>> {
    let compact = mac::compact(mac_addr)?;
    let pattern = format!(r#"(.*)="(.*),(.*),{},.*""#, regex::escape(&compact));
    let re = Regex::new(&pattern).map_err(|e| Error::InvalidConfig(e.to_string()))?;

    let malformed = |reason: String| Error::MalformedLeases {
        path: path.to_path_buf(),
        reason,
    };

    let mut best: Option<(i64, Ipv4Addr)> = None;
    for line in contents.lines() {
        let line = line.trim_end_matches('\r');
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let ip: Ipv4Addr = caps[1]
            .trim()
            .parse()
            .map_err(|_| malformed(format!("invalid address in '{line}'")))?;
        let expiry: i64 = caps[2]
            .parse()
            .map_err(|_| malformed(format!("invalid expiry in '{line}'")))?;
        let duration: i64 = caps[3]
            .parse()
            .map_err(|_| malformed(format!("invalid duration in '{line}'")))?;
        let start = expiry - duration;
        if best.is_none_or(|(most_recent, _)| most_recent <= start) {
            best = Some((start, ip));
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

    const MAC: &str = "00:1c:42:b2:ff:28";

    fn find(contents: &str) -> Option<Ipv4Addr> {
        find_ip(Path::new(DEFAULT_PATH), contents, MAC).unwrap()
    }

    #[test]
    fn picks_most_recent_start() {
        let contents = "[vnic0]\n\
            10.211.55.3=\"1506528036,1800,001c42b2ff28,ff42b2ff28000100011d\"\n\
            10.211.55.4=\"1506529836,1800,001c42b2ff28,ff42b2ff28000100011d\"\n\
            10.211.55.5=\"1506530000,7200,001c42b2ff28,ff42b2ff28000100011d\"\n";
        assert_eq!(find(contents), Some(Ipv4Addr::new(10, 211, 55, 4)));
    }

    #[test]
    fn later_line_wins_ties() {
        let contents = "10.211.55.7=\"2000,1000,001c42b2ff28,x\"\n\
            10.211.55.8=\"1500,500,001c42b2ff28,x\"\n";
        assert_eq!(find(contents), Some(Ipv4Addr::new(10, 211, 55, 8)));
    }

    #[test]
    fn tolerates_crlf() {
        let contents = "[vnic0]\r\n10.211.55.9=\"1506528036,1800,001c42b2ff28,ff42\"\r\n";
        assert_eq!(find(contents), Some(Ipv4Addr::new(10, 211, 55, 9)));
    }

    #[test]
    fn other_macs_are_ignored() {
        let contents = "10.211.55.3=\"1506528036,1800,001c42aaaaaa,ff42\"\n";
        assert_eq!(find(contents), None);
    }

    #[test]
    fn bad_numbers_are_malformed() {
        let contents = "10.211.55.3=\"soon,1800,001c42b2ff28,ff42\"\n";
        let err = find_ip(Path::new("leases"), contents, MAC).unwrap_err();
        assert!(matches!(err, Error::MalformedLeases { .. }));
    }
}
