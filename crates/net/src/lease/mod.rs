//! Host DHCP lease tables, used to find a guest's address by MAC when
//! the hypervisor cannot report it.

pub mod bootpd;
pub mod isc;
pub mod parallels;

use minikit_core::Result;
use std::net::Ipv4Addr;
use std::path::Path;

/// Reads a lease file, mapping a missing file to `None`: the daemon
/// creates it lazily on the first lease.
pub(crate) async fn read_leases(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "lease file does not exist yet");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Looks up `mac` in the lease file at `path` using `find`.
pub(crate) async fn lookup(
    path: &Path,
    mac: &str,
    find: fn(&Path, &str, &str) -> Result<Option<Ipv4Addr>>,
) -> Result<Option<Ipv4Addr>> {
    let Some(contents) = read_leases(path).await? else {
        return Ok(None);
    };
    let ip = find(path, &contents, mac)?;
    tracing::debug!(path = %path.display(), mac, ?ip, "lease lookup");
    Ok(ip)
}
