//! macOS application firewall. When enabled it can drop DHCP requests
//! to `bootpd`, so guests never get an address.

use async_trait::async_trait;
use minikit_core::{Result, exec};
use std::path::Path;

pub const SOCKETFILTERFW: &str = "/usr/libexec/ApplicationFirewall/socketfilterfw";
pub const BOOTPD: &str = "/usr/libexec/bootpd";

#[async_trait]
pub trait Firewall: Send + Sync {
    /// Whether incoming connections to `app` are being dropped.
    async fn is_blocking(&self, app: &Path) -> Result<bool>;

    /// Adds `app` to the firewall and allows incoming connections.
    /// Requires elevation.
    async fn unblock(&self, app: &Path) -> Result<()>;
}

/// `socketfilterfw --getglobalstate` prints `Firewall is enabled. (State = 1)`.
pub fn parse_global_state(output: &str) -> bool {
    output.to_ascii_lowercase().contains("enabled")
}

/// Finds `app` in `socketfilterfw --listapps` output and reports whether
/// it is blocked. Apps missing from the list are blocked.
pub fn parse_app_blocked(output: &str, app: &str) -> bool {
    let mut lines = output.lines().map(str::trim);
    while let Some(line) = lines.next() {
        let Some((index, path)) = line.split_once(':') else {
            continue;
        };
        if index.trim().parse::<u32>().is_err() || path.trim() != app {
            continue;
        }
        for detail in lines.by_ref() {
            if detail.contains("Allow incoming connections") {
                return false;
            }
            if detail.contains("Block incoming connections") {
                return true;
            }
            if detail.split_once(':').is_some_and(|(i, _)| i.trim().parse::<u32>().is_ok()) {
                break;
            }
        }
        return true;
    }
    true
}

/// The real application firewall, driven through `socketfilterfw`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketFilterFirewall;

#[async_trait]
impl Firewall for SocketFilterFirewall {
    async fn is_blocking(&self, app: &Path) -> Result<bool> {
        let state = exec::run(SOCKETFILTERFW, &["--getglobalstate"]).await?;
        if !parse_global_state(&state) {
            return Ok(false);
        }
        let apps = exec::run(SOCKETFILTERFW, &["--listapps"]).await?;
        Ok(parse_app_blocked(&apps, &app.to_string_lossy()))
    }

    async fn unblock(&self, app: &Path) -> Result<()> {
        let app = app.to_string_lossy();
        for flag in ["--add", "--unblock"] {
            exec::run(
                "sudo",
                &["--non-interactive", SOCKETFILTERFW, flag, &*app],
            )
            .await?;
        }
        tracing::info!(app = %app, "allowed incoming connections in the application firewall");
        Ok(())
    }
}
