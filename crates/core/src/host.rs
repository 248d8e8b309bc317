//! Facts about the host the CLI runs on.

use crate::error::Result;
use crate::exec;
use crate::version::parse_host_version;
use semver::Version;

/// `/proc/cpuinfo` lists `hypervisor` among the CPU flags inside a VM.
pub fn cpuinfo_has_hypervisor(cpuinfo: &str) -> bool {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("flags"))
        .filter_map(|line| line.split_once(':'))
        .any(|(_, flags)| flags.split_whitespace().any(|f| f == "hypervisor"))
}

/// `machdep.cpu.features` contains `VMM` inside a VM on Intel Macs.
pub fn cpu_features_have_vmm(features: &str) -> bool {
    features.split_whitespace().any(|f| f == "VMM")
}

/// Best effort; any detection failure reads as "not nested".
pub async fn is_nested_vm() -> bool {
    let nested = if cfg!(target_os = "macos") {
        exec::run("sysctl", &["-n", "machdep.cpu.features"])
            .await
            .map(|out| cpu_features_have_vmm(&out))
    } else if cfg!(target_os = "linux") {
        tokio::fs::read_to_string("/proc/cpuinfo")
            .await
            .map(|info| cpuinfo_has_hypervisor(&info))
            .map_err(Into::into)
    } else {
        Ok(false)
    };
    nested.unwrap_or_else(|e| {
        tracing::debug!("nested virtualization check failed: {e}");
        false
    })
}

pub async fn macos_version() -> Result<Version> {
    let out = exec::run("sw_vers", &["-productVersion"]).await?;
    parse_host_version(&out)
}

#[cfg(unix)]
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
    false
}

/// Uid and gid of the user who invoked `sudo`, as exported by sudo itself.
pub fn sudo_invoker() -> Option<(u32, u32)> {
    let uid = std::env::var("SUDO_UID").ok()?.parse().ok()?;
    let gid = std::env::var("SUDO_GID").ok()?.parse().ok()?;
    Some((uid, gid))
}
