use crate::error::{Error, Result};
use semver::Version;

/// First macOS release where vmnet no longer needs root.
pub const UNPRIVILEGED_HOST_MAJOR: u64 = 26;

/// First vmnet-helper release that can run without root.
pub const UNPRIVILEGED_HELPER: Version = Version::new(0, 7, 0);

fn invalid(input: &str, e: impl std::fmt::Display) -> Error {
    Error::InvalidConfig(format!("invalid version {input:?}: {e}"))
}

/// Parses `vX.Y.Z` or `version: vX.Y.Z` as printed by `--version`.
pub fn parse_helper_version(output: &str) -> Result<Version> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let raw = line.strip_prefix("version:").unwrap_or(line).trim();
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    Version::parse(raw).map_err(|e| invalid(output.trim(), e))
}

/// Parses a host OS version, padding `X` and `X.Y` with zeros.
pub fn parse_host_version(raw: &str) -> Result<Version> {
    let raw = raw.trim();
    let padded = match raw.matches('.').count() {
        0 => format!("{raw}.0.0"),
        1 => format!("{raw}.0"),
        _ => raw.to_string(),
    };
    Version::parse(&padded).map_err(|e| invalid(raw, e))
}

/// Whether the network helper must be launched through `sudo`.
pub fn helper_requires_elevation(host: &Version, helper: &Version) -> bool {
    host.major < UNPRIVILEGED_HOST_MAJOR || *helper < UNPRIVILEGED_HELPER
}
