//! User defaults read from `<home>/config.toml`.

use anyhow::Context;
use minikit_core::{DriverKind, NetworkMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "config.toml";

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    pub driver: Option<DriverKind>,
    pub cpus: Option<u32>,
    /// MB
    pub memory: Option<u32>,
    /// MB
    pub disk_size: Option<u64>,
    pub network: Option<NetworkMode>,
    pub iso: Option<PathBuf>,
    pub api_server_port: Option<u16>,
    pub keep_context: Option<bool>,
    /// Shell command run in the guest once SSH is up.
    pub bootstrap_command: Option<String>,
}

impl Settings {
    /// A missing file yields the built-in defaults.
    pub fn load(home: &Path) -> anyhow::Result<Self> {
        let path = home.join(SETTINGS_FILE);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        toml::from_str(&data).with_context(|| format!("invalid settings in {}", path.display()))
    }
}
