use super::{DriverKind, MountSpec, NetworkMode, ResourceConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const DEFAULT_SSH_USER: &str = "docker";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_API_SERVER_PORT: u16 = 8443;

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_api_server_port() -> u16 {
    DEFAULT_API_SERVER_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub key_path: PathBuf,
}

/// Boot image the machine was created from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Local copy of the image, resolved before `create`.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervOptions {
    /// Virtual switch; the host's default switch when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(default)]
    pub nested_virtualization: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfkitOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_id: Option<Uuid>,
    #[serde(default)]
    pub offloading: bool,
    /// Set when the running helper was launched through sudo.
    #[serde(default)]
    pub helper_elevated: bool,
    #[serde(default)]
    pub rosetta: bool,
}

/// Persisted record of a single machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    pub driver: DriverKind,
    /// Working directory; exists for the whole life of the machine.
    pub dir: PathBuf,
    pub ssh: SshConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub boot_image: BootImage,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default)]
    pub extra_disks: u32,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default = "default_api_server_port")]
    pub api_server_port: u16,
    #[serde(default)]
    pub hyperv: HypervOptions,
    #[serde(default)]
    pub vfkit: VfkitOptions,
}

impl MachineConfig {
    pub fn new(name: impl Into<String>, driver: DriverKind, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            name: name.into(),
            driver,
            ssh: SshConfig {
                user: default_ssh_user(),
                port: DEFAULT_SSH_PORT,
                key_path: dir.join("id_rsa"),
            },
            dir,
            resources: ResourceConfig::default(),
            boot_image: BootImage::default(),
            network: NetworkMode::default(),
            mac: None,
            extra_disks: 0,
            mounts: Vec::new(),
            api_server_port: DEFAULT_API_SERVER_PORT,
            hyperv: HypervOptions::default(),
            vfkit: VfkitOptions::default(),
        }
    }

    /// Path of a file inside the machine directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn disk_path(&self) -> PathBuf {
        self.file("disk.img")
    }

    pub fn iso_path(&self) -> PathBuf {
        self.file("boot2docker.iso")
    }

    pub fn extra_disk_path(&self, index: u32) -> PathBuf {
        self.file(&format!("extra-disk-{index}.img"))
    }

    pub fn public_key_path(&self) -> PathBuf {
        let mut path = self.ssh.key_path.clone().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records the MAC address. Once set it never changes.
    pub fn set_mac(&mut self, mac: impl Into<String>) -> Result<()> {
        let mac = mac.into();
        match &self.mac {
            Some(existing) if !existing.eq_ignore_ascii_case(&mac) => {
                Err(Error::InvalidConfig(format!(
                    "machine '{}' already has MAC {existing}, refusing to replace it with {mac}",
                    self.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.mac = Some(mac);
                Ok(())
            }
        }
    }

    /// Validates sizing and mounts. `separator` is the backend's device
    /// option separator, if it has one.
    pub fn validate(&self, separator: Option<char>) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(Error::InvalidConfig(format!(
                "invalid machine name '{}'",
                self.name
            )));
        }
        self.resources.validate()?;
        for mount in &self.mounts {
            mount.validate(separator)?;
        }
        Ok(())
    }
}
