mod machine;
mod mount;
mod network;

pub use machine::{BootImage, HypervOptions, MachineConfig, SshConfig, VfkitOptions};
pub use mount::MountSpec;
pub use network::NetworkMode;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Observed state of a machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    #[default]
    None,
    Stopped,
    Starting,
    Running,
    Paused,
    Saved,
    Stopping,
    Error,
}

impl MachineState {
    pub fn is_running(self) -> bool {
        self == MachineState::Running
    }

    /// Anything other than `Stopped` or `None`: some part of the machine
    /// may still be holding resources and needs a stop.
    pub fn is_live(self) -> bool {
        !matches!(self, MachineState::Stopped | MachineState::None)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::None => "None",
            MachineState::Stopped => "Stopped",
            MachineState::Starting => "Starting",
            MachineState::Running => "Running",
            MachineState::Paused => "Paused",
            MachineState::Saved => "Saved",
            MachineState::Stopping => "Stopping",
            MachineState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Hypervisor backend a machine is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    None,
    Hyperv,
    Vmware,
    Parallels,
    Vfkit,
}

impl DriverKind {
    pub const ALL: [DriverKind; 5] = [
        DriverKind::None,
        DriverKind::Hyperv,
        DriverKind::Vmware,
        DriverKind::Parallels,
        DriverKind::Vfkit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DriverKind::None => "none",
            DriverKind::Hyperv => "hyperv",
            DriverKind::Vmware => "vmware",
            DriverKind::Parallels => "parallels",
            DriverKind::Vfkit => "vfkit",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DriverKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::Unsupported {
                driver: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 2048,
            disk_mb: 20000,
        }
    }
}

impl ResourceConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.cpus == 0 {
            return Err(crate::Error::InvalidConfig(
                "CPU count must be at least 1".to_string(),
            ));
        }
        if self.memory_mb < 128 {
            return Err(crate::Error::InvalidConfig(format!(
                "memory must be at least 128 MB, got {}",
                self.memory_mb
            )));
        }
        if self.disk_mb == 0 {
            return Err(crate::Error::InvalidConfig(
                "disk size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod resource_config {
        use super::*;

        #[test]
        fn default_values_are_valid() {
            let config = ResourceConfig::default();
            assert_eq!(config.cpus, 2);
            assert_eq!(config.memory_mb, 2048);
            assert!(config.validate().is_ok());
        }

        #[test]
        fn rejects_zero_cpus() {
            let config = ResourceConfig {
                cpus: 0,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(crate::Error::InvalidConfig(_))
            ));
        }

        #[test]
        fn rejects_tiny_memory() {
            let config = ResourceConfig {
                memory_mb: 64,
                ..Default::default()
            };
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("128 MB"));
        }
    }

    mod machine_state {
        use super::*;

        #[test]
        fn serializes_lowercase() {
            assert_eq!(
                serde_json::to_string(&MachineState::Running).unwrap(),
                "\"running\""
            );
        }

        #[test]
        fn displays_capitalized() {
            assert_eq!(MachineState::Stopped.to_string(), "Stopped");
            assert_eq!(MachineState::None.to_string(), "None");
        }

        #[test]
        fn default_is_none() {
            assert_eq!(MachineState::default(), MachineState::None);
        }

        #[test]
        fn only_stopped_and_none_are_not_live() {
            assert!(!MachineState::Stopped.is_live());
            assert!(!MachineState::None.is_live());
            for state in [
                MachineState::Starting,
                MachineState::Running,
                MachineState::Paused,
                MachineState::Saved,
                MachineState::Stopping,
                MachineState::Error,
            ] {
                assert!(state.is_live(), "{state} should be live");
            }
        }
    }

    mod driver_kind {
        use super::*;

        #[test]
        fn parses_case_insensitively() {
            assert_eq!("VFKit".parse::<DriverKind>().unwrap(), DriverKind::Vfkit);
            assert_eq!("none".parse::<DriverKind>().unwrap(), DriverKind::None);
        }

        #[test]
        fn unknown_driver_is_unsupported() {
            let err = "virtualbox".parse::<DriverKind>().unwrap_err();
            assert!(matches!(err, crate::Error::Unsupported { driver } if driver == "virtualbox"));
        }
    }
}
