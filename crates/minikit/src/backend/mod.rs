mod hyperv;
mod none;
mod parallels;
mod unsupported;
#[cfg(unix)]
mod vfkit;
mod vmware;

pub use hyperv::HypervDriver;
pub use none::NoneDriver;
pub use parallels::ParallelsDriver;
pub use unsupported::UnsupportedDriver;
#[cfg(unix)]
pub use vfkit::VfkitDriver;
pub use vmware::VmwareDriver;

use crate::lifecycle::DriverFactory;
use minikit_core::{Driver, DriverKind, Error, MachineConfig, Result, ssh};
use std::path::PathBuf;

/// Whether `kind` is built for the current host OS.
pub fn supported_on_host(kind: DriverKind) -> bool {
    match kind {
        DriverKind::None => cfg!(target_os = "linux"),
        DriverKind::Hyperv => cfg!(windows),
        DriverKind::Vmware => cfg!(any(target_os = "macos", target_os = "linux", windows)),
        DriverKind::Parallels | DriverKind::Vfkit => cfg!(target_os = "macos"),
    }
}

/// Driver for the machine's backend, or the unsupported placeholder when
/// the backend is not built for this host.
pub fn select_driver(config: MachineConfig) -> Box<dyn Driver> {
    if !supported_on_host(config.driver) {
        return Box::new(UnsupportedDriver::new(config));
    }
    match config.driver {
        DriverKind::None => Box::new(NoneDriver::new(config)),
        DriverKind::Hyperv => Box::new(HypervDriver::new(config)),
        DriverKind::Vmware => Box::new(VmwareDriver::new(config)),
        DriverKind::Parallels => Box::new(ParallelsDriver::new(config)),
        #[cfg(unix)]
        DriverKind::Vfkit => Box::new(VfkitDriver::new(config)),
        #[cfg(not(unix))]
        DriverKind::Vfkit => Box::new(UnsupportedDriver::new(config)),
    }
}

/// Picks drivers by host OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDrivers;

impl DriverFactory for HostDrivers {
    fn driver(&self, config: MachineConfig) -> Box<dyn Driver> {
        select_driver(config)
    }
}

/// Creates the machine key pair if needed and returns the public key.
pub(crate) async fn prepare_ssh_key(config: &MachineConfig) -> Result<Vec<u8>> {
    if !config.ssh.key_path.exists() {
        ssh::generate_key(&config.ssh.key_path).await?;
    }
    Ok(tokio::fs::read(config.public_key_path()).await?)
}

/// Copies the boot image into the machine directory.
pub(crate) async fn stage_boot_image(config: &MachineConfig) -> Result<PathBuf> {
    let dst = config.iso_path();
    if dst.exists() {
        return Ok(dst);
    }
    let src = &config.boot_image.path;
    if !src.is_file() {
        return Err(Error::InvalidConfig(format!(
            "boot image {} does not exist",
            src.display()
        )));
    }
    tokio::fs::copy(src, &dst).await?;
    Ok(dst)
}

/// Powershell/vmrun style single-quoted string.
pub(crate) fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// POSIX shell single-quoted string.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_kinds_get_placeholder() {
        for kind in DriverKind::ALL {
            let config = MachineConfig::new("m", kind, "/tmp/m");
            let driver = select_driver(config);
            if supported_on_host(kind) {
                assert_eq!(driver.name(), kind.as_str());
            } else {
                assert_eq!(driver.name(), "unsupported");
            }
        }
    }

    #[test]
    fn quoting() {
        assert_eq!(single_quote("it's"), "'it''s'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn staging_requires_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MachineConfig::new("m", DriverKind::Vfkit, dir.path());
        config.boot_image.path = dir.path().join("missing.iso");
        assert!(matches!(
            stage_boot_image(&config).await,
            Err(Error::InvalidConfig(_))
        ));

        let iso = dir.path().join("src.iso");
        std::fs::write(&iso, b"iso").unwrap();
        config.boot_image.path = iso;
        let staged = stage_boot_image(&config).await.unwrap();
        assert_eq!(std::fs::read(staged).unwrap(), b"iso");
    }
}
