//! On-disk registry of machines: `<base>/machines/<name>/config.json`.

use minikit_core::{DriverKind, Error, MachineConfig, Result};
use std::path::{Path, PathBuf};

const MACHINES_DIR: &str = "machines";
const CONFIG_FILE: &str = "config.json";

/// `~/.minikit`.
pub fn default_base() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".minikit"))
        .ok_or_else(|| Error::InvalidConfig("cannot determine home directory".to_string()))
}

#[derive(Debug, Clone)]
pub struct MachineStore {
    base: PathBuf,
}

impl MachineStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn machine_dir(&self, name: &str) -> PathBuf {
        self.base.join(MACHINES_DIR).join(name)
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.machine_dir(name).join(CONFIG_FILE)
    }

    /// Fresh record for a machine living under this store.
    pub fn new_config(&self, name: &str, driver: DriverKind) -> MachineConfig {
        MachineConfig::new(name, driver, self.machine_dir(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.config_path(name).is_file()
    }

    pub fn load(&self, name: &str) -> Result<MachineConfig> {
        let data = match std::fs::read(self.config_path(name)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MachineNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, config: &MachineConfig) -> Result<()> {
        std::fs::create_dir_all(&config.dir)?;
        let data = serde_json::to_vec_pretty(config)?;
        std::fs::write(config.dir.join(CONFIG_FILE), data)?;
        Ok(())
    }

    /// Names of all machines with a readable record, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.base.join(MACHINES_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && self.exists(name)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Deletes the machine directory. A missing machine is not an error.
    pub fn remove(&self, name: &str) -> Result<()> {
        match std::fs::remove_dir_all(self.machine_dir(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
