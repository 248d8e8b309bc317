use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A host directory exported into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub guest_path: String,
    /// Unique device tag the guest mounts by.
    pub tag: String,
}

impl MountSpec {
    pub fn new(host_path: impl Into<PathBuf>, guest_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            tag: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Parses `HOST:GUEST`. The split happens at the last colon so a
    /// Windows drive letter in the host half survives.
    pub fn parse(spec: &str) -> Result<Self> {
        let (host, guest) = spec.rsplit_once(':').ok_or_else(|| Error::InvalidMount {
            spec: spec.to_string(),
            reason: "expected HOST_PATH:GUEST_PATH".to_string(),
        })?;
        if host.is_empty() || guest.is_empty() {
            return Err(Error::InvalidMount {
                spec: spec.to_string(),
                reason: "host and guest paths must be non-empty".to_string(),
            });
        }
        Ok(Self::new(host, guest))
    }

    /// Checks the mount against the host filesystem. `separator` is the
    /// character the backend uses to split device options; a host path
    /// containing it cannot be expressed.
    pub fn validate(&self, separator: Option<char>) -> Result<()> {
        let host = self.host_path.to_string_lossy();
        let invalid = |reason: String| Error::InvalidMount {
            spec: format!("{}:{}", host, self.guest_path),
            reason,
        };

        if !self.host_path.is_absolute() {
            return Err(invalid("host path must be absolute".to_string()));
        }
        if let Some(sep) = separator
            && host.contains(sep)
        {
            return Err(invalid(format!("host path must not contain '{sep}'")));
        }
        let meta = std::fs::metadata(&self.host_path)
            .map_err(|e| invalid(format!("host path is not accessible: {e}")))?;
        if !meta.is_dir() {
            return Err(invalid("host path must be a directory".to_string()));
        }
        if !self.guest_path.starts_with('/') {
            return Err(invalid("guest path must be absolute".to_string()));
        }
        Ok(())
    }
}
