use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Guest network attachment.
///
/// Serialized as a plain string so machine records stay readable:
/// `"nat"`, `"shared-vmnet"`, or any backend-specific name (a Hyper-V
/// switch or a Parallels network, for instance).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NetworkMode {
    /// Backend-provided NAT.
    #[default]
    Nat,
    /// macOS vmnet shared mode through the vmnet-helper daemon.
    SharedVmnet,
    /// Anything else, passed through to the backend verbatim.
    Custom(String),
}

impl NetworkMode {
    pub fn as_str(&self) -> &str {
        match self {
            NetworkMode::Nat => "nat",
            NetworkMode::SharedVmnet => "shared-vmnet",
            NetworkMode::Custom(name) => name,
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "nat" => NetworkMode::Nat,
            "shared-vmnet" | "vmnet-shared" => NetworkMode::SharedVmnet,
            other => NetworkMode::Custom(other.to_string()),
        })
    }
}

impl From<String> for NetworkMode {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(mode) => mode,
            Err(never) => match never {},
        }
    }
}

impl From<NetworkMode> for String {
    fn from(mode: NetworkMode) -> Self {
        mode.as_str().to_string()
    }
}
