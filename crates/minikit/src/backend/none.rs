//! Runs the cluster directly on the host, supervised by systemd.

use async_trait::async_trait;
use minikit_core::{Driver, Error, MachineConfig, MachineState, Result, exec, host};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

const SERVICE: &str = "kubelet";
const DATA_DIR: &str = "/var/lib/minikit";

/// Maps `systemctl is-active` output to a machine state.
pub(crate) fn parse_is_active(output: &str) -> MachineState {
    match output.trim() {
        "active" => MachineState::Running,
        "activating" | "reloading" => MachineState::Starting,
        "deactivating" => MachineState::Stopping,
        "failed" => MachineState::Error,
        _ => MachineState::Stopped,
    }
}

pub struct NoneDriver {
    config: MachineConfig,
    data_dir: PathBuf,
}

impl NoneDriver {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            data_dir: PathBuf::from(DATA_DIR),
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String> {
        let systemctl = exec::find_binary("systemctl", "the none driver requires systemd")?;
        exec::run(systemctl, args).await
    }
}

#[async_trait]
impl Driver for NoneDriver {
    fn name(&self) -> &'static str {
        "none"
    }

    fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut MachineConfig {
        &mut self.config
    }

    async fn pre_create_check(&self) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(Error::Unsupported {
                driver: self.name().to_string(),
            });
        }
        if !host::is_root() {
            return Err(Error::InsufficientPrivileges(
                "the none driver must be run as root".to_string(),
            ));
        }
        exec::find_binary("systemctl", "the none driver requires systemd")?;
        Ok(())
    }

    async fn create(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.systemctl(&["start", SERVICE]).await?;
        tracing::info!(service = SERVICE, "started host service");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.systemctl(&["stop", SERVICE]).await?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.systemctl(&["kill", "--signal=SIGKILL", SERVICE]).await?;
        self.systemctl(&["stop", SERVICE]).await?;
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        if let Err(e) = self.systemctl(&["stop", SERVICE]).await {
            tracing::warn!("stopping {SERVICE} before removal failed: {e}");
        }
        match tokio::fs::remove_dir_all(&self.data_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn state(&self) -> Result<MachineState> {
        let systemctl = exec::find_binary("systemctl", "the none driver requires systemd")?;
        // is-active exits non-zero for every state but "active".
        let output = exec::run_unchecked(systemctl, &["is-active", SERVICE]).await?;
        Ok(parse_is_active(&output.stdout))
    }

    async fn ip(&self) -> Result<IpAddr> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn url(&self) -> Result<String> {
        Ok(Ipv4Addr::LOCALHOST.to_string())
    }

    fn supports_ssh(&self) -> bool {
        false
    }
}
