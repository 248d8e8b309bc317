use crate::error::{Error, Result};
use crate::types::{MachineConfig, MachineState};
use async_trait::async_trait;
use std::net::IpAddr;

/// Lifecycle contract every hypervisor backend implements.
///
/// Methods that change the machine record take `&mut self`; the caller
/// persists [`Driver::config`] afterwards.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> &MachineConfig;

    fn config_mut(&mut self) -> &mut MachineConfig;

    /// Checks host prerequisites. Fails with a preflight error.
    async fn pre_create_check(&self) -> Result<()>;

    async fn create(&mut self) -> Result<()>;

    /// Idempotent: brings up whatever part of the machine is not running,
    /// resuming a paused VM and leaving a running one alone.
    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    async fn kill(&mut self) -> Result<()>;

    async fn restart(&mut self) -> Result<()> {
        if self.state().await?.is_running() {
            self.stop().await?;
        }
        self.start().await
    }

    async fn remove(&mut self) -> Result<()>;

    async fn state(&self) -> Result<MachineState>;

    async fn ip(&self) -> Result<IpAddr>;

    async fn url(&self) -> Result<String> {
        Ok(format!("tcp://{}:2376", self.ip().await?))
    }

    async fn ssh_hostname(&self) -> Result<String> {
        if !self.supports_ssh() {
            return Err(Error::SshUnsupported(self.name().to_string()));
        }
        Ok(self.ip().await?.to_string())
    }

    fn ssh_port(&self) -> Result<u16> {
        if !self.supports_ssh() {
            return Err(Error::SshUnsupported(self.name().to_string()));
        }
        Ok(self.config().ssh.port)
    }

    fn supports_ssh(&self) -> bool {
        true
    }

    /// True when the guest gets its address from the host DHCP daemon,
    /// which the macOS application firewall can block.
    fn uses_host_dhcp(&self) -> bool {
        false
    }

    /// Guest-side setup that needs SSH, run once the guest is reachable.
    async fn post_start(&self) -> Result<()> {
        Ok(())
    }
}
