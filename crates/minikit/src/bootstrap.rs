//! Cluster bootstrapping runs once the guest is reachable. The actual
//! orchestrator setup lives outside this crate; it plugs in here.

use async_trait::async_trait;
use minikit_core::{Driver, Result, SshClient, exec};
use std::net::IpAddr;

#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn bootstrap(&self, driver: &dyn Driver, ip: IpAddr) -> Result<()>;
}

/// Does nothing; the guest image brings the cluster up on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBootstrapper;

#[async_trait]
impl Bootstrapper for NoopBootstrapper {
    async fn bootstrap(&self, _driver: &dyn Driver, _ip: IpAddr) -> Result<()> {
        Ok(())
    }
}

/// Runs a shell command in the guest over SSH, or on the host for
/// drivers without SSH.
#[derive(Debug, Clone)]
pub struct SshCommandBootstrapper {
    command: String,
}

impl SshCommandBootstrapper {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Bootstrapper for SshCommandBootstrapper {
    async fn bootstrap(&self, driver: &dyn Driver, ip: IpAddr) -> Result<()> {
        tracing::info!(command = %self.command, %ip, "bootstrapping cluster");
        if !driver.supports_ssh() {
            exec::run("sh", &["-c", &self.command]).await?;
            return Ok(());
        }
        let config = driver.config();
        let client = SshClient::new(
            &config.ssh.user,
            driver.ssh_hostname().await?,
            driver.ssh_port()?,
            &config.ssh.key_path,
        );
        client.run(&self.command).await?;
        Ok(())
    }
}
