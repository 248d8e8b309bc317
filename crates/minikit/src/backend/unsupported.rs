use async_trait::async_trait;
use minikit_core::{Driver, Error, MachineConfig, MachineState, Result};
use std::net::IpAddr;

/// Stands in for a backend that is not built for this host. Every
/// operation reports the backend as unsupported.
pub struct UnsupportedDriver {
    config: MachineConfig,
}

impl UnsupportedDriver {
    pub fn new(config: MachineConfig) -> Self {
        Self { config }
    }

    fn unsupported(&self) -> Error {
        Error::Unsupported {
            driver: self.config.driver.to_string(),
        }
    }
}

#[async_trait]
impl Driver for UnsupportedDriver {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut MachineConfig {
        &mut self.config
    }

    async fn pre_create_check(&self) -> Result<()> {
        Err(self.unsupported())
    }

    async fn create(&mut self) -> Result<()> {
        Err(self.unsupported())
    }

    async fn start(&mut self) -> Result<()> {
        Err(self.unsupported())
    }

    async fn stop(&mut self) -> Result<()> {
        Err(self.unsupported())
    }

    async fn kill(&mut self) -> Result<()> {
        Err(self.unsupported())
    }

    async fn remove(&mut self) -> Result<()> {
        Err(self.unsupported())
    }

    async fn state(&self) -> Result<MachineState> {
        Err(self.unsupported())
    }

    async fn ip(&self) -> Result<IpAddr> {
        Err(self.unsupported())
    }

    fn supports_ssh(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minikit_core::{DriverKind, ErrorKind};

    #[tokio::test]
    async fn every_operation_is_unsupported() {
        let mut driver =
            UnsupportedDriver::new(MachineConfig::new("m", DriverKind::Parallels, "/tmp/m"));
        assert_eq!(
            driver.pre_create_check().await.unwrap_err().kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(driver.start().await.unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(driver.state().await.unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(driver.ssh_port().unwrap_err().kind(), ErrorKind::Unsupported);
        assert!(
            driver
                .pre_create_check()
                .await
                .unwrap_err()
                .to_string()
                .contains("parallels")
        );
    }
}
