//! Drives a machine through create / start / stop / remove, tying the
//! backend to address discovery, SSH readiness, bootstrapping and the
//! credential file.

use crate::backend::HostDrivers;
use crate::bootstrap::{Bootstrapper, NoopBootstrapper};
use crate::machine::MachineStore;
use minikit_core::{
    Driver, DriverKind, Error, MachineConfig, MachineState, Result, RetryPolicy, host, ssh,
};
use minikit_kubeconfig::{CertPaths, Endpoint, KubeconfigStore, change_none_user};
use minikit_net::{BOOTPD, Firewall};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Asks the user before the coordinator does something privileged on
/// their behalf.
pub trait Consent: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Answers every prompt the same way.
#[derive(Debug, Clone, Copy)]
pub struct AutoConsent(pub bool);

impl Consent for AutoConsent {
    fn confirm(&self, prompt: &str) -> bool {
        tracing::debug!(answer = self.0, "{prompt}");
        self.0
    }
}

/// Builds the driver for a machine record.
pub trait DriverFactory: Send + Sync {
    fn driver(&self, config: MachineConfig) -> Box<dyn Driver>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Leave `current-context` alone when updating the credential file.
    pub keep_context: bool,
    /// Budget for the graceful stop during a rollback before killing.
    pub stop_timeout: Duration,
    pub stop_poll: Duration,
    /// Overrides nested-VM detection when set.
    pub nested: Option<bool>,
    /// Overrides the address discovery policy when set.
    pub ip_policy: Option<RetryPolicy>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            keep_context: false,
            stop_timeout: Duration::from_secs(30),
            stop_poll: Duration::from_secs(1),
            nested: None,
            ip_policy: None,
        }
    }
}

pub struct Coordinator {
    store: MachineStore,
    kubeconfig: KubeconfigStore,
    firewall: Option<Arc<dyn Firewall>>,
    consent: Arc<dyn Consent>,
    bootstrapper: Arc<dyn Bootstrapper>,
    factory: Arc<dyn DriverFactory>,
    options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(store: MachineStore, kubeconfig: KubeconfigStore) -> Self {
        Self {
            store,
            kubeconfig,
            firewall: None,
            consent: Arc::new(AutoConsent(false)),
            bootstrapper: Arc::new(NoopBootstrapper),
            factory: Arc::new(HostDrivers),
            options: CoordinatorOptions::default(),
        }
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    pub fn with_consent(mut self, consent: Arc<dyn Consent>) -> Self {
        self.consent = consent;
        self
    }

    pub fn with_bootstrapper(mut self, bootstrapper: Arc<dyn Bootstrapper>) -> Self {
        self.bootstrapper = bootstrapper;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &MachineStore {
        &self.store
    }

    fn driver(&self, name: &str) -> Result<Box<dyn Driver>> {
        Ok(self.factory.driver(self.store.load(name)?))
    }

    /// Credential store for a machine. Files written for the no-VM driver
    /// can be handed back to the user who ran sudo.
    fn kubeconfig_for(&self, driver: DriverKind) -> KubeconfigStore {
        self.kubeconfig
            .clone()
            .with_chown_to_invoker(driver == DriverKind::None && change_none_user())
    }

    /// Runs the backend's checks and creates the machine. Creating an
    /// existing machine is a no-op.
    pub async fn create(&self, config: MachineConfig) -> Result<()> {
        let name = config.name.clone();
        if self.store.exists(&name) {
            tracing::info!(machine = %name, "machine already exists");
            return Ok(());
        }
        let mut driver = self.factory.driver(config);
        driver.pre_create_check().await?;
        tokio::fs::create_dir_all(driver.config().dir()).await?;

        if let Err(e) = driver.create().await {
            tracing::warn!(machine = %name, "create failed, cleaning up: {e}");
            if let Err(remove_err) = driver.remove().await {
                tracing::warn!(machine = %name, "removing partial machine failed: {remove_err}");
            }
            self.store.remove(&name)?;
            return Err(e);
        }
        self.store.save(driver.config())?;
        tracing::info!(machine = %name, driver = driver.name(), "created machine");
        Ok(())
    }

    /// Starts the machine and returns once the credential file points at
    /// it. The backend start always runs: it brings up whatever part of the
    /// machine is down and leaves a running VM alone. Everything after the
    /// launch reruns.
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<IpAddr> {
        let mut driver = self.driver(name)?;

        let before = driver.state().await?;
        tracing::info!(machine = %name, driver = driver.name(), state = %before, "starting machine");
        driver.start().await?;
        self.store.save(driver.config())?;

        match self.bring_up(&*driver, cancel).await {
            Ok(ip) => {
                self.store.save(driver.config())?;
                tracing::info!(machine = %name, %ip, "machine is ready");
                Ok(ip)
            }
            Err(e) => {
                if !before.is_live() || matches!(e, Error::Cancelled) {
                    self.rollback(&mut *driver).await;
                }
                Err(e)
            }
        }
    }

    async fn bring_up(&self, driver: &dyn Driver, cancel: &CancellationToken) -> Result<IpAddr> {
        let ip = self.wait_for_ip(driver, cancel).await?;
        tracing::info!(%ip, "guest has an address");

        if driver.supports_ssh() {
            let addr = SocketAddr::new(ip, driver.ssh_port()?);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = ssh::wait_for_ssh(addr) => {}
            }
            tracing::info!(%addr, "SSH is up");
        }

        driver.post_start().await?;
        self.bootstrapper.bootstrap(driver, ip).await?;
        self.update_credentials(driver.config(), ip).await?;
        Ok(ip)
    }

    async fn ip_policy(&self) -> RetryPolicy {
        if let Some(policy) = self.options.ip_policy {
            return policy;
        }
        let nested = match self.options.nested {
            Some(nested) => nested,
            None => host::is_nested_vm().await,
        };
        RetryPolicy::ip_discovery(nested)
    }

    async fn poll_ip(
        &self,
        driver: &dyn Driver,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<IpAddr> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = policy.retry(|| driver.ip()) => result,
        }
    }

    /// Polls for the guest address. When the guest depends on the host
    /// DHCP daemon and the firewall turns out to be blocking it, the
    /// daemon is unblocked (with consent) and the poll runs once more.
    async fn wait_for_ip(&self, driver: &dyn Driver, cancel: &CancellationToken) -> Result<IpAddr> {
        let policy = self.ip_policy().await;
        let err = match self.poll_ip(driver, policy, cancel).await {
            Ok(ip) => return Ok(ip),
            Err(e) => e,
        };
        let Some(firewall) = &self.firewall else {
            return Err(err);
        };
        if !err.is_no_ip_address() || !driver.uses_host_dhcp() {
            return Err(err);
        }
        self.unblock_dhcp(firewall.as_ref(), err).await?;
        self.poll_ip(driver, policy, cancel).await
    }

    async fn unblock_dhcp(&self, firewall: &dyn Firewall, err: Error) -> Result<()> {
        let bootpd = Path::new(BOOTPD);
        if !firewall.is_blocking(bootpd).await? {
            return Err(err);
        }
        tracing::warn!("the application firewall is blocking {BOOTPD}");
        let prompt = format!(
            "The macOS firewall is blocking {BOOTPD}, so the VM cannot get an address. Add and unblock it (requires sudo)?"
        );
        if !self.consent.confirm(&prompt) {
            return Err(Error::FirewallBlocked(BOOTPD.to_string()));
        }
        firewall.unblock(bootpd).await?;
        tracing::info!("unblocked {BOOTPD}, retrying address discovery");
        Ok(())
    }

    async fn update_credentials(&self, config: &MachineConfig, ip: IpAddr) -> Result<()> {
        let endpoint = Endpoint {
            name: config.name.clone(),
            host: ip.to_string(),
            port: config.api_server_port,
            certs: CertPaths::for_machine(config.dir()),
            keep_context: self.options.keep_context,
        };
        let store = self.kubeconfig_for(config.driver);
        // Runs to completion even if the caller gives up on the start.
        tokio::task::spawn_blocking(move || store.update(&endpoint))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Best-effort stop after a failed start: graceful within the stop
    /// budget, then forceful.
    async fn rollback(&self, driver: &mut dyn Driver) {
        tracing::warn!(machine = %driver.config().name, "start did not complete, stopping machine");
        let stopped = match tokio::time::timeout(self.options.stop_timeout, driver.stop()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("stop during rollback failed: {e}");
                false
            }
            Err(_) => {
                tracing::warn!("stop during rollback timed out");
                false
            }
        };
        if !stopped && let Err(e) = driver.kill().await {
            tracing::warn!("kill during rollback failed: {e}");
        }
    }

    /// Polls every `stop_poll` until the machine settles in a state that
    /// holds no running VM. No deadline; callers impose their own.
    async fn wait_until_stopped(&self, driver: &dyn Driver) -> Result<MachineState> {
        loop {
            let state = driver.state().await?;
            if !state.is_live() || matches!(state, MachineState::Saved | MachineState::Error) {
                return Ok(state);
            }
            tokio::time::sleep(self.options.stop_poll).await;
        }
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut driver = self.driver(name)?;
        if !driver.state().await?.is_live() {
            tracing::info!(machine = %name, "machine already stopped");
            return Ok(());
        }
        driver.stop().await?;
        let state = self.wait_until_stopped(&*driver).await?;
        self.store.save(driver.config())?;
        tracing::info!(machine = %name, %state, "machine stopped");
        Ok(())
    }

    pub async fn kill(&self, name: &str) -> Result<()> {
        let mut driver = self.driver(name)?;
        if !driver.state().await?.is_live() {
            tracing::info!(machine = %name, "machine already stopped");
            return Ok(());
        }
        driver.kill().await?;
        self.wait_until_stopped(&*driver).await?;
        tracing::info!(machine = %name, "machine killed");
        Ok(())
    }

    /// Removes the machine, its record and its credential entries. A
    /// missing machine is not an error.
    pub async fn remove(&self, name: &str) -> Result<()> {
        if !self.store.exists(name) {
            tracing::info!(machine = %name, "machine does not exist");
            return Ok(());
        }
        let mut driver = self.driver(name)?;
        if driver.state().await?.is_live() {
            driver.kill().await?;
            self.wait_until_stopped(&*driver).await?;
        }
        driver.remove().await?;

        let store = self.kubeconfig_for(driver.config().driver);
        let context = name.to_string();
        tokio::task::spawn_blocking(move || store.delete_context(&context))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        self.store.remove(name)?;
        tracing::info!(machine = %name, "machine removed");
        Ok(())
    }

    /// `None` for a machine that does not exist.
    pub async fn status(&self, name: &str) -> Result<MachineState> {
        if !self.store.exists(name) {
            return Ok(MachineState::None);
        }
        self.driver(name)?.state().await
    }

    pub async fn ip(&self, name: &str) -> Result<IpAddr> {
        self.driver(name)?.ip().await
    }

    /// Points the credential file at the machine's current address.
    pub async fn update_context(&self, name: &str) -> Result<IpAddr> {
        let driver = self.driver(name)?;
        let ip = driver.ip().await?;
        self.update_credentials(driver.config(), ip).await?;
        Ok(ip)
    }
}
