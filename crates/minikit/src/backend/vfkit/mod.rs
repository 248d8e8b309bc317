//! vfkit backend: the VM monitor runs as our own child process and is
//! driven over its REST socket.

mod monitor;
mod vmnet;

pub use monitor::{MonitorClient, StateRequest};
pub use vmnet::{DEFAULT_HELPER_PATH, VmnetHelper};

use super::{prepare_ssh_key, shell_quote, stage_boot_image};
use async_trait::async_trait;
use minikit_core::seed::{self, MIB};
use minikit_core::{
    ChildProcess, Driver, Error, MachineConfig, MachineState, NetworkMode, Result, SshClient,
    exec,
};
use minikit_net::lease::bootpd;
use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

const VFKIT: &str = "vfkit";
const OPTION_SEPARATOR: char = ',';
const EARLY_EXIT_GRACE: Duration = Duration::from_millis(500);
const STOP_POLL: Duration = Duration::from_secs(1);

const ROSETTA_TAG: &str = "rosetta";
const ROSETTA_MOUNT: &str = "/mnt/rosetta";
const ROSETTA_BINFMT: &str = r":rosetta:M::\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\x3e\x00:\xff\xff\xff\xff\xff\xfe\xfe\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff:/mnt/rosetta/rosetta:F";

/// Command line for the monitor. `helper_socket` is set when the guest
/// network goes through vmnet-helper.
pub(crate) fn monitor_args(config: &MachineConfig, helper_socket: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "--bootloader".to_string(),
        format!(
            "efi,variable-store={},create",
            config.file("efistore.nvram").display()
        ),
        "--memory".to_string(),
        config.resources.memory_mb.to_string(),
        "--cpus".to_string(),
        config.resources.cpus.to_string(),
        "--restful-uri".to_string(),
        format!("unix://{}", config.file("vfkit.sock").display()),
    ];
    let mut device = |spec: String| {
        args.push("--device".to_string());
        args.push(spec);
    };

    let mac = config.mac.as_deref().unwrap_or_default();
    match helper_socket {
        Some(socket) => device(format!(
            "virtio-net,unixSocketPath={},mac={mac}",
            socket.display()
        )),
        None => device(format!("virtio-net,nat,mac={mac}")),
    }
    device(format!("virtio-blk,path={}", config.iso_path().display()));
    device(format!("virtio-blk,path={}", config.disk_path().display()));
    for i in 0..config.extra_disks {
        device(format!(
            "virtio-blk,path={}",
            config.extra_disk_path(i).display()
        ));
    }
    device(format!(
        "virtio-serial,logFilePath={}",
        config.file("serial.log").display()
    ));
    device("virtio-rng".to_string());
    for mount in &config.mounts {
        device(format!(
            "virtio-fs,sharedDir={},mountTag={}",
            mount.host_path.display(),
            mount.tag
        ));
    }
    if config.vfkit.rosetta {
        device(format!("rosetta,mountTag={ROSETTA_TAG}"));
    }
    args
}

/// Guest commands that mount every virtio-fs share, skipping mounted ones.
pub(crate) fn mount_commands(config: &MachineConfig) -> Vec<String> {
    config
        .mounts
        .iter()
        .map(|mount| {
            let guest = shell_quote(&mount.guest_path);
            format!(
                "mountpoint -q {guest} || (sudo mkdir -p {guest} && sudo mount -t virtiofs {} {guest})",
                shell_quote(&mount.tag)
            )
        })
        .collect()
}

pub(crate) fn rosetta_commands() -> Vec<String> {
    vec![
        format!(
            "mountpoint -q {ROSETTA_MOUNT} || (sudo mkdir -p {ROSETTA_MOUNT} && sudo mount -t virtiofs {ROSETTA_TAG} {ROSETTA_MOUNT})"
        ),
        format!(
            "test -e /proc/sys/fs/binfmt_misc/rosetta || echo '{ROSETTA_BINFMT}' | sudo tee /proc/sys/fs/binfmt_misc/register > /dev/null"
        ),
    ]
}

pub struct VfkitDriver {
    config: MachineConfig,
    monitor: ChildProcess,
    client: MonitorClient,
}

impl VfkitDriver {
    pub fn new(config: MachineConfig) -> Self {
        let monitor = ChildProcess::new(config.file("vfkit.pid"), VFKIT);
        let client = MonitorClient::new(config.file("vfkit.sock"));
        Self {
            config,
            monitor,
            client,
        }
    }

    fn helper(&self) -> Option<VmnetHelper> {
        match self.config.network {
            NetworkMode::SharedVmnet => Some(VmnetHelper::new(
                &self.config,
                self.config.vfkit.interface_id.unwrap_or_default(),
            )),
            _ => None,
        }
    }

    fn check_network(&self) -> Result<()> {
        match &self.config.network {
            NetworkMode::Custom(name) => Err(Error::InvalidConfig(format!(
                "vfkit supports the nat and shared-vmnet networks, not '{name}'"
            ))),
            _ => Ok(()),
        }
    }

    /// Brings up vmnet-helper when the machine uses the shared network and
    /// records the MAC it hands out.
    async fn start_helper(&mut self) -> Result<Option<VmnetHelper>> {
        let Some(mut helper) = self.helper() else {
            return Ok(None);
        };
        if helper.child().state()? == MachineState::Running {
            tracing::warn!("vmnet-helper left over from a previous start, killing it");
            helper.kill()?;
        }
        let elevated = helper.requires_elevation().await;
        let mac = helper.start(elevated).await?;
        self.config.vfkit.helper_elevated = elevated;
        if let Err(e) = self.config.set_mac(mac) {
            if let Err(kill_err) = helper.kill() {
                tracing::warn!("stopping vmnet-helper failed: {kill_err}");
            }
            return Err(e);
        }
        Ok(Some(helper))
    }

    async fn launch_monitor(&self, helper_socket: Option<&Path>) -> Result<()> {
        let vfkit = exec::find_binary(VFKIT, "install vfkit with `brew install vfkit`")?;
        let _ = tokio::fs::remove_file(self.client.socket()).await;

        let log_path = self.config.file("vfkit.log");
        let log = std::fs::File::create(&log_path)?;
        let args = monitor_args(&self.config, helper_socket);
        tracing::debug!("executing: {} {}", vfkit.display(), args.join(" "));

        let mut child = Command::new(&vfkit)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Hypervisor("vfkit exited immediately".to_string()))?;
        self.monitor.record(pid)?;

        tokio::time::sleep(EARLY_EXIT_GRACE).await;
        if let Some(status) = child.try_wait()? {
            self.monitor.remove_pidfile()?;
            return Err(Error::Hypervisor(format!(
                "vfkit exited with {status}, see {}",
                log_path.display()
            )));
        }
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(pid, %status, "vfkit exited"),
                Err(e) => tracing::debug!(pid, "waiting for vfkit failed: {e}"),
            }
        });
        tracing::info!(pid, machine = %self.config.name, "started vfkit");
        Ok(())
    }

    async fn stop_helper(&self) -> Result<()> {
        match self.helper() {
            Some(helper) => helper.stop().await,
            None => Ok(()),
        }
    }

    fn ssh_client(&self, ip: IpAddr) -> SshClient {
        SshClient::new(
            &self.config.ssh.user,
            ip.to_string(),
            self.config.ssh.port,
            &self.config.ssh.key_path,
        )
    }
}

#[async_trait]
impl Driver for VfkitDriver {
    fn name(&self) -> &'static str {
        VFKIT
    }

    fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut MachineConfig {
        &mut self.config
    }

    async fn pre_create_check(&self) -> Result<()> {
        if !cfg!(target_os = "macos") {
            return Err(Error::Unsupported {
                driver: VFKIT.to_string(),
            });
        }
        exec::find_binary(VFKIT, "install vfkit with `brew install vfkit`")?;
        self.check_network()?;
        if let Some(helper) = self.helper()
            && !helper.path().exists()
        {
            return Err(Error::BinaryNotFound {
                name: "vmnet-helper".to_string(),
                hint: format!("expected at {}", helper.path().display()),
            });
        }
        self.config.validate(Some(OPTION_SEPARATOR))
    }

    async fn create(&mut self) -> Result<()> {
        self.config.validate(Some(OPTION_SEPARATOR))?;
        self.check_network()?;

        let public_key = prepare_ssh_key(&self.config).await?;
        stage_boot_image(&self.config).await?;

        let disk = self.config.disk_path();
        let disk_mb = self.config.resources.disk_mb;
        tokio::task::spawn_blocking(move || seed::write_seed_disk(&disk, &public_key, disk_mb))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        for i in 0..self.config.extra_disks {
            let file = std::fs::File::create(self.config.extra_disk_path(i))?;
            file.set_len(disk_mb * MIB)?;
        }

        match self.config.network {
            NetworkMode::Nat => {
                if self.config.mac.is_none() {
                    self.config.set_mac(minikit_net::mac::generate())?;
                }
            }
            NetworkMode::SharedVmnet => {
                self.config.vfkit.interface_id.get_or_insert_with(Uuid::new_v4);
            }
            NetworkMode::Custom(_) => {}
        }
        tracing::info!(machine = %self.config.name, dir = %self.config.dir.display(), "created vfkit machine");
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.monitor.state()? == MachineState::Running {
            match self.client.state().await {
                Ok(MachineState::Paused) => {
                    tracing::info!(machine = %self.config.name, "resuming paused VM");
                    return self.client.set_state(StateRequest::Resume).await;
                }
                Ok(MachineState::Stopped | MachineState::Stopping) => {
                    tracing::info!(machine = %self.config.name, "waiting for vfkit to exit before relaunch");
                    self.monitor.wait_stopped(STOP_POLL).await?;
                }
                _ => {
                    tracing::info!(machine = %self.config.name, "vfkit already running");
                    return Ok(());
                }
            }
        }
        let helper = self.start_helper().await?;
        let socket = helper.as_ref().map(|h| h.socket().to_path_buf());
        if let Err(e) = self.launch_monitor(socket.as_deref()).await {
            if let Some(helper) = helper
                && let Err(kill_err) = helper.kill()
            {
                tracing::warn!("stopping vmnet-helper after failed start: {kill_err}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.monitor.state()? == MachineState::Running {
            if let Err(e) = self.client.set_state(StateRequest::Stop).await {
                tracing::warn!("stop request failed, terminating vfkit: {e}");
                self.monitor.terminate()?;
            }
            self.monitor.wait_stopped(STOP_POLL).await?;
            tracing::info!(machine = %self.config.name, "vfkit stopped");
        }
        self.stop_helper().await?;
        let _ = tokio::fs::remove_file(self.client.socket()).await;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if self.monitor.state()? == MachineState::Running
            && let Err(e) = self.client.set_state(StateRequest::HardStop).await
        {
            tracing::warn!("hard stop request failed, killing vfkit: {e}");
            self.monitor.kill()?;
        }
        if let Some(helper) = self.helper() {
            helper.kill()?;
        }
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        if self.monitor.state()? == MachineState::Running {
            self.monitor.kill()?;
        }
        if let Some(helper) = self.helper() {
            helper.kill()?;
        }
        self.monitor.remove_pidfile()?;
        let _ = tokio::fs::remove_file(self.client.socket()).await;
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        if self.monitor.state()? == MachineState::Running {
            return match self.client.state().await {
                // The process outlives the VM for a moment after a stop.
                Ok(MachineState::Stopped) => Ok(MachineState::Stopping),
                Ok(state) => Ok(state),
                Err(e) => {
                    tracing::warn!("vfkit is running but its socket is not answering: {e}");
                    Ok(MachineState::Running)
                }
            };
        }
        if let Some(helper) = self.helper()
            && helper.child().state()? == MachineState::Running
        {
            return Ok(MachineState::Running);
        }
        Ok(MachineState::Stopped)
    }

    async fn ip(&self) -> Result<IpAddr> {
        let mac = self.config.mac.clone().unwrap_or_default();
        if mac.is_empty() {
            return Err(Error::NoIpAddress { mac });
        }
        bootpd::lookup(Path::new(bootpd::DEFAULT_PATH), &mac)
            .await?
            .map(IpAddr::V4)
            .ok_or(Error::NoIpAddress { mac })
    }

    fn uses_host_dhcp(&self) -> bool {
        true
    }

    async fn post_start(&self) -> Result<()> {
        let mut commands = Vec::new();
        if self.config.vfkit.rosetta {
            commands.extend(rosetta_commands());
        }
        commands.extend(mount_commands(&self.config));
        if commands.is_empty() {
            return Ok(());
        }
        let ssh = self.ssh_client(self.ip().await?);
        for command in commands {
            ssh.run(&command).await?;
        }
        tracing::info!(
            mounts = self.config.mounts.len(),
            rosetta = self.config.vfkit.rosetta,
            "guest shares ready"
        );
        Ok(())
    }
}
