//! Parallels Desktop backend, driven through `prlctl`, `prlsrvctl` and
//! `prl_disk_tool`.

use super::{prepare_ssh_key, stage_boot_image};
use async_trait::async_trait;
use minikit_core::{Driver, Error, MachineConfig, MachineState, Result, exec, seed};
use minikit_net::lease::parallels;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

const PRLCTL: &str = "prlctl";
const PRLSRVCTL: &str = "prlsrvctl";
const PRL_DISK_TOOL: &str = "prl_disk_tool";
const HINT: &str = "install Parallels Desktop Pro or Business edition";
const SHARED_NETWORK: &str = "Shared";
const SEED_DISK_MB: u64 = 32;

/// Host side address of the shared network from `prlsrvctl net info`.
pub(crate) fn parse_shared_address(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("IPv4 address:")
            .and_then(|addr| addr.trim().parse().ok())
    })
}

/// MAC of the first adapter from `prlctl list -i`, as `mac=001C42B2FF28`.
pub(crate) fn parse_mac(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find_map(|token| token.strip_prefix("mac="))
        .map(str::to_string)
}

pub(crate) fn parse_status(output: &str) -> MachineState {
    match output.trim() {
        "running" => MachineState::Running,
        "stopped" => MachineState::Stopped,
        "paused" => MachineState::Paused,
        "suspended" => MachineState::Saved,
        "stopping" => MachineState::Stopping,
        "starting" | "resuming" => MachineState::Starting,
        _ => MachineState::Error,
    }
}

fn missing_vm(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("could not be found") || stderr.contains("failed to get vm config")
}

pub struct ParallelsDriver {
    config: MachineConfig,
}

impl ParallelsDriver {
    pub fn new(config: MachineConfig) -> Self {
        Self { config }
    }

    fn disk_image(&self) -> PathBuf {
        self.config.file(&format!("{}.hdd", self.config.name))
    }

    async fn prlctl<S: AsRef<std::ffi::OsStr>>(&self, args: &[S]) -> Result<String> {
        exec::run(exec::find_binary(PRLCTL, HINT)?, args).await
    }

    async fn disk_tool(&self, args: &[OsString]) -> Result<String> {
        exec::run(exec::find_binary(PRL_DISK_TOOL, HINT)?, args).await
    }

    /// Refuses to start unless the shared network is up on this host.
    async fn check_shared_network(&self) -> Result<()> {
        let out = exec::run(
            exec::find_binary(PRLSRVCTL, HINT)?,
            &["net", "info", SHARED_NETWORK],
        )
        .await?;
        let connected = match parse_shared_address(&out) {
            Some(addr) => minikit_net::host_has_address(addr)?,
            None => false,
        };
        if !connected {
            return Err(Error::Hypervisor(
                "the Parallels shared network is not connected to the host; restart Parallels Desktop"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Creates a small plain disk, writes the seed tar into its data file,
    /// then turns it into an expanding disk of the requested size.
    async fn create_disk(&self, public_key: Vec<u8>) -> Result<()> {
        let image = self.disk_image();
        let name = &self.config.name;
        self.prlctl(&[
            OsString::from("set"),
            name.into(),
            "--device-add".into(),
            "hdd".into(),
            "--iface".into(),
            "sata".into(),
            "--position".into(),
            "0".into(),
            "--image".into(),
            image.clone().into(),
            "--type".into(),
            "plain".into(),
            "--size".into(),
            SEED_DISK_MB.to_string().into(),
        ])
        .await?;

        let data = find_data_file(&image)?;
        tokio::task::spawn_blocking(move || seed::write_seed_in_place(&data, &public_key))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        self.disk_tool(&[
            "convert".into(),
            "--expanding".into(),
            "--merge".into(),
            "--hdd".into(),
            image.clone().into(),
        ])
        .await?;
        self.disk_tool(&[
            "resize".into(),
            "--size".into(),
            format!("{}M", self.config.resources.disk_mb).into(),
            "--hdd".into(),
            image.into(),
        ])
        .await?;
        Ok(())
    }
}

/// The `.hds` data file inside a Parallels disk bundle.
fn find_data_file(image: &Path) -> Result<PathBuf> {
    for entry in std::fs::read_dir(image)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "hds") {
            return Ok(path);
        }
    }
    Err(Error::Hypervisor(format!(
        "no .hds data file in {}",
        image.display()
    )))
}

#[async_trait]
impl Driver for ParallelsDriver {
    fn name(&self) -> &'static str {
        "parallels"
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
                driver: self.name().to_string(),
            });
        }
        for tool in [PRLCTL, PRLSRVCTL, PRL_DISK_TOOL] {
            exec::find_binary(tool, HINT)?;
        }
        self.config.validate(None)
    }

    async fn create(&mut self) -> Result<()> {
        self.config.validate(None)?;
        let public_key = prepare_ssh_key(&self.config).await?;
        let iso = stage_boot_image(&self.config).await?;
        let name = self.config.name.clone();

        self.prlctl(&[
            OsString::from("create"),
            name.clone().into(),
            "--distribution".into(),
            "boot2docker".into(),
            "--dst".into(),
            self.config.dir.clone().into(),
            "--no-hdd".into(),
        ])
        .await?;
        self.prlctl(&[
            "set".to_string(),
            name.clone(),
            "--cpus".to_string(),
            self.config.resources.cpus.to_string(),
            "--memsize".to_string(),
            self.config.resources.memory_mb.to_string(),
        ])
        .await?;
        self.prlctl(&[
            OsString::from("set"),
            name.clone().into(),
            "--device-set".into(),
            "cdrom0".into(),
            "--image".into(),
            iso.into(),
            "--connect".into(),
        ])
        .await?;
        self.prlctl(&["set", &name, "--device-bootorder", "cdrom0 hdd0"])
            .await?;
        self.create_disk(public_key).await?;

        if !self.config.mounts.is_empty() {
            self.prlctl(&["set", &name, "--shf-host", "on"]).await?;
            for mount in &self.config.mounts {
                self.prlctl(&[
                    OsString::from("set"),
                    name.clone().into(),
                    "--shf-host-add".into(),
                    mount.tag.clone().into(),
                    "--path".into(),
                    mount.host_path.clone().into(),
                ])
                .await?;
            }
        }
        tracing::info!(machine = %name, "created Parallels VM");
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.check_shared_network().await?;
        match self.state().await? {
            MachineState::Running => {}
            MachineState::Paused | MachineState::Saved => {
                self.prlctl(&["resume", &self.config.name]).await?;
            }
            _ => {
                self.prlctl(&["start", &self.config.name]).await?;
            }
        }
        let info = self.prlctl(&["list", "-i", &self.config.name]).await?;
        let mac = parse_mac(&info)
            .ok_or_else(|| Error::Hypervisor("no MAC address in prlctl output".to_string()))?;
        let mac = minikit_net::mac::canonical(&mac)?;
        self.config.set_mac(mac)?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state().await? != MachineState::Running {
            return Ok(());
        }
        self.prlctl(&["stop", &self.config.name]).await?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if self.state().await? != MachineState::Running {
            return Ok(());
        }
        self.prlctl(&["stop", &self.config.name, "--kill"]).await?;
        Ok(())
    }

    async fn restart(&mut self) -> Result<()> {
        self.prlctl(&["restart", &self.config.name]).await?;
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        match self.state().await? {
            MachineState::None => return Ok(()),
            MachineState::Running => {
                self.prlctl(&["stop", &self.config.name, "--kill"]).await?;
            }
            _ => {}
        }
        self.prlctl(&["delete", &self.config.name]).await?;
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        let prlctl = exec::find_binary(PRLCTL, HINT)?;
        let out = exec::run_unchecked(
            prlctl,
            &["list", &self.config.name, "--output", "status", "--no-header"],
        )
        .await?;
        if !out.success {
            if missing_vm(&out.stderr) {
                return Ok(MachineState::None);
            }
            return Err(Error::CommandFailed {
                command: "prlctl list".to_string(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(parse_status(&out.stdout))
    }

    async fn ip(&self) -> Result<IpAddr> {
        let mac = self.config.mac.clone().unwrap_or_default();
        if mac.is_empty() {
            return Err(Error::NoIpAddress { mac });
        }
        parallels::lookup(Path::new(parallels::DEFAULT_PATH), &mac)
            .await?
            .map(IpAddr::V4)
            .ok_or(Error::NoIpAddress { mac })
    }
}
