//! Hyper-V backend, driven through PowerShell cmdlets.

use super::{prepare_ssh_key, single_quote, stage_boot_image};
use async_trait::async_trait;
use minikit_core::exec::{self, CommandOutput};
use minikit_core::seed;
use minikit_core::{Driver, Error, MachineConfig, MachineState, Result};
use std::net::IpAddr;
use std::path::PathBuf;

pub const DEFAULT_SWITCH: &str = "Default Switch";

const ADMINISTRATORS_SID: &str = "S-1-5-32-544";
const HYPERV_ADMINISTRATORS_SID: &str = "S-1-5-32-578";
const SEED_VHD_MB: u64 = 10;

fn is_in_role(sid: &str) -> String {
    format!(
        "([Security.Principal.WindowsPrincipal][Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole([System.Security.Principal.SecurityIdentifier]::new(\"{sid}\"))"
    )
}

/// PowerShell prints warnings before the value; only the last non-empty
/// line is the answer.
pub(crate) fn is_true(output: &str) -> bool {
    output
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .is_some_and(|line| line == "True")
}

pub(crate) fn parse_vm_state(output: &str) -> MachineState {
    match output.trim() {
        "Running" => MachineState::Running,
        "Off" => MachineState::Stopped,
        "Starting" => MachineState::Starting,
        "Stopping" => MachineState::Stopping,
        "Paused" => MachineState::Paused,
        "Saved" => MachineState::Saved,
        _ => MachineState::Error,
    }
}

/// Picks the switch to attach to: the configured one, or the host's
/// default switch.
pub(crate) fn resolve_switch(configured: Option<&str>, available: &[String]) -> Result<String> {
    let wanted = configured.unwrap_or(DEFAULT_SWITCH);
    if available.iter().any(|name| name == wanted) {
        Ok(wanted.to_string())
    } else {
        Err(Error::VirtualSwitchNotFound(wanted.to_string()))
    }
}

/// Cmdlets that define the VM once its boot disk exists.
pub(crate) fn define_vm_commands(config: &MachineConfig, switch: &str) -> Result<Vec<String>> {
    let vm = single_quote(&config.name);
    let mut commands = vec![
        format!(
            "Hyper-V\\New-VM -Name {vm} -Path {} -SwitchName {} -MemoryStartupBytes {}MB",
            single_quote(&config.dir.display().to_string()),
            single_quote(switch),
            config.resources.memory_mb
        ),
    ];
    let mut processor = format!(
        "Hyper-V\\Set-VMProcessor {vm} -Count {}",
        config.resources.cpus
    );
    if config.hyperv.nested_virtualization {
        processor.push_str(" -ExposeVirtualizationExtensions $true");
    }
    commands.push(processor);
    if let Some(vlan) = config.hyperv.vlan_id {
        commands.push(format!(
            "Hyper-V\\Set-VMNetworkAdapterVlan -VMName {vm} -Access -VlanId {vlan}"
        ));
    }
    if let Some(mac) = &config.mac {
        commands.push(format!(
            "Hyper-V\\Set-VMNetworkAdapter -VMName {vm} -StaticMacAddress {}",
            single_quote(&minikit_net::mac::dashed_upper(mac)?)
        ));
    }
    commands.push(format!(
        "Hyper-V\\Set-VMDvdDrive -VMName {vm} -Path {}",
        single_quote(&config.iso_path().display().to_string())
    ));
    commands.push(format!(
        "Hyper-V\\Add-VMHardDiskDrive -VMName {vm} -Path {}",
        single_quote(&vhd_path(config).display().to_string())
    ));
    for i in 0..config.extra_disks {
        let path = single_quote(&extra_vhd_path(config, i).display().to_string());
        commands.push(format!(
            "Hyper-V\\New-VHD -Path {path} -SizeBytes {}MB -Dynamic",
            config.resources.disk_mb
        ));
        commands.push(format!("Hyper-V\\Add-VMHardDiskDrive -VMName {vm} -Path {path}"));
    }
    Ok(commands)
}

fn vhd_path(config: &MachineConfig) -> PathBuf {
    config.file("disk.vhd")
}

fn extra_vhd_path(config: &MachineConfig, index: u32) -> PathBuf {
    config.file(&format!("extra-disk-{index}.vhd"))
}

pub struct HypervDriver {
    config: MachineConfig,
    powershell: Option<PathBuf>,
}

impl HypervDriver {
    pub fn new(config: MachineConfig) -> Self {
        let powershell = exec::find_binary("powershell", "").ok();
        Self { config, powershell }
    }

    fn vm(&self) -> String {
        single_quote(&self.config.name)
    }

    async fn ps_unchecked(&self, script: &str) -> Result<CommandOutput> {
        let powershell = self.powershell.as_ref().ok_or(Error::PowershellMissing)?;
        exec::run_unchecked(powershell, &["-NoProfile", "-NonInteractive", script]).await
    }

    async fn ps(&self, script: &str) -> Result<String> {
        let powershell = self.powershell.as_ref().ok_or(Error::PowershellMissing)?;
        exec::run(powershell, &["-NoProfile", "-NonInteractive", script]).await
    }

    async fn switches(&self) -> Result<Vec<String>> {
        let out = self
            .ps("[Console]::OutputEncoding = [Text.Encoding]::UTF8; Hyper-V\\Get-VMSwitch | Select-Object -ExpandProperty Name")
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn create_boot_disk(&self) -> Result<()> {
        let public_key = prepare_ssh_key(&self.config).await?;
        let fixed = self.config.file("fixed.vhd");
        let fixed_quoted = single_quote(&fixed.display().to_string());
        let disk = single_quote(&vhd_path(&self.config).display().to_string());

        self.ps(&format!(
            "Hyper-V\\New-VHD -Path {fixed_quoted} -SizeBytes {SEED_VHD_MB}MB -Fixed"
        ))
        .await?;
        // A fixed VHD is raw data followed by a footer, so the tar can go
        // straight at offset zero.
        tokio::task::spawn_blocking(move || seed::write_seed_in_place(&fixed, &public_key))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        self.ps(&format!(
            "Hyper-V\\Convert-VHD -Path {fixed_quoted} -DestinationPath {disk} -VHDType Dynamic -DeleteSource"
        ))
        .await?;
        self.ps(&format!(
            "Hyper-V\\Resize-VHD -Path {disk} -SizeBytes {}MB",
            self.config.resources.disk_mb
        ))
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for HypervDriver {
    fn name(&self) -> &'static str {
        "hyperv"
    }

    fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut MachineConfig {
        &mut self.config
    }

    async fn pre_create_check(&self) -> Result<()> {
        if self.powershell.is_none() {
            return Err(Error::PowershellMissing);
        }
        let modules = self
            .ps("@(Get-Module -ListAvailable hyper-v).Name | Get-Unique")
            .await?;
        if !modules.lines().any(|line| line.trim() == "Hyper-V") {
            return Err(Error::HypervModuleMissing);
        }
        if !is_true(&self.ps(&is_in_role(ADMINISTRATORS_SID)).await?)
            && !is_true(&self.ps(&is_in_role(HYPERV_ADMINISTRATORS_SID)).await?)
        {
            return Err(Error::InsufficientPrivileges(
                "hyperv commands have to be run as an Administrator or a member of Hyper-V Administrators".to_string(),
            ));
        }
        resolve_switch(self.config.hyperv.switch.as_deref(), &self.switches().await?)?;
        self.config.validate(None)
    }

    async fn create(&mut self) -> Result<()> {
        self.config.validate(None)?;
        let switch = resolve_switch(self.config.hyperv.switch.as_deref(), &self.switches().await?)?;
        stage_boot_image(&self.config).await?;
        self.create_boot_disk().await?;
        for command in define_vm_commands(&self.config, &switch)? {
            self.ps(&command).await?;
        }
        self.config.hyperv.switch = Some(switch);
        tracing::info!(machine = %self.config.name, "created Hyper-V VM");
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        // Start-VM also resumes paused and saved machines.
        if self.state().await? != MachineState::Running {
            self.ps(&format!("Hyper-V\\Start-VM {}", self.vm())).await?;
        }
        let mac = self
            .ps(&format!(
                "(Hyper-V\\Get-VMNetworkAdapter -VMName {}).MacAddress",
                self.vm()
            ))
            .await?;
        let mac = minikit_net::mac::canonical(mac.trim())?;
        self.config.set_mac(mac)?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state().await? != MachineState::Running {
            return Ok(());
        }
        self.ps(&format!("Hyper-V\\Stop-VM {}", self.vm())).await?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if self.state().await? != MachineState::Running {
            return Ok(());
        }
        self.ps(&format!("Hyper-V\\Stop-VM {} -TurnOff", self.vm()))
            .await?;
        Ok(())
    }

    async fn restart(&mut self) -> Result<()> {
        self.ps(&format!("Hyper-V\\Restart-VM {} -Force", self.vm()))
            .await?;
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        if self.state().await? == MachineState::None {
            return Ok(());
        }
        self.ps(&format!("Hyper-V\\Remove-VM {} -Force", self.vm()))
            .await?;
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        let out = self
            .ps_unchecked(&format!("(Hyper-V\\Get-VM {}).state", self.vm()))
            .await?;
        if !out.success {
            if out
                .stderr
                .to_lowercase()
                .contains("unable to find a virtual machine")
            {
                return Ok(MachineState::None);
            }
            return Err(Error::CommandFailed {
                command: "Get-VM".to_string(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(parse_vm_state(&out.stdout))
    }

    async fn ip(&self) -> Result<IpAddr> {
        let out = self
            .ps(&format!(
                "((Hyper-V\\Get-VM {}).networkadapters[0]).ipaddresses[0]",
                self.vm()
            ))
            .await?;
        let mac = self.config.mac.clone().unwrap_or_default();
        let addr = out.trim();
        if addr.is_empty() {
            return Err(Error::NoIpAddress { mac });
        }
        addr.parse()
            .map_err(|_| Error::Hypervisor(format!("unexpected address {addr:?} for {mac}")))
    }
}
