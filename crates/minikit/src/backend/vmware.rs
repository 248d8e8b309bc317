//! VMware Workstation / Fusion backend, driven through `vmrun`.

use super::{prepare_ssh_key, shell_quote, stage_boot_image};
use async_trait::async_trait;
use minikit_core::{
    Driver, Error, MachineConfig, MachineState, NetworkMode, Result, RetryPolicy, exec, seed,
};
use minikit_net::lease::isc;
use std::ffi::OsString;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

const FUSION_LIBRARY: &str = "/Applications/VMware Fusion.app/Contents/Library";

const GUEST_USER: &str = "docker";
const GUEST_PASSWORD: &str = "tcuser";
const GUEST_PERSIST_DIR: &str = "/var/lib/boot2docker";
const GUEST_HOME: &str = "/home/docker";
const USERDATA: &str = "userdata.tar";

fn host_type() -> &'static str {
    if cfg!(target_os = "macos") { "fusion" } else { "ws" }
}

/// Finds a VMware tool on `PATH`, falling back to the Fusion bundle.
fn find_tool(name: &str) -> Result<PathBuf> {
    exec::find_binary(name, "install VMware Workstation or Fusion").or_else(|e| {
        let bundled = Path::new(FUSION_LIBRARY).join(name);
        if cfg!(target_os = "macos") && bundled.exists() {
            Ok(bundled)
        } else {
            Err(e)
        }
    })
}

/// VM definition for a freshly created machine.
pub(crate) fn render_vmx(config: &MachineConfig) -> String {
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut set = |key: &str, value: String| entries.push((key.to_string(), value));

    set(".encoding", "UTF-8".into());
    set("config.version", "8".into());
    set("virtualHW.version", "10".into());
    set("displayName", config.name.clone());
    set("guestOS", "other3xlinux-64".into());
    set("memsize", config.resources.memory_mb.to_string());
    set("numvcpus", config.resources.cpus.to_string());

    set("ethernet0.present", "TRUE".into());
    set("ethernet0.virtualDev", "vmxnet3".into());
    match &config.network {
        NetworkMode::Custom(vnet) => {
            set("ethernet0.connectionType", "custom".into());
            set("ethernet0.vnet", vnet.clone());
        }
        _ => set("ethernet0.connectionType", "nat".into()),
    }
    match &config.mac {
        Some(mac) => {
            set("ethernet0.addressType", "static".into());
            set("ethernet0.address", mac.clone());
        }
        None => set("ethernet0.addressType", "generated".into()),
    }

    set("ide1:0.present", "TRUE".into());
    set("ide1:0.deviceType", "cdrom-image".into());
    set("ide1:0.fileName", config.iso_path().display().to_string());
    set("scsi0.present", "TRUE".into());
    set("scsi0.virtualDev", "lsilogic".into());
    set("scsi0:0.present", "TRUE".into());
    set("scsi0:0.fileName", "disk.vmdk".into());
    set("bios.bootOrder", "cdrom,hdd".into());
    set("tools.syncTime", "TRUE".into());

    if !config.mounts.is_empty() {
        set("isolation.tools.hgfs.disable", "FALSE".into());
        set("sharedFolder.maxNum", config.mounts.len().to_string());
        for (i, mount) in config.mounts.iter().enumerate() {
            let key = |field: &str| format!("sharedFolder{i}.{field}");
            set(&key("present"), "TRUE".into());
            set(&key("enabled"), "TRUE".into());
            set(&key("readAccess"), "TRUE".into());
            set(&key("writeAccess"), "TRUE".into());
            set(&key("hostPath"), mount.host_path.display().to_string());
            set(&key("guestName"), mount.tag.clone());
        }
    }

    entries
        .into_iter()
        .map(|(key, value)| format!("{key} = \"{value}\"\n"))
        .collect()
}

/// MAC the first adapter ended up with, static or generated.
pub(crate) fn vmx_mac(vmx: &str) -> Option<String> {
    let mut generated = None;
    for line in vmx.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "ethernet0.address" if !value.is_empty() => return Some(value.to_string()),
            "ethernet0.generatedAddress" if !value.is_empty() => {
                generated = Some(value.to_string())
            }
            _ => {}
        }
    }
    generated
}

/// `vmrun list` prints a count line followed by one vmx path per VM.
pub(crate) fn list_contains(output: &str, vmx: &Path) -> bool {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .any(|line| Path::new(line) == vmx)
}

pub struct VmwareDriver {
    config: MachineConfig,
}

impl VmwareDriver {
    pub fn new(config: MachineConfig) -> Self {
        Self { config }
    }

    fn vmx_path(&self) -> PathBuf {
        self.config.file(&format!("{}.vmx", self.config.name))
    }

    fn vmdk_path(&self) -> PathBuf {
        self.config.file("disk.vmdk")
    }

    async fn vmrun(&self, command: &str, extra: &[&str]) -> Result<String> {
        let vmrun = find_tool("vmrun")?;
        let mut args: Vec<OsString> = vec!["-T".into(), host_type().into(), command.into()];
        args.push(self.vmx_path().into());
        args.extend(extra.iter().map(OsString::from));
        exec::run(vmrun, &args).await
    }

    async fn vmrun_guest(&self, command: &str, extra: &[&str]) -> Result<String> {
        let vmrun = find_tool("vmrun")?;
        let mut args: Vec<OsString> = vec![
            "-T".into(),
            host_type().into(),
            "-gu".into(),
            GUEST_USER.into(),
            "-gp".into(),
            GUEST_PASSWORD.into(),
            command.into(),
        ];
        args.push(self.vmx_path().into());
        args.extend(extra.iter().map(OsString::from));
        exec::run(vmrun, &args).await
    }

    /// Hands the seed archive to the guest through VMware Tools, once.
    async fn deliver_userdata(&self) -> Result<()> {
        let userdata = self.config.file(USERDATA);
        if !userdata.exists() {
            return Ok(());
        }
        // Guest tools come up a while after the VM starts.
        RetryPolicy::ip_discovery(false)
            .retry(|| self.vmrun_guest("directoryExistsInGuest", &[GUEST_PERSIST_DIR]))
            .await?;

        let guest_tar = format!("{GUEST_HOME}/{USERDATA}");
        let host_tar = userdata.display().to_string();
        self.vmrun_guest("copyFileFromHostToGuest", &[&host_tar, &guest_tar])
            .await?;
        let persisted = format!("{GUEST_PERSIST_DIR}/{USERDATA}");
        let script = format!(
            "sudo /bin/mv {} {} && sudo tar xf {} -C {GUEST_HOME} && sudo chown -R {GUEST_USER}:staff {GUEST_HOME}",
            shell_quote(&guest_tar),
            shell_quote(&persisted),
            shell_quote(&persisted)
        );
        self.vmrun_guest("runProgramInGuest", &["/bin/sh", "-c", &script])
            .await?;
        tokio::fs::remove_file(&userdata).await?;
        tracing::info!(machine = %self.config.name, "delivered SSH key to guest");
        Ok(())
    }

    async fn lease_ip(&self) -> Result<IpAddr> {
        let vmx = tokio::fs::read_to_string(self.vmx_path()).await?;
        let Some(mac) = vmx_mac(&vmx) else {
            return Err(Error::NoIpAddress {
                mac: "<not yet generated>".to_string(),
            });
        };
        isc::lookup(&isc::default_path(), &mac)
            .await?
            .map(IpAddr::V4)
            .ok_or(Error::NoIpAddress { mac })
    }
}

#[async_trait]
impl Driver for VmwareDriver {
    fn name(&self) -> &'static str {
        "vmware"
    }

    fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut MachineConfig {
        &mut self.config
    }

    async fn pre_create_check(&self) -> Result<()> {
        find_tool("vmrun")?;
        find_tool("vmware-vdiskmanager")?;
        self.config.validate(None)
    }

    async fn create(&mut self) -> Result<()> {
        self.config.validate(None)?;
        let public_key = prepare_ssh_key(&self.config).await?;
        stage_boot_image(&self.config).await?;

        tokio::fs::write(self.vmx_path(), render_vmx(&self.config)).await?;

        let vdiskmanager = find_tool("vmware-vdiskmanager")?;
        let size = format!("{}MB", self.config.resources.disk_mb);
        let vmdk = self.vmdk_path();
        let args: Vec<OsString> = vec![
            "-c".into(),
            "-t".into(),
            "0".into(),
            "-s".into(),
            size.into(),
            "-a".into(),
            "lsilogic".into(),
            vmdk.into(),
        ];
        exec::run(vdiskmanager, &args).await?;

        let tar = seed::build_seed_tar(&public_key)?;
        tokio::fs::write(self.config.file(USERDATA), tar).await?;
        tracing::info!(machine = %self.config.name, vmx = %self.vmx_path().display(), "created VMware VM");
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.state().await? != MachineState::Running {
            self.vmrun("start", &["nogui"]).await?;
        }
        self.deliver_userdata().await?;
        if self.config.mac.is_none()
            && let Some(mac) = vmx_mac(&tokio::fs::read_to_string(self.vmx_path()).await?)
        {
            self.config.set_mac(minikit_net::mac::canonical(&mac)?)?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state().await? != MachineState::Running {
            return Ok(());
        }
        self.vmrun("stop", &["soft"]).await?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if self.state().await? != MachineState::Running {
            return Ok(());
        }
        self.vmrun("stop", &["hard"]).await?;
        Ok(())
    }

    async fn restart(&mut self) -> Result<()> {
        self.vmrun("reset", &["soft"]).await?;
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        match self.state().await? {
            MachineState::None => return Ok(()),
            MachineState::Running => {
                self.vmrun("stop", &["hard"]).await?;
            }
            _ => {}
        }
        self.vmrun("deleteVM", &[]).await?;
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        let vmx = self.vmx_path();
        if !vmx.exists() {
            return Ok(MachineState::None);
        }
        let vmrun = find_tool("vmrun")?;
        let out = exec::run(vmrun, &["list"]).await?;
        Ok(if list_contains(&out, &vmx) {
            MachineState::Running
        } else {
            MachineState::Stopped
        })
    }

    async fn ip(&self) -> Result<IpAddr> {
        match self.vmrun("getGuestIPAddress", &[]).await {
            Ok(out) => {
                if let Ok(ip) = out.trim().parse() {
                    return Ok(ip);
                }
                tracing::debug!(output = %out.trim(), "vmrun reported no address");
            }
            Err(e) => tracing::debug!("getGuestIPAddress failed: {e}"),
        }
        self.lease_ip().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minikit_core::{DriverKind, MountSpec};

    fn config() -> MachineConfig {
        MachineConfig::new("minikit", DriverKind::Vmware, "/mk/minikit")
    }

    #[test]
    fn vmx_defaults_to_nat_with_generated_mac() {
        let vmx = render_vmx(&config());
        assert!(vmx.contains("ethernet0.connectionType = \"nat\"\n"));
        assert!(vmx.contains("ethernet0.addressType = \"generated\"\n"));
        assert!(vmx.contains("ethernet0.virtualDev = \"vmxnet3\"\n"));
        assert!(vmx.contains("ide1:0.fileName = \"/mk/minikit/boot2docker.iso\"\n"));
        assert!(vmx.contains("scsi0:0.fileName = \"disk.vmdk\"\n"));
        assert!(!vmx.contains("sharedFolder"));
    }

    #[test]
    fn vmx_custom_network_static_mac_and_shares() {
        let mut config = config();
        config.network = NetworkMode::Custom("vmnet2".to_string());
        config.mac = Some("00:50:56:00:00:01".to_string());
        let mut mount = MountSpec::new("/Users/me/src", "/src");
        mount.tag = "src".to_string();
        config.mounts.push(mount);

        let vmx = render_vmx(&config);
        assert!(vmx.contains("ethernet0.connectionType = \"custom\"\n"));
        assert!(vmx.contains("ethernet0.vnet = \"vmnet2\"\n"));
        assert!(vmx.contains("ethernet0.address = \"00:50:56:00:00:01\"\n"));
        assert!(vmx.contains("sharedFolder0.hostPath = \"/Users/me/src\"\n"));
        assert!(vmx.contains("sharedFolder0.guestName = \"src\"\n"));
    }

    #[test]
    fn mac_prefers_static_address() {
        let vmx = "ethernet0.generatedAddress = \"00:0c:29:8f:2d:64\"\nethernet0.address = \"00:50:56:00:00:01\"\n";
        assert_eq!(vmx_mac(vmx).as_deref(), Some("00:50:56:00:00:01"));
        let vmx = "ethernet0.generatedAddress = \"00:0c:29:8f:2d:64\"\n";
        assert_eq!(vmx_mac(vmx).as_deref(), Some("00:0c:29:8f:2d:64"));
        assert_eq!(vmx_mac("displayName = \"m\"\n"), None);
    }

    #[test]
    fn running_list() {
        let out = "Total running VMs: 2\n/mk/other/other.vmx\n/mk/minikit/minikit.vmx\n";
        assert!(list_contains(out, Path::new("/mk/minikit/minikit.vmx")));
        assert!(!list_contains(
            "Total running VMs: 0\n",
            Path::new("/mk/minikit/minikit.vmx")
        ));
    }

    #[tokio::test]
    async fn missing_vmx_is_state_none() {
        let dir = tempfile::tempdir().unwrap();
        let driver = VmwareDriver::new(MachineConfig::new("m", DriverKind::Vmware, dir.path()));
        assert_eq!(driver.state().await.unwrap(), MachineState::None);
    }
}
