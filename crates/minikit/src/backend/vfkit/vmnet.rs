//! vmnet-helper: bridges the guest onto the macOS shared network through a
//! unix datagram socket that vfkit connects to.

use minikit_core::process::ELEVATION_WRAPPER;
use minikit_core::{ChildProcess, Error, MachineConfig, Result, exec, host, version};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

pub const DEFAULT_HELPER_PATH: &str = "/opt/vmnet-helper/bin/vmnet-helper";
const HELPER_NAME: &str = "vmnet-helper";
const MAC_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct HelperInfo {
    vmnet_mac_address: String,
}

/// Parses the single JSON line the helper prints once the interface is up.
pub(crate) fn parse_helper_info(line: &str) -> Result<String> {
    let info: HelperInfo = serde_json::from_str(line.trim())
        .map_err(|e| Error::NetworkHelper(format!("unexpected helper output {line:?}: {e}")))?;
    minikit_net::mac::canonical(&info.vmnet_mac_address)
}

#[derive(Debug, Clone)]
pub struct VmnetHelper {
    path: PathBuf,
    socket: PathBuf,
    log: PathBuf,
    interface_id: Uuid,
    offloading: bool,
    child: ChildProcess,
}

impl VmnetHelper {
    pub fn new(config: &MachineConfig, interface_id: Uuid) -> Self {
        let path = config
            .vfkit
            .helper_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HELPER_PATH));
        Self {
            path,
            socket: config.file("vmnet-helper.sock"),
            log: config.file("vmnet-helper.log"),
            interface_id,
            offloading: config.vfkit.offloading,
            child: ChildProcess::new(config.file("vmnet-helper.pid"), HELPER_NAME)
                .elevated(config.vfkit.helper_elevated),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn child(&self) -> &ChildProcess {
        &self.child
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--socket".into(),
            self.socket.clone().into(),
            "--interface-id".into(),
            self.interface_id.to_string().into(),
        ];
        if self.offloading {
            args.push("--enable-tso".into());
            args.push("--enable-checksum-offload".into());
        }
        args
    }

    /// Whether the helper has to run as root on this host. Hosts whose
    /// version cannot be read are treated as needing it.
    pub async fn requires_elevation(&self) -> bool {
        let host = match host::macos_version().await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("cannot read host version, assuming elevation: {e}");
                return true;
            }
        };
        let helper = match exec::run(&self.path, &["--version"]).await {
            Ok(out) => version::parse_helper_version(&out),
            Err(e) => Err(e),
        };
        match helper {
            Ok(helper) => version::helper_requires_elevation(&host, &helper),
            Err(e) => {
                tracing::debug!("cannot read helper version, assuming elevation: {e}");
                true
            }
        }
    }

    /// Confirms sudo will run the helper without prompting. One attempt.
    async fn validate_sudo(&self) -> Result<()> {
        let sudo = exec::find_binary(ELEVATION_WRAPPER, "vmnet-helper needs sudo")?;
        let mut args: Vec<OsString> = vec!["--non-interactive".into(), self.path.clone().into()];
        args.push("--version".into());
        exec::run(sudo, &args).await.map(|_| ()).map_err(|e| {
            Error::InsufficientPrivileges(format!(
                "cannot run {} through sudo without a password: {e}",
                self.path.display()
            ))
        })
    }

    /// Starts the helper and returns the MAC address vmnet assigned.
    pub async fn start(&mut self, elevated: bool) -> Result<String> {
        if !self.path.exists() {
            return Err(Error::BinaryNotFound {
                name: HELPER_NAME.to_string(),
                hint: format!("expected at {}", self.path.display()),
            });
        }
        self.child = self.child.clone().elevated(elevated);
        if elevated {
            self.validate_sudo().await?;
        }
        let _ = tokio::fs::remove_file(&self.socket).await;

        let mut command = if elevated {
            let mut command = Command::new(ELEVATION_WRAPPER);
            command.arg("--non-interactive").arg(&self.path);
            command
        } else {
            Command::new(&self.path)
        };
        let log = std::fs::File::create(&self.log)?;
        command
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(log)
            .process_group(0);

        tracing::info!(
            helper = %self.path.display(),
            interface_id = %self.interface_id,
            elevated,
            "starting vmnet-helper"
        );
        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| Error::NetworkHelper("helper exited immediately".to_string()))?;
        self.child.record(pid)?;

        let stdout = child.stdout.take();
        let mac: Result<String> = async {
            let stdout = stdout
                .ok_or_else(|| Error::NetworkHelper("helper stdout unavailable".to_string()))?;
            let mut line = String::new();
            let read = tokio::time::timeout(MAC_TIMEOUT, BufReader::new(stdout).read_line(&mut line))
                .await
                .map_err(|_| Error::Timeout("waiting for vmnet-helper to report its MAC".to_string()))??;
            if read == 0 {
                return Err(Error::NetworkHelper(format!(
                    "helper exited without reporting a MAC, see {}",
                    self.log.display()
                )));
            }
            parse_helper_info(&line)
        }
        .await;

        match mac {
            Ok(mac) => {
                tracing::info!(pid, mac = %mac, "vmnet-helper is up");
                Ok(mac)
            }
            Err(e) => {
                if let Err(kill_err) = self.child.kill_group() {
                    tracing::warn!("cleaning up vmnet-helper failed: {kill_err}");
                }
                let _ = child.wait().await;
                self.child.remove_pidfile()?;
                Err(e)
            }
        }
    }

    /// Asks the helper to exit and waits for it.
    pub async fn stop(&self) -> Result<()> {
        self.child.terminate()?;
        match tokio::time::timeout(STOP_TIMEOUT, self.child.wait_stopped(Duration::from_secs(1)))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    pidfile = %self.child.pidfile().display(),
                    "vmnet-helper did not exit, killing its process group"
                );
                self.child.kill_group()
            }
        }
    }

    pub fn kill(&self) -> Result<()> {
        self.child.kill_group()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minikit_core::DriverKind;

    fn config() -> MachineConfig {
        MachineConfig::new("m", DriverKind::Vfkit, "/m")
    }

    #[test]
    fn helper_info_line() {
        assert_eq!(
            parse_helper_info("{\"vmnet_mac_address\":\"5A:94:EF:E4:0C:EE\"}\n").unwrap(),
            "5a:94:ef:e4:0c:ee"
        );
        assert!(parse_helper_info("starting...").is_err());
    }

    #[test]
    fn argv_without_offloading() {
        let id = Uuid::parse_str("8f1d3c1e-5a2b-4c3d-9e8f-0a1b2c3d4e5f").unwrap();
        let helper = VmnetHelper::new(&config(), id);
        assert_eq!(helper.path(), Path::new(DEFAULT_HELPER_PATH));
        assert_eq!(
            helper.args(),
            vec![
                OsString::from("--socket"),
                OsString::from("/m/vmnet-helper.sock"),
                OsString::from("--interface-id"),
                OsString::from("8f1d3c1e-5a2b-4c3d-9e8f-0a1b2c3d4e5f"),
            ]
        );
    }

    #[test]
    fn argv_with_offloading() {
        let mut config = config();
        config.vfkit.offloading = true;
        let helper = VmnetHelper::new(&config, Uuid::new_v4());
        let args = helper.args();
        assert_eq!(args[4], "--enable-tso");
        assert_eq!(args[5], "--enable-checksum-offload");
    }

    #[test]
    fn recorded_elevation_selects_wrapper_name() {
        let mut config = config();
        config.vfkit.helper_elevated = true;
        let helper = VmnetHelper::new(&config, Uuid::new_v4());
        assert_eq!(helper.child().expected_name(), "sudo");
    }

    #[tokio::test]
    async fn start_reads_mac_from_stdout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("vmnet-helper");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"vmnet_mac_address\":\"aa:bb:cc:dd:ee:01\"}'\nsleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = MachineConfig::new("m", DriverKind::Vfkit, dir.path());
        config.vfkit.helper_path = Some(script);
        let mut helper = VmnetHelper::new(&config, Uuid::new_v4());

        let mac = helper.start(false).await.unwrap();
        assert_eq!(mac, "aa:bb:cc:dd:ee:01");
        assert!(helper.child().pid().unwrap().is_some());

        helper.kill().unwrap();
    }

    #[tokio::test]
    async fn start_cleans_up_when_helper_reports_nothing() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("vmnet-helper");
        std::fs::write(&script, "#!/bin/sh\necho 'vmnet: operation not permitted' >&2\nexit 1\n")
            .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = MachineConfig::new("m", DriverKind::Vfkit, dir.path());
        config.vfkit.helper_path = Some(script);
        let mut helper = VmnetHelper::new(&config, Uuid::new_v4());

        let err = helper.start(false).await.unwrap_err();
        assert!(matches!(err, Error::NetworkHelper(_)));
        assert!(!dir.path().join("vmnet-helper.pid").exists());
        let log = std::fs::read_to_string(dir.path().join("vmnet-helper.log")).unwrap();
        assert!(log.contains("operation not permitted"));
    }
}
