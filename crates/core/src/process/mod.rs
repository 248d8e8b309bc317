//! Pidfile-based supervision of out-of-process children.
//!
//! A child is identified by the pid recorded in its pidfile *and* its
//! executable name, so a recycled pid running something else reads as
//! dead rather than as our child.

mod pidfile;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use windows as sys;

pub use pidfile::{read_pidfile, remove_pidfile, write_pidfile};

use crate::error::{Error, Result};
use crate::types::MachineState;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};

/// Name a child has when launched through `sudo`.
pub const ELEVATION_WRAPPER: &str = "sudo";

// Linux truncates the command name to 15 bytes.
const COMM_LEN: usize = 15;

fn name_matches(actual: &OsStr, expected: &str) -> bool {
    let actual = actual.to_string_lossy();
    actual == expected
        || (actual.len() == COMM_LEN && expected.len() > COMM_LEN && expected.starts_with(&*actual))
}

fn process_matches(pid: u32, expected: &str) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let Some(process) = system.process(pid) else {
        return false;
    };
    if name_matches(process.name(), expected) {
        return true;
    }
    process
        .exe()
        .and_then(Path::file_name)
        .is_some_and(|base| name_matches(base, expected))
}

/// Returns true iff `pid` is alive and runs an executable named `name`.
pub fn exists(pid: u32, name: &str) -> Result<bool> {
    if !sys::pid_alive(pid)? {
        return Ok(false);
    }
    Ok(process_matches(pid, name))
}

fn already_done(pid: u32, name: &str) -> Error {
    Error::ProcessAlreadyDone {
        pid,
        name: name.to_string(),
    }
}

/// Asks the process to exit.
pub fn terminate(pid: u32, name: &str) -> Result<()> {
    if !exists(pid, name)? || !sys::terminate(pid)? {
        return Err(already_done(pid, name));
    }
    Ok(())
}

/// Forcefully stops the process.
pub fn kill(pid: u32, name: &str) -> Result<()> {
    if !exists(pid, name)? || !sys::kill_process(pid)? {
        return Err(already_done(pid, name));
    }
    Ok(())
}

/// Kills the whole process group led by `pid`.
pub fn kill_group(pid: u32) -> Result<()> {
    if !sys::kill_group(pid)? {
        return Err(already_done(pid, "process group"));
    }
    Ok(())
}

/// A child process tracked through a pidfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildProcess {
    pidfile: PathBuf,
    name: String,
    elevated: bool,
}

impl ChildProcess {
    pub fn new(pidfile: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            pidfile: pidfile.into(),
            name: name.into(),
            elevated: false,
        }
    }

    /// Marks the child as started under the privilege-elevation wrapper.
    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pidfile(&self) -> &Path {
        &self.pidfile
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Executable name the live process is expected to have.
    pub fn expected_name(&self) -> &str {
        if self.elevated {
            ELEVATION_WRAPPER
        } else {
            &self.name
        }
    }

    fn context(&self, operation: &'static str, source: Error) -> Error {
        Error::Child {
            operation,
            child: self.name.clone(),
            pidfile: self.pidfile.clone(),
            source: Box::new(source),
        }
    }

    pub fn record(&self, pid: u32) -> Result<()> {
        write_pidfile(&self.pidfile, pid).map_err(|e| self.context("record", e))
    }

    /// Pid from the pidfile, `None` when there is no pidfile.
    pub fn pid(&self) -> Result<Option<u32>> {
        match read_pidfile(&self.pidfile) {
            Ok(pid) => Ok(Some(pid)),
            Err(Error::PidfileNotFound(_)) => Ok(None),
            Err(e) => Err(self.context("read pidfile of", e)),
        }
    }

    /// `Running` when the recorded process is alive, `Stopped` otherwise.
    /// A stale pidfile is removed before `Stopped` is reported.
    pub fn state(&self) -> Result<MachineState> {
        let Some(pid) = self.pid()? else {
            return Ok(MachineState::Stopped);
        };
        if exists(pid, self.expected_name()).map_err(|e| self.context("check", e))? {
            return Ok(MachineState::Running);
        }
        tracing::warn!(
            pid,
            child = %self.name,
            pidfile = %self.pidfile.display(),
            "removing stale pidfile"
        );
        self.remove_pidfile()?;
        Ok(MachineState::Stopped)
    }

    pub fn remove_pidfile(&self) -> Result<()> {
        remove_pidfile(&self.pidfile).map_err(|e| self.context("remove pidfile of", e))
    }

    fn signal(
        &self,
        operation: &'static str,
        send: impl FnOnce(u32) -> Result<()>,
    ) -> Result<()> {
        let Some(pid) = self.pid()? else {
            tracing::debug!(child = %self.name, "no pidfile, nothing to {operation}");
            return Ok(());
        };
        match send(pid) {
            Ok(()) => {
                tracing::debug!(pid, child = %self.name, "sent {operation}");
                Ok(())
            }
            Err(e) if e.is_process_already_done() => {
                tracing::debug!(pid, child = %self.name, "{e}");
                self.remove_pidfile()
            }
            Err(e) => Err(self.context(operation, e)),
        }
    }

    /// Sends a graceful stop. A child that is already gone is not an error.
    pub fn terminate(&self) -> Result<()> {
        let name = self.expected_name().to_string();
        self.signal("terminate", |pid| terminate(pid, &name))
    }

    pub fn kill(&self) -> Result<()> {
        let name = self.expected_name().to_string();
        self.signal("kill", |pid| kill(pid, &name))
    }

    /// Kills the child's process group. Only valid for children started
    /// as group leaders.
    pub fn kill_group(&self) -> Result<()> {
        let name = self.expected_name().to_string();
        self.signal("kill group of", |pid| {
            if !exists(pid, &name)? {
                return Err(already_done(pid, &name));
            }
            kill_group(pid)
        })
    }

    /// Polls until the child is no longer running. Callers impose their
    /// own deadline.
    pub async fn wait_stopped(&self, interval: Duration) -> Result<()> {
        while self.state()? == MachineState::Running {
            tokio::time::sleep(interval).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod name_matching {
        use super::*;

        #[test]
        fn exact_name_matches() {
            assert!(name_matches(OsStr::new("vfkit"), "vfkit"));
            assert!(!name_matches(OsStr::new("vfkit"), "vmnet-helper"));
        }

        #[test]
        fn truncated_comm_matches_long_name() {
            assert!(name_matches(
                OsStr::new("very-long-helpe"),
                "very-long-helper-binary"
            ));
            assert!(!name_matches(OsStr::new("very-long"), "very-long-helper"));
        }
    }

    mod child_process {
        use super::*;

        #[test]
        fn expected_name_switches_to_wrapper_when_elevated() {
            let child = ChildProcess::new("/m/vmnet-helper.pid", "vmnet-helper");
            assert_eq!(child.expected_name(), "vmnet-helper");
            let child = child.elevated(true);
            assert_eq!(child.expected_name(), "sudo");
            assert_eq!(child.name(), "vmnet-helper");
        }

        #[test]
        fn missing_pidfile_is_stopped() {
            let dir = tempfile::tempdir().unwrap();
            let child = ChildProcess::new(dir.path().join("vfkit.pid"), "vfkit");
            assert_eq!(child.state().unwrap(), MachineState::Stopped);
            assert_eq!(child.pid().unwrap(), None);
        }

        #[test]
        fn terminate_without_pidfile_succeeds() {
            let dir = tempfile::tempdir().unwrap();
            let child = ChildProcess::new(dir.path().join("vfkit.pid"), "vfkit");
            child.terminate().unwrap();
            child.kill().unwrap();
        }

        #[test]
        fn malformed_pidfile_surfaces_child_and_path() {
            let dir = tempfile::tempdir().unwrap();
            let pidfile = dir.path().join("vfkit.pid");
            std::fs::write(&pidfile, "not-a-pid").unwrap();
            let child = ChildProcess::new(&pidfile, "vfkit");
            let err = child.state().unwrap_err();
            let message = err.to_string();
            assert!(message.contains("vfkit"));
            assert!(message.contains(&pidfile.display().to_string()));
        }
    }
}
