use crate::error::Result;
use sysinfo::{Pid, ProcessesToUpdate, System};

fn with_process<T>(pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(f)
}

pub(super) fn pid_alive(pid: u32) -> Result<bool> {
    Ok(with_process(pid, |_| ()).is_some())
}

// Windows has no graceful signal for arbitrary processes; both paths end
// in TerminateProcess.
pub(super) fn terminate(pid: u32) -> Result<bool> {
    kill_process(pid)
}

pub(super) fn kill_process(pid: u32) -> Result<bool> {
    Ok(with_process(pid, |process| process.kill()).unwrap_or(false))
}

pub(super) fn kill_group(pid: u32) -> Result<bool> {
    kill_process(pid)
}
