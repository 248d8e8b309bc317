use crate::error::Result;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Signal 0 check. `EPERM` still means the pid exists, it just belongs to
/// another user (a child started through sudo, for instance).
pub(super) fn pid_alive(pid: u32) -> Result<bool> {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => Ok(true),
        Err(errno) => Err(std::io::Error::from(errno).into()),
    }
}

/// Returns `false` when the target vanished before the signal landed.
fn send(target: i32, signal: Signal) -> Result<bool> {
    match kill(Pid::from_raw(target), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(std::io::Error::from(errno).into()),
    }
}

pub(super) fn terminate(pid: u32) -> Result<bool> {
    send(pid as i32, Signal::SIGTERM)
}

pub(super) fn kill_process(pid: u32) -> Result<bool> {
    send(pid as i32, Signal::SIGKILL)
}

pub(super) fn kill_group(pid: u32) -> Result<bool> {
    send(-(pid as i32), Signal::SIGKILL)
}
