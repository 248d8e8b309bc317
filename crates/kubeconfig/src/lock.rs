//! Cross-process named lock guarding read-modify-write of the credential
//! file.
//!
//! POSIX record locks do not exclude threads of the same process, so a
//! process-wide mutex is taken first.

use file_lock::{FileLock, FileOptions};
use minikit_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_NAME_LEN: usize = 40;
const PREFIX: &str = "mk";

static IN_PROCESS: Mutex<()> = Mutex::new(());

/// Lock name for `path`: stable across processes and at most 40 chars.
/// Every spelling of the same file (relative, with `.` or `..`, through a
/// symlinked directory) gets the same name.
pub fn lock_name(path: &Path) -> String {
    let resolved = resolve(path);
    let digest = hex::encode(Sha256::digest(resolved.as_os_str().as_encoded_bytes()));
    format!("{PREFIX}{}", &digest[..MAX_NAME_LEN - PREFIX.len()])
}

/// Canonical form of `path`. The file and any number of its parent
/// directories may not exist yet; the deepest existing ancestor is
/// canonicalized and the rest is joined back on.
fn resolve(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let Some(file_name) = absolute.file_name().map(|n| n.to_os_string()) else {
        return absolute;
    };
    let mut missing = vec![file_name];
    let mut dir = absolute.parent();
    while let Some(current) = dir {
        if let Ok(real) = current.canonicalize() {
            return missing.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match current.file_name() {
            Some(name) => missing.push(name.to_os_string()),
            None => break,
        }
        dir = current.parent();
    }
    absolute
}

fn lock_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.lock"))
}

/// Lock files are shared between users (a `sudo` run followed by a normal
/// one), so they are world-writable. Only the owner can change the mode.
#[cfg(unix)]
fn share_lock_file(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
        tracing::debug!(path = %path.display(), "cannot widen lock file mode: {e}");
    }
}

#[cfg(not(unix))]
fn share_lock_file(_path: &Path) {}

/// Held lock. Released on drop, including during unwinding.
pub struct NamedLock {
    name: String,
    _file: FileLock,
    _guard: MutexGuard<'static, ()>,
}

impl std::fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLock").field("name", &self.name).finish()
    }
}

impl NamedLock {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Waits up to `timeout` for the lock called `name`.
pub fn acquire(name: &str, timeout: Duration) -> Result<NamedLock> {
    let deadline = Instant::now() + timeout;
    let timed_out = || Error::LockTimeout(name.to_string());

    let guard = loop {
        match IN_PROCESS.try_lock() {
            Ok(guard) => break guard,
            Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
            Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                return Err(timed_out());
            }
            Err(TryLockError::WouldBlock) => std::thread::sleep(RETRY_INTERVAL),
        }
    };

    let path = lock_path(name);
    loop {
        // Opening someone else's file with O_CREAT in a sticky directory
        // fails under protected_regular, so only create when missing.
        let created = !path.exists();
        let options = FileOptions::new().write(true).create(created);
        match FileLock::lock(&path, false, options) {
            Ok(file) => {
                if created {
                    share_lock_file(&path);
                }
                tracing::debug!(lock = name, "acquired");
                return Ok(NamedLock {
                    name: name.to_string(),
                    _file: file,
                    _guard: guard,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(timed_out());
                }
                std::thread::sleep(RETRY_INTERVAL);
            }
            // Removed between the existence check and the open.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !created => {}
            Err(e) => return Err(e.into()),
        }
    }
}
