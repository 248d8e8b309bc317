use crate::document::{Config, Endpoint};
use crate::lock::{self, DEFAULT_TIMEOUT};
use minikit_core::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path list naming the credential file; the first entry is used.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// When set, files written while running as root through sudo are handed
/// back to the invoking user. Only honoured for the no-VM driver.
pub const CHANGE_NONE_USER_ENV: &str = "MINIKIT_CHANGE_NONE_USER";

pub fn change_none_user() -> bool {
    std::env::var_os(CHANGE_NONE_USER_ENV).is_some_and(|v| !v.is_empty())
}

/// Resolves the credential file from an optional `KUBECONFIG` value.
pub fn resolve_path(kubeconfig: Option<&std::ffi::OsStr>, home: Option<&Path>) -> Result<PathBuf> {
    if let Some(list) = kubeconfig
        && let Some(first) = std::env::split_paths(list).find(|p| !p.as_os_str().is_empty())
    {
        return Ok(first);
    }
    home.map(|home| home.join(".kube").join("config"))
        .ok_or_else(|| Error::InvalidConfig("cannot determine home directory".to_string()))
}

/// Locked reader/writer for the credential file.
#[derive(Debug, Clone)]
pub struct KubeconfigStore {
    path: PathBuf,
    lock_timeout: Duration,
    chown_to_invoker: bool,
}

impl KubeconfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_TIMEOUT,
            chown_to_invoker: false,
        }
    }

    /// Store for `$KUBECONFIG`, falling back to `~/.kube/config`.
    pub fn from_env() -> Result<Self> {
        let env = std::env::var_os(KUBECONFIG_ENV);
        let home = dirs::home_dir();
        Ok(Self::new(resolve_path(env.as_deref(), home.as_deref())?))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_chown_to_invoker(mut self, enabled: bool) -> Self {
        self.chown_to_invoker = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document. A missing or empty file is an empty document;
    /// anything else that fails to decode is an error.
    pub fn read(&self) -> Result<Config> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(&data).map_err(|e| Error::MalformedCredentials {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _lock = lock::acquire(&lock::lock_name(&self.path), self.lock_timeout)?;
        f()
    }

    /// Points the entries called `endpoint.name` at the endpoint.
    pub fn update(&self, endpoint: &Endpoint) -> Result<()> {
        self.locked(|| {
            let mut config = self.read()?;
            if !config.apply(endpoint) && self.path.exists() {
                tracing::debug!(path = %self.path.display(), "credential file already up to date");
                return Ok(());
            }
            // Other contexts may reference entries kept in other files.
            config.validate_context(&endpoint.name)?;
            self.write(&config)?;
            tracing::info!(
                path = %self.path.display(),
                context = %endpoint.name,
                server = %endpoint.server(),
                "updated credential file"
            );
            Ok(())
        })
    }

    /// Removes the entries called `name`. A missing file is left missing.
    pub fn delete_context(&self, name: &str) -> Result<()> {
        self.locked(|| {
            if !self.path.exists() {
                return Ok(());
            }
            let mut config = self.read()?;
            if !config.remove(name) {
                return Ok(());
            }
            self.write(&config)?;
            tracing::info!(path = %self.path.display(), context = name, "removed context");
            Ok(())
        })
    }

    /// Serialized replace: temp file in the same directory, then rename.
    pub fn write(&self, config: &Config) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        create_parent_dirs(&dir)?;

        let data = serde_yaml::to_string(config)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        if self.chown_to_invoker {
            chown_to_invoker(&self.path)?;
        }
        Ok(())
    }
}

fn create_parent_dirs(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir)?;
    Ok(())
}

#[cfg(unix)]
fn chown_to_invoker(path: &Path) -> Result<()> {
    use nix::unistd::{Gid, Uid, chown};

    if !minikit_core::host::is_root() {
        return Ok(());
    }
    let Some((uid, gid)) = minikit_core::host::sudo_invoker() else {
        return Ok(());
    };
    let root = path.parent().unwrap_or(path);
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        chown(entry.path(), Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(std::io::Error::from)?;
    }
    tracing::debug!(path = %root.display(), uid, gid, "handed credential files back to invoking user");
    Ok(())
}

#[cfg(not(unix))]
fn chown_to_invoker(_path: &Path) -> Result<()> {
    Ok(())
}
