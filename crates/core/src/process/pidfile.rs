use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Writes `pid` as a single decimal line, readable only by the owner.
pub fn write_pidfile(path: &Path, pid: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    writeln!(file, "{pid}")?;
    file.sync_all()?;
    Ok(())
}

/// Reads a pidfile. A missing file is reported as
/// [`Error::PidfileNotFound`] so callers can tell it apart from I/O
/// failures.
pub fn read_pidfile(path: &Path) -> Result<u32> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::PidfileNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    data.trim()
        .parse::<u32>()
        .map_err(|e| Error::InvalidPidfile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Removes a pidfile, treating an already missing file as success.
pub fn remove_pidfile(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_pid_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfkit.pid");
        std::fs::write(&path, "12345\n").unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), 12345);
    }

    #[test]
    fn reads_pid_surrounded_by_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfkit.pid");
        std::fs::write(&path, "  77 \r\n").unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), 77);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfkit.pid");
        std::fs::write(&path, "invalid").unwrap();
        assert!(matches!(
            read_pidfile(&path),
            Err(Error::InvalidPidfile { .. })
        ));
    }

    #[test]
    fn empty_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfkit.pid");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            read_pidfile(&path),
            Err(Error::InvalidPidfile { .. })
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_pidfile(&dir.path().join("absent.pid")).unwrap_err();
        assert!(matches!(err, Error::PidfileNotFound(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.pid");
        write_pidfile(&path, 4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242\n");
        assert_eq!(read_pidfile(&path).unwrap(), 4242);
    }

    #[test]
    fn write_truncates_previous_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.pid");
        write_pidfile(&path, 1234567).unwrap();
        write_pidfile(&path, 8).unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), 8);
    }

    #[cfg(unix)]
    #[test]
    fn written_pidfile_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.pid");
        std::fs::write(&path, "1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        write_pidfile(&path, 2).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn remove_ignores_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.pid");
        remove_pidfile(&path).unwrap();
        write_pidfile(&path, 1).unwrap();
        remove_pidfile(&path).unwrap();
        assert!(!path.exists());
    }
}
