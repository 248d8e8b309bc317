use std::path::PathBuf;

/// Errors that can occur while provisioning or supervising a machine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{name} not found in PATH: {hint}")]
    BinaryNotFound { name: String, hint: String },

    #[error("insufficient privileges: {0}")]
    InsufficientPrivileges(String),

    #[error("virtual switch '{0}' not found")]
    VirtualSwitchNotFound(String),

    #[error("Hyper-V PowerShell module is not available")]
    HypervModuleMissing,

    #[error("powershell was not found in PATH")]
    PowershellMissing,

    #[error("driver '{driver}' is not supported on this host")]
    Unsupported { driver: String },

    #[error("could not find an IP address for {mac}")]
    NoIpAddress { mac: String },

    #[error("pidfile {} not found", .0.display())]
    PidfileNotFound(PathBuf),

    #[error("invalid pidfile {}: {reason}", .path.display())]
    InvalidPidfile { path: PathBuf, reason: String },

    #[error("process {pid} ({name}) already done")]
    ProcessAlreadyDone { pid: u32, name: String },

    #[error("{operation} {child} (pidfile {}): {source}", .pidfile.display())]
    Child {
        operation: &'static str,
        child: String,
        pidfile: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid mount '{spec}': {reason}")]
    InvalidMount { spec: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("machine '{0}' does not exist")]
    MachineNotFound(String),

    #[error("driver '{0}' does not support SSH")]
    SshUnsupported(String),

    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("monitor error: {0}")]
    Monitor(String),

    #[error("network helper error: {0}")]
    NetworkHelper(String),

    #[error("firewall is blocking {0}")]
    FirewallBlocked(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("malformed credential file {}: {reason}", .path.display())]
    MalformedCredentials { path: PathBuf, reason: String },

    #[error("context '{context}' references missing {kind} '{name}'")]
    DanglingContext {
        context: String,
        kind: &'static str,
        name: String,
    },

    #[error("timed out waiting for lock {0}")]
    LockTimeout(String),

    #[error("malformed lease file {}: {reason}", .path.display())]
    MalformedLeases { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Coarse classification used by callers deciding whether to retry,
/// prompt the user or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Preflight,
    Transient,
    FirewallBlocked,
    StalePidfile,
    MalformedState,
    ProcessAlreadyDone,
    Unsupported,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BinaryNotFound { .. }
            | Error::InsufficientPrivileges(_)
            | Error::VirtualSwitchNotFound(_)
            | Error::HypervModuleMissing
            | Error::PowershellMissing
            | Error::InvalidMount { .. }
            | Error::InvalidConfig(_) => ErrorKind::Preflight,
            Error::NoIpAddress { .. } | Error::Timeout(_) | Error::Io(_) => ErrorKind::Transient,
            Error::FirewallBlocked(_) => ErrorKind::FirewallBlocked,
            Error::PidfileNotFound(_) => ErrorKind::StalePidfile,
            Error::InvalidPidfile { .. }
            | Error::MalformedCredentials { .. }
            | Error::DanglingContext { .. }
            | Error::MalformedLeases { .. }
            | Error::Json(_)
            | Error::Yaml(_) => ErrorKind::MalformedState,
            Error::ProcessAlreadyDone { .. } => ErrorKind::ProcessAlreadyDone,
            Error::Unsupported { .. } | Error::SshUnsupported(_) => ErrorKind::Unsupported,
            Error::Child { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }

    pub fn is_process_already_done(&self) -> bool {
        self.kind() == ErrorKind::ProcessAlreadyDone
    }

    pub fn is_no_ip_address(&self) -> bool {
        match self {
            Error::NoIpAddress { .. } => true,
            Error::Child { source, .. } => source.is_no_ip_address(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::PidfileNotFound(_) | Error::MachineNotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Child { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_no_ip_address() {
        let err = Error::NoIpAddress {
            mac: "52:54:00:12:34:56".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not find an IP address for 52:54:00:12:34:56"
        );
    }

    #[test]
    fn error_display_invalid_pidfile() {
        let err = Error::InvalidPidfile {
            path: PathBuf::from("/tmp/vfkit.pid"),
            reason: "invalid digit found in string".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid pidfile /tmp/vfkit.pid: invalid digit found in string"
        );
    }

    #[test]
    fn error_display_child_carries_operation_and_pidfile() {
        let err = Error::Child {
            operation: "terminate",
            child: "vfkit".to_string(),
            pidfile: PathBuf::from("/m/vfkit.pid"),
            source: Box::new(Error::Io(std::io::Error::other("boom"))),
        };
        let message = err.to_string();
        assert!(message.contains("terminate vfkit"));
        assert!(message.contains("/m/vfkit.pid"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn process_already_done_is_seen_through_child_context() {
        let err = Error::Child {
            operation: "kill",
            child: "vmnet-helper".to_string(),
            pidfile: PathBuf::from("/m/vmnet-helper.pid"),
            source: Box::new(Error::ProcessAlreadyDone {
                pid: 42,
                name: "sudo".to_string(),
            }),
        };
        assert!(err.is_process_already_done());
        assert!(!err.is_no_ip_address());
    }

    #[test]
    fn kind_classifies_preflight_errors() {
        assert_eq!(Error::PowershellMissing.kind(), ErrorKind::Preflight);
        assert_eq!(Error::HypervModuleMissing.kind(), ErrorKind::Preflight);
        assert_eq!(
            Error::InsufficientPrivileges("not an administrator".into()).kind(),
            ErrorKind::Preflight
        );
    }

    #[test]
    fn is_not_found_matches_io_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_not_found());
        assert!(Error::PidfileNotFound(PathBuf::from("x.pid")).is_not_found());
    }
}
