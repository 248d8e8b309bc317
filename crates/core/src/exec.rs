//! Running host tools (vendor CLIs, ssh, sysctl...) and capturing their
//! output.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// When set to a non-empty value, command output is logged at `info`.
pub const DRIVER_DEBUG_ENV: &str = "MINIKIT_DRIVER_DEBUG";

pub fn driver_debug() -> bool {
    std::env::var_os(DRIVER_DEBUG_ENV).is_some_and(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Resolves a binary on `PATH`.
pub fn find_binary(name: &str, hint: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| Error::BinaryNotFound {
        name: name.to_string(),
        hint: hint.to_string(),
    })
}

fn render<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> String {
    let mut line = program.to_string_lossy().into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Runs a command to completion. A non-zero exit is reported in the
/// returned output rather than as an error.
pub async fn run_unchecked<P, S>(program: P, args: &[S]) -> Result<CommandOutput>
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let command = render(program, args);
    tracing::debug!("executing: {command}");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::BinaryNotFound {
                    name: program.to_string_lossy().into_owned(),
                    hint: "install it or add it to PATH".to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;

    let result = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if driver_debug() {
        tracing::info!(status = %output.status, "{command}\nstdout: {}\nstderr: {}", result.stdout, result.stderr);
    } else {
        tracing::debug!(status = %output.status, stdout = %result.stdout.trim(), stderr = %result.stderr.trim());
    }
    Ok(result)
}

/// Runs a command and returns its stdout, failing on a non-zero exit.
pub async fn run<P, S>(program: P, args: &[S]) -> Result<String>
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let command = render(program.as_ref(), args);
    let output = run_unchecked(program, args).await?;
    if !output.success {
        let stderr = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        return Err(Error::CommandFailed { command, stderr });
    }
    Ok(output.stdout)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_stdout() {
        let out = run("sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn run_reports_stderr_on_failure() {
        let err = run("sh", &["-c", "echo nope >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { command, stderr } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_unchecked_keeps_failing_output() {
        let out = run_unchecked("sh", &["-c", "echo inactive; exit 3"])
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.stdout.trim(), "inactive");
    }

    #[tokio::test]
    async fn missing_binary_is_binary_not_found() {
        let err = run("minikit-no-such-binary", &[] as &[&str])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound { .. }));
    }
}
