use crate::error::{Error, Result};
use crate::exec;
use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// One readiness check: connect and read the first byte of the banner.
pub async fn check_ssh(addr: SocketAddr) -> Result<()> {
    let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout(format!("dialing {addr}")))??;
    let mut byte = [0u8; 1];
    let n = tokio::time::timeout(DIAL_TIMEOUT, stream.read(&mut byte))
        .await
        .map_err(|_| Error::Timeout(format!("reading banner from {addr}")))??;
    if n == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("{addr} closed the connection"),
        )));
    }
    Ok(())
}

/// Waits until the guest SSH daemon answers. Never gives up on its own;
/// cancel the future to stop waiting.
pub async fn wait_for_ssh(addr: SocketAddr) {
    loop {
        match check_ssh(addr).await {
            Ok(()) => {
                tracing::debug!(%addr, "ssh is available");
                return;
            }
            Err(e) => tracing::debug!(%addr, "ssh not available yet: {e}"),
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// Creates an RSA key pair at `path` and `path.pub`.
pub async fn generate_key(path: &Path) -> Result<()> {
    let keygen = exec::find_binary("ssh-keygen", "install OpenSSH")?;
    let args: Vec<&OsStr> = ["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f"]
        .into_iter()
        .map(OsStr::new)
        .chain([path.as_os_str()])
        .collect();
    exec::run(keygen, &args).await?;
    Ok(())
}

/// Runs commands in the guest through the host `ssh` client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshClient {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key_path: PathBuf,
}

impl SshClient {
    pub fn new(
        user: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            key_path: key_path.into(),
        }
    }

    pub fn args(&self, command: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "-F",
            "/dev/null",
            "-o",
            "ConnectionAttempts=3",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "ControlMaster=no",
            "-o",
            "ControlPath=none",
            "-o",
            "LogLevel=quiet",
            "-o",
            "PasswordAuthentication=no",
            "-o",
            "ServerAliveInterval=60",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "IdentitiesOnly=yes",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        args.push("-i".to_string());
        args.push(self.key_path.display().to_string());
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());
        args
    }

    pub async fn run(&self, command: &str) -> Result<String> {
        let ssh = exec::find_binary("ssh", "install OpenSSH")?;
        exec::run(ssh, &self.args(command)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    mod client {
        use super::*;

        #[test]
        fn args_target_user_host_and_port() {
            let client = SshClient::new("docker", "192.168.64.5", 2222, "/m/id_rsa");
            let args = client.args("uname -a");
            assert_eq!(args.last().unwrap(), "uname -a");
            assert!(args.contains(&"docker@192.168.64.5".to_string()));
            let p = args.iter().position(|a| a == "-p").unwrap();
            assert_eq!(args[p + 1], "2222");
            let i = args.iter().position(|a| a == "-i").unwrap();
            assert_eq!(args[i + 1], "/m/id_rsa");
        }

        #[test]
        fn args_never_prompt() {
            let client = SshClient::new("docker", "h", 22, "/k");
            let args = client.args("true");
            assert!(args.contains(&"PasswordAuthentication=no".to_string()));
            assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        }
    }

    mod readiness {
        use super::*;

        #[tokio::test]
        async fn check_succeeds_after_banner() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
            });
            check_ssh(addr).await.unwrap();
        }

        #[tokio::test]
        async fn check_fails_when_peer_closes_silently() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                drop(socket);
            });
            assert!(check_ssh(addr).await.is_err());
        }

        #[tokio::test]
        async fn wait_retries_until_listener_appears() {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);

            let server = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let listener = TcpListener::bind(addr).await.unwrap();
                let (mut socket, _) = listener.accept().await.unwrap();
                socket.write_all(b"SSH-2.0-test\r\n").await.unwrap();
            });

            tokio::time::timeout(Duration::from_secs(10), wait_for_ssh(addr))
                .await
                .unwrap();
            server.await.unwrap();
        }
    }
}
