//! Client for the vfkit REST endpoint on its unix control socket.

use minikit_core::{Error, MachineState, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const STATE_PATH: &str = "/vm/state";
const STATE_PREFIX: &str = "VirtualMachineState";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRequest {
    Stop,
    HardStop,
    Resume,
}

impl StateRequest {
    fn as_str(self) -> &'static str {
        match self {
            StateRequest::Stop => "Stop",
            StateRequest::HardStop => "HardStop",
            StateRequest::Resume => "Resume",
        }
    }
}

#[derive(Serialize)]
struct StateBody<'a> {
    state: &'a str,
}

#[derive(Deserialize)]
struct StateReply {
    state: String,
}

/// What came back on the socket. The monitor may close the connection
/// before answering a stop request.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Complete { status: u16, body: Vec<u8> },
    Incomplete,
}

/// Maps a `VirtualMachineState*` name to a machine state.
pub(crate) fn parse_state(raw: &str) -> MachineState {
    match raw.strip_prefix(STATE_PREFIX).unwrap_or(raw) {
        "Running" | "Saving" | "Restoring" => MachineState::Running,
        "Starting" | "Resuming" => MachineState::Starting,
        "Paused" | "Pausing" => MachineState::Paused,
        "Stopping" => MachineState::Stopping,
        "Stopped" => MachineState::Stopped,
        _ => MachineState::Error,
    }
}

fn parse_reply(data: &[u8]) -> Reply {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(data) {
        Ok(httparse::Status::Complete(len)) => Reply::Complete {
            status: response.code.unwrap_or_default(),
            body: data[len..].to_vec(),
        },
        Ok(httparse::Status::Partial) | Err(_) => Reply::Incomplete,
    }
}

#[derive(Debug, Clone)]
pub struct MonitorClient {
    socket: PathBuf,
    timeout: Duration,
}

impl MonitorClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn request(&self, method: &str, body: Option<&[u8]>) -> Result<Reply> {
        let mut stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| Error::Monitor(format!("connect to {} timed out", self.socket.display())))?
            .map_err(|e| Error::Monitor(format!("connect to {}: {e}", self.socket.display())))?;

        let mut request = format!(
            "{method} {STATE_PATH} HTTP/1.1\r\nHost: vfkit\r\nConnection: close\r\n"
        );
        if let Some(body) = body {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");
        let mut bytes = request.into_bytes();
        bytes.extend_from_slice(body.unwrap_or_default());
        stream.write_all(&bytes).await?;

        let mut data = Vec::new();
        match tokio::time::timeout(self.timeout, stream.read_to_end(&mut data)).await {
            Ok(Ok(_)) => Ok(parse_reply(&data)),
            Ok(Err(e)) => {
                tracing::debug!(socket = %self.socket.display(), "monitor read failed: {e}");
                Ok(Reply::Incomplete)
            }
            Err(_) => {
                tracing::debug!(socket = %self.socket.display(), "monitor read timed out");
                Ok(Reply::Incomplete)
            }
        }
    }

    pub async fn state(&self) -> Result<MachineState> {
        match self.request("GET", None).await? {
            Reply::Complete { status, body } if status < 400 => {
                let reply: StateReply = serde_json::from_slice(&body)?;
                Ok(parse_state(&reply.state))
            }
            Reply::Complete { status, .. } => Err(Error::Monitor(format!(
                "GET {STATE_PATH} returned {status}"
            ))),
            Reply::Incomplete => Err(Error::Monitor(format!(
                "incomplete response to GET {STATE_PATH}"
            ))),
        }
    }

    /// Asks the monitor to change state. The monitor may exit before it
    /// answers, so a truncated response counts as accepted.
    pub async fn set_state(&self, request: StateRequest) -> Result<()> {
        let body = serde_json::to_vec(&StateBody {
            state: request.as_str(),
        })?;
        match self.request("POST", Some(&body)).await? {
            Reply::Complete { status, body } if status >= 400 => Err(Error::Monitor(format!(
                "POST {STATE_PATH} {} returned {status}: {}",
                request.as_str(),
                String::from_utf8_lossy(&body).trim()
            ))),
            Reply::Complete { .. } => Ok(()),
            Reply::Incomplete => {
                tracing::debug!(
                    socket = %self.socket.display(),
                    "monitor closed the connection before answering {}",
                    request.as_str()
                );
                Ok(())
            }
        }
    }
}
