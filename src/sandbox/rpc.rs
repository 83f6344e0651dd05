//! Wire protocol for the sentry control channel.
//!
//! The sentry listens on a unix socket whose path is derived
//! deterministically from the root directory and the sandbox id.
//! Every request is one newline-delimited JSON message; requests that
//! donate files (console TTY, gofer IO channels, filestores) carry
//! them as SCM_RIGHTS ancillary data on the same send, in the order
//! the message body declares. Responses are a single JSON line.
//!
//! ```text
//! Host                                  Sentry
//!   |                                     |
//!   |  {"method":"pause","cid":...}\n     |
//!   |------------------------------------>|
//!   |  {"status":"ok"}\n                  |
//!   |<------------------------------------|
//! ```
//!
//! Every call is synchronous. Cancellation is cooperative: the client
//! polls its token between read timeouts, and a tripped token closes
//! the transport; partial sentry-side work is reconciled on the next
//! operation or the next runtime-state poll.

use crate::cancel::CancelToken;
use crate::constants::{CTRL_SOCKET_SUFFIX, RPC_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::mounts::GoferMountConf;
use crate::spec::{Spec, User};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{IoSlice, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Returns the control socket path for a sandbox.
pub fn endpoint(root_dir: &Path, sandbox_id: &str) -> PathBuf {
    root_dir.join(format!("{sandbox_id}{CTRL_SOCKET_SUFFIX}"))
}

// =============================================================================
// Requests
// =============================================================================

/// Host-to-sentry request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Registers a sub-container; the console master TTY rides along
    /// when `has_tty` is set.
    CreateSubcontainer { cid: String, has_tty: bool },

    /// Starts the root container's workload.
    StartRoot { spec: Box<Spec> },

    /// Starts a sub-container. The donated files arrive in declared
    /// order: stdio, gofer IO channels, filestores, then the device
    /// IO channel when `has_dev_io` is set.
    StartSubcontainer {
        cid: String,
        spec: Box<Spec>,
        confs: Vec<GoferMountConf>,
        stdio_count: usize,
        io_count: usize,
        filestore_count: usize,
        has_dev_io: bool,
    },

    /// Runs a new process inside a container.
    Execute { cid: String, args: ExecArgs },

    /// Waits for a container's init process to exit.
    Wait { cid: String },

    /// Waits for a process in the container's PID namespace.
    WaitPid { cid: String, pid: i32 },

    /// Waits for a process in the sandbox's PID namespace.
    WaitRootPid { pid: i32 },

    SignalContainer { cid: String, signo: i32, all: bool },
    SignalProcess { cid: String, pid: i32, signo: i32 },

    Pause { cid: String },
    Resume { cid: String },

    Checkpoint {
        cid: String,
        image_path: PathBuf,
        opts: CheckpointOpts,
    },
    WaitCheckpoint,
    Restore {
        cid: String,
        image_path: PathBuf,
        direct: bool,
        background: bool,
    },
    WaitRestore,

    DestroyContainer { cid: String },
    RuntimeState { cid: String },
    Processes { cid: String },
    Event { cid: String },

    /// Forwards a host connection (donated stream) to a port inside
    /// the container.
    PortForward { cid: String, port: u16 },
}

/// Arguments for `Execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecArgs {
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default)]
    pub tty: bool,
}

/// Options for `Checkpoint`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CheckpointOpts {
    /// Write the image with direct I/O.
    pub direct: bool,
    /// Keep the sandbox running after the image is written.
    pub leave_running: bool,
}

// =============================================================================
// Responses
// =============================================================================

/// Sentry-to-host response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok(OkPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: RpcErrorCode,
    pub message: String,
}

/// Stable error surface of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    NotFound,
    InvalidState,
    Unavailable,
    Cancelled,
    Internal,
}

/// Typed payloads of successful responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    Pid { pid: i32 },
    WaitStatus { status: i32 },
    RuntimeState { state: RuntimeState },
    Processes { processes: Vec<ProcessInfo> },
    Event { event: EventOut },
}

/// Container state as the sentry sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Creating,
    Running,
    Stopped,
    Unknown,
}

/// One process inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub cmd: String,
    #[serde(default)]
    pub uid: u32,
}

/// Event payload for the `events` surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventOut {
    pub event: Event,
    /// Sentry-internal CPU accounting per container, used to split
    /// host cgroup usage proportionally.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub container_usage: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventData {
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub pids: PidsUsage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    /// Total CPU time consumed, in nanoseconds.
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub usage: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidsUsage {
    pub current: u64,
}

// =============================================================================
// Client
// =============================================================================

/// Short-lived synchronous client for one control channel.
pub struct RpcClient {
    stream: UnixStream,
}

impl RpcClient {
    /// Connects to a sandbox control socket.
    pub fn connect(endpoint: &Path) -> Result<Self> {
        let stream = UnixStream::connect(endpoint).map_err(|e| {
            Error::SandboxUnreachable(format!("{}: {e}", endpoint.display()))
        })?;
        Ok(Self { stream })
    }

    /// Wraps an already-connected stream (tests, socketpair setups).
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Issues one request and decodes the response, donating `fds` as
    /// ancillary data. Honors the cancellation token: a trip closes
    /// the transport and surfaces `Cancelled`.
    pub fn call(
        &mut self,
        request: &Request,
        fds: &[RawFd],
        cancel: &CancelToken,
    ) -> Result<Option<ResponseData>> {
        cancel.check()?;
        let mut message = serde_json::to_vec(request)
            .map_err(|e| Error::Internal(format!("encoding rpc request: {e}")))?;
        message.push(b'\n');

        if fds.is_empty() {
            self.stream
                .write_all(&message)
                .map_err(|e| Error::SandboxUnreachable(format!("send: {e}")))?;
        } else {
            let iov = [IoSlice::new(&message)];
            let cmsg = [nix::sys::socket::ControlMessage::ScmRights(fds)];
            nix::sys::socket::sendmsg::<()>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsg,
                nix::sys::socket::MsgFlags::empty(),
                None,
            )
            .map_err(|e| Error::SandboxUnreachable(format!("send with fds: {e}")))?;
        }

        let line = self.read_line(cancel)?;
        let response: Response = serde_json::from_slice(&line)
            .map_err(|e| Error::Internal(format!("decoding rpc response: {e}")))?;
        match response {
            Response::Ok(payload) => Ok(payload.data),
            Response::Error(err) => Err(map_rpc_error(err)),
        }
    }

    /// Reads one newline-terminated message, polling the cancellation
    /// token between bounded reads.
    fn read_line(&mut self, cancel: &CancelToken) -> Result<Vec<u8>> {
        self.stream
            .set_read_timeout(Some(RPC_POLL_INTERVAL))
            .map_err(Error::Io)?;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(Error::SandboxUnreachable(
                        "control connection closed".into(),
                    ))
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        return Ok(line);
                    }
                    line.push(byte[0]);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if cancel.is_cancelled() {
                        let _ = self.stream.shutdown(std::net::Shutdown::Both);
                        return Err(Error::Cancelled);
                    }
                }
                Err(e) => return Err(Error::SandboxUnreachable(format!("recv: {e}"))),
            }
        }
    }
}

fn map_rpc_error(err: ErrorPayload) -> Error {
    match err.code {
        RpcErrorCode::NotFound => Error::NotFound(err.message),
        RpcErrorCode::InvalidState => Error::InvalidState(err.message),
        RpcErrorCode::Unavailable => Error::SandboxUnreachable(err.message),
        RpcErrorCode::Cancelled => Error::Cancelled,
        RpcErrorCode::Internal => Error::Internal(err.message),
    }
}
