//! Sandbox handle and typed control operations.
//!
//! A `Sandbox` is a persisted descriptor of a running sentry: enough
//! to find its control socket, its host pid, and its cgroup again
//! from an unrelated process. It deliberately owns no containers and
//! no long-lived connection; each operation dials a short-lived RPC
//! client through the injected dialer, so any CLI invocation can act
//! on any sandbox it can read the record of.

pub mod rpc;

use crate::cancel::CancelToken;
use crate::cgroup::CgroupRef;
use crate::error::{Error, Result};
use crate::mounts::{GoferMountConf, PodMountHints};
use crate::spec::Spec;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

pub use rpc::{
    endpoint, CheckpointOpts, Event, EventData, EventOut, ExecArgs, ProcessInfo, Request, Response,
    ResponseData, RpcClient, RpcErrorCode, RuntimeState,
};

// =============================================================================
// Dialer
// =============================================================================

/// Opens control channels. Injected into the engine so tests can run
/// against an in-process sentry stand-in.
pub trait SandboxDialer: Send + Sync {
    fn dial(&self, endpoint: &Path) -> Result<RpcClient>;
}

/// Default dialer: connects the deterministic unix socket.
pub struct UnixDialer;

impl SandboxDialer for UnixDialer {
    fn dial(&self, endpoint: &Path) -> Result<RpcClient> {
        RpcClient::connect(endpoint)
    }
}

// =============================================================================
// Sandbox
// =============================================================================

/// Persisted descriptor of one sandbox (sentry process).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// Container id of the root container.
    pub id: String,
    /// Host pid of the sentry.
    pub pid: i32,
    /// Parent cgroup of the sandbox, if one was installed.
    pub cgroup: Option<CgroupRef>,
    /// Pod-wide mount hints, derived from the root container's spec.
    pub mount_hints: PodMountHints,
    /// `oom_score_adj` the sentry inherited at creation, restored
    /// when the last score-carrying container is destroyed.
    pub original_oom_score_adj: i32,
    /// Control socket path.
    pub rpc_endpoint: PathBuf,
}

impl Sandbox {
    /// True if this sandbox's root container is `cid`.
    pub fn is_root_container(&self, cid: &str) -> bool {
        self.id == cid
    }

    /// True if the sentry process still exists.
    pub fn is_running(&self) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(self.pid), None).is_ok()
    }

    fn call(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        request: &Request,
        fds: &[RawFd],
    ) -> Result<Option<ResponseData>> {
        let mut client = dialer.dial(&self.rpc_endpoint)?;
        client.call(request, fds, cancel)
    }

    // =========================================================================
    // Container Registration and Start
    // =========================================================================

    /// Registers a sub-container, donating its console master TTY
    /// when one was allocated.
    pub fn create_subcontainer(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        tty: Option<&File>,
    ) -> Result<()> {
        let request = Request::CreateSubcontainer {
            cid: cid.to_string(),
            has_tty: tty.is_some(),
        };
        let fds: Vec<RawFd> = tty.iter().map(|f| f.as_raw_fd()).collect();
        self.call(dialer, cancel, &request, &fds)?;
        Ok(())
    }

    /// Starts the root container's workload.
    pub fn start_root(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        spec: &Spec,
    ) -> Result<()> {
        let request = Request::StartRoot {
            spec: Box::new(spec.clone()),
        };
        self.call(dialer, cancel, &request, &[])?;
        Ok(())
    }

    /// Starts a sub-container, donating its stdio, gofer IO channels,
    /// filestores, and optional device IO channel in declared order.
    #[allow(clippy::too_many_arguments)]
    pub fn start_subcontainer(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        spec: &Spec,
        stdios: &[RawFd],
        io_files: &[File],
        filestores: &[File],
        dev_io: Option<&File>,
        confs: &[GoferMountConf],
    ) -> Result<()> {
        let request = Request::StartSubcontainer {
            cid: cid.to_string(),
            spec: Box::new(spec.clone()),
            confs: confs.to_vec(),
            stdio_count: stdios.len(),
            io_count: io_files.len(),
            filestore_count: filestores.len(),
            has_dev_io: dev_io.is_some(),
        };
        let mut fds: Vec<RawFd> = Vec::new();
        fds.extend_from_slice(stdios);
        fds.extend(io_files.iter().map(|f| f.as_raw_fd()));
        fds.extend(filestores.iter().map(|f| f.as_raw_fd()));
        if let Some(dev) = dev_io {
            fds.push(dev.as_raw_fd());
        }
        self.call(dialer, cancel, &request, &fds)?;
        Ok(())
    }

    // =========================================================================
    // Process Operations
    // =========================================================================

    /// Runs a new process in the container; returns its pid in the
    /// sandbox.
    pub fn execute(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        args: ExecArgs,
    ) -> Result<i32> {
        let data = self.call(
            dialer,
            cancel,
            &Request::Execute {
                cid: cid.to_string(),
                args,
            },
            &[],
        )?;
        match data {
            Some(ResponseData::Pid { pid }) => Ok(pid),
            other => Err(unexpected("pid", other)),
        }
    }

    /// Waits for the container's init process; returns the raw wait
    /// status.
    pub fn wait(&self, dialer: &dyn SandboxDialer, cancel: &CancelToken, cid: &str) -> Result<i32> {
        self.wait_request(dialer, cancel, Request::Wait { cid: cid.to_string() })
    }

    /// Waits for `pid` in the container's PID namespace.
    pub fn wait_pid(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        pid: i32,
    ) -> Result<i32> {
        self.wait_request(
            dialer,
            cancel,
            Request::WaitPid {
                cid: cid.to_string(),
                pid,
            },
        )
    }

    /// Waits for `pid` in the sandbox's PID namespace.
    pub fn wait_root_pid(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        pid: i32,
    ) -> Result<i32> {
        self.wait_request(dialer, cancel, Request::WaitRootPid { pid })
    }

    fn wait_request(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        request: Request,
    ) -> Result<i32> {
        match self.call(dialer, cancel, &request, &[])? {
            Some(ResponseData::WaitStatus { status }) => Ok(status),
            other => Err(unexpected("wait_status", other)),
        }
    }

    pub fn signal_container(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        signo: i32,
        all: bool,
    ) -> Result<()> {
        self.call(
            dialer,
            cancel,
            &Request::SignalContainer {
                cid: cid.to_string(),
                signo,
                all,
            },
            &[],
        )?;
        Ok(())
    }

    pub fn signal_process(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        pid: i32,
        signo: i32,
    ) -> Result<()> {
        self.call(
            dialer,
            cancel,
            &Request::SignalProcess {
                cid: cid.to_string(),
                pid,
                signo,
            },
            &[],
        )?;
        Ok(())
    }

    // =========================================================================
    // Suspend / Checkpoint
    // =========================================================================

    pub fn pause(&self, dialer: &dyn SandboxDialer, cancel: &CancelToken, cid: &str) -> Result<()> {
        self.call(dialer, cancel, &Request::Pause { cid: cid.to_string() }, &[])?;
        Ok(())
    }

    pub fn resume(&self, dialer: &dyn SandboxDialer, cancel: &CancelToken, cid: &str) -> Result<()> {
        self.call(dialer, cancel, &Request::Resume { cid: cid.to_string() }, &[])?;
        Ok(())
    }

    pub fn checkpoint(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        image_path: &Path,
        opts: CheckpointOpts,
    ) -> Result<()> {
        self.call(
            dialer,
            cancel,
            &Request::Checkpoint {
                cid: cid.to_string(),
                image_path: image_path.to_path_buf(),
                opts,
            },
            &[],
        )?;
        Ok(())
    }

    pub fn wait_checkpoint(&self, dialer: &dyn SandboxDialer, cancel: &CancelToken) -> Result<()> {
        self.call(dialer, cancel, &Request::WaitCheckpoint, &[])?;
        Ok(())
    }

    pub fn restore(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        image_path: &Path,
        direct: bool,
        background: bool,
    ) -> Result<()> {
        self.call(
            dialer,
            cancel,
            &Request::Restore {
                cid: cid.to_string(),
                image_path: image_path.to_path_buf(),
                direct,
                background,
            },
            &[],
        )?;
        Ok(())
    }

    pub fn wait_restore(&self, dialer: &dyn SandboxDialer, cancel: &CancelToken) -> Result<()> {
        self.call(dialer, cancel, &Request::WaitRestore, &[])?;
        Ok(())
    }

    // =========================================================================
    // Teardown and Introspection
    // =========================================================================

    pub fn destroy_container(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
    ) -> Result<()> {
        self.call(
            dialer,
            cancel,
            &Request::DestroyContainer {
                cid: cid.to_string(),
            },
            &[],
        )?;
        Ok(())
    }

    pub fn container_runtime_state(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
    ) -> Result<RuntimeState> {
        match self.call(
            dialer,
            cancel,
            &Request::RuntimeState {
                cid: cid.to_string(),
            },
            &[],
        )? {
            Some(ResponseData::RuntimeState { state }) => Ok(state),
            other => Err(unexpected("runtime_state", other)),
        }
    }

    pub fn processes(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
    ) -> Result<Vec<ProcessInfo>> {
        match self.call(
            dialer,
            cancel,
            &Request::Processes {
                cid: cid.to_string(),
            },
            &[],
        )? {
            Some(ResponseData::Processes { processes }) => Ok(processes),
            other => Err(unexpected("processes", other)),
        }
    }

    pub fn event(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
    ) -> Result<EventOut> {
        match self.call(dialer, cancel, &Request::Event { cid: cid.to_string() }, &[])? {
            Some(ResponseData::Event { event }) => Ok(event),
            other => Err(unexpected("event", other)),
        }
    }

    /// Forwards a connected host stream to a port in the container.
    pub fn port_forward(
        &self,
        dialer: &dyn SandboxDialer,
        cancel: &CancelToken,
        cid: &str,
        port: u16,
        stream: OwnedFd,
    ) -> Result<()> {
        self.call(
            dialer,
            cancel,
            &Request::PortForward {
                cid: cid.to_string(),
                port,
            },
            &[stream.as_raw_fd()],
        )?;
        Ok(())
    }
}

fn unexpected(expected: &str, got: Option<ResponseData>) -> Error {
    Error::Internal(format!(
        "unexpected control response: expected {expected}, got {got:?}"
    ))
}
