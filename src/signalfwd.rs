//! Signal forwarding from the caller to a container process.
//!
//! In attached mode (and for foreground execs with a terminal) the
//! signals the CLI process receives belong to the workload inside the
//! sandbox. The forwarder installs handlers that push each signal
//! number through a self-pipe; a thread drains the pipe and relays
//! every signal over the control channel. `stop` restores the old
//! dispositions and writes a sentinel, so the thread always unblocks.
//!
//! Signal handlers cannot capture state, so the write end of the pipe
//! is published through one process-wide atomic; only one forwarder
//! can be active at a time, which matches the CLI's one-command-per-
//! process model.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxDialer};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Sentinel byte asking the forwarding thread to exit.
const STOP_SENTINEL: u8 = 0xff;

/// Signals relayed into the sandbox. SIGKILL and SIGSTOP cannot be
/// caught; SIGCHLD belongs to this process's own children.
const FORWARDED_SIGNALS: &[i32] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
];

/// Write end of the active forwarder's self-pipe, -1 when inactive.
static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_handler(signo: libc::c_int) {
    let fd = PIPE_WR.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = signo as u8;
        // SAFETY: write(2) is async-signal-safe; a full pipe drops the
        // signal, matching kernel semantics for pending duplicates.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// An active signal-forwarding session.
pub struct SignalForwarder {
    pipe_wr: RawFd,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SignalForwarder {
    /// Starts forwarding caller signals to `pid` inside container
    /// `cid` (pid 0 targets the foreground process group).
    pub fn start(
        sandbox: Sandbox,
        dialer: Arc<dyn SandboxDialer>,
        cid: String,
        pid: i32,
    ) -> Result<SignalForwarder> {
        let mut fds: [RawFd; 2] = [-1, -1];
        // SAFETY: plain pipe2 call with a valid out array.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let (pipe_rd, pipe_wr) = (fds[0], fds[1]);

        if PIPE_WR
            .compare_exchange(-1, pipe_wr, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            unsafe {
                libc::close(pipe_rd);
                libc::close(pipe_wr);
            }
            return Err(Error::Internal(
                "signal forwarding is already active in this process".into(),
            ));
        }

        for signo in FORWARDED_SIGNALS {
            install_handler(*signo, forward_handler as *const () as libc::sighandler_t);
        }

        let thread = std::thread::spawn(move || {
            let cancel = CancelToken::new();
            loop {
                let mut byte = 0u8;
                // SAFETY: blocking read on our own pipe.
                let n = unsafe {
                    libc::read(pipe_rd, &mut byte as *mut u8 as *mut libc::c_void, 1)
                };
                if n <= 0 || byte == STOP_SENTINEL {
                    break;
                }
                let signo = byte as i32;
                tracing::debug!(signo, cid = %cid, pid, "forwarding signal to container");
                if let Err(e) = sandbox.signal_process(dialer.as_ref(), &cancel, &cid, pid, signo) {
                    tracing::warn!(signo, cid = %cid, error = %e, "failed to forward signal");
                }
            }
            // SAFETY: closing our own read end.
            unsafe {
                libc::close(pipe_rd);
            }
        });

        Ok(SignalForwarder {
            pipe_wr,
            thread: Some(thread),
        })
    }

    /// Restores default dispositions and unblocks the forwarding
    /// thread. Guaranteed to return even if no signal ever arrived.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        for signo in FORWARDED_SIGNALS {
            install_handler(*signo, libc::SIG_DFL);
        }
        PIPE_WR.store(-1, Ordering::SeqCst);
        let sentinel = STOP_SENTINEL;
        // SAFETY: writing the sentinel on our own pipe, then closing it.
        unsafe {
            libc::write(
                self.pipe_wr,
                &sentinel as *const u8 as *const libc::c_void,
                1,
            );
        }
        let _ = thread.join();
        unsafe {
            libc::close(self.pipe_wr);
        }
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn install_handler(signo: i32, handler: libc::sighandler_t) {
    // SAFETY: sigaction with a zeroed mask and a handler that is
    // either SIG_DFL or our async-signal-safe forwarder.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signo, &sa, std::ptr::null_mut());
    }
}
