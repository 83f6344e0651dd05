//! OCI lifecycle hook execution.
//!
//! Hooks receive the container's OCI state document on stdin.
//! `prestart` and `createRuntime` are fatal: a non-zero exit aborts
//! the calling operation. `poststart` and `poststop` are best-effort:
//! failures are logged and discarded. `createContainer` and
//! `startContainer` would have to execute inside the sandbox's own
//! namespaces, which this runtime does not support; they are accepted
//! and skipped with a warning.

use crate::error::{Error, Result};
use crate::spec::{Hook, State};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a hook with a timeout.
const HOOK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs every hook in order; the first failure aborts.
pub fn execute_hooks(hooks: &[Hook], state: &State) -> Result<()> {
    for hook in hooks {
        execute_hook(hook, state)?;
    }
    Ok(())
}

/// Runs every hook in order, logging failures instead of returning
/// them.
pub fn execute_hooks_best_effort(hooks: &[Hook], state: &State) {
    for hook in hooks {
        if let Err(e) = execute_hook(hook, state) {
            tracing::warn!(hook = %hook.path.display(), error = %e, "best-effort hook failed");
        }
    }
}

/// Logs that a hook set is not supported, once per call site.
pub fn warn_unsupported(kind: &str, hooks: &[Hook]) {
    if !hooks.is_empty() {
        tracing::warn!(
            kind,
            count = hooks.len(),
            "hook skipped because running inside the container namespace is not supported"
        );
    }
}

fn execute_hook(hook: &Hook, state: &State) -> Result<()> {
    tracing::debug!(path = %hook.path.display(), args = ?hook.args, "executing hook");

    let mut cmd = Command::new(&hook.path);
    if hook.args.len() > 1 {
        cmd.args(&hook.args[1..]);
    }
    // OCI hooks run with exactly the environment the spec gives them.
    cmd.env_clear();
    for entry in &hook.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::HookFailed(format!("{}: spawn: {e}", hook.path.display())))?;

    let state_json = serde_json::to_vec(state)
        .map_err(|e| Error::Internal(format!("encoding hook state: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        // The hook may exit without reading; a broken pipe is its call.
        let _ = stdin.write_all(&state_json);
    }

    let status = match hook.timeout {
        None => child
            .wait()
            .map_err(|e| Error::HookFailed(format!("{}: wait: {e}", hook.path.display())))?,
        Some(secs) => {
            let deadline = Instant::now() + Duration::from_secs(secs.max(0) as u64);
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => break status,
                    Ok(None) if Instant::now() >= deadline => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::HookFailed(format!(
                            "{}: timed out after {secs}s",
                            hook.path.display()
                        )));
                    }
                    Ok(None) => std::thread::sleep(HOOK_POLL_INTERVAL),
                    Err(e) => {
                        return Err(Error::HookFailed(format!(
                            "{}: wait: {e}",
                            hook.path.display()
                        )))
                    }
                }
            }
        }
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            use std::io::Read;
            let _ = pipe.read_to_string(&mut stderr);
        }
        return Err(Error::HookFailed(format!(
            "{} exited with {status}: {}",
            hook.path.display(),
            stderr.trim()
        )));
    }
    Ok(())
}
