//! Error types for the container lifecycle core.

use std::fmt;
use std::time::Duration;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the lifecycle core.
///
/// The variants form a stable taxonomy: callers (the CLI, an
/// orchestrator shim) are expected to match on them to decide whether
/// to retry, escalate, or treat the failure as benign.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Validation
    // =========================================================================
    /// Container id does not match the accepted alphabet.
    #[error("invalid container id: {0:?}")]
    InvalidId(String),

    /// The OCI spec (or runtime configuration derived from it) is unusable.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The operation is not permitted in the container's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A live container with the same id already exists.
    #[error("container already exists: {0}")]
    AlreadyExists(String),

    /// No container with this id exists under the root directory.
    #[error("container not found: {0}")]
    NotFound(String),

    /// A non-blocking lock acquisition found the state file held.
    #[error("state file is locked by another process: {0}")]
    LockContended(String),

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    /// The caller's cancellation token tripped.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait expired.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The state file exists but cannot be decoded (torn write from a
    /// foreign tool, or an unknown format version).
    #[error("corrupt state file: {0}")]
    Corrupt(String),

    // =========================================================================
    // Host Errors
    // =========================================================================
    /// Host I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller lacks permission for the requested action.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The sentry control socket could not be reached.
    #[error("sandbox unreachable: {0}")]
    SandboxUnreachable(String),

    /// A fatal OCI hook failed.
    #[error("hook failed: {0}")]
    HookFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Several teardown failures collected into one report.
    #[error("{0}")]
    Aggregate(ErrorList),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Folds collected error messages into a single aggregate error.
    ///
    /// Returns `None` when the list is empty so teardown paths can
    /// report success after a fully clean pass.
    pub fn aggregate(errs: Vec<String>) -> Option<Error> {
        if errs.is_empty() {
            None
        } else {
            Some(Error::Aggregate(ErrorList(errs)))
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

/// List of error messages, one per failed teardown step.
#[derive(Debug)]
pub struct ErrorList(pub Vec<String>);

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_none() {
        assert!(Error::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn test_aggregate_joins_messages() {
        let err = Error::aggregate(vec!["a failed".into(), "b failed".into()]).unwrap();
        assert_eq!(err.to_string(), "a failed; b failed");
    }
}
