//! Named file-descriptor donation for sandbox children.
//!
//! An agency accumulates host files destined for one child. At spawn
//! time the pending donations are assigned consecutive descriptors in
//! the child's table and published as `--<name>=<n>` flags so the
//! child locates each file by name rather than by position. Files the
//! agency still holds are closed when it is dropped, so no donation
//! survives past child start on any path.

use crate::error::{Error, Result};
use crate::process::SpawnPlan;
use std::fs::File;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;

use crate::constants::DONATION_BASE_FD;

/// Collects named file donations for one child process.
#[derive(Default)]
pub struct Agency {
    donations: Vec<(String, OwnedFd)>,
}

impl Agency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `path` with the given flags and retains it under `name`.
    pub fn open_and_donate(
        &mut self,
        name: &str,
        path: &Path,
        flags: nix::fcntl::OFlag,
    ) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;
        let path_c = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Internal(format!("path {} contains NUL", path.display())))?;
        // SAFETY: plain open(2) on an owned C string.
        let fd = unsafe {
            libc::open(
                path_c.as_ptr(),
                flags.bits() | libc::O_CLOEXEC,
                0o644 as libc::c_uint,
            )
        };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return Err(Error::Internal(format!(
                "opening {} for donation {name:?}: {err}",
                path.display()
            )));
        }
        // SAFETY: fd was just opened and is owned by nobody else.
        self.donate(name, unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(())
    }

    /// Takes ownership of an already-open file under `name`. The same
    /// name may be donated repeatedly; the flag is repeated and the
    /// child collects the list in donation order.
    pub fn donate(&mut self, name: &str, fd: OwnedFd) {
        self.donations.push((name.to_string(), fd));
    }

    /// Convenience for donating a `File`.
    pub fn donate_file(&mut self, name: &str, file: File) {
        self.donate(name, OwnedFd::from(file));
    }

    /// Number of pending donations.
    pub fn len(&self) -> usize {
        self.donations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.donations.is_empty()
    }

    /// Moves every pending donation into the spawn plan, assigning
    /// consecutive child descriptors and appending the name→number
    /// flags. Returns the first descriptor past the donated range.
    pub fn transfer(&mut self, plan: &mut SpawnPlan) -> i32 {
        for (name, fd) in self.donations.drain(..) {
            let target = DONATION_BASE_FD + plan.inherited.len() as i32;
            tracing::debug!(name = %name, fd = target, "donating file to child");
            plan.args.push(format!("--{name}={target}"));
            plan.inherited.push(fd);
        }
        DONATION_BASE_FD + plan.inherited.len() as i32
    }

    /// Closes every file still held. Dropping the agency has the same
    /// effect; this form marks intent on early-error paths.
    pub fn close(self) {}
}
