//! Filestore creation for overlay upper layers.
//!
//! Filestores are regular files backing the writable layer of
//! overlaid gofer mounts. They are created inside the gofer's mount
//! namespace, reached through `/proc/<gofer_pid>/root`, so they never
//! pin the host's own mount points. The gofer must already be running
//! and still be parked before its pivot root: the synchronization
//! descriptor donated at spawn keeps it there until the filestores
//! exist.

use crate::config::Overlay2;
use crate::constants::SELF_FILESTORE_PREFIX;
use crate::error::{Error, Result};
use crate::mounts::{GoferMountConf, PodMountHints, UpperLayer};
use crate::spec::Spec;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};

/// Location used for memory-backed filestores.
const MEMORY_FILESTORE_DIR: &str = "/dev/shm";

/// Path of the named filestore file for a self-backed overlay: a
/// hidden file inside the mount source, keyed by sandbox id so the
/// file is discoverable by path traversal (storage accounting tools
/// scan for it) and distinct across sandboxes sharing a source.
pub fn self_filestore_path(mount_src: &Path, sandbox_id: &str) -> PathBuf {
    mount_src.join(format!("{SELF_FILESTORE_PREFIX}{sandbox_id}"))
}

/// Re-roots an absolute host path under `/proc/<pid>/root`.
fn in_gofer_root(gofer_root: &Path, path: &Path) -> PathBuf {
    gofer_root.join(path.strip_prefix("/").unwrap_or(path))
}

/// Creates every filestore required by the mount configurations, in
/// mount order. Returns the open files in the same order; they are
/// donated to the sentry alongside the IO channels.
pub fn create_filestores(
    gofer_pid: i32,
    spec: &Spec,
    confs: &[GoferMountConf],
    overlay: &Overlay2,
    hints: &PodMountHints,
    sandbox_id: &str,
) -> Result<Vec<File>> {
    let gofer_root = PathBuf::from(format!("/proc/{gofer_pid}/root"));
    let root = spec
        .root
        .as_ref()
        .ok_or_else(|| Error::InvalidSpec("spec has no root filesystem".into()))?;

    let mut filestores = Vec::new();
    let mut sources: Vec<&Path> = vec![root.path.as_path()];
    sources.extend(spec.gofer_mounts().map(|m| m.source.as_path()));
    if sources.len() != confs.len() {
        return Err(Error::Internal(format!(
            "mount configuration count {} does not match gofer mount count {}",
            confs.len(),
            sources.len()
        )));
    }

    for (conf, src) in confs.iter().zip(sources) {
        if let Some(file) = create_filestore(&gofer_root, conf, src, overlay, hints, sandbox_id)? {
            filestores.push(file);
        }
    }

    for file in &filestores {
        // Runs outside the sandbox: the sentry's seccomp filter would
        // reject the mmap this needs.
        ima_workaround(file.as_raw_fd());
    }
    Ok(filestores)
}

fn create_filestore(
    gofer_root: &Path,
    conf: &GoferMountConf,
    mount_src: &Path,
    overlay: &Overlay2,
    hints: &PodMountHints,
    sandbox_id: &str,
) -> Result<Option<File>> {
    match conf.upper {
        UpperLayer::None => Ok(None),
        UpperLayer::SelfBacked => {
            let shared = hints
                .find(mount_src)
                .map(|h| h.should_share_mount())
                .unwrap_or(false);
            create_in_self(gofer_root, mount_src, sandbox_id, shared).map(Some)
        }
        UpperLayer::Anon => {
            let dir = overlay.host_file_dir.as_deref().ok_or_else(|| {
                Error::InvalidSpec("anon overlay requested without a host filestore directory".into())
            })?;
            create_unnamed(gofer_root, dir).map(Some)
        }
        UpperLayer::Memory => create_unnamed(gofer_root, Path::new(MEMORY_FILESTORE_DIR)).map(Some),
    }
}

/// Creates the named filestore inside the mount source.
///
/// Shared mounts may reopen an existing filestore (the first shared
/// user created it). For non-shared mounts an existing file is fatal:
/// two independent overlays of the same source would not see each
/// other's writes, so repeated submounts are rejected here.
fn create_in_self(
    gofer_root: &Path,
    mount_src: &Path,
    sandbox_id: &str,
    shared: bool,
) -> Result<File> {
    use std::os::unix::ffi::OsStrExt;
    let mut flags = libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC;
    if !shared {
        flags |= libc::O_EXCL;
    }
    let path = in_gofer_root(gofer_root, &self_filestore_path(mount_src, sandbox_id));
    let path_c = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Internal(format!("path {} contains NUL", path.display())))?;
    // SAFETY: plain open(2) on an owned C string.
    let fd = unsafe { libc::open(path_c.as_ptr(), flags, 0o666 as libc::c_uint) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Err(Error::InvalidSpec(format!(
                "mount source {} already has a filestore at {}; repeated submounts are not supported with overlays",
                mount_src.display(),
                path.display()
            )));
        }
        return Err(Error::Internal(format!(
            "creating filestore inside {}: {err}",
            mount_src.display()
        )));
    }
    tracing::debug!(path = %path.display(), source = %mount_src.display(), "created self filestore");
    // SAFETY: fd was just opened and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Creates an unnamed filestore in `dir`: a named temporary file that
/// is immediately unlinked, so its lifetime is bounded by the
/// descriptor. O_TMPFILE is not relied on; not all filesystems
/// support it.
fn create_unnamed(gofer_root: &Path, dir: &Path) -> Result<File> {
    let host_dir = in_gofer_root(gofer_root, dir);
    let meta = std::fs::metadata(&host_dir)
        .map_err(|e| Error::InvalidSpec(format!("filestore directory {}: {e}", dir.display())))?;
    if !meta.is_dir() {
        return Err(Error::InvalidSpec(format!(
            "filestore location {} is not a directory",
            dir.display()
        )));
    }
    let file = tempfile::tempfile_in(&host_dir)
        .map_err(|e| Error::Internal(format!("creating filestore in {}: {e}", dir.display())))?;
    tracing::debug!(dir = %dir.display(), "created unnamed filestore");
    Ok(file)
}

/// Touches the file with an executable mapping so the host's
/// integrity-measurement machinery records it now, while the
/// measurement is still permitted. Must run before the sentry
/// installs its seccomp filter. Failure is harmless on hosts without
/// measurement enforcement.
pub fn ima_workaround(fd: std::os::fd::RawFd) {
    unsafe {
        let len = 1;
        let addr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_EXEC,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if addr == libc::MAP_FAILED {
            tracing::warn!(fd, "executable mapping of filestore failed");
            return;
        }
        libc::munmap(addr, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_filestore_path() {
        let path = self_filestore_path(Path::new("/mnt/data"), "sandbox1");
        assert_eq!(
            path,
            PathBuf::from("/mnt/data/.wardenrun.filestore.sandbox1")
        );
    }

    #[test]
    fn test_in_gofer_root_reroots_absolute_paths() {
        let root = Path::new("/proc/42/root");
        assert_eq!(
            in_gofer_root(root, Path::new("/mnt/data")),
            PathBuf::from("/proc/42/root/mnt/data")
        );
    }

    #[test]
    fn test_create_in_self_excl_rejects_existing() {
        let dir = tempfile::tempdir().unwrap();
        create_in_self(Path::new("/"), dir.path(), "s1", false).unwrap();
        let err = create_in_self(Path::new("/"), dir.path(), "s1", false).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
        // A shared mount may reopen the same filestore.
        create_in_self(Path::new("/"), dir.path(), "s1", true).unwrap();
    }

    #[test]
    fn test_create_unnamed_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let _file = create_unnamed(Path::new("/"), dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
