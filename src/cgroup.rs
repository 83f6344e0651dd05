//! Control-group interface.
//!
//! The engine drives cgroups only through the narrow `Cgroup` trait:
//! install the hierarchy, join it before spawning sandbox processes,
//! uninstall it on destroy. The driver producing handles is injected
//! at engine construction. This crate ships a minimal cgroup2
//! filesystem binding plus a null driver for rootless and
//! cgroup-ignoring configurations; richer drivers (systemd slices)
//! are supplied by the embedding distribution.

use crate::error::{Error, Result};
use crate::spec::LinuxResources;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Interface
// =============================================================================

/// Restore handle returned by `Cgroup::join`; leaving the guard moves
/// the process back where it was.
pub struct CgroupGuard {
    restore: Option<Box<dyn FnOnce() + Send>>,
}

impl CgroupGuard {
    pub fn noop() -> Self {
        Self { restore: None }
    }

    pub fn with_restore(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            restore: Some(Box::new(f)),
        }
    }
}

impl Drop for CgroupGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

/// One control group.
pub trait Cgroup: Send + Sync {
    /// Creates the hierarchy and applies resource limits.
    fn install(&self, resources: Option<&LinuxResources>) -> Result<()>;

    /// Moves the calling process into the cgroup; the guard restores
    /// the previous membership.
    fn join(&self) -> Result<CgroupGuard>;

    /// Removes the hierarchy.
    fn uninstall(&self) -> Result<()>;

    /// Total CPU usage of the cgroup in nanoseconds.
    fn cpu_usage(&self) -> Result<u64>;

    /// The cgroup path this handle was opened from.
    fn path(&self) -> &str;
}

/// Factory producing cgroup handles from spec paths. Injected into
/// the engine; destroy re-opens handles from persisted paths.
pub trait CgroupDriver: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn Cgroup>>;
}

/// Serialisable descriptor of a cgroup, persisted with the container
/// record and re-resolved through the driver on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupRef {
    pub path: String,
}

// =============================================================================
// Helpers
// =============================================================================

/// Executes `f` inside the cgroup, restoring membership afterwards.
/// With no cgroup, runs `f` in the current context.
pub fn run_in_cgroup<T>(cg: Option<&dyn Cgroup>, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match cg {
        Some(cg) => {
            let _guard = cg.join()?;
            f()
        }
        None => f(),
    }
}

/// Installs the cgroup, suppressing permission failures in rootless
/// mode (the hierarchy may be read-only there). Returns false when
/// installation was skipped.
pub fn install_checked(
    cg: &dyn Cgroup,
    resources: Option<&LinuxResources>,
    rootless: bool,
) -> Result<bool> {
    match cg.install(resources) {
        Ok(()) => Ok(true),
        Err(Error::Io(e))
            if rootless
                && matches!(
                    e.raw_os_error(),
                    Some(libc::EACCES) | Some(libc::EROFS) | Some(libc::EPERM)
                ) =>
        {
            tracing::warn!(path = cg.path(), error = %e, "skipping cgroup configuration in rootless mode");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// cgroup2 Filesystem Driver
// =============================================================================

/// Minimal binding against the unified cgroup2 hierarchy.
pub struct HostCgroupDriver {
    mountpoint: PathBuf,
}

impl HostCgroupDriver {
    pub fn new() -> Self {
        Self {
            mountpoint: PathBuf::from("/sys/fs/cgroup"),
        }
    }

    pub fn with_mountpoint(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
        }
    }
}

impl Default for HostCgroupDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupDriver for HostCgroupDriver {
    fn open(&self, path: &str) -> Result<Box<dyn Cgroup>> {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            return Err(Error::InvalidSpec("empty cgroup path".into()));
        }
        Ok(Box::new(HostCgroup {
            dir: self.mountpoint.join(rel),
            path: path.to_string(),
        }))
    }
}

struct HostCgroup {
    dir: PathBuf,
    path: String,
}

impl HostCgroup {
    fn write_limit(&self, file: &str, value: &str) -> Result<()> {
        std::fs::write(self.dir.join(file), value).map_err(Error::Io)
    }
}

impl Cgroup for HostCgroup {
    fn install(&self, resources: Option<&LinuxResources>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let Some(res) = resources else {
            return Ok(());
        };
        if let Some(limit) = res.pointer("/memory/limit").and_then(|v| v.as_i64()) {
            self.write_limit("memory.max", &limit.to_string())?;
        }
        if let Some(limit) = res.pointer("/pids/limit").and_then(|v| v.as_i64()) {
            self.write_limit("pids.max", &limit.to_string())?;
        }
        let quota = res.pointer("/cpu/quota").and_then(|v| v.as_i64());
        let period = res
            .pointer("/cpu/period")
            .and_then(|v| v.as_u64())
            .unwrap_or(100_000);
        if let Some(quota) = quota {
            let max = if quota <= 0 {
                "max".to_string()
            } else {
                quota.to_string()
            };
            self.write_limit("cpu.max", &format!("{max} {period}"))?;
        }
        Ok(())
    }

    fn join(&self) -> Result<CgroupGuard> {
        let previous = current_cgroup_dir(&self.dir)?;
        std::fs::write(self.dir.join("cgroup.procs"), std::process::id().to_string())?;
        Ok(CgroupGuard::with_restore(move || {
            if let Some(prev) = previous {
                let _ = std::fs::write(prev.join("cgroup.procs"), std::process::id().to_string());
            }
        }))
    }

    fn uninstall(&self) -> Result<()> {
        match std::fs::remove_dir(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn cpu_usage(&self) -> Result<u64> {
        let stat = std::fs::read_to_string(self.dir.join("cpu.stat"))?;
        for line in stat.lines() {
            if let Some(usec) = line.strip_prefix("usage_usec ") {
                let usec: u64 = usec
                    .trim()
                    .parse()
                    .map_err(|_| Error::Internal(format!("malformed cpu.stat line {line:?}")))?;
                return Ok(usec * 1_000);
            }
        }
        Ok(0)
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// Resolves the calling process's current cgroup directory so `join`
/// can restore it. `None` when the membership cannot be determined.
fn current_cgroup_dir(target: &Path) -> Result<Option<PathBuf>> {
    let mountpoint = target
        .ancestors()
        .find(|a| a.join("cgroup.controllers").exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/sys/fs/cgroup"));
    let content = match std::fs::read_to_string("/proc/self/cgroup") {
        Ok(content) => content,
        Err(_) => return Ok(None),
    };
    for line in content.lines() {
        // cgroup2 entries look like `0::/some/path`.
        if let Some(rel) = line.strip_prefix("0::") {
            return Ok(Some(mountpoint.join(rel.trim_start_matches('/'))));
        }
    }
    Ok(None)
}

// =============================================================================
// Null Driver
// =============================================================================

/// Driver used when cgroup configuration is disabled: every operation
/// succeeds without touching the host.
pub struct NullCgroupDriver;

impl CgroupDriver for NullCgroupDriver {
    fn open(&self, path: &str) -> Result<Box<dyn Cgroup>> {
        Ok(Box::new(NullCgroup {
            path: path.to_string(),
        }))
    }
}

struct NullCgroup {
    path: String,
}

impl Cgroup for NullCgroup {
    fn install(&self, _resources: Option<&LinuxResources>) -> Result<()> {
        Ok(())
    }

    fn join(&self) -> Result<CgroupGuard> {
        Ok(CgroupGuard::noop())
    }

    fn uninstall(&self) -> Result<()> {
        Ok(())
    }

    fn cpu_usage(&self) -> Result<u64> {
        Ok(0)
    }

    fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_driver_round_trip() {
        let cg = NullCgroupDriver.open("/pod/c1").unwrap();
        cg.install(None).unwrap();
        {
            let _guard = cg.join().unwrap();
        }
        cg.uninstall().unwrap();
        assert_eq!(cg.path(), "/pod/c1");
    }

    #[test]
    fn test_run_in_cgroup_without_cgroup() {
        let out = run_in_cgroup(None, || Ok(7)).unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn test_host_driver_rejects_empty_path() {
        assert!(HostCgroupDriver::new().open("").is_err());
    }
}
