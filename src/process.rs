//! Process supervision for sandbox children.
//!
//! The supervisor spawns the gofer and the sentry by re-entering the
//! runtime binary under a subcommand label, with a prepared namespace
//! set and an inherited descriptor table. Namespace entry happens in
//! the child between fork and exec through a single primitive: one
//! `unshare` call for namespaces to create, then `setns` per
//! namespace to join. A failure at any step aborts the exec, so the
//! child never runs with partial namespace setup.
//!
//! uid/gid mappings for a freshly created user namespace are written
//! by the parent right after the spawn; children are expected to gate
//! on their synchronization descriptor before doing credential-
//! sensitive work, and to resolve their own credentials once the
//! mappings are in place.

use crate::error::{Error, Result};
use crate::spec::{LinuxIdMapping, LinuxNamespace, NamespaceType};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};

use crate::constants::DONATION_BASE_FD;

// =============================================================================
// Spawn Plan
// =============================================================================

/// uid/gid mappings written into `/proc/<pid>/` after spawn.
#[derive(Debug, Clone, Default)]
pub struct IdMappings {
    pub uid: Vec<LinuxIdMapping>,
    pub gid: Vec<LinuxIdMapping>,
}

/// Everything needed to start one sandbox child.
pub struct SpawnPlan {
    /// Executable; the runtime's own binary unless overridden.
    pub exe: PathBuf,
    /// Process label (argv[0]), e.g. `wardenrun-gofer`, so the child
    /// is identifiable in process listings.
    pub arg0: String,
    /// Full argument list: configuration flags, the subcommand label,
    /// subcommand flags, and the donation name→fd flags.
    pub args: Vec<String>,
    /// Namespaces to create (no path) or join (path).
    pub namespaces: Vec<LinuxNamespace>,
    /// Mappings to install when a user namespace is created.
    pub id_mappings: Option<IdMappings>,
    /// Signal delivered to the child when this process exits
    /// (attached mode).
    pub death_signal: Option<i32>,
    /// Detach the child from the controlling terminal.
    pub detach_session: bool,
    /// Files inherited by the child at consecutive descriptors
    /// starting at `DONATION_BASE_FD`.
    pub inherited: Vec<OwnedFd>,
}

impl SpawnPlan {
    pub fn new(exe: PathBuf, arg0: impl Into<String>) -> Self {
        Self {
            exe,
            arg0: arg0.into(),
            args: Vec::new(),
            namespaces: Vec::new(),
            id_mappings: None,
            death_signal: None,
            detach_session: false,
            inherited: Vec::new(),
        }
    }
}

fn clone_flag(typ: NamespaceType) -> libc::c_int {
    match typ {
        NamespaceType::Pid => libc::CLONE_NEWPID,
        NamespaceType::Network => libc::CLONE_NEWNET,
        NamespaceType::Mount => libc::CLONE_NEWNS,
        NamespaceType::Ipc => libc::CLONE_NEWIPC,
        NamespaceType::Uts => libc::CLONE_NEWUTS,
        NamespaceType::User => libc::CLONE_NEWUSER,
        NamespaceType::Cgroup => libc::CLONE_NEWCGROUP,
    }
}

/// Spawns the child described by the plan.
pub fn spawn(plan: SpawnPlan) -> Result<Child> {
    let mut unshare_flags: libc::c_int = 0;
    let mut join_fds: Vec<(OwnedFd, libc::c_int)> = Vec::new();
    for ns in &plan.namespaces {
        match &ns.path {
            None => unshare_flags |= clone_flag(ns.typ),
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|e| {
                    Error::Internal(format!("opening namespace {}: {e}", path.display()))
                })?;
                join_fds.push((OwnedFd::from(file), clone_flag(ns.typ)));
            }
        }
    }

    let mut cmd = Command::new(&plan.exe);
    cmd.arg0(&plan.arg0);
    cmd.args(&plan.args);

    let detach_session = plan.detach_session;
    let death_signal = plan.death_signal;
    let join_raw: Vec<(RawFd, libc::c_int)> =
        join_fds.iter().map(|(fd, t)| (fd.as_raw_fd(), *t)).collect();
    let inherit_raw: Vec<RawFd> = plan.inherited.iter().map(|fd| fd.as_raw_fd()).collect();

    // SAFETY: the closure runs between fork and exec and only calls
    // async-signal-safe libc functions.
    unsafe {
        cmd.pre_exec(move || {
            if detach_session && libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(sig) = death_signal {
                if libc::prctl(libc::PR_SET_PDEATHSIG, sig as libc::c_ulong) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            // PID namespace membership applies to descendants; the
            // sandbox processes fork their workers after the sync
            // gate, which lands them in the new namespace.
            if unshare_flags != 0 && libc::unshare(unshare_flags) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            for (fd, nstype) in &join_raw {
                if libc::setns(*fd, *nstype) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            remap_fds(&inherit_raw)?;
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| Error::Internal(format!("spawning {}: {e}", plan.exe.display())))?;

    // Parent-side copies of the donated files are dropped here; the
    // child holds its own table now.
    drop(plan.inherited);
    drop(join_fds);

    if plan
        .namespaces
        .iter()
        .any(|ns| ns.typ == NamespaceType::User && ns.path.is_none())
    {
        if let Some(mappings) = &plan.id_mappings {
            if let Err(e) = write_id_mappings(child.id() as i32, mappings) {
                return Err(Error::Internal(format!(
                    "writing id mappings for pid {}: {e}",
                    child.id()
                )));
            }
        }
    }

    Ok(child)
}

/// Moves the inherited descriptors onto consecutive slots starting at
/// `DONATION_BASE_FD`. Sources are first duplicated above the target
/// range (close-on-exec) so a source sitting on a target slot is
/// never clobbered; `dup2` then clears close-on-exec on each target.
fn remap_fds(sources: &[RawFd]) -> std::io::Result<()> {
    let above = DONATION_BASE_FD + sources.len() as RawFd;
    let mut staged = Vec::with_capacity(sources.len());
    for src in sources {
        let tmp = unsafe { libc::fcntl(*src, libc::F_DUPFD_CLOEXEC, above) };
        if tmp < 0 {
            return Err(std::io::Error::last_os_error());
        }
        staged.push(tmp);
    }
    for (i, tmp) in staged.iter().enumerate() {
        let target = DONATION_BASE_FD + i as RawFd;
        if unsafe { libc::dup2(*tmp, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn write_id_mappings(pid: i32, mappings: &IdMappings) -> std::io::Result<()> {
    // setgroups must be denied before an unprivileged gid_map write.
    if let Ok(mut f) = std::fs::OpenOptions::new()
        .write(true)
        .open(format!("/proc/{pid}/setgroups"))
    {
        let _ = f.write_all(b"deny");
    }
    write_map_file(&format!("/proc/{pid}/gid_map"), &mappings.gid)?;
    write_map_file(&format!("/proc/{pid}/uid_map"), &mappings.uid)?;
    Ok(())
}

fn write_map_file(path: &str, mappings: &[LinuxIdMapping]) -> std::io::Result<()> {
    if mappings.is_empty() {
        return Ok(());
    }
    let mut content = String::new();
    for m in mappings {
        content.push_str(&format!("{} {} {}\n", m.container_id, m.host_id, m.size));
    }
    std::fs::write(path, content)
}

// =============================================================================
// Descriptor Hygiene
// =============================================================================

/// Marks every open descriptor above stdio close-on-exec so nothing
/// leaks into a child beyond its prepared table.
pub fn set_cloexec_on_all_fds() -> Result<()> {
    let entries = std::fs::read_dir("/proc/self/fd")?;
    for entry in entries.flatten() {
        let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<RawFd>().ok()) else {
            continue;
        };
        if fd <= 2 {
            continue;
        }
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 {
                // The readdir descriptor itself, or a racing close.
                continue;
            }
            if flags & libc::FD_CLOEXEC == 0 {
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Reaper
// =============================================================================

/// Kill/wait operations on host pids, injected into the engine so
/// tests can supervise fake children.
pub trait ProcessReaper: Send + Sync {
    /// Sends a signal to the process.
    fn kill(&self, pid: i32, signo: i32) -> Result<()>;

    /// Returns true if the process still exists.
    fn alive(&self, pid: i32) -> bool;

    /// Blocks until the child exits and collects its status. Only
    /// valid for direct children of the current process.
    fn reap(&self, pid: i32) -> Result<()>;
}

/// The host implementation.
pub struct HostReaper;

impl ProcessReaper for HostReaper {
    fn kill(&self, pid: i32, signo: i32) -> Result<()> {
        let sig = nix::sys::signal::Signal::try_from(signo)
            .map_err(|_| Error::Internal(format!("invalid signal number {signo}")))?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig)?;
        Ok(())
    }

    fn alive(&self, pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    fn reap(&self, pid: i32) -> Result<()> {
        nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_reaper_reaps_child() {
        let child = Command::new("/bin/true").spawn().unwrap();
        let pid = child.id() as i32;
        let reaper = HostReaper;
        reaper.reap(pid).unwrap();
        assert!(!reaper.alive(pid));
    }

    #[test]
    fn test_spawn_plain_child_with_label() {
        let mut plan = SpawnPlan::new(PathBuf::from("/bin/true"), "wardenrun-test");
        plan.detach_session = true;
        let mut child = spawn(plan).unwrap();
        let status = child.wait().unwrap();
        assert!(status.success());
    }
}
