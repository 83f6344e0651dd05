//! Container lifecycle engine.
//!
//! A `Container` is the per-container state machine:
//!
//! ```text
//!   Creating ──▶ Created ──▶ Running ◀──▶ Paused
//!       │           │           │            │
//!       └───────────┴───────────┴────────────┴──▶ Stopped
//! ```
//!
//! It owns the persisted metadata record, the gofer it spawned, and a
//! handle to the sandbox hosting it. All cross-process ordering rests
//! on the state file's advisory lock: an operation that mutates the
//! record saves it before releasing the lock, and any other process
//! observes either the previous record or the new one.
//!
//! The `Engine` bundles the injected dependencies (configuration,
//! cgroup driver, sandbox dialer, process reaper); containers borrow
//! it for every operation.

use crate::cancel::CancelToken;
use crate::cgroup::{install_checked, run_in_cgroup, Cgroup, CgroupDriver, CgroupRef};
use crate::cleanup::Cleanup;
use crate::config::Config;
use crate::constants::{
    BOOT_COMMAND, CGROUP_PARENT_ANNOTATION, EXIT_SIGNAL_OFFSET, GOFER_COMMAND, OCI_VERSION,
    STOP_POLL_INTERVAL, STOP_TIMEOUT,
};
use crate::donation::Agency;
use crate::error::{Error, Result};
use crate::filestore::{self, self_filestore_path};
use crate::hooks::{execute_hooks, execute_hooks_best_effort, warn_unsupported};
use crate::mounts::{
    plan_gofer_mounts, render_conf_flag, should_spawn_gofer, GoferMountConf, PodMountHints,
    RootfsHint,
};
use crate::oom::{self, SiblingScore};
use crate::process::{self, IdMappings, ProcessReaper, SpawnPlan};
use crate::sandbox::{
    endpoint, CheckpointOpts, EventOut, ExecArgs, ProcessInfo, RuntimeState, Sandbox, SandboxDialer,
};
use crate::signalfwd::SignalForwarder;
use crate::spec::{
    self, container_type, is_root, modify_for_directfs, validate_id, Mount, NamespaceType, Spec,
    State,
};
use crate::statefile::{self, FullId, LockMode, StateFile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

// =============================================================================
// Status
// =============================================================================

/// Container lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Being created; never observed on disk after create returns.
    Creating,
    /// Created but not started.
    Created,
    /// Workload running.
    Running,
    /// Suspended by `pause`.
    Paused,
    /// Workload exited or sandbox gone.
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The lifecycle engine: configuration plus injected host seams.
pub struct Engine {
    config: Config,
    cgroups: Arc<dyn CgroupDriver>,
    dialer: Arc<dyn SandboxDialer>,
    reaper: Arc<dyn ProcessReaper>,
}

/// Arguments for creating a container.
pub struct CreateArgs {
    pub id: String,
    pub spec: Spec,
    pub bundle_dir: PathBuf,
    /// Listening unix socket that receives the console master FD.
    pub console_socket: Option<PathBuf>,
    /// File the sandbox pid is written to; the orchestrator considers
    /// create complete once it exists.
    pub pid_file: Option<PathBuf>,
    /// Destination for user-visible sandbox logs (root container only).
    pub user_log: Option<PathBuf>,
    /// Tie the sandbox lifetime to the calling process.
    pub attached: bool,
}

impl Engine {
    pub fn new(
        config: Config,
        cgroups: Arc<dyn CgroupDriver>,
        dialer: Arc<dyn SandboxDialer>,
        reaper: Arc<dyn ProcessReaper>,
    ) -> Self {
        Self {
            config,
            cgroups,
            dialer,
            reaper,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lists every live container under the root directory.
    pub fn list(&self) -> Result<Vec<FullId>> {
        statefile::live_ids(&self.config.root_dir)
    }

    /// Loads a container by bare id, searching across sandboxes.
    pub fn load(&self, cid: &str) -> Result<Container> {
        let full_id = statefile::find(&self.config.root_dir, cid)?;
        self.load_exact(&full_id)
    }

    /// Loads a container by its exact `FullId`.
    pub fn load_exact(&self, full_id: &FullId) -> Result<Container> {
        let mut container: Container = statefile::load(&self.config.root_dir, full_id)?;
        container.gofer_is_child = false;
        Ok(container)
    }

    /// Loads every container of one sandbox.
    pub fn load_sandbox(&self, sandbox_id: &str) -> Result<Vec<Container>> {
        statefile::sandbox_ids(&self.config.root_dir, sandbox_id)?
            .iter()
            .map(|id| self.load_exact(id))
            .collect()
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates a container: in a new sandbox for root containers, in
    /// the existing sandbox named by the spec annotations otherwise.
    /// The caller must eventually destroy the returned container.
    pub fn create(&self, args: CreateArgs, cancel: &CancelToken) -> Result<Container> {
        tracing::debug!(cid = %args.id, root_dir = %self.config.root_dir.display(), "creating container");
        validate_id(&args.id)?;
        create_state_root(&self.config.root_dir)?;

        let conf = self.config.with_bundle_overrides(&args.spec.annotations)?;
        let mut spec = args.spec;
        if conf.directfs && !conf.test_only_run_as_user {
            modify_for_directfs(&mut spec)?;
        }

        let sandbox_id = if is_root(&spec) {
            args.id.clone()
        } else {
            spec::sandbox_id(&spec).ok_or_else(|| {
                Error::InvalidSpec("no sandbox id found when creating container".into())
            })?
        };

        let mut container = Container {
            id: args.id.clone(),
            spec,
            bundle_dir: args.bundle_dir,
            created_at: Utc::now(),
            owner: std::env::var("USER").unwrap_or_default(),
            console_socket: args.console_socket,
            status: Status::Creating,
            gofer_pid: 0,
            sandbox: None,
            compat_cgroup: None,
            gofer_mount_confs: Vec::new(),
            saver: StateFile::new(
                self.config.root_dir.clone(),
                FullId::new(sandbox_id, args.id),
            ),
            gofer_is_child: false,
        };

        // Locking the metadata prevents concurrent creations with the
        // same id. Failure here must not destroy anything: the losing
        // creator would take down the winner's container.
        container.saver.lock_for_new()?;

        let result = self.create_locked(
            &mut container,
            &conf,
            args.pid_file.as_deref(),
            args.user_log.as_deref(),
            args.attached,
            cancel,
        );
        container.saver.unlock_or_log();

        match result {
            Ok(()) => Ok(container),
            Err(e) => {
                // Roll back whatever the partial create acquired.
                if let Err(derr) = container.destroy(self) {
                    tracing::warn!(cid = %container.id, error = %derr, "cleanup of failed create");
                }
                Err(e)
            }
        }
    }

    fn create_locked(
        &self,
        c: &mut Container,
        conf: &Config,
        pid_file: Option<&Path>,
        user_log: Option<&Path>,
        attached: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        if is_root(&c.spec) {
            tracing::debug!(cid = %c.id, "creating new sandbox for container");
            let (parent_cgroup, sub_cgroup) = if conf.ignore_cgroups {
                (None, None)
            } else {
                self.setup_cgroup_for_root(c, conf)?
            };
            c.compat_cgroup = sub_cgroup.as_ref().map(|cg| CgroupRef {
                path: cg.path().to_string(),
            });
            let mount_hints = PodMountHints::from_spec(&c.spec)?;

            // Join before spawning so the gofer, the sentry, and all
            // their descendants are accounted from the first instant.
            let join_cgroup: Option<&dyn Cgroup> = sub_cgroup
                .as_deref()
                .or(parent_cgroup.as_deref());
            run_in_cgroup(join_cgroup, || {
                let gofer = self.create_gofer_process(c, conf, &mount_hints, attached)?;
                let sandbox = self.spawn_sentry(
                    c,
                    conf,
                    &mount_hints,
                    parent_cgroup.as_deref(),
                    gofer,
                    user_log,
                    attached,
                )?;
                c.sandbox = Some(sandbox);
                Ok(())
            })?;
        } else {
            let sandbox_id = c.saver.id.sandbox_id.clone();
            tracing::debug!(cid = %c.id, sandbox = %sandbox_id, "creating subcontainer");

            let root_id = FullId::new(sandbox_id.clone(), sandbox_id.clone());
            let root = self.load_exact(&root_id)?;
            let sandbox = root.sandbox.ok_or_else(|| {
                Error::InvalidState(format!("sandbox {sandbox_id:?} is not running"))
            })?;

            if !conf.ignore_cgroups {
                c.compat_cgroup = self.setup_cgroup_for_subcontainer(c, conf)?;
            }

            // A console socket means the orchestrator wants the master
            // side of a fresh pty; the replica goes to the sandbox.
            let tty = match &c.console_socket {
                Some(socket) => Some(allocate_console(socket)?),
                None => None,
            };
            sandbox.create_subcontainer(self.dialer.as_ref(), cancel, &c.id, tty.as_ref())?;
            c.sandbox = Some(sandbox);
        }

        c.change_status(Status::Created);
        c.save_locked()?;

        // Per the OCI lifecycle, prestart (deprecated but still called
        // from create) and createRuntime failures must stop and
        // destroy the container.
        if let Some(hooks) = c.spec.hooks.clone() {
            let state = c.state();
            execute_hooks(&hooks.prestart, &state)?;
            execute_hooks(&hooks.create_runtime, &state)?;
            warn_unsupported("createContainer", &hooks.create_container);
        }

        // The pid file is the orchestrator's completion signal, so it
        // is the last thing written.
        if let Some(pid_file) = pid_file {
            std::fs::write(pid_file, c.sandbox_pid().to_string())?;
        }
        Ok(())
    }

    /// Create + start (+ attached wait). Returns the raw wait status,
    /// or 0 when the sandbox was left running detached.
    pub fn run(&self, args: CreateArgs, cancel: &CancelToken) -> Result<i32> {
        tracing::debug!(cid = %args.id, "running container");
        let attached = args.attached;
        let terminal = args
            .spec
            .process
            .as_ref()
            .map(|p| p.terminal)
            .unwrap_or(false);

        let mut container = self.create(args, cancel)?;
        if let Err(e) = container.start(self, cancel) {
            if let Err(derr) = container.destroy(self) {
                tracing::warn!(cid = %container.id, error = %derr, "cleanup of failed run");
            }
            return Err(e);
        }

        // With a terminal allocated, the caller's Ctrl+C belongs to
        // the workload, not to this process tree.
        let forwarder = if terminal {
            Some(container.forward_signals(self, 0)?)
        } else {
            None
        };

        let result = if attached {
            container.wait(self, cancel)
        } else {
            Ok(0)
        };
        if let Some(forwarder) = forwarder {
            forwarder.stop();
        }
        result
    }

    // =========================================================================
    // Cgroup Setup
    // =========================================================================

    /// Configures the sandbox cgroups: a parent for the whole pod and
    /// an optional per-container child. With the parent-cgroup
    /// annotation, that path hosts the sandbox and the spec path the
    /// container; otherwise both derive from the spec path.
    #[allow(clippy::type_complexity)]
    fn setup_cgroup_for_root(
        &self,
        c: &mut Container,
        conf: &Config,
    ) -> Result<(Option<Box<dyn Cgroup>>, Option<Box<dyn Cgroup>>)> {
        // Force a spec cgroup path so every sandbox is accounted.
        let linux = c.spec.linux.get_or_insert_with(Default::default);
        if linux.cgroups_path.as_deref().unwrap_or("").is_empty() && !conf.test_only_run_as_user {
            linux.cgroups_path = Some(format!("/{}", c.id));
        }

        let parent_path = match c.spec.annotations.get(CGROUP_PARENT_ANNOTATION) {
            Some(path) => Some(path.clone()),
            None => c.spec.linux.as_ref().and_then(|l| l.cgroups_path.clone()),
        };
        let Some(parent_path) = parent_path.filter(|p| !p.is_empty()) else {
            return Ok((None, None));
        };

        let parent = self.cgroups.open(&parent_path)?;
        let resources = c.spec.linux.as_ref().and_then(|l| l.resources.clone());
        if !install_checked(parent.as_ref(), resources.as_ref(), conf.rootless)? {
            return Ok((None, None));
        }

        let sub = match self.setup_cgroup_for_subcontainer(c, conf) {
            Ok(sub) => sub,
            Err(e) => {
                let _ = parent.uninstall();
                return Err(e);
            }
        };
        let sub = match sub {
            Some(sub_ref) => Some(self.cgroups.open(&sub_ref.path)?),
            None => None,
        };
        Ok((Some(parent), sub))
    }

    /// Creates the compatibility cgroup for a container. Containers
    /// run exclusively inside the sandbox, so this hierarchy carries
    /// no limits; it exists because discovery tools expect the paths.
    fn setup_cgroup_for_subcontainer(
        &self,
        c: &Container,
        conf: &Config,
    ) -> Result<Option<CgroupRef>> {
        if is_root(&c.spec) && !c.spec.annotations.contains_key(CGROUP_PARENT_ANNOTATION) {
            return Ok(None);
        }
        let Some(path) = c
            .spec
            .linux
            .as_ref()
            .and_then(|l| l.cgroups_path.clone())
            .filter(|p| !p.is_empty())
        else {
            return Ok(None);
        };
        let cg = self.cgroups.open(&path)?;
        if !install_checked(cg.as_ref(), None, conf.rootless)? {
            return Ok(None);
        }
        Ok(Some(CgroupRef { path }))
    }

    // =========================================================================
    // Gofer
    // =========================================================================

    /// Plans the gofer mounts and spawns the gofer, returning the IO
    /// channels, the filestores, and the resolved-mounts pipe. In
    /// goferless mode (EROFS rootfs, no bind mounts) no process is
    /// spawned and the rootfs image itself is the only IO file.
    fn create_gofer_process(
        &self,
        c: &mut Container,
        conf: &Config,
        mount_hints: &PodMountHints,
        attached: bool,
    ) -> Result<GoferFiles> {
        let rootfs_hint = RootfsHint::from_spec(&c.spec)?;
        c.gofer_mount_confs = plan_gofer_mounts(
            &c.spec,
            &conf.overlay2,
            mount_hints,
            rootfs_hint.as_ref(),
        )?;

        if !should_spawn_gofer(&c.gofer_mount_confs) {
            if !c.gofer_mount_confs[0].should_use_erofs() {
                return Err(Error::InvalidSpec(
                    "goferless mode is only possible with an EROFS rootfs".into(),
                ));
            }
            let hint = rootfs_hint.as_ref().ok_or_else(|| {
                Error::InvalidSpec("EROFS rootfs requires a rootfs hint with an image source".into())
            })?;
            let image = File::open(&hint.mount.source).map_err(|e| {
                Error::InvalidSpec(format!(
                    "opening rootfs image {}: {e}",
                    hint.mount.source.display()
                ))
            })?;
            tracing::debug!(cid = %c.id, "goferless sandbox, donating rootfs image directly");
            return Ok(GoferFiles {
                io_files: vec![image],
                filestores: Vec::new(),
                mounts_file: None,
            });
        }

        // Nothing beyond the prepared table may leak into the child.
        process::set_cloexec_on_all_fds()?;

        let mut donations = Agency::new();
        if let Some(log) = &conf.log {
            donations.open_and_donate(
                "log-fd",
                log,
                nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_APPEND,
            )?;
        }
        if let Some(debug_log) = &conf.debug_log {
            donations.open_and_donate(
                "debug-log-fd",
                debug_log,
                nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_APPEND,
            )?;
        }
        donations.open_and_donate(
            "spec-fd",
            &c.bundle_dir.join("config.json"),
            nix::fcntl::OFlag::O_RDONLY,
        )?;

        // The gofer resolves symlinks in the mount list and reports
        // the cleaned mounts back over this pipe.
        let (mounts_read, mounts_write) = pipe_pair()?;
        donations.donate("mounts-fd", mounts_write);

        // The gofer parks before its pivot root until this end closes,
        // keeping its pre-chroot mount view available to the host.
        let (sync_host, sync_gofer) = stream_pair()?;
        donations.donate("sync-chroot-fd", sync_gofer);

        let mut io_files: Vec<File> = Vec::new();
        for (i, mount_conf) in c.gofer_mount_confs.iter().enumerate() {
            if mount_conf.should_use_lisafs() {
                let (sand_end, gofer_end) = stream_pair()?;
                io_files.push(File::from(sand_end));
                donations.donate("io-fds", gofer_end);
            } else if mount_conf.should_use_erofs() {
                if i > 0 {
                    return Err(Error::InvalidSpec(
                        "EROFS lower layer is only supported for the root mount".into(),
                    ));
                }
                let hint = rootfs_hint.as_ref().ok_or_else(|| {
                    Error::InvalidSpec("EROFS rootfs requires a rootfs hint".into())
                })?;
                io_files.push(File::open(&hint.mount.source).map_err(|e| {
                    Error::InvalidSpec(format!(
                        "opening rootfs image {}: {e}",
                        hint.mount.source.display()
                    ))
                })?);
            }
        }

        let mut plan = SpawnPlan::new(self.sandbox_exe(conf)?, "wardenrun-gofer");
        plan.args = conf.to_flags();
        plan.args.push(GOFER_COMMAND.to_string());
        plan.args
            .push(format!("--bundle={}", c.bundle_dir.display()));
        plan.args.push(format!(
            "--gofer-mount-confs={}",
            render_conf_flag(&c.gofer_mount_confs)
        ));
        // Detach from the session so foreground signals are not
        // delivered twice.
        plan.detach_session = true;
        if attached {
            plan.death_signal = Some(libc::SIGKILL);
        }
        self.prepare_namespaces(&mut plan, &c.spec, conf)?;
        donations.transfer(&mut plan);

        tracing::debug!(cid = %c.id, exe = %plan.exe.display(), args = ?plan.args, "starting gofer");
        let child = process::spawn(plan)?;
        c.gofer_pid = child.id() as i32;
        c.gofer_is_child = true;
        tracing::info!(cid = %c.id, pid = c.gofer_pid, "gofer started");

        // From here until creation completes, a failure must not leak
        // the gofer: kill and reap it on any error path.
        let mut gofer_cleanup = Cleanup::new();
        {
            let reaper = Arc::clone(&self.reaper);
            let gofer_pid = c.gofer_pid;
            gofer_cleanup.push(move || {
                let _ = reaper.kill(gofer_pid, libc::SIGKILL);
                let _ = reaper.reap(gofer_pid);
            });
        }

        // Filestores are created through the gofer's mount namespace
        // while the sync gate still holds it pre-pivot.
        let filestores = filestore::create_filestores(
            c.gofer_pid,
            &c.spec,
            &c.gofer_mount_confs,
            &conf.overlay2,
            mount_hints,
            &c.saver.id.sandbox_id,
        )?;
        drop(sync_host);
        gofer_cleanup.release();

        Ok(GoferFiles {
            io_files,
            filestores,
            mounts_file: Some(File::from(mounts_read)),
        })
    }

    /// Spawns the sentry and returns the persisted sandbox handle.
    #[allow(clippy::too_many_arguments)]
    fn spawn_sentry(
        &self,
        c: &mut Container,
        conf: &Config,
        mount_hints: &PodMountHints,
        parent_cgroup: Option<&dyn Cgroup>,
        gofer: GoferFiles,
        user_log: Option<&Path>,
        attached: bool,
    ) -> Result<Sandbox> {
        let sandbox_id = c.saver.id.sandbox_id.clone();
        let rpc_endpoint = endpoint(&self.config.root_dir, &sandbox_id);

        let mut donations = Agency::new();
        if let Some(log) = &conf.log {
            donations.open_and_donate(
                "log-fd",
                log,
                nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_APPEND,
            )?;
        }
        if let Some(debug_log) = &conf.debug_log {
            donations.open_and_donate(
                "debug-log-fd",
                debug_log,
                nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_APPEND,
            )?;
        }
        if let Some(user_log) = user_log {
            donations.open_and_donate(
                "user-log-fd",
                user_log,
                nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_APPEND,
            )?;
        }
        donations.open_and_donate(
            "spec-fd",
            &c.bundle_dir.join("config.json"),
            nix::fcntl::OFlag::O_RDONLY,
        )?;
        if let Some(mounts_file) = gofer.mounts_file {
            donations.donate_file("mounts-fd", mounts_file);
        }
        for io_file in gofer.io_files {
            donations.donate_file("io-fds", io_file);
        }
        for filestore in gofer.filestores {
            donations.donate_file("filestore-fds", filestore);
        }

        let mut plan = SpawnPlan::new(self.sandbox_exe(conf)?, "wardenrun-sandbox");
        plan.args = conf.to_flags();
        plan.args.push(BOOT_COMMAND.to_string());
        plan.args
            .push(format!("--bundle={}", c.bundle_dir.display()));
        plan.args.push(format!("--id={sandbox_id}"));
        plan.args
            .push(format!("--controller={}", rpc_endpoint.display()));
        plan.args.push(format!(
            "--gofer-mount-confs={}",
            render_conf_flag(&c.gofer_mount_confs)
        ));
        plan.detach_session = true;
        if attached {
            plan.death_signal = Some(libc::SIGKILL);
        }
        self.prepare_namespaces(&mut plan, &c.spec, conf)?;
        donations.transfer(&mut plan);

        tracing::debug!(cid = %c.id, exe = %plan.exe.display(), args = ?plan.args, "starting sentry");
        let child = process::spawn(plan)?;
        tracing::info!(cid = %c.id, pid = child.id(), "sentry started");

        Ok(Sandbox {
            id: sandbox_id,
            pid: child.id() as i32,
            cgroup: parent_cgroup.map(|cg| CgroupRef {
                path: cg.path().to_string(),
            }),
            mount_hints: mount_hints.clone(),
            original_oom_score_adj: oom_score_adj_of_self(),
            rpc_endpoint,
        })
    }

    /// Resolves the binary used for sandbox processes.
    fn sandbox_exe(&self, conf: &Config) -> Result<PathBuf> {
        match &conf.sandbox_binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| Error::Internal(format!("resolving own executable: {e}"))),
        }
    }

    /// Fills the spawn plan's namespace set: fresh IPC, mount,
    /// network, PID, and UTS namespaces isolate the child from the
    /// host; a user namespace is entered or created per the spec.
    /// Rootless operation requires a user namespace.
    fn prepare_namespaces(&self, plan: &mut SpawnPlan, spec: &Spec, conf: &Config) -> Result<()> {
        if conf.test_only_run_as_user {
            return Ok(());
        }
        for typ in [
            NamespaceType::Ipc,
            NamespaceType::Mount,
            NamespaceType::Network,
            NamespaceType::Pid,
            NamespaceType::Uts,
        ] {
            // Honor a spec-provided namespace path (e.g. a pod network
            // namespace); create a fresh namespace otherwise.
            let path = spec.get_ns(typ).and_then(|ns| ns.path.clone());
            plan.namespaces.push(crate::spec::LinuxNamespace { typ, path });
        }

        let user_ns = spec.get_ns(NamespaceType::User).cloned();
        let rootless_euid = !nix::unistd::geteuid().is_root();
        match user_ns {
            Some(ns) => {
                let creates = ns.path.is_none();
                plan.namespaces.push(ns);
                if creates {
                    plan.id_mappings = Some(id_mappings_from_spec(spec));
                }
            }
            None if rootless_euid || conf.rootless => {
                return Err(Error::PermissionDenied(
                    "cannot run a rootless container without a user namespace".into(),
                ));
            }
            None => {}
        }
        Ok(())
    }

    // =========================================================================
    // OOM Coordination
    // =========================================================================

    /// Recomputes the sandbox `oom_score_adj` from the sibling
    /// records. Skipped when the root container is on its way down:
    /// that destroys the whole sandbox anyway.
    fn adjust_sandbox_oom(&self, sandbox: &Sandbox, spec: &Spec, destroy: bool) -> Result<()> {
        if is_root(spec) && destroy {
            return Ok(());
        }
        let mut siblings = Vec::new();
        for id in statefile::sandbox_ids(&self.config.root_dir, &sandbox.id)? {
            let sibling: Container = statefile::load(&self.config.root_dir, &id)?;
            siblings.push(SiblingScore {
                container_type: container_type(&sibling.spec),
                oom_score_adj: sibling
                    .spec
                    .process
                    .as_ref()
                    .and_then(|p| p.oom_score_adj),
            });
        }
        match oom::sandbox_score(&siblings, sandbox.original_oom_score_adj, destroy) {
            Some(score) => oom::set_oom_score_adj(sandbox.pid, score),
            None => Ok(()),
        }
    }
}

/// IO channels handed from the gofer spawn to the sentry spawn.
struct GoferFiles {
    io_files: Vec<File>,
    filestores: Vec<File>,
    mounts_file: Option<File>,
}

// =============================================================================
// Container
// =============================================================================

/// A containerized application and its persisted record.
#[derive(Debug, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub spec: Spec,
    pub bundle_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub owner: String,
    pub console_socket: Option<PathBuf>,
    pub status: Status,
    /// Host pid of the gofer, 0 when absent (killed, or goferless).
    pub gofer_pid: i32,
    /// The hosting sandbox; reset when the sandbox is destroyed.
    pub sandbox: Option<Sandbox>,
    /// Informational cgroup for multi-container tooling; carries no
    /// limits of its own.
    pub compat_cgroup: Option<CgroupRef>,
    /// Per-mount gofer configuration, index 0 is the rootfs.
    pub gofer_mount_confs: Vec<GoferMountConf>,
    pub saver: StateFile,
    /// True iff this process spawned the gofer and may wait4 it.
    #[serde(skip)]
    pub gofer_is_child: bool,
}

impl Container {
    // =========================================================================
    // Start / Restore
    // =========================================================================

    /// Starts the workload. Requires `Created`.
    pub fn start(&mut self, engine: &Engine, cancel: &CancelToken) -> Result<()> {
        tracing::debug!(cid = %self.id, "starting container");
        self.start_impl(engine, cancel, "start", None)
    }

    /// Replaces the container's kernel and filesystem state from a
    /// checkpoint image. Requires `Created`.
    pub fn restore(
        &mut self,
        engine: &Engine,
        cancel: &CancelToken,
        image_path: &Path,
        direct: bool,
        background: bool,
    ) -> Result<()> {
        tracing::debug!(cid = %self.id, image = %image_path.display(), "restoring container");
        self.start_impl(
            engine,
            cancel,
            "restore",
            Some(RestoreArgs {
                image_path: image_path.to_path_buf(),
                direct,
                background,
            }),
        )
    }

    fn start_impl(
        &mut self,
        engine: &Engine,
        cancel: &CancelToken,
        action: &str,
        restore: Option<RestoreArgs>,
    ) -> Result<()> {
        self.saver.lock(LockMode::Block)?;
        let result = self.start_locked(engine, cancel, action, restore);
        self.saver.unlock_or_log();
        result?;

        // OOM adjustment reads sibling records, so it happens after
        // the lock is gone and the new record is visible.
        if let Some(sandbox) = self.sandbox.clone() {
            engine.adjust_sandbox_oom(&sandbox, &self.spec, false)?;
            self.adjust_gofer_oom();
        }
        Ok(())
    }

    fn start_locked(
        &mut self,
        engine: &Engine,
        cancel: &CancelToken,
        action: &str,
        restore: Option<RestoreArgs>,
    ) -> Result<()> {
        self.require_status(action, &[Status::Created])?;
        if let Some(hooks) = &self.spec.hooks {
            warn_unsupported("startContainer", &hooks.start_container);
        }
        let sandbox = self
            .sandbox
            .clone()
            .ok_or_else(|| Error::Internal("container has no sandbox".into()))?;

        if is_root(&self.spec) {
            match &restore {
                None => sandbox.start_root(engine.dialer.as_ref(), cancel, &self.spec)?,
                Some(r) => sandbox.restore(
                    engine.dialer.as_ref(),
                    cancel,
                    &self.id,
                    &r.image_path,
                    r.direct,
                    r.background,
                )?,
            }
        } else {
            let conf = engine.config.with_bundle_overrides(&self.spec.annotations)?;
            // The gofer joins the sandbox cgroup so its usage lands in
            // the pod's accounting.
            let cgroup = match &sandbox.cgroup {
                Some(cgroup_ref) => Some(engine.cgroups.open(&cgroup_ref.path)?),
                None => None,
            };
            run_in_cgroup(cgroup.as_deref(), || {
                let gofer =
                    engine.create_gofer_process(self, &conf, &sandbox.mount_hints, false)?;
                if let Some(mounts_file) = &gofer.mounts_file {
                    if let Some(clean) = read_clean_mounts(mounts_file)? {
                        self.spec.mounts = clean;
                    }
                }
                // Without a terminal, the caller's stdio is the
                // workload's stdio. With one, the TTY was already
                // delivered during create.
                let terminal = self
                    .spec
                    .process
                    .as_ref()
                    .map(|p| p.terminal)
                    .unwrap_or(false);
                let stdios: Vec<RawFd> = if terminal { Vec::new() } else { vec![0, 1, 2] };

                match &restore {
                    None => sandbox.start_subcontainer(
                        engine.dialer.as_ref(),
                        cancel,
                        &self.id,
                        &self.spec,
                        &stdios,
                        &gofer.io_files,
                        &gofer.filestores,
                        None,
                        &self.gofer_mount_confs,
                    ),
                    Some(r) => sandbox.restore(
                        engine.dialer.as_ref(),
                        cancel,
                        &self.id,
                        &r.image_path,
                        r.direct,
                        r.background,
                    ),
                }
            })?;
        }

        // Poststart failures only warn; the lifecycle continues.
        if let Some(hooks) = self.spec.hooks.clone() {
            execute_hooks_best_effort(&hooks.poststart, &self.state());
        }

        self.change_status(Status::Running);
        self.save_locked()
    }

    // =========================================================================
    // Process Operations
    // =========================================================================

    /// Runs a command in the container; returns the new pid. Allowed
    /// in `Created` and `Running`.
    pub fn execute(
        &mut self,
        engine: &Engine,
        cancel: &CancelToken,
        args: ExecArgs,
    ) -> Result<i32> {
        tracing::debug!(cid = %self.id, argv = ?args.argv, "executing in container");
        self.require_status("execute in", &[Status::Created, Status::Running])?;
        let sandbox = self.require_sandbox()?;
        sandbox.execute(engine.dialer.as_ref(), cancel, &self.id, args)
    }

    /// Waits for the init process; returns the raw wait status.
    pub fn wait(&mut self, engine: &Engine, cancel: &CancelToken) -> Result<i32> {
        tracing::debug!(cid = %self.id, "waiting on container");
        let sandbox = self.require_sandbox()?;
        let status = sandbox.wait(engine.dialer.as_ref(), cancel, &self.id)?;
        self.change_status(Status::Stopped);
        Ok(status)
    }

    /// Waits for `pid` in the container's PID namespace.
    pub fn wait_pid(&mut self, engine: &Engine, cancel: &CancelToken, pid: i32) -> Result<i32> {
        let sandbox = self.require_running_sandbox()?;
        sandbox.wait_pid(engine.dialer.as_ref(), cancel, &self.id, pid)
    }

    /// Waits for `pid` in the sandbox's PID namespace.
    pub fn wait_root_pid(
        &mut self,
        engine: &Engine,
        cancel: &CancelToken,
        pid: i32,
    ) -> Result<i32> {
        let sandbox = self.require_running_sandbox()?;
        sandbox.wait_root_pid(engine.dialer.as_ref(), cancel, pid)
    }

    /// Waits for an in-flight checkpoint to complete.
    pub fn wait_checkpoint(&self, engine: &Engine, cancel: &CancelToken) -> Result<()> {
        let sandbox = self.require_running_sandbox()?;
        sandbox.wait_checkpoint(engine.dialer.as_ref(), cancel)
    }

    /// Waits for an in-flight restore to complete.
    pub fn wait_restore(&self, engine: &Engine, cancel: &CancelToken) -> Result<()> {
        let sandbox = self.require_running_sandbox()?;
        sandbox.wait_restore(engine.dialer.as_ref(), cancel)
    }

    /// Sends a signal to the init process, or to every container
    /// process with `all`. Allowed in `Running` and `Stopped`: with
    /// `all`, signals still reach processes that outlive the init,
    /// which cleanup paths rely on.
    pub fn signal(
        &self,
        engine: &Engine,
        cancel: &CancelToken,
        signo: i32,
        all: bool,
    ) -> Result<()> {
        tracing::debug!(cid = %self.id, signo, all, "signaling container");
        self.require_status("signal", &[Status::Running, Status::Stopped])?;
        let sandbox = self.require_running_sandbox()?;
        sandbox.signal_container(engine.dialer.as_ref(), cancel, &self.id, signo, all)
    }

    /// Sends a signal to one process in the container.
    pub fn signal_process(
        &self,
        engine: &Engine,
        cancel: &CancelToken,
        pid: i32,
        signo: i32,
    ) -> Result<()> {
        tracing::debug!(cid = %self.id, pid, signo, "signaling process in container");
        self.require_status("signal a process inside", &[Status::Running])?;
        let sandbox = self.require_running_sandbox()?;
        sandbox.signal_process(engine.dialer.as_ref(), cancel, &self.id, pid, signo)
    }

    /// Forwards the caller's signals into the container until the
    /// returned forwarder is stopped. `pid` 0 targets the foreground
    /// process.
    pub fn forward_signals(&self, engine: &Engine, pid: i32) -> Result<SignalForwarder> {
        let sandbox = self.require_sandbox()?;
        SignalForwarder::start(
            sandbox,
            Arc::clone(&engine.dialer),
            self.id.clone(),
            pid,
        )
    }

    // =========================================================================
    // Suspend / Checkpoint
    // =========================================================================

    /// Suspends the container. Requires `Running`.
    pub fn pause(&mut self, engine: &Engine, cancel: &CancelToken) -> Result<()> {
        tracing::debug!(cid = %self.id, "pausing container");
        self.saver.lock(LockMode::Block)?;
        let result = (|| {
            self.require_status("pause", &[Status::Running])?;
            let sandbox = self.require_sandbox()?;
            sandbox.pause(engine.dialer.as_ref(), cancel, &self.id)?;
            self.change_status(Status::Paused);
            self.save_locked()
        })();
        self.saver.unlock_or_log();
        result
    }

    /// Resumes a paused container. Requires `Paused`.
    pub fn resume(&mut self, engine: &Engine, cancel: &CancelToken) -> Result<()> {
        tracing::debug!(cid = %self.id, "resuming container");
        self.saver.lock(LockMode::Block)?;
        let result = (|| {
            self.require_status("resume", &[Status::Paused])?;
            let sandbox = self.require_sandbox()?;
            sandbox.resume(engine.dialer.as_ref(), cancel, &self.id)?;
            self.change_status(Status::Running);
            self.save_locked()
        })();
        self.saver.unlock_or_log();
        result
    }

    /// Writes a checkpoint image of the container.
    pub fn checkpoint(
        &self,
        engine: &Engine,
        cancel: &CancelToken,
        image_path: &Path,
        opts: CheckpointOpts,
    ) -> Result<()> {
        tracing::debug!(cid = %self.id, image = %image_path.display(), "checkpointing container");
        self.require_status(
            "checkpoint",
            &[Status::Created, Status::Running, Status::Paused],
        )?;
        let sandbox = self.require_sandbox()?;
        sandbox.checkpoint(engine.dialer.as_ref(), cancel, &self.id, image_path, opts)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The OCI state document.
    pub fn state(&self) -> State {
        State {
            oci_version: OCI_VERSION.to_string(),
            id: self.id.clone(),
            status: self.status.to_string(),
            pid: match self.sandbox_pid() {
                -1 => None,
                pid => Some(pid),
            },
            bundle: self.bundle_dir.display().to_string(),
            annotations: self.spec.annotations.clone(),
        }
    }

    /// The sentry pid, or -1 when the container has no live sandbox.
    pub fn sandbox_pid(&self) -> i32 {
        if self
            .require_status(
                "get PID",
                &[Status::Created, Status::Running, Status::Paused],
            )
            .is_err()
        {
            return -1;
        }
        self.sandbox.as_ref().map(|s| s.pid).unwrap_or(-1)
    }

    /// Resource usage events. Allowed in `Created`, `Running`,
    /// `Paused`.
    pub fn event(&mut self, engine: &Engine, cancel: &CancelToken) -> Result<EventOut> {
        self.require_status(
            "get events for",
            &[Status::Created, Status::Running, Status::Paused],
        )?;
        let sandbox = self.require_sandbox()?;
        let mut event = sandbox.event(engine.dialer.as_ref(), cancel, &self.id)?;
        if !event.container_usage.is_empty() {
            self.populate_stats(engine, &mut event);
        }
        Ok(event)
    }

    /// Splits host cgroup CPU usage across the sandbox's containers
    /// proportionally to the sentry's own accounting. Falls back to
    /// whichever side has data when the other reports nothing.
    fn populate_stats(&self, engine: &Engine, event: &mut EventOut) {
        let containers = event.container_usage.len() as u64;
        let mut container_usage = event
            .container_usage
            .get(&self.id)
            .copied()
            .unwrap_or(0);
        let mut all_usage: u64 = event.container_usage.values().sum();

        let cgroup_usage = self
            .sandbox
            .as_ref()
            .and_then(|s| s.cgroup.as_ref())
            .and_then(|r| engine.cgroups.open(&r.path).ok())
            .and_then(|cg| cg.cpu_usage().ok())
            .unwrap_or(0);
        if cgroup_usage == 0 {
            event.event.data.cpu.total = container_usage;
            return;
        }
        if all_usage == 0 {
            all_usage = cgroup_usage;
            container_usage = cgroup_usage / containers.max(1);
        }
        // The products overflow u64 for seconds-scale counters; go
        // through floats.
        let total =
            container_usage as f64 * (cgroup_usage as f64 / all_usage as f64);
        event.event.data.cpu.total = total as u64;
    }

    /// Processes running inside the container.
    pub fn processes(&self, engine: &Engine, cancel: &CancelToken) -> Result<Vec<ProcessInfo>> {
        self.require_status("get processes of", &[Status::Running, Status::Paused])?;
        let sandbox = self.require_sandbox()?;
        sandbox.processes(engine.dialer.as_ref(), cancel, &self.id)
    }

    /// Forwards a connected host stream to a container port.
    pub fn port_forward(
        &self,
        engine: &Engine,
        cancel: &CancelToken,
        port: u16,
        stream: OwnedFd,
    ) -> Result<()> {
        self.require_status("port forward", &[Status::Running])?;
        let sandbox = self.require_sandbox()?;
        sandbox.port_forward(engine.dialer.as_ref(), cancel, &self.id, port, stream)
    }

    /// Reconciles the status against the sentry's view; marks the
    /// container stopped when the sandbox no longer knows it or no
    /// longer exists.
    pub fn check_stopped(&mut self, engine: &Engine, cancel: &CancelToken) {
        if self.status == Status::Stopped {
            return;
        }
        let Some(sandbox) = self.sandbox.clone() else {
            self.change_status(Status::Stopped);
            return;
        };
        match sandbox.container_runtime_state(engine.dialer.as_ref(), cancel, &self.id) {
            Ok(RuntimeState::Stopped) => {
                self.change_status(Status::Stopped);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(cid = %self.id, error = %e, "cannot query container state");
                if !sandbox.is_running() {
                    tracing::warn!(cid = %self.id, "sandbox is gone, marking container stopped");
                    self.change_status(Status::Stopped);
                }
            }
        }
    }

    pub fn is_sandbox_running(&self) -> bool {
        self.sandbox.as_ref().map(Sandbox::is_running).unwrap_or(false)
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Stops all processes and removes every resource the container
    /// acquired. Idempotent; collects every failure and keeps going so
    /// one bad step never blocks the rest of the teardown.
    pub fn destroy(&mut self, engine: &Engine) -> Result<()> {
        tracing::debug!(cid = %self.id, "destroying container");
        self.saver.lock(LockMode::Block)?;

        // stop() clears self.sandbox; keep a copy for the filestore
        // and OOM work below so destroy stays idempotent.
        let sandbox = self.sandbox.clone();
        let mut errs: Vec<String> = Vec::new();
        let cancel = CancelToken::new();

        if let Err(e) = self.stop(engine, &cancel) {
            tracing::warn!(cid = %self.id, error = %e, "stopping container");
            errs.push(format!("stopping container: {e}"));
        }

        if let Err(e) = self.saver.destroy() {
            tracing::warn!(cid = %self.id, error = %e, "deleting container state files");
            errs.push(format!("deleting container state files: {e}"));
        }

        // Self-backed filestores live inside their mount sources on
        // the host and outlive the gofer; shared ones belong to the
        // sandbox and wait for the root container.
        let sandbox_id = self.saver.id.sandbox_id.clone();
        self.for_each_self_mount(|mount_src| {
            if let Some(sandbox) = &sandbox {
                if let Some(hint) = sandbox.mount_hints.find(mount_src) {
                    if hint.should_share_mount() {
                        return;
                    }
                }
            }
            let filestore = self_filestore_path(mount_src, &sandbox_id);
            if let Err(e) = std::fs::remove_file(&filestore) {
                tracing::warn!(path = %filestore.display(), error = %e, "deleting filestore");
                errs.push(format!("deleting filestore {}: {e}", filestore.display()));
            }
        });
        if let Some(sandbox) = &sandbox {
            if sandbox.is_root_container(&self.id) {
                for hint in &sandbox.mount_hints.mounts {
                    if !hint.should_share_mount() {
                        continue;
                    }
                    // Assume a self-backed shared mount; a missing
                    // file just means the assumption was wrong.
                    let filestore = self_filestore_path(&hint.mount.source, &sandbox_id);
                    match std::fs::remove_file(&filestore) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            errs.push(format!(
                                "deleting shared filestore {}: {e}",
                                filestore.display()
                            ));
                        }
                    }
                }
            }
        }

        self.change_status(Status::Stopped);

        if let Some(sandbox) = &sandbox {
            if let Err(e) = engine.adjust_sandbox_oom(sandbox, &self.spec, true) {
                errs.push(format!("adjusting sandbox oom score: {e}"));
            }
        }

        // Poststop runs exactly once: the record is gone, so this
        // container cannot be loaded and destroyed again.
        if let Some(hooks) = self.spec.hooks.clone() {
            execute_hooks_best_effort(&hooks.poststop, &self.state());
        }

        self.saver.unlock_or_log();
        Error::aggregate(errs).map_or(Ok(()), Err)
    }

    /// Stops the container (root containers stop the whole sandbox)
    /// and waits for the gofer to disappear.
    fn stop(&mut self, engine: &Engine, cancel: &CancelToken) -> Result<()> {
        let mut parent_cgroup: Option<CgroupRef> = None;
        // Retained past the nil-out below: the stop verification still
        // needs a handle to probe the sentry.
        let sandbox = self.sandbox.clone();
        if let Some(sandbox) = &sandbox {
            tracing::debug!(cid = %self.id, "destroying container in sandbox");
            match sandbox.destroy_container(engine.dialer.as_ref(), cancel, &self.id) {
                Ok(()) => {}
                // An unreachable sandbox during teardown is already
                // where we want it.
                Err(Error::SandboxUnreachable(msg)) => {
                    tracing::debug!(cid = %self.id, msg, "sandbox already gone");
                }
                Err(e) => return Err(e),
            }
            if sandbox.is_root_container(&self.id) {
                parent_cgroup = sandbox.cgroup.clone();
            }
            // Cleared only after the sandbox was told, so a failed
            // attempt retries on the next destroy.
            self.sandbox = None;
        }

        if self.gofer_pid != 0 {
            tracing::debug!(cid = %self.id, pid = self.gofer_pid, "killing gofer");
            if let Err(e) = engine.reaper.kill(self.gofer_pid, libc::SIGKILL) {
                // Already gone is fine.
                tracing::warn!(pid = self.gofer_pid, error = %e, "sending SIGKILL to gofer");
            }
        }
        self.wait_for_stopped(engine, cancel, sandbox.as_ref())?;

        if let Some(compat) = self.compat_cgroup.clone() {
            engine.cgroups.open(&compat.path)?.uninstall()?;
        }
        // The gofer ran inside the parent cgroup; uninstall only after
        // it is gone.
        if let Some(parent) = parent_cgroup {
            engine.cgroups.open(&parent.path)?.uninstall()?;
        }
        Ok(())
    }

    /// Waits for the gofer to exit: by reaping when it is our child,
    /// by bounded polling otherwise. `sandbox` is the handle retained
    /// by `stop` (the field itself is already cleared); a signal-0
    /// probe against a live sentry confirms the container actually
    /// stopped before the gofer is collected.
    fn wait_for_stopped(
        &mut self,
        engine: &Engine,
        cancel: &CancelToken,
        sandbox: Option<&Sandbox>,
    ) -> Result<()> {
        if self.gofer_pid == 0 {
            return Ok(());
        }
        if let Some(sandbox) = sandbox.filter(|s| s.is_running()) {
            if sandbox
                .signal_container(engine.dialer.as_ref(), cancel, &self.id, 0, false)
                .is_ok()
            {
                return Err(Error::InvalidState("container is still running".into()));
            }
        }
        if self.gofer_is_child {
            engine.reaper.reap(self.gofer_pid)?;
            self.gofer_pid = 0;
            return Ok(());
        }
        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            if !engine.reaper.alive(self.gofer_pid) {
                self.gofer_pid = 0;
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(STOP_TIMEOUT));
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
    }

    /// Applies `fn` to the source of every self-backed mount.
    fn for_each_self_mount(&self, mut f: impl FnMut(&Path)) {
        if self.gofer_mount_confs.is_empty() {
            // Never got as far as mount planning.
            return;
        }
        if self.gofer_mount_confs[0].is_self_backed() {
            if let Some(root) = &self.spec.root {
                f(&root.path);
            }
        }
        let mut conf_idx = 1;
        for mount in self.spec.gofer_mounts() {
            if let Some(conf) = self.gofer_mount_confs.get(conf_idx) {
                if conf.is_self_backed() {
                    f(&mount.source);
                }
            }
            conf_idx += 1;
        }
    }

    // =========================================================================
    // Record Keeping
    // =========================================================================

    fn save_locked(&self) -> Result<()> {
        tracing::debug!(cid = %self.id, status = %self.status, "saving container record");
        self.saver.save_locked(self)
    }

    fn require_sandbox(&self) -> Result<Sandbox> {
        self.sandbox
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("container {:?} has no sandbox", self.id)))
    }

    fn require_running_sandbox(&self) -> Result<Sandbox> {
        let sandbox = self.require_sandbox()?;
        if !sandbox.is_running() {
            return Err(Error::SandboxUnreachable("sandbox is not running".into()));
        }
        Ok(sandbox)
    }

    fn require_status(&self, action: &str, statuses: &[Status]) -> Result<()> {
        if statuses.contains(&self.status) {
            return Ok(());
        }
        Err(Error::InvalidState(format!(
            "cannot {action} container {:?} in state {}",
            self.id, self.status
        )))
    }

    /// Transitions to a new status, enforcing the lifecycle diagram.
    /// A forbidden transition is a programming error, not a user
    /// error.
    fn change_status(&mut self, new: Status) {
        match new {
            Status::Creating => {
                panic!("invalid state transition: {} => {new}", self.status)
            }
            Status::Created => {
                assert!(
                    self.status == Status::Creating,
                    "invalid state transition: {} => {new}",
                    self.status
                );
                assert!(self.sandbox.is_some(), "created container has no sandbox");
            }
            Status::Running => {
                assert!(
                    self.status == Status::Created || self.status == Status::Paused,
                    "invalid state transition: {} => {new}",
                    self.status
                );
                assert!(self.sandbox.is_some(), "running container has no sandbox");
            }
            Status::Paused => {
                assert!(
                    self.status == Status::Running,
                    "invalid state transition: {} => {new}",
                    self.status
                );
            }
            // Everything may stop.
            Status::Stopped => {}
        }
        self.status = new;
    }

    fn adjust_gofer_oom(&self) {
        let Some(score) = self.spec.process.as_ref().and_then(|p| p.oom_score_adj) else {
            return;
        };
        if self.gofer_pid == 0 {
            return;
        }
        // The gofer is dedicated to this container, so it carries the
        // container's own score.
        if let Err(e) = oom::set_oom_score_adj(self.gofer_pid, score) {
            tracing::warn!(pid = self.gofer_pid, error = %e, "adjusting gofer oom score");
        }
    }
}

struct RestoreArgs {
    image_path: PathBuf,
    direct: bool,
    background: bool,
}

// =============================================================================
// Helpers
// =============================================================================

/// Converts a raw wait status into a CLI exit code: the exit status
/// for normal exits, 128 plus the signal number for signal deaths.
pub fn wait_status_to_exit_code(raw: i32) -> i32 {
    if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        EXIT_SIGNAL_OFFSET + libc::WTERMSIG(raw)
    } else {
        raw
    }
}

fn create_state_root(root_dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o711)
        .create(root_dir)
        .map_err(|e| Error::Internal(format!("creating root directory {}: {e}", root_dir.display())))
}

fn id_mappings_from_spec(spec: &Spec) -> IdMappings {
    match &spec.linux {
        Some(linux) => IdMappings {
            uid: linux.uid_mappings.clone(),
            gid: linux.gid_mappings.clone(),
        },
        None => IdMappings::default(),
    }
}

/// The caller's own `oom_score_adj`, recorded at sandbox creation so
/// destroy can revert the sentry to it.
fn oom_score_adj_of_self() -> i32 {
    std::fs::read_to_string("/proc/self/oom_score_adj")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Allocates a pty pair, sends the master over the listening console
/// socket, and returns the replica for the sandbox.
fn allocate_console(console_socket: &Path) -> Result<File> {
    let pty = nix::pty::openpty(None, None)
        .map_err(|e| Error::Internal(format!("allocating pty: {e}")))?;
    let stream = std::os::unix::net::UnixStream::connect(console_socket).map_err(|e| {
        Error::Internal(format!(
            "connecting console socket {}: {e}",
            console_socket.display()
        ))
    })?;
    let iov = [std::io::IoSlice::new(b"pty-master")];
    let fds = [pty.master.as_raw_fd()];
    let cmsg = [nix::sys::socket::ControlMessage::ScmRights(&fds)];
    nix::sys::socket::sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &cmsg,
        nix::sys::socket::MsgFlags::empty(),
        None,
    )
    .map_err(|e| Error::Internal(format!("sending console master: {e}")))?;
    Ok(File::from(pty.slave))
}

/// Reads the symlink-resolved mount list the gofer reports back.
/// `None` when the pipe closed without data (nothing to clean).
fn read_clean_mounts(mut mounts_file: &File) -> Result<Option<Vec<Mount>>> {
    let mut data = Vec::new();
    mounts_file
        .read_to_end(&mut data)
        .map_err(|e| Error::Internal(format!("reading mounts file: {e}")))?;
    if data.is_empty() {
        return Ok(None);
    }
    let mounts: Vec<Mount> = serde_json::from_slice(&data)
        .map_err(|e| Error::Internal(format!("decoding mounts file: {e}")))?;
    Ok(Some(mounts))
}

fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe().map_err(|e| Error::Internal(format!("creating pipe: {e}")))
}

fn stream_pair() -> Result<(OwnedFd, OwnedFd)> {
    nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| Error::Internal(format!("creating socket pair: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_status_to_exit_code() {
        // Normal exit with status 3.
        assert_eq!(wait_status_to_exit_code(3 << 8), 3);
        // Killed by SIGKILL (9).
        assert_eq!(wait_status_to_exit_code(9), 128 + 9);
        // Killed by SIGTERM (15).
        assert_eq!(wait_status_to_exit_code(15), 128 + 15);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Creating.to_string(), "creating");
        assert_eq!(Status::Stopped.to_string(), "stopped");
    }
}
