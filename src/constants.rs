//! Constants for the lifecycle core.
//!
//! All file names, annotation keys, timeouts, and wire labels live
//! here so the on-disk and on-wire surfaces stay in one place.

use std::time::Duration;

// =============================================================================
// On-Disk Layout
// =============================================================================

/// Name of the metadata file inside a container directory.
pub const META_FILENAME: &str = "meta.json";

/// Name of the advisory lock file inside a container directory.
///
/// The lock lives next to the metadata file rather than on it:
/// atomic save replaces the metadata inode, which would silently drop
/// the exclusion held by other processes.
pub const META_LOCK_FILENAME: &str = "meta.lock";

/// Version stamp written into every metadata file. Loading any other
/// version fails as corrupt.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Suffix of the sentry control socket under the root directory.
pub const CTRL_SOCKET_SUFFIX: &str = ".ctrl.sock";

/// Prefix of self-backed filestore files created inside a mount source.
pub const SELF_FILESTORE_PREFIX: &str = ".wardenrun.filestore.";

// =============================================================================
// Process Supervision
// =============================================================================

/// Subcommand label used when re-entering the binary as the gofer.
pub const GOFER_COMMAND: &str = "gofer";

/// Subcommand label used when re-entering the binary as the sentry.
pub const BOOT_COMMAND: &str = "boot";

/// First descriptor number assigned to donated files in a child.
/// 0, 1 and 2 are taken by stdio.
pub const DONATION_BASE_FD: i32 = 3;

/// How long to wait for a non-child gofer to disappear after SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a process to stop.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read-timeout granularity used to observe cancellation during a
/// blocking RPC.
pub const RPC_POLL_INTERVAL: Duration = Duration::from_millis(200);

// =============================================================================
// Annotations
// =============================================================================

/// Container-type annotation keys checked in order.
pub const CONTAINER_TYPE_ANNOTATIONS: &[&str] = &[
    "io.kubernetes.cri.container-type",
    "io.kubernetes.cri-o.ContainerType",
];

/// Sandbox-id annotation keys checked in order.
pub const SANDBOX_ID_ANNOTATIONS: &[&str] = &[
    "io.kubernetes.cri.sandbox-id",
    "io.kubernetes.cri-o.SandboxID",
];

/// Overrides the parent cgroup for the sandbox.
pub const CGROUP_PARENT_ANNOTATION: &str = "dev.gvisor.spec.cgroup-parent";

/// Prefix of per-bundle flag override annotations.
pub const FLAG_ANNOTATION_PREFIX: &str = "dev.gvisor.flag.";

/// Rootfs hint annotations.
pub const ROOTFS_SOURCE_ANNOTATION: &str = "dev.gvisor.spec.rootfs.source";
pub const ROOTFS_TYPE_ANNOTATION: &str = "dev.gvisor.spec.rootfs.type";
pub const ROOTFS_OVERLAY_ANNOTATION: &str = "dev.gvisor.spec.rootfs.overlay";

/// Prefix of pod-wide mount hint annotations
/// (`dev.gvisor.spec.mount.<name>.{source,type,share}`).
pub const MOUNT_HINT_ANNOTATION_PREFIX: &str = "dev.gvisor.spec.mount.";

// =============================================================================
// OCI
// =============================================================================

/// OCI Runtime Spec version emitted in state documents.
pub const OCI_VERSION: &str = "1.0.2";

/// Mount type served through the gofer.
pub const BIND_MOUNT: &str = "bind";

/// Mount type of an EROFS image lower layer.
pub const EROFS_MOUNT: &str = "erofs";

/// Mount type backed purely by sentry memory.
pub const TMPFS_MOUNT: &str = "tmpfs";

/// Exit-code offset for processes terminated by a signal.
pub const EXIT_SIGNAL_OFFSET: i32 = 128;
