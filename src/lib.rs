//! # wardenrun
//!
//! **Container lifecycle core for a sandboxed OCI runtime.**
//!
//! wardenrun launches each container as an isolated user-space kernel
//! (the *sentry*) plus a filesystem proxy (the *gofer*) and owns the
//! coordination between them: the persisted per-container metadata
//! record, process spawning and supervision, the multi-container
//! sandbox grouping, and teardown across processes, cgroups, and host
//! files. It is driven by an external orchestrator speaking the OCI
//! command lifecycle.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ orchestrator (create/start/exec/kill/pause/checkpoint/delete)    │
//! └──────────────────────────┬───────────────────────────────────────┘
//!                            ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Engine (container.rs)                                            │
//! │   config        explicit option schema                           │
//! │   cgroups       CgroupDriver seam                                │
//! │   dialer        SandboxDialer seam                               │
//! │   reaper        ProcessReaper seam                               │
//! │      │                                                           │
//! │      ├── StateFile        advisory-locked meta.json per container│
//! │      ├── MountPlanner     spec → ordered gofer mount confs       │
//! │      ├── Agency           named FD donation to children          │
//! │      ├── Supervisor       gofer/sentry spawn with namespaces     │
//! │      ├── Filestores       overlay backing files via /proc/pid    │
//! │      └── Sandbox          persisted handle + control RPC client  │
//! └──────────────────┬──────────────────────────┬────────────────────┘
//!                    ▼                          ▼
//!          ┌──────────────────┐       ┌──────────────────┐
//!          │ gofer (fs proxy) │◀─────▶│ sentry (kernel)  │
//!          └──────────────────┘ lisafs└──────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   Creating ──▶ Created ──▶ Running ◀──▶ Paused
//!       │           │           │            │
//!       └───────────┴───────────┴────────────┴──▶ Stopped
//! ```
//!
//! Create is restart-safe: every resource acquisition is compensated
//! on failure, and no command ever leaves a record in `Creating` on
//! disk. Destroy is idempotent and collects every teardown failure
//! into one aggregate error instead of stopping at the first.
//!
//! # Out of Scope
//!
//! The sentry internals, the gofer internals, platform back-ends, and
//! seccomp filtering are external collaborators behind narrow
//! interfaces: the engine spawns them, donates descriptors, and
//! drives them over the control channel.

pub mod cancel;
pub mod cgroup;
pub mod cleanup;
pub mod config;
pub mod constants;
pub mod container;
pub mod donation;
pub mod error;
pub mod filestore;
pub mod hooks;
pub mod mounts;
pub mod oom;
pub mod process;
pub mod sandbox;
pub mod signalfwd;
pub mod spec;
pub mod statefile;

pub use cancel::CancelToken;
pub use config::{default_root_dir, Config, Overlay2, OverlayMedium};
pub use container::{wait_status_to_exit_code, Container, CreateArgs, Engine, Status};
pub use error::{Error, Result};
pub use sandbox::{Sandbox, SandboxDialer, UnixDialer};
pub use statefile::FullId;
