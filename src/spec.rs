//! OCI runtime spec data model and spec utilities.
//!
//! The lifecycle core treats the spec as mostly opaque: it is loaded
//! from the bundle, persisted with the container record, and handed
//! verbatim to the sentry, the gofer, and the hooks. The few fields
//! the core does interpret (root, mounts, annotations, namespaces,
//! hooks, the process terminal/oom bits) are modelled here; resource
//! limits stay an opaque JSON value for the cgroup driver.

use crate::constants::{
    BIND_MOUNT, CONTAINER_TYPE_ANNOTATIONS, OCI_VERSION, SANDBOX_ID_ANNOTATIONS,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Opaque resource limits, interpreted only by the cgroup driver.
pub type LinuxResources = serde_json::Value;

// =============================================================================
// Spec Types
// =============================================================================

/// OCI runtime spec (`config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default = "default_oci_version")]
    pub oci_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

fn default_oci_version() -> String {
    OCI_VERSION.to_string()
}

/// Root filesystem of the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Root {
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

/// Container init process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
}

fn default_cwd() -> String {
    "/".to_string()
}

/// Process credentials.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

/// A single mount point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mount {
    pub destination: PathBuf,
    #[serde(rename = "type", default)]
    pub typ: String,
    #[serde(default)]
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// OCI lifecycle hooks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create_runtime: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create_container: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start_container: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststart: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststop: Vec<Hook>,
}

/// A single hook invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<LinuxNamespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<LinuxIdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<LinuxIdMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<LinuxResources>,
}

/// A namespace the container joins (with `path`) or creates (without).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinuxNamespace {
    #[serde(rename = "type")]
    pub typ: NamespaceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Linux namespace kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Pid,
    Network,
    Mount,
    Ipc,
    Uts,
    User,
    Cgroup,
}

/// uid/gid mapping for a user namespace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxIdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

/// OCI state document, emitted by `state` and fed to hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub oci_version: String,
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub bundle: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

// =============================================================================
// Container Type / Sandbox Derivation
// =============================================================================

/// How the orchestrator tagged this spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    /// The root container that brings the sandbox up.
    Sandbox,
    /// A sub-container joining an existing sandbox.
    Container,
    /// No annotation: single-container sandbox, container is the root.
    Unspecified,
}

/// Returns the container type derived from the spec annotations.
pub fn container_type(spec: &Spec) -> ContainerType {
    for key in CONTAINER_TYPE_ANNOTATIONS {
        match spec.annotations.get(*key).map(String::as_str) {
            Some("sandbox") => return ContainerType::Sandbox,
            Some("container") => return ContainerType::Container,
            _ => {}
        }
    }
    ContainerType::Unspecified
}

/// Returns true if creating this container brings the sandbox up.
pub fn is_root(spec: &Spec) -> bool {
    container_type(spec) != ContainerType::Container
}

/// Returns the sandbox id a sub-container spec points at.
pub fn sandbox_id(spec: &Spec) -> Option<String> {
    for key in SANDBOX_ID_ANNOTATIONS {
        if let Some(id) = spec.annotations.get(*key) {
            return Some(id.clone());
        }
    }
    None
}

// =============================================================================
// Spec Utilities
// =============================================================================

/// Validates a container id: non-empty, `[A-Za-z0-9_+.-]` only.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '.' | '-'))
    {
        return Err(Error::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Returns true if the mount is proxied through the gofer.
///
/// Only bind mounts with a source are served by the gofer; everything
/// else (proc, tmpfs, devpts, ...) is synthesized inside the sentry.
pub fn is_gofer_mount(mount: &Mount) -> bool {
    mount.typ == BIND_MOUNT && !mount.source.as_os_str().is_empty()
}

/// Returns true if the mount options request a read-only mount.
pub fn is_readonly_mount(options: &[String]) -> bool {
    options.iter().any(|o| o == "ro")
}

/// Loads the spec from `<bundle>/config.json`.
pub fn load_from_bundle(bundle_dir: &Path) -> Result<Spec> {
    let path = bundle_dir.join("config.json");
    let data = std::fs::read(&path).map_err(|e| {
        Error::InvalidSpec(format!("reading spec {}: {e}", path.display()))
    })?;
    let spec: Spec =
        serde_json::from_slice(&data).map_err(|e| Error::InvalidSpec(format!("parsing spec: {e}")))?;
    if spec.root.is_none() {
        return Err(Error::InvalidSpec("spec has no root filesystem".into()));
    }
    Ok(spec)
}

/// Looks up `name` in an OCI-style `NAME=value` environment list.
pub fn env_var(env: &[String], name: &str) -> Option<String> {
    env.iter().find_map(|e| {
        e.split_once('=')
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    })
}

impl Spec {
    /// Returns the configured namespace of the given type, if any.
    pub fn get_ns(&self, typ: NamespaceType) -> Option<&LinuxNamespace> {
        self.linux
            .as_ref()
            .and_then(|l| l.namespaces.iter().find(|ns| ns.typ == typ))
    }

    /// Returns the mounts served through the gofer, in spec order.
    pub fn gofer_mounts(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter().filter(|m| is_gofer_mount(m))
    }
}

// =============================================================================
// Directfs Spec Rewriting
// =============================================================================

/// Rewrites the spec for directfs: when no user namespace is
/// configured, inject one with identity uid/gid mappings so the
/// gofer's view of file ownership matches the sandbox.
///
/// Specs that define mappings without a user namespace are rejected.
pub fn modify_for_directfs(spec: &mut Spec) -> Result<()> {
    if spec.get_ns(NamespaceType::User).is_some() {
        // The spec brings its own userns; use it as-is.
        return Ok(());
    }
    let linux = spec.linux.get_or_insert_with(Linux::default);
    if !linux.uid_mappings.is_empty() || !linux.gid_mappings.is_empty() {
        return Err(Error::InvalidSpec(
            "spec defines uid/gid mappings without a user namespace".into(),
        ));
    }
    tracing::debug!("injecting identity-mapped user namespace for directfs");
    linux.namespaces.push(LinuxNamespace {
        typ: NamespaceType::User,
        path: None,
    });
    linux.uid_mappings = identity_mapping("uid_map")?;
    linux.gid_mappings = identity_mapping("gid_map")?;
    Ok(())
}

/// Reads `/proc/self/{uid,gid}_map` and mirrors each line as an
/// identity mapping into the current namespace.
fn identity_mapping(map_file: &str) -> Result<Vec<LinuxIdMapping>> {
    let path = format!("/proc/self/{map_file}");
    let file = std::fs::File::open(&path)
        .map_err(|e| Error::Internal(format!("opening {path}: {e}")))?;
    let mut mappings = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let start: u32 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| Error::Internal(format!("malformed line in {path}: {line:?}")))?;
        let _parent: u32 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| Error::Internal(format!("malformed line in {path}: {line:?}")))?;
        let len: u32 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| Error::Internal(format!("malformed line in {path}: {line:?}")))?;
        mappings.push(LinuxIdMapping {
            container_id: start,
            host_id: start,
            size: len,
        });
    }
    Ok(mappings)
}
