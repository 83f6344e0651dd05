//! Runtime configuration.
//!
//! The configuration is an explicit schema produced by the CLI
//! front-end and passed into the engine by value. The engine never
//! introspects it; `to_flags` re-renders the exact option set when
//! the binary re-enters itself as the gofer or the sentry.

use crate::constants::FLAG_ANNOTATION_PREFIX;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Flags that a bundle may override via `dev.gvisor.flag.<name>`
/// annotations. Override permission is computed per flag: a flag
/// outside this list never elevates, regardless of configuration.
const OVERRIDABLE_FLAGS: &[&str] = &["debug-log", "directfs", "overlay2", "platform"];

// =============================================================================
// Overlay Configuration
// =============================================================================

/// Medium backing an overlay upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMedium {
    /// No overlay: writes go to the lower layer (or fail if read-only).
    None,
    /// Upper layer backed by sentry memory.
    Memory,
    /// Upper layer backed by a named file inside the mount source.
    SelfBacked,
    /// Upper layer backed by an unnamed file in a host directory.
    Anon,
}

impl OverlayMedium {
    /// Returns true if this medium needs a host-side backing file.
    pub fn needs_filestore(self) -> bool {
        matches!(self, OverlayMedium::SelfBacked | OverlayMedium::Anon)
    }
}

/// Overlay tuning for the rootfs and the bind submounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overlay2 {
    pub root_medium: OverlayMedium,
    pub sub_medium: OverlayMedium,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_size: Option<String>,
    /// Host directory staging anon filestores. Required when either
    /// medium is `Anon`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_file_dir: Option<PathBuf>,
}

impl Default for Overlay2 {
    fn default() -> Self {
        Self {
            root_medium: OverlayMedium::SelfBacked,
            sub_medium: OverlayMedium::None,
            root_size: None,
            sub_size: None,
            host_file_dir: None,
        }
    }
}

impl Overlay2 {
    /// Parses `<scope>:<medium>[,size=<s>]` where scope is `root` or
    /// `all` and medium is `none`, `memory`, `self`, or `dir=<path>`.
    pub fn parse(value: &str) -> Result<Self> {
        let (scope, rest) = value
            .split_once(':')
            .ok_or_else(|| bad_overlay(value, "expected <scope>:<medium>"))?;
        let (medium_str, size) = match rest.split_once(",size=") {
            Some((m, s)) => (m, Some(s.to_string())),
            None => (rest, None),
        };
        let mut host_file_dir = None;
        let medium = match medium_str {
            "none" => OverlayMedium::None,
            "memory" => OverlayMedium::Memory,
            "self" => OverlayMedium::SelfBacked,
            _ => match medium_str.strip_prefix("dir=") {
                Some(dir) if !dir.is_empty() => {
                    host_file_dir = Some(PathBuf::from(dir));
                    OverlayMedium::Anon
                }
                _ => return Err(bad_overlay(value, "unknown medium")),
            },
        };
        let mut conf = Overlay2 {
            host_file_dir,
            ..Overlay2::default()
        };
        match scope {
            "root" => {
                conf.root_medium = medium;
                conf.root_size = size;
                conf.sub_medium = OverlayMedium::None;
            }
            "all" => {
                conf.root_medium = medium;
                conf.sub_medium = medium;
                conf.root_size = size.clone();
                conf.sub_size = size;
            }
            _ => return Err(bad_overlay(value, "scope must be root or all")),
        }
        Ok(conf)
    }

    fn render(&self) -> String {
        let medium = |m: OverlayMedium| match m {
            OverlayMedium::None => "none".to_string(),
            OverlayMedium::Memory => "memory".to_string(),
            OverlayMedium::SelfBacked => "self".to_string(),
            OverlayMedium::Anon => format!(
                "dir={}",
                self.host_file_dir
                    .as_deref()
                    .unwrap_or_else(|| std::path::Path::new(""))
                    .display()
            ),
        };
        let scope = if self.root_medium == self.sub_medium {
            "all"
        } else {
            "root"
        };
        let mut out = format!("{scope}:{}", medium(self.root_medium));
        if let Some(size) = &self.root_size {
            out.push_str(&format!(",size={size}"));
        }
        out
    }
}

fn bad_overlay(value: &str, why: &str) -> Error {
    Error::InvalidSpec(format!("invalid overlay2 value {value:?}: {why}"))
}

// =============================================================================
// Config
// =============================================================================

/// Runtime configuration, owned by the engine for its lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding per-container state. Defaults to
    /// `$XDG_RUNTIME_DIR/wardenrun`, else `/var/run/wardenrun`.
    pub root_dir: PathBuf,
    /// Log destination for sandbox processes (appended).
    pub log: Option<PathBuf>,
    /// Extra debug log destination for sandbox processes.
    pub debug_log: Option<PathBuf>,
    /// Platform back-end selector, passed through to the sentry.
    pub platform: String,
    /// Serve gofer files via direct host FDs instead of message-based
    /// access; requires identity user-namespace mappings.
    pub directfs: bool,
    /// Run without root privileges; requires a user namespace and
    /// suppresses cgroup failures.
    pub rootless: bool,
    /// Skip cgroup configuration entirely.
    pub ignore_cgroups: bool,
    /// Interpret cgroup paths as systemd slices (driver concern).
    pub systemd_cgroup: bool,
    /// Permit bundles to override whitelisted flags via annotations.
    pub allow_flag_override: bool,
    /// Overlay tuning for gofer mounts.
    pub overlay2: Overlay2,
    /// Binary spawned for sandbox processes. Defaults to the current
    /// executable; the deployment binary provides the `gofer` and
    /// `boot` entry points.
    pub sandbox_binary: Option<PathBuf>,
    /// Run sandbox processes as the current user without namespace
    /// isolation or forced cgroups. Unsafe; tests only.
    pub test_only_run_as_user: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            log: None,
            debug_log: None,
            platform: "trap".to_string(),
            directfs: false,
            rootless: false,
            ignore_cgroups: false,
            systemd_cgroup: false,
            allow_flag_override: false,
            overlay2: Overlay2::default(),
            sandbox_binary: None,
            test_only_run_as_user: false,
        }
    }
}

/// Returns the default state root: `$XDG_RUNTIME_DIR/wardenrun` when
/// the variable is set, `/var/run/wardenrun` otherwise.
pub fn default_root_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("wardenrun"),
        _ => PathBuf::from("/var/run/wardenrun"),
    }
}

impl Config {
    /// Renders the configuration as command-line flags for re-entering
    /// the binary under the `gofer`/`boot` subcommand labels.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = vec![
            format!("--root={}", self.root_dir.display()),
            format!("--platform={}", self.platform),
            format!("--overlay2={}", self.overlay2.render()),
        ];
        if let Some(log) = &self.log {
            flags.push(format!("--log={}", log.display()));
        }
        if let Some(debug_log) = &self.debug_log {
            flags.push(format!("--debug-log={}", debug_log.display()));
        }
        if self.directfs {
            flags.push("--directfs".to_string());
        }
        if self.rootless {
            flags.push("--rootless".to_string());
        }
        if self.ignore_cgroups {
            flags.push("--ignore-cgroups".to_string());
        }
        if self.systemd_cgroup {
            flags.push("--systemd-cgroup".to_string());
        }
        if self.test_only_run_as_user {
            flags.push("--testonly-run-as-current-user".to_string());
        }
        flags
    }

    /// Applies `dev.gvisor.flag.<name>` bundle annotations and returns
    /// the per-container effective configuration.
    ///
    /// Permission is computed for every flag individually: an override
    /// while overrides are disabled, or for a flag outside the
    /// whitelist, fails with `PermissionDenied` instead of being
    /// silently applied or silently dropped.
    pub fn with_bundle_overrides(&self, annotations: &HashMap<String, String>) -> Result<Config> {
        let mut conf = self.clone();
        for (key, value) in annotations {
            let Some(name) = key.strip_prefix(FLAG_ANNOTATION_PREFIX) else {
                continue;
            };
            if !self.allow_flag_override {
                return Err(Error::PermissionDenied(format!(
                    "flag override {name:?} requested but overrides are disabled"
                )));
            }
            if !OVERRIDABLE_FLAGS.contains(&name) {
                return Err(Error::PermissionDenied(format!(
                    "flag {name:?} may not be overridden by the bundle"
                )));
            }
            tracing::info!(flag = name, value = %value, "applying bundle flag override");
            match name {
                "debug-log" => conf.debug_log = Some(PathBuf::from(value)),
                "directfs" => {
                    conf.directfs = value.parse().map_err(|_| {
                        Error::InvalidSpec(format!("directfs override must be a bool: {value:?}"))
                    })?
                }
                "overlay2" => conf.overlay2 = Overlay2::parse(value)?,
                "platform" => conf.platform = value.clone(),
                _ => unreachable!("whitelisted flag without a handler"),
            }
        }
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay2_parse() {
        let o = Overlay2::parse("root:self").unwrap();
        assert_eq!(o.root_medium, OverlayMedium::SelfBacked);
        assert_eq!(o.sub_medium, OverlayMedium::None);

        let o = Overlay2::parse("all:memory,size=256m").unwrap();
        assert_eq!(o.root_medium, OverlayMedium::Memory);
        assert_eq!(o.sub_medium, OverlayMedium::Memory);
        assert_eq!(o.root_size.as_deref(), Some("256m"));

        let o = Overlay2::parse("root:dir=/var/lib/overlays").unwrap();
        assert_eq!(o.root_medium, OverlayMedium::Anon);
        assert_eq!(
            o.host_file_dir.as_deref(),
            Some(std::path::Path::new("/var/lib/overlays"))
        );

        assert!(Overlay2::parse("bogus").is_err());
        assert!(Overlay2::parse("root:floppy").is_err());
    }

    #[test]
    fn test_override_disabled_is_refused() {
        let conf = Config::default();
        let mut annotations = HashMap::new();
        annotations.insert("dev.gvisor.flag.platform".to_string(), "kvm".to_string());
        let err = conf.with_bundle_overrides(&annotations).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn test_override_outside_whitelist_is_refused() {
        let conf = Config {
            allow_flag_override: true,
            ..Config::default()
        };
        let mut annotations = HashMap::new();
        annotations.insert("dev.gvisor.flag.root".to_string(), "/tmp/evil".to_string());
        let err = conf.with_bundle_overrides(&annotations).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn test_override_applied() {
        let conf = Config {
            allow_flag_override: true,
            ..Config::default()
        };
        let mut annotations = HashMap::new();
        annotations.insert("dev.gvisor.flag.platform".to_string(), "kvm".to_string());
        annotations.insert(
            "dev.gvisor.flag.overlay2".to_string(),
            "all:memory".to_string(),
        );
        let conf = conf.with_bundle_overrides(&annotations).unwrap();
        assert_eq!(conf.platform, "kvm");
        assert_eq!(conf.overlay2.sub_medium, OverlayMedium::Memory);
    }

    #[test]
    fn test_to_flags_round_trip_overlay() {
        let conf = Config {
            overlay2: Overlay2::parse("all:memory").unwrap(),
            directfs: true,
            ..Config::default()
        };
        let flags = conf.to_flags();
        assert!(flags.iter().any(|f| f == "--overlay2=all:memory"));
        assert!(flags.iter().any(|f| f == "--directfs"));
    }
}
