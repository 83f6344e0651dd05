//! Gofer mount planning.
//!
//! The planner resolves the spec's rootfs and bind mounts into an
//! ordered list of gofer mount configurations: for every mount point,
//! which lower layer serves it (lisafs proxy, EROFS image, or nothing)
//! and which medium backs its writable upper layer. Index 0 is always
//! the rootfs; the remaining entries correspond 1:1 to the
//! gofer-serviced entries of `spec.mounts` in their original order.

use crate::config::{Overlay2, OverlayMedium};
use crate::constants::{
    BIND_MOUNT, EROFS_MOUNT, MOUNT_HINT_ANNOTATION_PREFIX, ROOTFS_OVERLAY_ANNOTATION,
    ROOTFS_SOURCE_ANNOTATION, ROOTFS_TYPE_ANNOTATION, TMPFS_MOUNT,
};
use crate::error::{Error, Result};
use crate::spec::{is_gofer_mount, is_readonly_mount, Mount, Spec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

// =============================================================================
// Gofer Mount Configuration
// =============================================================================

/// Lower layer serving a gofer mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LowerLayer {
    /// No lower layer (pure tmpfs-style mount).
    None,
    /// Served by the gofer over a lisafs connection.
    Lisafs,
    /// Read directly from an EROFS image file.
    Erofs,
}

/// Medium backing the writable upper layer of a gofer mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpperLayer {
    /// No overlay; the lower layer is exposed as-is.
    None,
    /// Overlay backed by sentry memory.
    Memory,
    /// Overlay backed by a named filestore inside the mount source.
    #[serde(rename = "self")]
    SelfBacked,
    /// Overlay backed by an unnamed filestore in a host directory.
    Anon,
}

/// How one gofer mount point is served: lower layer plus overlay
/// medium, with an optional upper-layer size limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoferMountConf {
    pub lower: LowerLayer,
    pub upper: UpperLayer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl GoferMountConf {
    pub fn should_use_lisafs(&self) -> bool {
        self.lower == LowerLayer::Lisafs
    }

    pub fn should_use_erofs(&self) -> bool {
        self.lower == LowerLayer::Erofs
    }

    pub fn is_self_backed(&self) -> bool {
        self.upper == UpperLayer::SelfBacked
    }

    /// True if the upper layer needs a host-side backing file.
    pub fn needs_filestore(&self) -> bool {
        matches!(
            self.upper,
            UpperLayer::SelfBacked | UpperLayer::Anon | UpperLayer::Memory
        )
    }
}

impl fmt::Display for GoferMountConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lower = match self.lower {
            LowerLayer::None => "none",
            LowerLayer::Lisafs => "lisafs",
            LowerLayer::Erofs => "erofs",
        };
        let upper = match self.upper {
            UpperLayer::None => "none",
            UpperLayer::Memory => "memory",
            UpperLayer::SelfBacked => "self",
            UpperLayer::Anon => "anon",
        };
        write!(f, "{lower}:{upper}")?;
        if let Some(size) = &self.size {
            write!(f, ":size={size}")?;
        }
        Ok(())
    }
}

/// Renders the ordered configurations as the flag value handed to the
/// gofer and the sentry (`lisafs:self,lisafs:none,...`).
pub fn render_conf_flag(confs: &[GoferMountConf]) -> String {
    confs
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Mount Hints
// =============================================================================

/// How a hinted mount is shared across the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    /// Private to one container.
    Container,
    /// Shared among the containers of one sandbox.
    Pod,
    /// Shared with the host and other sandboxes.
    Shared,
}

/// A pod-wide mount hint parsed from spec annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountHint {
    pub name: String,
    pub mount: Mount,
    pub share: ShareMode,
}

impl MountHint {
    /// Sandbox-local mounts get a self overlay so a master mount can
    /// be shared by every container in the sandbox.
    pub fn is_sandbox_local(&self) -> bool {
        self.share == ShareMode::Pod
    }

    /// Shared mounts keep one filestore for the whole sandbox; it is
    /// deleted when the root container is destroyed.
    pub fn should_share_mount(&self) -> bool {
        self.share == ShareMode::Pod
    }
}

/// Pod-wide mount hints, derived once from the root container's spec
/// annotations (`dev.gvisor.spec.mount.<name>.{source,type,share}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodMountHints {
    pub mounts: Vec<MountHint>,
}

impl PodMountHints {
    pub fn from_spec(spec: &Spec) -> Result<PodMountHints> {
        let mut partial: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (key, value) in &spec.annotations {
            let Some(rest) = key.strip_prefix(MOUNT_HINT_ANNOTATION_PREFIX) else {
                continue;
            };
            let Some((name, field)) = rest.rsplit_once('.') else {
                continue;
            };
            partial
                .entry(name.to_string())
                .or_default()
                .insert(field.to_string(), value.clone());
        }

        let mut mounts = Vec::new();
        for (name, fields) in partial {
            let Some(source) = fields.get("source").filter(|s| !s.is_empty()) else {
                return Err(Error::InvalidSpec(format!(
                    "mount hint {name:?} has no source"
                )));
            };
            let share = match fields.get("share").map(String::as_str) {
                Some("container") => ShareMode::Container,
                Some("pod") => ShareMode::Pod,
                Some("shared") => ShareMode::Shared,
                Some(other) => {
                    return Err(Error::InvalidSpec(format!(
                        "mount hint {name:?} has invalid share mode {other:?}"
                    )))
                }
                None => ShareMode::Container,
            };
            let typ = fields
                .get("type")
                .cloned()
                .unwrap_or_else(|| BIND_MOUNT.to_string());
            mounts.push(MountHint {
                name: name.clone(),
                mount: Mount {
                    destination: Default::default(),
                    typ,
                    source: source.into(),
                    options: Vec::new(),
                },
                share,
            });
        }
        mounts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(PodMountHints { mounts })
    }

    /// Finds the hint matching a mount source, if any.
    pub fn find(&self, source: &Path) -> Option<&MountHint> {
        self.mounts.iter().find(|h| h.mount.source == source)
    }
}

// =============================================================================
// Rootfs Hint
// =============================================================================

/// Rootfs override parsed from
/// `dev.gvisor.spec.rootfs.{source,type,overlay}` annotations.
#[derive(Debug, Clone)]
pub struct RootfsHint {
    pub mount: Mount,
    pub overlay: OverlayMedium,
    pub size: Option<String>,
}

impl RootfsHint {
    pub fn from_spec(spec: &Spec) -> Result<Option<RootfsHint>> {
        let source = spec.annotations.get(ROOTFS_SOURCE_ANNOTATION);
        let typ = spec.annotations.get(ROOTFS_TYPE_ANNOTATION);
        let overlay = spec.annotations.get(ROOTFS_OVERLAY_ANNOTATION);
        if source.is_none() && typ.is_none() && overlay.is_none() {
            return Ok(None);
        }
        let (Some(source), Some(typ)) = (source, typ) else {
            return Err(Error::InvalidSpec(
                "rootfs hint needs both source and type annotations".into(),
            ));
        };
        let overlay = match overlay.map(String::as_str) {
            Some("none") | None => OverlayMedium::None,
            Some("memory") => OverlayMedium::Memory,
            Some("self") => OverlayMedium::SelfBacked,
            Some("anon") => OverlayMedium::Anon,
            Some(other) => {
                return Err(Error::InvalidSpec(format!(
                    "rootfs hint has invalid overlay medium {other:?}"
                )))
            }
        };
        Ok(Some(RootfsHint {
            mount: Mount {
                destination: "/".into(),
                typ: typ.clone(),
                source: source.into(),
                options: Vec::new(),
            },
            overlay,
            size: None,
        }))
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Resolves the spec into the ordered gofer mount configurations.
pub fn plan_gofer_mounts(
    spec: &Spec,
    overlay: &Overlay2,
    hints: &PodMountHints,
    rootfs_hint: Option<&RootfsHint>,
) -> Result<Vec<GoferMountConf>> {
    let root = spec
        .root
        .as_ref()
        .ok_or_else(|| Error::InvalidSpec("spec has no root filesystem".into()))?;

    // Rootfs first.
    let mut medium = overlay.root_medium;
    let mut size = overlay.root_size.clone();
    let mut mount_type = BIND_MOUNT;
    let mut root_src = root.path.as_path();
    if let Some(hint) = rootfs_hint {
        medium = hint.overlay;
        size = hint.size.clone();
        if !is_gofer_mount(&hint.mount) {
            mount_type = &hint.mount.typ;
        }
        root_src = &hint.mount.source;
    }
    if root.readonly {
        medium = OverlayMedium::None;
    }
    check_anon_dir(medium, overlay)?;
    let mut confs = vec![conf_for(medium, size, mount_type, root_src)?];

    // Submounts in spec order, skipping anything not gofer-serviced.
    for mount in spec.gofer_mounts() {
        let mut medium = overlay.sub_medium;
        let mut size = overlay.sub_size.clone();
        let mut mount_type = BIND_MOUNT;
        if is_readonly_mount(&mount.options) {
            medium = OverlayMedium::None;
        }
        if let Some(hint) = hints.find(&mount.source) {
            if hint.is_sandbox_local() {
                // Self even for read-only entries, so the shared mount
                // is set up for a future writable user of this source.
                medium = OverlayMedium::SelfBacked;
                if !is_gofer_mount(&hint.mount) {
                    mount_type = &hint.mount.typ;
                }
                size = None;
            }
        }
        check_anon_dir(medium, overlay)?;
        confs.push(conf_for(medium, size, mount_type, &mount.source)?);
    }
    Ok(confs)
}

fn check_anon_dir(medium: OverlayMedium, overlay: &Overlay2) -> Result<()> {
    if medium == OverlayMedium::Anon && overlay.host_file_dir.is_none() {
        return Err(Error::InvalidSpec(
            "anon overlay requested without a host filestore directory".into(),
        ));
    }
    Ok(())
}

/// Builds one gofer mount configuration from overlay medium and mount
/// type. A self overlay for a non-directory source degrades to memory
/// since a filestore cannot be created next to it.
fn conf_for(
    medium: OverlayMedium,
    size: Option<String>,
    mount_type: &str,
    mount_src: &Path,
) -> Result<GoferMountConf> {
    let lower = match mount_type {
        BIND_MOUNT => LowerLayer::Lisafs,
        TMPFS_MOUNT => LowerLayer::None,
        EROFS_MOUNT => LowerLayer::Erofs,
        other => {
            return Err(Error::InvalidSpec(format!(
                "unsupported mount type {other:?} in mount hint"
            )))
        }
    };
    let conf = match medium {
        OverlayMedium::None => GoferMountConf {
            lower,
            upper: UpperLayer::None,
            size: None,
        },
        OverlayMedium::Memory => GoferMountConf {
            lower,
            upper: UpperLayer::Memory,
            size,
        },
        OverlayMedium::SelfBacked => {
            let is_dir = std::fs::metadata(mount_src)
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                tracing::warn!(
                    source = %mount_src.display(),
                    "self filestore requires a directory source, falling back to memory"
                );
                GoferMountConf {
                    lower,
                    upper: UpperLayer::Memory,
                    size,
                }
            } else {
                GoferMountConf {
                    lower,
                    upper: UpperLayer::SelfBacked,
                    size,
                }
            }
        }
        OverlayMedium::Anon => GoferMountConf {
            lower,
            upper: UpperLayer::Anon,
            size,
        },
    };
    Ok(conf)
}

// =============================================================================
// Gofer Presence
// =============================================================================

/// Whether a gofer process must be spawned for these configurations.
/// Only lisafs-served mounts need one; a pure EROFS/tmpfs sandbox is
/// goferless and the rootfs image is handed to the sentry directly.
pub fn should_spawn_gofer(confs: &[GoferMountConf]) -> bool {
    confs.iter().any(GoferMountConf::should_use_lisafs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_flag_rendering() {
        let confs = vec![
            GoferMountConf {
                lower: LowerLayer::Lisafs,
                upper: UpperLayer::SelfBacked,
                size: None,
            },
            GoferMountConf {
                lower: LowerLayer::Erofs,
                upper: UpperLayer::Memory,
                size: Some("2g".into()),
            },
        ];
        assert_eq!(render_conf_flag(&confs), "lisafs:self,erofs:memory:size=2g");
    }

    #[test]
    fn test_conf_serde_round_trip() {
        let conf = GoferMountConf {
            lower: LowerLayer::Lisafs,
            upper: UpperLayer::SelfBacked,
            size: Some("1g".into()),
        };
        let json = serde_json::to_string(&conf).unwrap();
        assert!(json.contains("\"self\""));
        let back: GoferMountConf = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conf);
    }
}
