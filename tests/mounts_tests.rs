//! Tests for gofer mount planning.

use std::path::Path;
use wardenrun::config::{Overlay2, OverlayMedium};
use wardenrun::error::Error;
use wardenrun::mounts::{
    plan_gofer_mounts, should_spawn_gofer, LowerLayer, PodMountHints, RootfsHint, UpperLayer,
};
use wardenrun::spec::{Mount, Root, Spec};

fn bind(source: &Path, dest: &str, options: &[&str]) -> Mount {
    Mount {
        destination: dest.into(),
        typ: "bind".into(),
        source: source.into(),
        options: options.iter().map(|o| o.to_string()).collect(),
    }
}

fn spec_with_root(root_path: &Path, readonly: bool) -> Spec {
    Spec {
        root: Some(Root {
            path: root_path.into(),
            readonly,
        }),
        ..Default::default()
    }
}

fn overlay(root: OverlayMedium, sub: OverlayMedium) -> Overlay2 {
    Overlay2 {
        root_medium: root,
        sub_medium: sub,
        root_size: None,
        sub_size: None,
        host_file_dir: None,
    }
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_rootfs_first_submounts_in_spec_order() {
    let rootfs = tempfile::tempdir().unwrap();
    let data_a = tempfile::tempdir().unwrap();
    let data_b = tempfile::tempdir().unwrap();

    let mut spec = spec_with_root(rootfs.path(), false);
    spec.mounts = vec![
        Mount {
            destination: "/tmp".into(),
            typ: "tmpfs".into(),
            ..Default::default()
        },
        bind(data_a.path(), "/a", &[]),
        Mount {
            destination: "/proc".into(),
            typ: "proc".into(),
            ..Default::default()
        },
        bind(data_b.path(), "/b", &[]),
    ];

    let confs = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::SelfBacked, OverlayMedium::None),
        &PodMountHints::default(),
        None,
    )
    .unwrap();

    // Rootfs plus the two bind mounts; tmpfs and proc are synthesized
    // in the sentry and never reach the gofer.
    assert_eq!(confs.len(), 3);
    assert_eq!(confs[0].lower, LowerLayer::Lisafs);
    assert_eq!(confs[0].upper, UpperLayer::SelfBacked);
    assert!(confs[1..].iter().all(|c| c.lower == LowerLayer::Lisafs));
    assert!(should_spawn_gofer(&confs));
}

// =============================================================================
// Read-Only Rules
// =============================================================================

#[test]
fn test_readonly_root_forces_no_overlay() {
    let rootfs = tempfile::tempdir().unwrap();
    let spec = spec_with_root(rootfs.path(), true);

    let confs = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::Memory, OverlayMedium::None),
        &PodMountHints::default(),
        None,
    )
    .unwrap();
    assert_eq!(confs[0].upper, UpperLayer::None);
}

#[test]
fn test_readonly_submount_forces_no_overlay() {
    let rootfs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut spec = spec_with_root(rootfs.path(), false);
    spec.mounts = vec![bind(data.path(), "/data", &["rbind", "ro"])];

    let confs = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::None, OverlayMedium::Memory),
        &PodMountHints::default(),
        None,
    )
    .unwrap();
    assert_eq!(confs[1].upper, UpperLayer::None);
}

// =============================================================================
// Mount Hints
// =============================================================================

fn hints_for(source: &Path, share: &str) -> PodMountHints {
    let mut spec = Spec::default();
    spec.annotations.insert(
        "dev.gvisor.spec.mount.data.source".into(),
        source.display().to_string(),
    );
    spec.annotations
        .insert("dev.gvisor.spec.mount.data.type".into(), "bind".into());
    spec.annotations
        .insert("dev.gvisor.spec.mount.data.share".into(), share.into());
    PodMountHints::from_spec(&spec).unwrap()
}

#[test]
fn test_sandbox_local_hint_forces_self_even_readonly() {
    let rootfs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut spec = spec_with_root(rootfs.path(), false);
    spec.mounts = vec![bind(data.path(), "/data", &["ro"])];

    let confs = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::None, OverlayMedium::None),
        &hints_for(data.path(), "pod"),
        None,
    )
    .unwrap();
    assert_eq!(confs[1].upper, UpperLayer::SelfBacked);
}

#[test]
fn test_self_overlay_degrades_to_memory_for_file_sources() {
    let rootfs = tempfile::tempdir().unwrap();
    let file_source = tempfile::NamedTempFile::new().unwrap();
    let mut spec = spec_with_root(rootfs.path(), false);
    spec.mounts = vec![bind(file_source.path(), "/data", &[])];

    let confs = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::None, OverlayMedium::SelfBacked),
        &PodMountHints::default(),
        None,
    )
    .unwrap();
    assert_eq!(confs[1].upper, UpperLayer::Memory);
}

#[test]
fn test_container_share_is_not_sandbox_local() {
    let data = tempfile::tempdir().unwrap();
    let hints = hints_for(data.path(), "container");
    assert!(!hints.find(data.path()).unwrap().is_sandbox_local());
}

// =============================================================================
// EROFS and Goferless
// =============================================================================

fn erofs_spec(rootfs: &Path, image: &Path) -> Spec {
    let mut spec = spec_with_root(rootfs, true);
    spec.annotations.insert(
        "dev.gvisor.spec.rootfs.source".into(),
        image.display().to_string(),
    );
    spec.annotations
        .insert("dev.gvisor.spec.rootfs.type".into(), "erofs".into());
    spec.annotations
        .insert("dev.gvisor.spec.rootfs.overlay".into(), "memory".into());
    spec
}

#[test]
fn test_erofs_rootfs_hint() {
    let rootfs = tempfile::tempdir().unwrap();
    let image = tempfile::NamedTempFile::new().unwrap();
    let mut spec = erofs_spec(rootfs.path(), image.path());
    spec.root.as_mut().unwrap().readonly = false;

    let hint = RootfsHint::from_spec(&spec).unwrap().unwrap();
    let confs = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::SelfBacked, OverlayMedium::None),
        &PodMountHints::default(),
        Some(&hint),
    )
    .unwrap();
    assert_eq!(confs[0].lower, LowerLayer::Erofs);
    assert_eq!(confs[0].upper, UpperLayer::Memory);

    // No lisafs mount anywhere: goferless.
    assert!(!should_spawn_gofer(&confs));
}

#[test]
fn test_erofs_with_bind_mount_still_needs_gofer() {
    let rootfs = tempfile::tempdir().unwrap();
    let image = tempfile::NamedTempFile::new().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut spec = erofs_spec(rootfs.path(), image.path());
    spec.mounts = vec![bind(data.path(), "/data", &[])];

    let hint = RootfsHint::from_spec(&spec).unwrap().unwrap();
    let confs = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::None, OverlayMedium::None),
        &PodMountHints::default(),
        Some(&hint),
    )
    .unwrap();
    assert!(should_spawn_gofer(&confs));
}

#[test]
fn test_incomplete_rootfs_hint_is_rejected() {
    let mut spec = Spec::default();
    spec.annotations
        .insert("dev.gvisor.spec.rootfs.type".into(), "erofs".into());
    assert!(matches!(
        RootfsHint::from_spec(&spec),
        Err(Error::InvalidSpec(_))
    ));
}

// =============================================================================
// Anon Overlay
// =============================================================================

#[test]
fn test_anon_overlay_requires_host_dir() {
    let rootfs = tempfile::tempdir().unwrap();
    let spec = spec_with_root(rootfs.path(), false);

    let err = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::Anon, OverlayMedium::None),
        &PodMountHints::default(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidSpec(_)));
}

// =============================================================================
// Persistence Round Trip
// =============================================================================

#[test]
fn test_plan_round_trips_through_serialization() {
    let rootfs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut spec = spec_with_root(rootfs.path(), false);
    spec.mounts = vec![bind(data.path(), "/data", &["ro"])];

    let confs = plan_gofer_mounts(
        &spec,
        &overlay(OverlayMedium::SelfBacked, OverlayMedium::Memory),
        &PodMountHints::default(),
        None,
    )
    .unwrap();

    let json = serde_json::to_string(&confs).unwrap();
    let back: Vec<wardenrun::mounts::GoferMountConf> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, confs);
}
