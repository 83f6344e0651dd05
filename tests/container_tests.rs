//! Lifecycle engine tests against an in-process sentry stand-in.
//!
//! The engine runs with its seams injected: a null cgroup driver, a
//! scripted reaper, and `/bin/true` standing in for the sandbox
//! binary. Sandboxes are EROFS-rooted and goferless so no privileged
//! namespace setup is needed; every control call lands on the fake
//! sentry listening at the deterministic socket path.

mod common;

use common::{FakeReaper, FakeSentry};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wardenrun::cgroup::NullCgroupDriver;
use wardenrun::error::Error;
use wardenrun::sandbox::{endpoint, ExecArgs, RuntimeState};
use wardenrun::spec::{Process, Root, Spec};
use wardenrun::statefile;
use wardenrun::{CancelToken, Config, Container, CreateArgs, Engine, Status, UnixDialer};

fn test_engine(root: &Path) -> Engine {
    let config = Config {
        root_dir: root.to_path_buf(),
        ignore_cgroups: true,
        test_only_run_as_user: true,
        sandbox_binary: Some(PathBuf::from("/bin/true")),
        ..Config::default()
    };
    Engine::new(
        config,
        Arc::new(NullCgroupDriver),
        Arc::new(UnixDialer),
        Arc::new(FakeReaper::default()),
    )
}

/// Writes a bundle with an EROFS-rooted, read-only spec. With a
/// sandbox id the spec is tagged as a sub-container of that sandbox.
fn write_bundle(dir: &Path, name: &str, image: &Path, sandbox_id: Option<&str>) -> PathBuf {
    let bundle = dir.join(name);
    let rootfs = bundle.join("rootfs");
    std::fs::create_dir_all(&rootfs).unwrap();

    let mut spec = Spec {
        root: Some(Root {
            path: rootfs,
            readonly: true,
        }),
        process: Some(Process {
            args: vec!["/bin/sleep".into(), "100".into()],
            ..Default::default()
        }),
        ..Default::default()
    };
    spec.annotations.insert(
        "dev.gvisor.spec.rootfs.source".into(),
        image.display().to_string(),
    );
    spec.annotations
        .insert("dev.gvisor.spec.rootfs.type".into(), "erofs".into());
    spec.annotations
        .insert("dev.gvisor.spec.rootfs.overlay".into(), "memory".into());
    if let Some(sandbox_id) = sandbox_id {
        spec.annotations.insert(
            "io.kubernetes.cri.container-type".into(),
            "container".into(),
        );
        spec.annotations
            .insert("io.kubernetes.cri.sandbox-id".into(), sandbox_id.into());
    }
    std::fs::write(
        bundle.join("config.json"),
        serde_json::to_vec_pretty(&spec).unwrap(),
    )
    .unwrap();
    bundle
}

fn create_args(id: &str, bundle: &Path) -> CreateArgs {
    CreateArgs {
        id: id.to_string(),
        spec: wardenrun::spec::load_from_bundle(bundle).unwrap(),
        bundle_dir: bundle.to_path_buf(),
        console_socket: None,
        pid_file: None,
        user_log: None,
        attached: false,
    }
}

fn create_root(engine: &Engine, dir: &Path, id: &str) -> Container {
    let image = dir.join(format!("{id}.img"));
    std::fs::write(&image, b"erofs image bytes").unwrap();
    let bundle = write_bundle(dir, &format!("{id}-bundle"), &image, None);
    engine
        .create(create_args(id, &bundle), &CancelToken::new())
        .unwrap()
}

fn create_sub(engine: &Engine, dir: &Path, id: &str, sandbox_id: &str) -> Container {
    let image = dir.join(format!("{id}.img"));
    std::fs::write(&image, b"erofs image bytes").unwrap();
    let bundle = write_bundle(dir, &format!("{id}-bundle"), &image, Some(sandbox_id));
    engine
        .create(create_args(id, &bundle), &CancelToken::new())
        .unwrap()
}

// =============================================================================
// Root Container Lifecycle
// =============================================================================

#[test]
fn test_root_container_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let _sentry = FakeSentry::start(&endpoint(&root, "c1"));
    let engine = test_engine(&root);
    let cancel = CancelToken::new();

    let mut container = create_root(&engine, dir.path(), "c1");
    assert_eq!(container.status, Status::Created);
    // Goferless: EROFS root, no bind mounts, so no gofer was spawned.
    assert_eq!(container.gofer_pid, 0);
    assert!(root.join("c1_c1").join("meta.json").exists());

    container.start(&engine, &cancel).unwrap();
    assert_eq!(container.status, Status::Running);
    assert!(_sentry.methods().contains(&"start_root".to_string()));

    let status = container.wait(&engine, &cancel).unwrap();
    assert_eq!(status, 0);
    assert_eq!(container.status, Status::Stopped);

    container.destroy(&engine).unwrap();
    assert!(!root.join("c1_c1").exists());
}

#[test]
fn test_wait_reports_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let sentry = FakeSentry::start(&endpoint(&root, "c1"));
    sentry.set_wait_status(7 << 8);
    let engine = test_engine(&root);
    let cancel = CancelToken::new();

    let mut container = create_root(&engine, dir.path(), "c1");
    container.start(&engine, &cancel).unwrap();
    let status = container.wait(&engine, &cancel).unwrap();
    assert_eq!(wardenrun::wait_status_to_exit_code(status), 7);
}

#[test]
fn test_duplicate_create_fails_and_preserves_winner() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let _sentry = FakeSentry::start(&endpoint(&root, "c1"));
    let engine = test_engine(&root);

    let container = create_root(&engine, dir.path(), "c1");
    let image = dir.path().join("other.img");
    std::fs::write(&image, b"img").unwrap();
    let bundle = write_bundle(dir.path(), "other-bundle", &image, None);

    let err = engine
        .create(create_args("c1", &bundle), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "got {err}");

    // The losing attempt must not have removed the winner's state.
    assert!(root.join("c1_c1").join("meta.json").exists());
    assert_eq!(container.status, Status::Created);
}

#[test]
fn test_destroy_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let _sentry = FakeSentry::start(&endpoint(&root, "c1"));
    let engine = test_engine(&root);

    let mut container = create_root(&engine, dir.path(), "c1");
    container.destroy(&engine).unwrap();
    assert!(!root.join("c1_c1").exists());

    container.destroy(&engine).unwrap();
    assert!(!root.join("c1_c1").exists());
    assert_eq!(container.status, Status::Stopped);
}

#[test]
fn test_invalid_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let engine = test_engine(&root);
    let image = dir.path().join("c.img");
    std::fs::write(&image, b"img").unwrap();
    let bundle = write_bundle(dir.path(), "bundle", &image, None);

    let mut args = create_args("ok", &bundle);
    args.id = "not ok!".to_string();
    let err = engine.create(args, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::InvalidId(_)));
}

#[test]
fn test_restore_transitions_created_to_running() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let sentry = FakeSentry::start(&endpoint(&root, "c1"));
    let engine = test_engine(&root);
    let cancel = CancelToken::new();

    let mut container = create_root(&engine, dir.path(), "c1");
    let image_dir = dir.path().join("image");
    std::fs::create_dir_all(&image_dir).unwrap();
    container
        .restore(&engine, &cancel, &image_dir, false, false)
        .unwrap();
    assert_eq!(container.status, Status::Running);
    assert!(sentry.methods().contains(&"restore".to_string()));

    // A second restore is rejected: the container already runs.
    let err = container
        .restore(&engine, &cancel, &image_dir, false, false)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

// =============================================================================
// State Machine Guards
// =============================================================================

#[test]
fn test_operation_guards_by_status() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let sentry = FakeSentry::start(&endpoint(&root, "c1"));
    let engine = test_engine(&root);
    let cancel = CancelToken::new();

    let mut container = create_root(&engine, dir.path(), "c1");

    // Created: no signals, no pause, no resume.
    assert!(matches!(
        container.signal(&engine, &cancel, libc::SIGTERM, false),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        container.pause(&engine, &cancel),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        container.resume(&engine, &cancel),
        Err(Error::InvalidState(_))
    ));
    // Execute and events are allowed in Created.
    let pid = container
        .execute(
            &engine,
            &cancel,
            ExecArgs {
                argv: vec!["/bin/ls".into()],
                cwd: "/".into(),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(pid, 123);
    let event = container.event(&engine, &cancel).unwrap();
    assert_eq!(event.event.typ, "stats");

    container.start(&engine, &cancel).unwrap();
    // Running: start is no longer allowed.
    assert!(matches!(
        container.start(&engine, &cancel),
        Err(Error::InvalidState(_))
    ));

    container.pause(&engine, &cancel).unwrap();
    assert_eq!(container.status, Status::Paused);
    container.resume(&engine, &cancel).unwrap();
    assert_eq!(container.status, Status::Running);

    assert!(sentry.methods().contains(&"pause".to_string()));
    assert!(sentry.methods().contains(&"resume".to_string()));
}

#[test]
fn test_check_stopped_reconciles_with_sentry() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let sentry = FakeSentry::start(&endpoint(&root, "c1"));
    let engine = test_engine(&root);
    let cancel = CancelToken::new();

    let mut container = create_root(&engine, dir.path(), "c1");
    container.start(&engine, &cancel).unwrap();

    sentry.set_runtime_state(RuntimeState::Running);
    container.check_stopped(&engine, &cancel);
    assert_eq!(container.status, Status::Running);

    sentry.set_runtime_state(RuntimeState::Stopped);
    container.check_stopped(&engine, &cancel);
    assert_eq!(container.status, Status::Stopped);
}

// =============================================================================
// Sub-Containers
// =============================================================================

#[test]
fn test_subcontainer_lifecycle_in_shared_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let sentry = FakeSentry::start(&endpoint(&root, "sb1"));
    let engine = test_engine(&root);
    let cancel = CancelToken::new();

    let mut sandbox_root = create_root(&engine, dir.path(), "sb1");
    sandbox_root.start(&engine, &cancel).unwrap();

    let mut sub = create_sub(&engine, dir.path(), "c2", "sb1");
    assert_eq!(sub.status, Status::Created);
    assert_eq!(sub.gofer_pid, 0);
    assert!(sentry.methods().contains(&"create_subcontainer".to_string()));
    assert!(root.join("sb1_c2").join("meta.json").exists());

    sub.start(&engine, &cancel).unwrap();
    assert_eq!(sub.status, Status::Running);
    assert!(sentry.methods().contains(&"start_subcontainer".to_string()));

    sub.destroy(&engine).unwrap();
    assert!(!root.join("sb1_c2").exists());
    assert!(sentry.methods().contains(&"destroy_container".to_string()));

    sandbox_root.destroy(&engine).unwrap();
    assert!(!root.join("sb1_sb1").exists());
}

#[test]
fn test_signals_into_paused_sandbox_need_all() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let _sentry = FakeSentry::start(&endpoint(&root, "sb1"));
    let engine = test_engine(&root);
    let cancel = CancelToken::new();

    let mut sandbox_root = create_root(&engine, dir.path(), "sb1");
    sandbox_root.start(&engine, &cancel).unwrap();
    let mut sub = create_sub(&engine, dir.path(), "c2", "sb1");
    sub.start(&engine, &cancel).unwrap();

    // Pausing the root suspends the whole sandbox kernel; the sub
    // container's own record still says Running.
    sandbox_root.pause(&engine, &cancel).unwrap();

    let err = sub
        .signal(&engine, &cancel, libc::SIGTERM, false)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "got {err}");

    // With all=true the sentry queues the signal for delivery after
    // resume.
    sub.signal(&engine, &cancel, libc::SIGTERM, true).unwrap();

    sandbox_root.resume(&engine, &cancel).unwrap();
    sub.signal(&engine, &cancel, libc::SIGTERM, false).unwrap();
}

#[test]
fn test_subcontainer_without_sandbox_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let engine = test_engine(&root);

    let image = dir.path().join("c.img");
    std::fs::write(&image, b"img").unwrap();
    let bundle = write_bundle(dir.path(), "bundle", &image, Some("sbX"));
    let mut args = create_args("c3", &bundle);
    args.spec
        .annotations
        .remove("io.kubernetes.cri.sandbox-id");
    let err = engine.create(args, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::InvalidSpec(_)), "got {err}");
}

// =============================================================================
// Recovery
// =============================================================================

#[test]
fn test_interrupted_create_is_invisible_and_removable() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    std::fs::create_dir_all(root.join("c9_c9")).unwrap();
    let engine = test_engine(&root);

    // A directory without a saved record is not a live container.
    assert!(engine.list().unwrap().is_empty());
    assert!(matches!(engine.load("c9"), Err(Error::NotFound(_))));

    // Forced deletion clears the leftovers.
    assert!(statefile::remove_orphans(&root, "c9").unwrap());
    assert!(!root.join("c9_c9").exists());
}

#[test]
fn test_load_round_trips_record() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let _sentry = FakeSentry::start(&endpoint(&root, "c1"));
    let engine = test_engine(&root);

    let container = create_root(&engine, dir.path(), "c1");
    let loaded = engine.load("c1").unwrap();
    assert_eq!(loaded.id, container.id);
    assert_eq!(loaded.status, Status::Created);
    assert_eq!(loaded.gofer_mount_confs, container.gofer_mount_confs);
    assert!(!loaded.gofer_is_child);
    assert_eq!(
        loaded.sandbox.as_ref().map(|s| s.id.clone()),
        Some("c1".to_string())
    );
}
