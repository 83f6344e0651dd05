//! Tests for state-file locking, atomic persistence, and discovery.

use serde::{Deserialize, Serialize};
use wardenrun::error::Error;
use wardenrun::statefile::{self, FullId, LockMode, StateFile};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestRecord {
    id: String,
    generation: u32,
}

fn record(id: &str, generation: u32) -> TestRecord {
    TestRecord {
        id: id.to_string(),
        generation,
    }
}

// =============================================================================
// Locking
// =============================================================================

#[test]
fn test_lock_for_new_then_save_and_load() {
    let root = tempfile::tempdir().unwrap();
    let id = FullId::new("s1", "c1");
    let mut sf = StateFile::new(root.path(), id.clone());

    sf.lock_for_new().unwrap();
    sf.save_locked(&record("c1", 1)).unwrap();
    sf.unlock().unwrap();

    let loaded: TestRecord = statefile::load(root.path(), &id).unwrap();
    assert_eq!(loaded, record("c1", 1));
}

#[test]
fn test_lock_for_new_rejects_existing_record() {
    let root = tempfile::tempdir().unwrap();
    let id = FullId::new("s1", "c1");

    let mut first = StateFile::new(root.path(), id.clone());
    first.lock_for_new().unwrap();
    first.save_locked(&record("c1", 1)).unwrap();
    first.unlock().unwrap();

    let mut second = StateFile::new(root.path(), id.clone());
    let err = second.lock_for_new().unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "got {err}");

    // The existing record is untouched by the failed attempt.
    let loaded: TestRecord = statefile::load(root.path(), &id).unwrap();
    assert_eq!(loaded.generation, 1);
}

#[test]
fn test_nonblocking_lock_reports_contention() {
    let root = tempfile::tempdir().unwrap();
    let id = FullId::new("s1", "c1");

    let mut holder = StateFile::new(root.path(), id.clone());
    holder.lock(LockMode::Block).unwrap();

    let mut contender = StateFile::new(root.path(), id.clone());
    let err = contender.lock(LockMode::NonBlock).unwrap_err();
    assert!(matches!(err, Error::LockContended(_)), "got {err}");

    holder.unlock().unwrap();
    contender.lock(LockMode::NonBlock).unwrap();
    contender.unlock().unwrap();
}

#[test]
fn test_save_without_lock_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let sf = StateFile::new(root.path(), FullId::new("s1", "c1"));
    let err = sf.save_locked(&record("c1", 1)).unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

// =============================================================================
// Atomicity and Versioning
// =============================================================================

#[test]
fn test_save_replaces_record_atomically() {
    let root = tempfile::tempdir().unwrap();
    let id = FullId::new("s1", "c1");
    let mut sf = StateFile::new(root.path(), id.clone());

    sf.lock_for_new().unwrap();
    sf.save_locked(&record("c1", 1)).unwrap();
    sf.save_locked(&record("c1", 2)).unwrap();
    sf.unlock().unwrap();

    let loaded: TestRecord = statefile::load(root.path(), &id).unwrap();
    assert_eq!(loaded.generation, 2);

    // No temporary files survive next to the record.
    let entries: Vec<_> = std::fs::read_dir(root.path().join(id.dir_name()))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries.len(), 2, "unexpected files: {entries:?}");
    assert!(entries.contains(&"meta.json".to_string()));
    assert!(entries.contains(&"meta.lock".to_string()));
}

#[test]
fn test_unknown_version_is_corrupt() {
    let root = tempfile::tempdir().unwrap();
    let id = FullId::new("s1", "c1");
    let dir = root.path().join(id.dir_name());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("meta.json"),
        r#"{"version": 99, "record": {"id": "c1", "generation": 1}}"#,
    )
    .unwrap();

    let err = statefile::load::<TestRecord>(root.path(), &id).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "got {err}");
}

#[test]
fn test_garbage_record_is_corrupt() {
    let root = tempfile::tempdir().unwrap();
    let id = FullId::new("s1", "c1");
    let dir = root.path().join(id.dir_name());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("meta.json"), b"not json at all").unwrap();

    let err = statefile::load::<TestRecord>(root.path(), &id).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
}

#[test]
fn test_load_missing_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let err = statefile::load::<TestRecord>(root.path(), &FullId::new("s1", "nope")).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// =============================================================================
// Destroy and Discovery
// =============================================================================

#[test]
fn test_destroy_removes_directory() {
    let root = tempfile::tempdir().unwrap();
    let id = FullId::new("s1", "c1");
    let mut sf = StateFile::new(root.path(), id.clone());
    sf.lock_for_new().unwrap();
    sf.save_locked(&record("c1", 1)).unwrap();
    sf.destroy().unwrap();
    sf.unlock().unwrap();

    assert!(!root.path().join(id.dir_name()).exists());
    // Destroy of an already-removed directory succeeds.
    let mut sf = StateFile::new(root.path(), id);
    sf.destroy().unwrap();
}

#[test]
fn test_live_ids_skips_directories_without_records() {
    let root = tempfile::tempdir().unwrap();

    let id = FullId::new("s1", "c1");
    let mut sf = StateFile::new(root.path(), id.clone());
    sf.lock_for_new().unwrap();
    sf.save_locked(&record("c1", 1)).unwrap();
    sf.unlock().unwrap();

    // An interrupted create: directory exists, record was never saved.
    std::fs::create_dir_all(root.path().join("s1_partial")).unwrap();

    let ids = statefile::live_ids(root.path()).unwrap();
    assert_eq!(ids, vec![id]);
}

#[test]
fn test_find_by_bare_container_id() {
    let root = tempfile::tempdir().unwrap();
    for (sid, cid) in [("pod1", "pod1"), ("pod1", "web")] {
        let mut sf = StateFile::new(root.path(), FullId::new(sid, cid));
        sf.lock_for_new().unwrap();
        sf.save_locked(&record(cid, 1)).unwrap();
        sf.unlock().unwrap();
    }

    let found = statefile::find(root.path(), "web").unwrap();
    assert_eq!(found, FullId::new("pod1", "web"));
    assert!(matches!(
        statefile::find(root.path(), "ghost"),
        Err(Error::NotFound(_))
    ));

    let in_sandbox = statefile::sandbox_ids(root.path(), "pod1").unwrap();
    assert_eq!(in_sandbox.len(), 2);
}

#[test]
fn test_remove_orphans() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("c9_c9")).unwrap();

    assert!(statefile::remove_orphans(root.path(), "c9").unwrap());
    assert!(!root.path().join("c9_c9").exists());
    assert!(!statefile::remove_orphans(root.path(), "c9").unwrap());
}
