//! Per-container metadata persistence.
//!
//! Every container owns a directory `<root_dir>/<sandbox_id>_<container_id>/`
//! holding a versioned `meta.json` and a sibling `meta.lock`. The lock
//! file carries an OS advisory lock so unrelated processes (another
//! CLI invocation, an orchestrator retry) observe mutual exclusion
//! without any shared in-process state. Saves are atomic: the record
//! is written to a temporary file in the same directory and renamed
//! over the metadata file, so a reader sees either the old record or
//! the new one, never a torn write.

use crate::constants::{META_FILENAME, META_LOCK_FILENAME, STATE_FORMAT_VERSION};
use crate::error::{Error, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// =============================================================================
// FullId
// =============================================================================

/// Pathing key of a container under the root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullId {
    pub sandbox_id: String,
    pub container_id: String,
}

impl FullId {
    pub fn new(sandbox_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            container_id: container_id.into(),
        }
    }

    /// Directory name under the root: `<sandbox_id>_<container_id>`.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.sandbox_id, self.container_id)
    }

    fn from_dir_name(name: &str) -> Option<FullId> {
        let (sandbox_id, container_id) = name.split_once('_')?;
        Some(FullId::new(sandbox_id, container_id))
    }
}

impl std::fmt::Display for FullId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.sandbox_id, self.container_id)
    }
}

// =============================================================================
// StateFile
// =============================================================================

/// How to acquire the state file lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Block until the lock is available.
    Block,
    /// Fail immediately with `LockContended` when held elsewhere.
    NonBlock,
}

/// Coordination handle for one container's on-disk metadata.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateFile {
    pub root_dir: PathBuf,
    pub id: FullId,
    /// Open lock file while the advisory lock is held. Not persisted;
    /// the OS releases the lock if the process dies.
    #[serde(skip)]
    lock: Option<File>,
}

/// On-disk envelope. Unknown versions load as corrupt.
#[derive(Serialize, Deserialize)]
struct Versioned<T> {
    version: u32,
    record: T,
}

impl StateFile {
    pub fn new(root_dir: impl Into<PathBuf>, id: FullId) -> Self {
        Self {
            root_dir: root_dir.into(),
            id,
            lock: None,
        }
    }

    /// The container's directory under the root.
    pub fn container_dir(&self) -> PathBuf {
        self.root_dir.join(self.id.dir_name())
    }

    fn meta_path(&self) -> PathBuf {
        self.container_dir().join(META_FILENAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.container_dir().join(META_LOCK_FILENAME)
    }

    /// Acquires the exclusive advisory lock.
    pub fn lock(&mut self, mode: LockMode) -> Result<()> {
        if self.lock.is_some() {
            return Err(Error::Internal(format!(
                "state file for {} is already locked by this handle",
                self.id
            )));
        }
        create_state_dir(&self.container_dir())?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;
        match mode {
            LockMode::Block => file.lock_exclusive()?,
            LockMode::NonBlock => file.try_lock_exclusive().map_err(|e| {
                if e.kind() == fs2::lock_contended_error().kind() {
                    Error::LockContended(self.id.to_string())
                } else {
                    Error::Io(e)
                }
            })?,
        }
        self.lock = Some(file);
        Ok(())
    }

    /// Acquires the lock for a brand-new container, failing with
    /// `AlreadyExists` if a live record with the same id is present.
    pub fn lock_for_new(&mut self) -> Result<()> {
        self.lock(LockMode::Block)?;
        if self.meta_path().exists() {
            self.unlock_or_log();
            return Err(Error::AlreadyExists(self.id.container_id.clone()));
        }
        Ok(())
    }

    /// Releases the advisory lock.
    pub fn unlock(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(file) => {
                FileExt::unlock(&file)?;
                Ok(())
            }
            None => Err(Error::Internal(format!(
                "state file for {} is not locked",
                self.id
            ))),
        }
    }

    /// Releases the lock on exit paths where the operation's own error
    /// must win over an unlock failure.
    pub fn unlock_or_log(&mut self) {
        if let Err(e) = self.unlock() {
            tracing::warn!(id = %self.id, error = %e, "failed to unlock state file");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Atomically replaces the metadata file with the serialised record.
    ///
    /// Precondition: the lock is held by this handle.
    pub fn save_locked<T: Serialize>(&self, record: &T) -> Result<()> {
        if self.lock.is_none() {
            return Err(Error::Internal(format!(
                "saving state file for {} without holding its lock",
                self.id
            )));
        }
        let envelope = Versioned {
            version: STATE_FORMAT_VERSION,
            record,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(self.container_dir())?;
        serde_json::to_writer(&mut tmp, &envelope)
            .map_err(|e| Error::Internal(format!("encoding state file: {e}")))?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.meta_path())
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// True if a saved record exists on disk.
    pub fn exists(&self) -> bool {
        self.meta_path().exists()
    }

    /// Removes the entire container directory.
    pub fn destroy(&mut self) -> Result<()> {
        let dir = self.container_dir();
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }
}

fn create_state_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o711)
        .create(dir)
        .map_err(Error::Io)
}

// =============================================================================
// Loading
// =============================================================================

/// Loads a record by its exact `FullId`. May be called without the
/// lock; callers that subsequently mutate must lock and re-load.
pub fn load<T: DeserializeOwned>(root_dir: &Path, id: &FullId) -> Result<T> {
    let path = root_dir.join(id.dir_name()).join(META_FILENAME);
    let data = std::fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(id.container_id.clone())
        } else {
            Error::Io(e)
        }
    })?;
    let envelope: Versioned<T> =
        serde_json::from_slice(&data).map_err(|e| Error::Corrupt(format!("{}: {e}", id)))?;
    if envelope.version != STATE_FORMAT_VERSION {
        return Err(Error::Corrupt(format!(
            "{}: unknown state file version {}",
            id, envelope.version
        )));
    }
    Ok(envelope.record)
}

/// Resolves a bare container id to its `FullId` by scanning the root.
///
/// Fails with `NotFound` when no live record matches and with an
/// internal error when the id is ambiguous across sandboxes.
pub fn find(root_dir: &Path, container_id: &str) -> Result<FullId> {
    let mut matches: Vec<FullId> = live_ids(root_dir)?
        .into_iter()
        .filter(|id| id.container_id == container_id)
        .collect();
    match matches.len() {
        0 => Err(Error::NotFound(container_id.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::Internal(format!(
            "container id {container_id:?} matches multiple sandboxes"
        ))),
    }
}

/// Lists every live container id under the root directory.
///
/// A container is live once its metadata file has been saved;
/// directories left behind by an interrupted create are not listed.
pub fn live_ids(root_dir: &Path) -> Result<Vec<FullId>> {
    let mut ids = Vec::new();
    let entries = match std::fs::read_dir(root_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(Error::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(FullId::from_dir_name) else {
            continue;
        };
        if entry.path().join(META_FILENAME).exists() {
            ids.push(id);
        }
    }
    ids.sort_by(|a, b| a.dir_name().cmp(&b.dir_name()));
    Ok(ids)
}

/// Lists the ids of every container in one sandbox.
pub fn sandbox_ids(root_dir: &Path, sandbox_id: &str) -> Result<Vec<FullId>> {
    Ok(live_ids(root_dir)?
        .into_iter()
        .filter(|id| id.sandbox_id == sandbox_id)
        .collect())
}

/// Removes directories left behind for `container_id` even when no
/// metadata was ever saved (an interrupted create). Returns true if
/// anything was removed.
pub fn remove_orphans(root_dir: &Path, container_id: &str) -> Result<bool> {
    let mut removed = false;
    let entries = match std::fs::read_dir(root_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(FullId::from_dir_name) else {
            continue;
        };
        if id.container_id == container_id && entry.path().is_dir() {
            std::fs::remove_dir_all(entry.path())?;
            removed = true;
        }
    }
    Ok(removed)
}
