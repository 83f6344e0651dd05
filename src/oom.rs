//! OOM-score coordination across a sandbox.
//!
//! One sentry hosts every container of a sandbox, so its
//! `oom_score_adj` is the minimum over the scores its containers ask
//! for. The pause (sandbox-tagged) container is excluded: it always
//! carries a very low score and would otherwise pin the sandbox
//! there. The computation is pure; the `/proc` write lives apart so
//! both halves stay independently testable.

use crate::error::{Error, Result};
use crate::spec::ContainerType;
use std::io::Write;

/// Score-relevant view of one sibling container in a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct SiblingScore {
    pub container_type: ContainerType,
    pub oom_score_adj: Option<i32>,
}

/// Computes the sandbox's `oom_score_adj`.
///
/// Returns `None` when nothing should be written: the sandbox is
/// already gone, or no remaining container specifies a score and the
/// inherited value should stand.
pub fn sandbox_score(siblings: &[SiblingScore], original: i32, destroy: bool) -> Option<i32> {
    if siblings.is_empty() {
        return None;
    }
    let low = siblings
        .iter()
        .filter(|s| s.container_type != ContainerType::Sandbox)
        .filter_map(|s| s.oom_score_adj)
        .min();
    match low {
        Some(score) => Some(score),
        // A destroy that removed the last score-carrying container
        // reverts the sandbox to the score it was created with.
        None if destroy => Some(original),
        None => None,
    }
}

/// Writes `oom_score_adj` for a pid. A process that already exited
/// (missing proc entry, ESRCH on write) is benign: the adjustment
/// always races with process exit.
pub fn set_oom_score_adj(pid: i32, score: i32) -> Result<()> {
    let path = format!("/proc/{pid}/oom_score_adj");
    let mut file = match std::fs::OpenOptions::new().write(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(pid, "process not found setting oom_score_adj");
            return Ok(());
        }
        Err(e) => return Err(Error::Io(e)),
    };
    match file.write_all(score.to_string().as_bytes()) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
            tracing::warn!(pid, "process exited while setting oom_score_adj");
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sibling(container_type: ContainerType, score: Option<i32>) -> SiblingScore {
        SiblingScore {
            container_type,
            oom_score_adj: score,
        }
    }

    #[test]
    fn test_minimum_over_workload_containers() {
        let siblings = vec![
            sibling(ContainerType::Sandbox, Some(-998)),
            sibling(ContainerType::Container, Some(100)),
            sibling(ContainerType::Container, Some(300)),
        ];
        assert_eq!(sandbox_score(&siblings, 0, false), Some(100));
    }

    #[test]
    fn test_destroy_reverts_to_original_when_no_scores_remain() {
        let siblings = vec![
            sibling(ContainerType::Sandbox, Some(-998)),
            sibling(ContainerType::Container, None),
        ];
        assert_eq!(sandbox_score(&siblings, 42, true), Some(42));
        assert_eq!(sandbox_score(&siblings, 42, false), None);
    }

    #[test]
    fn test_empty_sandbox_writes_nothing() {
        assert_eq!(sandbox_score(&[], 42, true), None);
    }

    #[test]
    fn test_single_container_without_annotation_uses_score() {
        // The single-container case has no container-type annotation.
        let siblings = vec![sibling(ContainerType::Unspecified, Some(500))];
        assert_eq!(sandbox_score(&siblings, 0, false), Some(500));
    }
}
