//! Advisory file lock shared by every process writing one content root.
//!
//! The in-process [`LockManager`](crate::LockManager) only orders callers
//! that share it. A `stash apply` run next to `stash serve` builds its own
//! manager, so whoever holds the slot also claims this lock before touching
//! the tree or its history. The lock is released when the guard's file
//! handle is closed, including when the process dies.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "stash.lock";

/// Location of the advisory lock for a content root.
#[derive(Debug, Clone)]
pub struct Interlock {
    path: PathBuf,
}

impl Interlock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The lock for `root`: inside its `.git` directory when there is one,
    /// otherwise a hidden file at the top of the tree.
    pub fn for_root(root: &Path) -> Self {
        let git_dir = root.join(".git");
        if git_dir.is_dir() {
            Self::new(git_dir.join(LOCK_FILE))
        } else {
            Self::new(root.join(format!(".{}", LOCK_FILE)))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without blocking. `None` means another handle holds it.
    pub fn try_claim(&self) -> io::Result<Option<InterlockGuard>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(InterlockGuard { _file: file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// A claimed [`Interlock`]; dropping it unlocks.
#[derive(Debug)]
pub struct InterlockGuard {
    _file: File,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let tmp = TempDir::new().unwrap();
        let lock = Interlock::for_root(tmp.path());

        let guard = lock.try_claim().unwrap().unwrap();
        assert!(lock.try_claim().unwrap().is_none());
        assert!(Interlock::for_root(tmp.path()).try_claim().unwrap().is_none());

        drop(guard);
        assert!(lock.try_claim().unwrap().is_some());
    }

    #[test]
    fn test_lock_file_location() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            Interlock::for_root(tmp.path()).path(),
            tmp.path().join(".stash.lock")
        );

        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        assert_eq!(
            Interlock::for_root(tmp.path()).path(),
            tmp.path().join(".git").join("stash.lock")
        );
    }
}
