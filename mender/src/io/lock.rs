//! Single-instance run lock for a project checkout.
//!
//! The lock is advisory and filesystem-based: an exclusive flock on
//! `.mender/run.lock`. Acquisition never blocks; a contended lock means
//! another run owns this checkout and the caller exits cleanly. Release is
//! tied to the guard's lifetime so every exit path, including panics
//! unwinding out of the loop, lets go of the lock.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

/// Marker error for a lock already held by another run.
#[derive(Debug)]
pub struct LockContended;

impl std::fmt::Display for LockContended {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "another run holds the lock for this checkout")
    }
}

impl std::error::Error for LockContended {}

/// Held run lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock without blocking. A contended lock surfaces as a
    /// [`LockContended`] error the caller can downcast on.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(path = %path.display(), "acquired run lock");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(LockContended.into()),
            Err(err) => {
                Err(err).with_context(|| format!("lock {}", path.display()))
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(err = %err, "failed to unlock run lock");
        }
        // Best effort; a stale empty file is harmless since only the flock
        // carries meaning.
        let _ = std::fs::remove_file(&self.path);
        debug!(path = %self.path.display(), "released run lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_contended_while_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.lock");

        let held = RunLock::acquire(&path).expect("first acquire");
        let err = RunLock::acquire(&path).expect_err("second acquire should fail");
        assert!(err.downcast_ref::<LockContended>().is_some());
        drop(held);
    }

    #[test]
    fn lock_can_be_reacquired_after_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.lock");

        drop(RunLock::acquire(&path).expect("first acquire"));
        let again = RunLock::acquire(&path).expect("reacquire");
        drop(again);
    }

    #[test]
    fn acquire_creates_missing_parent_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/run.lock");
        let lock = RunLock::acquire(&path).expect("acquire");
        assert!(path.exists());
        drop(lock);
    }
}
