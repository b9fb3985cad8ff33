//! Per-job lock files, shared by every agent process on the host.
//!
//! The daemon and `restic-agent run` each hold an exclusive `flock` on
//! `<dir>/<job>.lock` for the length of a run. The kernel drops the lock when
//! the holder exits, so a crashed run never leaves a stale lock behind.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("job is locked by another process")]
    Busy,

    #[error("failed to lock job: {0}")]
    Io(#[from] std::io::Error),
}

/// Held for the length of one run; unlocks on drop
#[derive(Debug)]
pub struct JobLock {
    _lock: Flock<File>,
}

pub fn try_lock(dir: &Path, name: &str) -> Result<JobLock, LockError> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(format!("{}.lock", name)))?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(JobLock { _lock: lock }),
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(LockError::Busy),
        Err((_, errno)) => Err(LockError::Io(errno.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_is_busy_until_released() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("locks");

        let held = try_lock(&dir, "daily").unwrap();
        assert!(matches!(try_lock(&dir, "daily"), Err(LockError::Busy)));
        assert!(try_lock(&dir, "weekly").is_ok());

        drop(held);
        assert!(try_lock(&dir, "daily").is_ok());
    }

    #[test]
    fn test_unusable_dir_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("not-a-dir");
        std::fs::write(&file, "").unwrap();

        assert!(matches!(try_lock(&file, "daily"), Err(LockError::Io(_))));
    }
}
