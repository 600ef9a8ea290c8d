//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Advisory `flock(2)` lock guarding installed-version state across processes.
//!
//! The lock is released when the guard drops (closing the descriptor
//! releases it). A pipeline that needs a reboot hands the guard back to its
//! caller instead of dropping it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, UpdateError};

/// Held update lock.
#[derive(Debug)]
pub struct UpdateLock {
    file: File,
    path: PathBuf,
}

impl UpdateLock {
    /// Block until the exclusive lock on `path` is held.
    ///
    /// Runs on the blocking pool so a long wait does not stall the runtime.
    pub async fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!(path = %path.display(), "acquiring update lock");
        let owned = path.clone();
        let joined = tokio::task::spawn_blocking(move || lock_blocking(&owned)).await;
        match joined {
            Ok(Ok(lock)) => Ok(lock),
            Ok(Err(source)) => Err(UpdateError::LockUnavailable { path, source }),
            Err(join) => Err(UpdateError::LockUnavailable {
                path,
                source: io::Error::new(io::ErrorKind::Other, join),
            }),
        }
    }

    /// Take the lock if it is free, `None` if another holder has it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = open_lock_file(path).map_err(|source| UpdateError::LockUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if err.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(None),
            Err(source) => Err(UpdateError::LockUnavailable {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        // Closing the descriptor also releases; unlock first so the log line is accurate.
        let _ = flock(&self.file, libc::LOCK_UN);
        debug!(path = %self.path.display(), "update lock released");
    }
}

fn lock_blocking(path: &Path) -> io::Result<UpdateLock> {
    let file = open_lock_file(path)?;
    loop {
        match flock(&file, libc::LOCK_EX) {
            Ok(()) => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    debug!(path = %path.display(), "update lock held");
    Ok(UpdateLock {
        file,
        path: path.to_path_buf(),
    })
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_holder_is_excluded_until_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ota.lock");

        let held = UpdateLock::acquire(&path).await.unwrap();
        assert_eq!(held.path(), path.as_path());
        assert!(UpdateLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(UpdateLock::try_acquire(&path).unwrap().is_some());
    }

    #[tokio::test]
    async fn blocked_acquire_completes_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ota.lock");
        let held = UpdateLock::try_acquire(&path).unwrap().unwrap();

        let waiter = tokio::spawn({
            let path = path.clone();
            async move { UpdateLock::acquire(path).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let lock = waiter.await.unwrap().unwrap();
        assert_eq!(lock.path(), path.as_path());
    }

    #[tokio::test]
    async fn missing_directory_is_lock_unavailable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent").join("ota.lock");
        assert!(matches!(
            UpdateLock::acquire(&path).await,
            Err(UpdateError::LockUnavailable { .. })
        ));
    }
}
