use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use heureka_config::locks_dir;
use heureka_core::ReconcileOperation;

use crate::ReconcileError;

/// Advisory lock held for the duration of one reconciliation call. Released
/// when dropped.
#[derive(Debug)]
pub struct OperationLock {
    file: File,
    path: PathBuf,
}

impl OperationLock {
    /// Fails with [`ReconcileError::AlreadyRunning`] instead of waiting when
    /// another holder exists.
    pub fn acquire(
        workspace: impl AsRef<Path>,
        operation: ReconcileOperation,
    ) -> Result<Self, ReconcileError> {
        let path = lock_path(workspace, operation);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                Err(ReconcileError::AlreadyRunning { operation, path })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release operation lock");
        }
    }
}

pub fn lock_path(workspace: impl AsRef<Path>, operation: ReconcileOperation) -> PathBuf {
    locks_dir(workspace).join(format!("{}.lock", operation.as_str()))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn second_holder_is_rejected_until_release() {
        let temp = tempdir().expect("tempdir");
        let first = OperationLock::acquire(temp.path(), ReconcileOperation::Autopatch)
            .expect("first lock");
        assert!(first.path().ends_with(".heureka/locks/autopatch.lock"));

        let err = OperationLock::acquire(temp.path(), ReconcileOperation::Autopatch)
            .expect_err("lock is held");
        assert!(matches!(err, ReconcileError::AlreadyRunning { .. }));
        assert!(err.is_retryable());

        let other = OperationLock::acquire(temp.path(), ReconcileOperation::Autoclose)
            .expect("locks are per operation");
        drop(other);

        drop(first);
        OperationLock::acquire(temp.path(), ReconcileOperation::Autopatch)
            .expect("lock after release");
    }
}
