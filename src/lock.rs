//! Run lock: two enforcement cycles never touch the same packet filter at once.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "/var/run/egressguard.lock";

/// Holds an exclusive advisory lock; released when dropped.
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the system-wide lock at [`LOCK_FILE`].
    pub fn acquire() -> Result<Self> {
        Self::acquire_at(LOCK_FILE)
    }

    /// Acquire an exclusive lock on `path` without blocking.
    ///
    /// The file is opened create+read+write without truncation so creating
    /// and locking it cannot race.
    pub fn acquire_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another egressguard run is in progress.\n\
                 If you believe this is an error, remove the lock file: {}",
                path.display()
            )
        })?;

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
