//! Cross-process run lock

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

/// Exclusive advisory lock held for the duration of one pipeline run
///
/// Released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        debug!(?path, "RunLock::try_acquire: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(?path, "RunLock::try_acquire: acquired");
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!(?path, "RunLock::try_acquire: held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = ?self.path, error = %e, "Failed to release run lock");
        }
    }
}
