//! Disk-backed byte store with TTL eviction on read.
//!
//! Keys are relative paths with `/` separators, joined onto the root
//! directory component by component. The file's modification time is the
//! entry's write timestamp; an entry older than the TTL is deleted
//! best-effort and reported as a miss. A TTL of zero disables expiry.
//!
//! Writes are not atomic. A torn file fails response-codec validation on
//! the next read and is treated as a miss, so no locking is needed here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CacheError;

/// Mode for cache directories.
#[cfg(unix)]
const DIR_MODE: u32 = 0o755;

/// Mode for cache entry files.
#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

/// `create_dir_all` at [`DIR_MODE`] rather than whatever the umask says.
fn create_dirs(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

/// Writes `data` to `path` and pins the file to [`FILE_MODE`].
fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))?;
    }
    Ok(())
}

/// Disk-backed byte store.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    ttl: Duration,
}

impl DiskStore {
    /// Creates a store rooted at `root` with the given TTL.
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    /// Creates the root directory and any missing parents. Idempotent.
    pub fn init(&self) -> Result<(), CacheError> {
        create_dirs(&self.root)?;
        Ok(())
    }

    /// Returns the configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the root directory.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Maps a key to its on-disk path. Rejects empty keys.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        let mut path = self.root.clone();
        for part in key.split('/') {
            path.push(part);
        }
        Ok(path)
    }

    /// Reads an entry. Returns `None` for missing or expired entries; an
    /// expired entry is removed best-effort before returning.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.path_for(key)?;

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !self.ttl.is_zero() {
            // A modification time in the future reads as age zero.
            let age = meta.modified()?.elapsed().unwrap_or_default();
            if age > self.ttl {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(
                        "failed to remove expired cache entry {}: {}",
                        path.display(),
                        e
                    );
                }
                return Ok(None);
            }
        }

        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            // Lost a race with concurrent expiry; same as not found.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes an entry, creating intermediate directories as needed.
    pub fn set(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key)?;

        if let Some(parent) = path.parent() {
            create_dirs(parent)?;
        }
        write_file(&path, data)?;

        tracing::debug!("cached {}", path.display());
        Ok(())
    }
}
