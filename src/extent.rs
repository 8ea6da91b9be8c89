//! Extent file — a fixed-size file on disk, the unit of mmap residency.
//!
//! Grounded on the teacher's `shm::region` file-creation dance (create,
//! set_len, zero), generalized from a single region file to a sequence of
//! indexed extent files living in a container directory.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Formats the filename for extent `index`, e.g. `ext-0000`.
pub fn extent_filename(index: u32) -> String {
    format!("ext-{index:04}")
}

/// A bare file handle for one extent. No mmap yet — mapping is the window
/// cache's job.
pub struct ExtentFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl ExtentFile {
    /// Create a new extent file of exactly `size` bytes, pre-allocated
    /// (logically zero-filled; hole-punching is acceptable).
    pub fn create(dir: &Path, index: u32, size: u64) -> Result<Self> {
        let path = dir.join(extent_filename(index));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.set_len(size).map_err(|e| StoreError::io(&path, e))?;
        tracing::debug!(index, size, path = %path.display(), "created extent");
        Ok(ExtentFile {
            path,
            file,
            size,
        })
    }

    /// Open an already-existing extent file. Its length must equal `size`;
    /// a mismatch is treated as corruption (a mis-numbered or truncated
    /// extent is a fatal error at open, per spec §4.1).
    pub fn open_existing(dir: &Path, index: u32, size: u64) -> Result<Self> {
        let path = dir.join(extent_filename(index));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let actual_len = file
            .metadata()
            .map_err(|e| StoreError::io(&path, e))?
            .len();
        if actual_len != size {
            return Err(StoreError::Corruption(format!(
                "extent {index} has length {actual_len}, expected {size}"
            )));
        }
        Ok(ExtentFile {
            path,
            file,
            size,
        })
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| StoreError::io(&self.path, e))
    }

    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_preallocates_full_length() {
        let dir = tempdir().unwrap();
        let ext = ExtentFile::create(dir.path(), 0, 1 << 20).unwrap();
        assert_eq!(ext.len(), 1 << 20);
        assert_eq!(dir.path().join("ext-0000").metadata().unwrap().len(), 1 << 20);
    }

    #[test]
    fn open_existing_rejects_wrong_length() {
        let dir = tempdir().unwrap();
        ExtentFile::create(dir.path(), 0, 1 << 20).unwrap();
        assert!(matches!(
            ExtentFile::open_existing(dir.path(), 0, 2 << 20).unwrap_err(),
            StoreError::Corruption(_)
        ));
    }

    #[test]
    fn open_missing_extent_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ExtentFile::open_existing(dir.path(), 0, 1 << 20).unwrap_err(),
            StoreError::Io { .. }
        ));
    }
}
