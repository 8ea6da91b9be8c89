//! Advisory file lock on the container's header file.
//!
//! Grounded on the teacher's `shm::lock` (direct libc FFI for a
//! cross-process lock), simplified from a `pthread_rwlock` embedded in
//! shared memory to a plain advisory `flock()` on the header file — this
//! crate is single-writer/single-threaded per container (spec §5), so
//! the lock's only job is to reject a second process opening the same
//! directory, not to arbitrate concurrent readers/writers.
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{Result, StoreError};

pub struct DirLock {
    file: File,
}

impl DirLock {
    /// Try to take an exclusive, non-blocking advisory lock on the
    /// header file. Returns `StoreError::AlreadyOpen` if another process
    /// already holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(StoreError::AlreadyOpen(path.to_path_buf()));
            }
            return Err(StoreError::io(path, err));
        }
        Ok(DirLock { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
