//! Directory lifecycle: creation, reopening, the process-wide open-path
//! table, and the poisoned-container state machine (spec §3 "Lifecycle",
//! §5 "Shared resources", §7 "Poisoned").

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::header::{self, ContainerKind, Header};
use crate::lock::DirLock;
use crate::window_cache::WindowCache;

fn registry() -> &'static Mutex<HashSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_open(path: &Path) -> Result<()> {
    let mut set = registry().lock();
    if !set.insert(path.to_path_buf()) {
        return Err(StoreError::AlreadyOpen(path.to_path_buf()));
    }
    Ok(())
}

fn unregister_open(path: &Path) {
    registry().lock().remove(path);
}

pub struct Container {
    dir: PathBuf,
    canonical: PathBuf,
    window: WindowCache,
    header: RefCell<Header>,
    poisoned: Cell<bool>,
    _lock: DirLock,
}

impl Container {
    /// Open `dir` as a container of `kind`, creating it (with a fresh
    /// header and no extents yet) if it doesn't already exist. Returns
    /// whether the container was freshly created, so callers (EMList /
    /// EMDict) know whether to initialize their root structures.
    pub fn open_or_create(
        dir: &Path,
        kind: ContainerKind,
        config: &StoreConfig,
    ) -> Result<(Container, bool)> {
        config.validate()?;
        header::ensure_dir(dir)?;

        let canonical = dir
            .canonicalize()
            .map_err(|e| StoreError::io(dir, e))?;
        register_open(&canonical)?;

        match Self::open_or_create_inner(dir, &canonical, kind, config) {
            Ok(result) => Ok(result),
            Err(e) => {
                unregister_open(&canonical);
                Err(e)
            }
        }
    }

    fn open_or_create_inner(
        dir: &Path,
        canonical: &Path,
        kind: ContainerKind,
        config: &StoreConfig,
    ) -> Result<(Container, bool)> {
        let is_fresh = !header::exists(dir);
        if is_fresh {
            let log2 = config.extent_size_log2();
            let header = match kind {
                ContainerKind::List => Header::new_list(log2),
                ContainerKind::Dict => {
                    let seed = rand::random::<u64>();
                    Header::new_dict(log2, seed, config.initial_dict_slots)
                }
            };
            header::write_atomic(dir, &header)?;
            tracing::info!(path = %dir.display(), ?kind, "created fresh container");
        }

        let lock = DirLock::acquire(&header::header_path(dir))?;
        let loaded = header::read(dir)?;
        if loaded.kind != kind {
            return Err(StoreError::Corruption(format!(
                "{} is a {:?} container, expected {:?}",
                dir.display(),
                loaded.kind,
                kind
            )));
        }

        let window = WindowCache::new(dir.to_path_buf(), loaded.extent_size(), config.window_capacity);
        // Existing extents are known to the window cache only through
        // the header's extent_count; nothing is mapped until first pin.

        let container = Container {
            dir: dir.to_path_buf(),
            canonical: canonical.to_path_buf(),
            window,
            header: RefCell::new(loaded),
            poisoned: Cell::new(false),
            _lock: lock,
        };
        Ok((container, is_fresh))
    }

    #[inline]
    pub fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.get() {
            Err(StoreError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Mark the container poisoned after an unrecoverable error. All
    /// subsequent operations raise `StoreError::Poisoned` until the
    /// container is closed and reopened.
    pub fn poison(&self) {
        if !self.poisoned.replace(true) {
            tracing::error!(path = %self.dir.display(), "container poisoned");
        }
    }

    /// Run `f`, poisoning the container if it returns `StoreError::Corruption`.
    pub fn guarded<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.check_poisoned()?;
        let result = f();
        if let Err(StoreError::Corruption(_)) = &result {
            self.poison();
        }
        result
    }

    pub fn window(&self) -> &WindowCache {
        &self.window
    }

    pub fn header(&self) -> Ref<'_, Header> {
        self.header.borrow()
    }

    pub fn header_mut(&self) -> RefMut<'_, Header> {
        self.header.borrow_mut()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flush the header (tempfile + rename) and msync all dirty extents.
    /// Idempotent: flushing twice with no intervening mutation rewrites
    /// a byte-identical header (spec §8 invariant 5).
    pub fn flush(&self) -> Result<()> {
        self.check_poisoned()?;
        self.window.flush_all()?;
        header::write_atomic(&self.dir, &self.header.borrow())?;
        Ok(())
    }

    /// Close the container. Valid even when poisoned (in which case no
    /// flush is attempted, since state may be inconsistent) — spec §7.
    pub fn close(self) -> Result<()> {
        if !self.poisoned.get() {
            self.flush()?;
        }
        Ok(())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        unregister_open(&self.canonical);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::tempdir;

    #[test]
    fn second_open_of_same_path_fails() {
        crate::init_test_tracing();
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let (_first, _fresh) =
            Container::open_or_create(dir.path(), ContainerKind::List, &config).unwrap();
        let err = Container::open_or_create(dir.path(), ContainerKind::List, &config).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyOpen(_)));
    }

    #[test]
    fn reopen_after_close_succeeds() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let (first, is_fresh) =
            Container::open_or_create(dir.path(), ContainerKind::List, &config).unwrap();
        assert!(is_fresh);
        first.close().unwrap();

        let (second, is_fresh) =
            Container::open_or_create(dir.path(), ContainerKind::List, &config).unwrap();
        assert!(!is_fresh);
        second.close().unwrap();
    }

    #[test]
    fn reopening_as_wrong_kind_is_corruption() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let (container, _) =
            Container::open_or_create(dir.path(), ContainerKind::List, &config).unwrap();
        container.close().unwrap();

        let err =
            Container::open_or_create(dir.path(), ContainerKind::Dict, &config).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }

    #[test]
    fn guarded_poisons_on_corruption() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let (container, _) =
            Container::open_or_create(dir.path(), ContainerKind::List, &config).unwrap();

        let result: Result<()> = container.guarded(|| Err(StoreError::Corruption("boom".into())));
        assert!(result.is_err());
        assert!(matches!(
            container.check_poisoned().unwrap_err(),
            StoreError::Poisoned
        ));
    }
}
