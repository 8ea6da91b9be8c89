//! External-memory list and dict containers backed by mmap'd extent
//! files. Each container is a directory on disk: a small header file
//! plus a sequence of fixed-size extents holding variable-length
//! records managed by a slab allocator. See [`EMList`] and [`EMDict`]
//! for the two container types, and [`StoreConfig`] for tunables.

mod alloc;
mod config;
mod container;
mod dict;
mod error;
mod extent;
mod header;
mod list;
mod lock;
mod offset;
mod record;
mod value;
mod window_cache;

pub use config::StoreConfig;
pub use dict::EMDict;
pub use error::{Result, StoreError};
pub use list::EMList;
pub use value::Value;

/// Open (or create) an `EMList` rooted at `dir`.
pub fn open_list(dir: impl AsRef<std::path::Path>, config: &StoreConfig) -> Result<EMList> {
    EMList::open(dir, config)
}

/// Open (or create) an `EMDict` rooted at `dir`.
pub fn open_dict(dir: impl AsRef<std::path::Path>, config: &StoreConfig) -> Result<EMDict> {
    EMDict::open(dir, config)
}

/// Installs a `tracing` subscriber writing to the test harness's captured
/// output, so `debug!`/`warn!`/`error!` spans from allocation, eviction,
/// and rehashing show up under `cargo test -- --nocapture`. Safe to call
/// from multiple tests; only the first call wins.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .try_init();
}
