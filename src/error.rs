use std::path::PathBuf;

/// The crate-wide error taxonomy.
///
/// Propagation policy: allocator and window-cache errors bubble up
/// unchanged. [`crate::list::EMList`] and [`crate::dict::EMDict`] add
/// [`StoreError::IndexOutOfRange`] / [`StoreError::KeyMissing`] but never
/// wrap an I/O error in a logical one.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("container already open: {0}")]
    AlreadyOpen(PathBuf),

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("key missing")]
    KeyMissing,

    #[error("cannot encode value: {0}")]
    InvalidValue(String),

    #[error("store is out of space")]
    OutOfSpace,

    #[error("container is poisoned by a prior fatal error")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
