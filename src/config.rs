use crate::error::{Result, StoreError};

/// Smallest extent size accepted: 1 MiB.
pub const MIN_EXTENT_SIZE: u64 = 1 << 20;
/// Largest extent size accepted: 16 MiB.
pub const MAX_EXTENT_SIZE: u64 = 1 << 24;

/// Configuration passed to [`crate::open_list`] / [`crate::open_dict`].
///
/// There is no file- or environment-sourced configuration in this crate
/// (no CLI, no env vars, no network ports in the core) — callers pass
/// everything explicitly, and defaults match spec: 4 MiB extents, a
/// 64-extent mmap window, 1024 initial hash slots.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub extent_size: u64,
    pub window_capacity: usize,
    pub initial_dict_slots: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            extent_size: 4 << 20,
            window_capacity: 64,
            initial_dict_slots: 1024,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.extent_size < MIN_EXTENT_SIZE
            || self.extent_size > MAX_EXTENT_SIZE
            || !self.extent_size.is_power_of_two()
        {
            return Err(StoreError::Corruption(format!(
                "extent_size must be a power of two in [{MIN_EXTENT_SIZE}, {MAX_EXTENT_SIZE}], got {}",
                self.extent_size
            )));
        }
        if self.window_capacity == 0 {
            return Err(StoreError::Corruption(
                "window_capacity must be at least 1".to_string(),
            ));
        }
        if !self.initial_dict_slots.is_power_of_two() || self.initial_dict_slots == 0 {
            return Err(StoreError::Corruption(
                "initial_dict_slots must be a nonzero power of two".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn extent_size_log2(&self) -> u8 {
        self.extent_size.trailing_zeros() as u8
    }
}
