//! EMList: an ordered, disk-backed sequence of values.
//!
//! The root structure is a flat array of 8-byte cells (the "spine"),
//! each holding either the offset of a value record or `NULL_OFFSET` for
//! an unset slot. The spine itself lives in one allocated record,
//! reallocated (old one freed) whenever it runs out of room — the same
//! allocate-copy-free resize the teacher used to grow `shm::hashtable`'s
//! bucket array, applied here to a sequence instead of a hash table.
//! Because a record can never straddle an extent boundary, a single
//! spine (and therefore the list's cheaply-addressable length) is capped
//! by the configured extent size.

use std::path::Path;

use crate::alloc;
use crate::config::StoreConfig;
use crate::container::Container;
use crate::error::{Result, StoreError};
use crate::header::ContainerKind;
use crate::offset::NULL_OFFSET;
use crate::record::HEADER_SIZE;
use crate::value::{self, Value};

const CELL_SIZE: u64 = 8;
const INITIAL_CAPACITY: u64 = 8;

pub struct EMList {
    container: Container,
}

impl EMList {
    pub fn open(dir: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let (container, _is_fresh) =
            Container::open_or_create(dir.as_ref(), ContainerKind::List, config)?;
        Ok(EMList { container })
    }

    pub fn len(&self) -> Result<u64> {
        self.container.check_poisoned()?;
        Ok(self.container.header().length_or_occupied)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn append(&self, value: &Value) -> Result<()> {
        self.container.guarded(|| self.append_inner(value))
    }

    fn append_inner(&self, value: &Value) -> Result<()> {
        let (length, capacity) = {
            let header = self.container.header();
            (header.length_or_occupied, header.slot_count_or_zero)
        };
        if length >= capacity {
            self.grow_spine()?;
        }

        let bytes = value::encode_value(value);
        let record_off = {
            let mut header = self.container.header_mut();
            alloc::allocate(self.container.window(), &mut header, bytes.len())?
        };
        alloc::write_payload(self.container.window(), record_off, &bytes)?;

        let spine = self.container.header().root;
        let cell_off = self.cell_offset(spine, length);
        self.write_cell(cell_off, record_off)?;

        self.container.header_mut().length_or_occupied += 1;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<Value> {
        self.container.guarded(|| self.get_inner(index))
    }

    fn get_inner(&self, index: u64) -> Result<Value> {
        let (length, spine) = {
            let header = self.container.header();
            (header.length_or_occupied, header.root)
        };
        if index >= length {
            return Err(StoreError::IndexOutOfRange {
                index: index as usize,
                len: length as usize,
            });
        }
        let cell_off = self.cell_offset(spine, index);
        let record_off = self.read_cell(cell_off)?;
        if record_off == NULL_OFFSET {
            return Err(StoreError::Corruption(format!(
                "list cell {index} is unset within bounds"
            )));
        }
        let bytes = alloc::read_payload(self.container.window(), record_off)?;
        let (v, _) = value::decode(&bytes)?;
        Ok(v)
    }

    pub fn set(&self, index: u64, value: &Value) -> Result<()> {
        self.container.guarded(|| self.set_inner(index, value))
    }

    fn set_inner(&self, index: u64, value: &Value) -> Result<()> {
        let (length, spine) = {
            let header = self.container.header();
            (header.length_or_occupied, header.root)
        };
        if index >= length {
            return Err(StoreError::IndexOutOfRange {
                index: index as usize,
                len: length as usize,
            });
        }
        let cell_off = self.cell_offset(spine, index);
        let old_off = self.read_cell(cell_off)?;

        let bytes = value::encode_value(value);
        let new_off = {
            let mut header = self.container.header_mut();
            alloc::allocate(self.container.window(), &mut header, bytes.len())?
        };
        alloc::write_payload(self.container.window(), new_off, &bytes)?;
        self.write_cell(cell_off, new_off)?;

        if old_off != NULL_OFFSET {
            let mut header = self.container.header_mut();
            alloc::free(self.container.window(), &mut header, old_off)?;
        }
        Ok(())
    }

    /// Lazily iterate elements `0..len()` at the time each element is
    /// fetched. Under concurrent mutation this is best-effort: it never
    /// panics, but a shrinking list may end early and a growing one
    /// won't see elements appended after iteration started past the
    /// point already reached.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            index: 0,
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.container.flush()
    }

    pub fn close(self) -> Result<()> {
        self.container.close()
    }

    /// `spine` is the spine *record's* offset, i.e. it points at the
    /// record's own `RecordHeader`, not its payload — cell `index` lives
    /// `HEADER_SIZE` bytes past that (spec §3's cell array starts at the
    /// payload, `alloc::read_payload`/`write_payload` make the same
    /// adjustment via `RecordHeader::payload_ptr`).
    fn cell_offset(&self, spine: u64, index: u64) -> u64 {
        spine + HEADER_SIZE as u64 + index * CELL_SIZE
    }

    fn read_cell(&self, cell_off: u64) -> Result<u64> {
        let pinned = self.container.window().access(cell_off)?;
        let bytes = unsafe { std::slice::from_raw_parts(pinned.ptr(), 8) };
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn write_cell(&self, cell_off: u64, value: u64) -> Result<()> {
        let pinned = self.container.window().access(cell_off)?;
        unsafe { std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), pinned.ptr(), 8) };
        self.container.window().mark_dirty(cell_off);
        Ok(())
    }

    fn grow_spine(&self) -> Result<()> {
        let (old_root, old_capacity) = {
            let header = self.container.header();
            (header.root, header.slot_count_or_zero)
        };
        let new_capacity = if old_capacity == 0 {
            INITIAL_CAPACITY
        } else {
            old_capacity * 2
        };
        let new_bytes = (new_capacity * CELL_SIZE) as usize;

        let new_root = {
            let mut header = self.container.header_mut();
            alloc::allocate(self.container.window(), &mut header, new_bytes)?
        };
        alloc::write_payload(self.container.window(), new_root, &vec![0u8; new_bytes])?;

        if old_root != NULL_OFFSET {
            let old_bytes = alloc::read_payload(self.container.window(), old_root)?;
            alloc::write_payload(self.container.window(), new_root, &old_bytes)?;
            let mut header = self.container.header_mut();
            alloc::free(self.container.window(), &mut header, old_root)?;
        }

        let mut header = self.container.header_mut();
        header.root = new_root;
        header.slot_count_or_zero = new_capacity;
        tracing::debug!(new_capacity, "grew list spine");
        Ok(())
    }
}

pub struct Iter<'a> {
    list: &'a EMList,
    index: u64,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let length = match self.list.len() {
            Ok(l) => l,
            Err(e) => return Some(Err(e)),
        };
        if self.index >= length {
            return None;
        }
        let idx = self.index;
        self.index += 1;
        Some(self.list.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_get_roundtrip() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let list = EMList::open(dir.path(), &config).unwrap();

        for i in 0..1000i64 {
            list.append(&Value::Int(i)).unwrap();
        }
        assert_eq!(list.len().unwrap(), 1000);
        for i in 0..1000i64 {
            assert_eq!(list.get(i as u64).unwrap(), Value::Int(i));
        }
    }

    #[test]
    fn set_replaces_value() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let list = EMList::open(dir.path(), &config).unwrap();
        list.append(&Value::Str("first".into())).unwrap();
        list.set(0, &Value::Str("replaced with a much longer string".into()))
            .unwrap();
        assert_eq!(
            list.get(0).unwrap(),
            Value::Str("replaced with a much longer string".into())
        );
    }

    #[test]
    fn out_of_range_errors() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let list = EMList::open(dir.path(), &config).unwrap();
        assert!(matches!(
            list.get(0).unwrap_err(),
            StoreError::IndexOutOfRange { index: 0, len: 0 }
        ));
    }

    #[test]
    fn iter_yields_everything_appended() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let list = EMList::open(dir.path(), &config).unwrap();
        for i in 0..50i64 {
            list.append(&Value::Int(i)).unwrap();
        }
        let collected: Vec<i64> = list
            .iter()
            .map(|r| match r.unwrap() {
                Value::Int(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(collected, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        {
            let list = EMList::open(dir.path(), &config).unwrap();
            for i in 0..200i64 {
                list.append(&Value::Int(i)).unwrap();
            }
            list.close().unwrap();
        }
        let list = EMList::open(dir.path(), &config).unwrap();
        assert_eq!(list.len().unwrap(), 200);
        assert_eq!(list.get(199).unwrap(), Value::Int(199));
    }

    use proptest::prelude::*;

    proptest! {
        /// spec §8 invariant 1: set(i, v) is always visible through get(i).
        #[test]
        fn set_then_get_observes_latest_value(values in proptest::collection::vec(-1000i64..1000, 1..50)) {
            let dir = tempdir().unwrap();
            let config = StoreConfig::default();
            let list = EMList::open(dir.path(), &config).unwrap();
            for v in &values {
                list.append(&Value::Int(*v)).unwrap();
            }
            for (i, v) in values.iter().enumerate() {
                list.set(i as u64, &Value::Int(v + 1)).unwrap();
                prop_assert_eq!(list.get(i as u64).unwrap(), Value::Int(v + 1));
            }
        }
    }
}
