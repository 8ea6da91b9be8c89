//! EMDict: an associative map backed by an open-addressed hash table
//! living in a single allocated slab record.
//!
//! Grounded on the teacher's `shm::hashtable` (bucket array resident in
//! shared memory, linear probing, capacity-driven resize), adapted here
//! to tombstone-based deletion (no backward-shift) and a persisted
//! 64-bit XXH64 hash seeded per-container so lookups are stable across a
//! reopen even though `std`'s hasher seeds are randomized per-process.
//!
//! Table layout: a flat array of 8-byte slots. `0` means empty, `u64::MAX`
//! means tombstone (no valid offset is ever that large), anything else is
//! the offset of an entry record laid out as
//! `[u32 key_len | u32 value_len | key bytes | value bytes]`.

use std::hash::Hasher;
use std::path::Path;

use twox_hash::XxHash64;

use crate::alloc;
use crate::config::StoreConfig;
use crate::container::Container;
use crate::error::{Result, StoreError};
use crate::header::ContainerKind;
use crate::offset::NULL_OFFSET;
use crate::record::HEADER_SIZE;
use crate::value::{self, Value};

const EMPTY: u64 = NULL_OFFSET;
const TOMBSTONE: u64 = u64::MAX;
const SLOT_SIZE: u64 = 8;

fn hash_bytes(seed: u64, data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write(data);
    hasher.finish()
}

enum Probe {
    Found { slot_index: u64, entry_off: u64 },
    Insertable { slot_index: u64 },
}

pub struct EMDict {
    container: Container,
    min_slots: u64,
}

impl EMDict {
    pub fn open(dir: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let (container, is_fresh) =
            Container::open_or_create(dir.as_ref(), ContainerKind::Dict, config)?;
        let dict = EMDict {
            container,
            min_slots: config.initial_dict_slots as u64,
        };
        if is_fresh {
            dict.init_table(config.initial_dict_slots as u64)?;
        }
        Ok(dict)
    }

    fn init_table(&self, slot_count: u64) -> Result<()> {
        let bytes = (slot_count * SLOT_SIZE) as usize;
        let root = {
            let mut header = self.container.header_mut();
            alloc::allocate(self.container.window(), &mut header, bytes)?
        };
        alloc::write_payload(self.container.window(), root, &vec![0u8; bytes])?;
        let mut header = self.container.header_mut();
        header.root = root;
        header.slot_count_or_zero = slot_count;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        self.container.check_poisoned()?;
        Ok(self.container.header().length_or_occupied)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn put(&self, key: &Value, value: &Value) -> Result<()> {
        self.container.guarded(|| self.put_inner(key, value))
    }

    fn put_inner(&self, key: &Value, value: &Value) -> Result<()> {
        let key_bytes = value::encode_value(key);
        let value_bytes = value::encode_value(value);

        self.maybe_grow()?;

        let seed = self.container.header().hash_seed;
        let hash = hash_bytes(seed, &key_bytes);

        match self.probe(&key_bytes, hash)? {
            Probe::Found {
                slot_index,
                entry_off,
            } => {
                let entry_bytes = encode_entry(&key_bytes, &value_bytes);
                let new_off = {
                    let mut header = self.container.header_mut();
                    alloc::allocate(self.container.window(), &mut header, entry_bytes.len())?
                };
                alloc::write_payload(self.container.window(), new_off, &entry_bytes)?;
                let table_root = self.container.header().root;
                self.write_slot(table_root, slot_index, new_off)?;
                let mut header = self.container.header_mut();
                alloc::free(self.container.window(), &mut header, entry_off)?;
            }
            Probe::Insertable { slot_index } => {
                let table_root = self.container.header().root;
                let was_tombstone = self.read_slot(table_root, slot_index)? == TOMBSTONE;

                let entry_bytes = encode_entry(&key_bytes, &value_bytes);
                let new_off = {
                    let mut header = self.container.header_mut();
                    alloc::allocate(self.container.window(), &mut header, entry_bytes.len())?
                };
                alloc::write_payload(self.container.window(), new_off, &entry_bytes)?;
                self.write_slot(table_root, slot_index, new_off)?;

                let mut header = self.container.header_mut();
                header.length_or_occupied += 1;
                if was_tombstone {
                    header.tombstones_or_zero -= 1;
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &Value) -> Result<Value> {
        self.container.guarded(|| {
            let key_bytes = value::encode_value(key);
            let seed = self.container.header().hash_seed;
            let hash = hash_bytes(seed, &key_bytes);
            match self.probe(&key_bytes, hash)? {
                Probe::Found { entry_off, .. } => {
                    let (_, value_bytes) = self.read_entry(entry_off)?;
                    let (v, _) = value::decode(&value_bytes)?;
                    Ok(v)
                }
                Probe::Insertable { .. } => Err(StoreError::KeyMissing),
            }
        })
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        self.container.guarded(|| {
            let key_bytes = value::encode_value(key);
            let seed = self.container.header().hash_seed;
            let hash = hash_bytes(seed, &key_bytes);
            Ok(matches!(self.probe(&key_bytes, hash)?, Probe::Found { .. }))
        })
    }

    pub fn delete(&self, key: &Value) -> Result<()> {
        self.container.guarded(|| {
            self.delete_inner(key)?;
            self.maybe_shrink()
        })
    }

    fn delete_inner(&self, key: &Value) -> Result<()> {
        let key_bytes = value::encode_value(key);
        let seed = self.container.header().hash_seed;
        let hash = hash_bytes(seed, &key_bytes);
        match self.probe(&key_bytes, hash)? {
            Probe::Found {
                slot_index,
                entry_off,
            } => {
                let table_root = self.container.header().root;
                self.write_slot(table_root, slot_index, TOMBSTONE)?;
                let mut header = self.container.header_mut();
                alloc::free(self.container.window(), &mut header, entry_off)?;
                header.length_or_occupied -= 1;
                header.tombstones_or_zero += 1;
                Ok(())
            }
            Probe::Insertable { .. } => Err(StoreError::KeyMissing),
        }
    }

    pub fn iter_items(&self) -> Result<ItemsIter<'_>> {
        self.container.check_poisoned()?;
        let header = self.container.header();
        Ok(ItemsIter {
            dict: self,
            table_root: header.root,
            slot_count: header.slot_count_or_zero,
            index: 0,
        })
    }

    pub fn iter_keys(&self) -> Result<impl Iterator<Item = Result<Value>> + '_> {
        Ok(self.iter_items()?.map(|r| r.map(|(k, _)| k)))
    }

    pub fn iter_values(&self) -> Result<impl Iterator<Item = Result<Value>> + '_> {
        Ok(self.iter_items()?.map(|r| r.map(|(_, v)| v)))
    }

    pub fn flush(&self) -> Result<()> {
        self.container.flush()
    }

    pub fn close(self) -> Result<()> {
        self.container.close()
    }

    fn probe(&self, key_bytes: &[u8], hash: u64) -> Result<Probe> {
        let (table_root, slot_count) = {
            let header = self.container.header();
            (header.root, header.slot_count_or_zero)
        };
        if slot_count == 0 {
            return Err(StoreError::Corruption(
                "dict table has zero slots".to_string(),
            ));
        }

        let start = hash % slot_count;
        let mut first_reusable: Option<u64> = None;

        for i in 0..slot_count {
            let idx = (start + i) % slot_count;
            let slot_val = self.read_slot(table_root, idx)?;

            if slot_val == EMPTY {
                return Ok(Probe::Insertable {
                    slot_index: first_reusable.unwrap_or(idx),
                });
            }
            if slot_val == TOMBSTONE {
                if first_reusable.is_none() {
                    first_reusable = Some(idx);
                }
                continue;
            }

            let (entry_key, _) = self.read_entry(slot_val)?;
            if entry_key == key_bytes {
                return Ok(Probe::Found {
                    slot_index: idx,
                    entry_off: slot_val,
                });
            }
        }

        match first_reusable {
            Some(slot_index) => Ok(Probe::Insertable { slot_index }),
            None => Err(StoreError::Corruption(
                "hash table probe exhausted without finding an empty or tombstone slot".to_string(),
            )),
        }
    }

    /// `table_root` is the table *record's* offset, i.e. it points at the
    /// record's own `RecordHeader`, not its payload — slot `index` lives
    /// `HEADER_SIZE` bytes past that (same adjustment `alloc::read_payload`
    /// / `write_payload` make via `RecordHeader::payload_ptr`).
    fn slot_offset(&self, table_root: u64, index: u64) -> u64 {
        table_root + HEADER_SIZE as u64 + index * SLOT_SIZE
    }

    fn read_slot(&self, table_root: u64, index: u64) -> Result<u64> {
        let pinned = self.container.window().access(self.slot_offset(table_root, index))?;
        let bytes = unsafe { std::slice::from_raw_parts(pinned.ptr(), 8) };
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn write_slot(&self, table_root: u64, index: u64, value: u64) -> Result<()> {
        let off = self.slot_offset(table_root, index);
        let pinned = self.container.window().access(off)?;
        unsafe { std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), pinned.ptr(), 8) };
        self.container.window().mark_dirty(off);
        Ok(())
    }

    fn read_entry(&self, entry_off: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let payload = alloc::read_payload(self.container.window(), entry_off)?;
        if payload.len() < 8 {
            return Err(StoreError::Corruption(format!(
                "entry at {entry_off} is too short to hold its length prefix"
            )));
        }
        let key_len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
        let value_len = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
        let key_start = 8;
        let value_start = key_start + key_len;
        let value_end = value_start + value_len;
        if payload.len() < value_end {
            return Err(StoreError::Corruption(format!(
                "entry at {entry_off} is truncated"
            )));
        }
        Ok((
            payload[key_start..value_start].to_vec(),
            payload[value_start..value_end].to_vec(),
        ))
    }

    /// Grow the table when the load factor (occupied + tombstones) would
    /// cross 3/4 after one more insert (spec §4.2 resize trigger).
    fn maybe_grow(&self) -> Result<()> {
        let (occupied, tombstones, slot_count) = {
            let header = self.container.header();
            (
                header.length_or_occupied,
                header.tombstones_or_zero,
                header.slot_count_or_zero,
            )
        };
        if (occupied + tombstones + 1) * 4 >= slot_count * 3 {
            self.rehash_to(slot_count * 2)
        } else {
            Ok(())
        }
    }

    /// Shrink the table back toward its configured floor once deletions
    /// have left it sparse and tombstone-laden (spec §4.2 resize trigger).
    fn maybe_shrink(&self) -> Result<()> {
        let (occupied, tombstones, slot_count) = {
            let header = self.container.header();
            (
                header.length_or_occupied,
                header.tombstones_or_zero,
                header.slot_count_or_zero,
            )
        };
        if tombstones > 0 && slot_count > self.min_slots && occupied <= slot_count / 4 {
            let target = (slot_count / 2).max(self.min_slots);
            self.rehash_to(target)?;
        }
        Ok(())
    }

    fn rehash_to(&self, new_slot_count: u64) -> Result<()> {
        let (old_root, old_slot_count, seed) = {
            let header = self.container.header();
            (header.root, header.slot_count_or_zero, header.hash_seed)
        };

        let new_bytes = (new_slot_count * SLOT_SIZE) as usize;
        let new_root = {
            let mut header = self.container.header_mut();
            alloc::allocate(self.container.window(), &mut header, new_bytes)?
        };
        alloc::write_payload(self.container.window(), new_root, &vec![0u8; new_bytes])?;

        let mut occupied = 0u64;
        if old_root != NULL_OFFSET {
            for i in 0..old_slot_count {
                let slot_val = self.read_slot(old_root, i)?;
                if slot_val == EMPTY || slot_val == TOMBSTONE {
                    continue;
                }
                let (key_bytes, _) = self.read_entry(slot_val)?;
                let hash = hash_bytes(seed, &key_bytes);
                let mut idx = hash % new_slot_count;
                loop {
                    if self.read_slot(new_root, idx)? == EMPTY {
                        self.write_slot(new_root, idx, slot_val)?;
                        break;
                    }
                    idx = (idx + 1) % new_slot_count;
                }
                occupied += 1;
            }
            let mut header = self.container.header_mut();
            alloc::free(self.container.window(), &mut header, old_root)?;
        }

        let mut header = self.container.header_mut();
        header.root = new_root;
        header.slot_count_or_zero = new_slot_count;
        header.length_or_occupied = occupied;
        header.tombstones_or_zero = 0;
        tracing::debug!(new_slot_count, occupied, "rehashed dict table");
        Ok(())
    }
}

fn encode_entry(key_bytes: &[u8], value_bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key_bytes.len() + value_bytes.len());
    buf.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(key_bytes);
    buf.extend_from_slice(value_bytes);
    buf
}

pub struct ItemsIter<'a> {
    dict: &'a EMDict,
    table_root: u64,
    slot_count: u64,
    index: u64,
}

impl<'a> Iterator for ItemsIter<'a> {
    type Item = Result<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.slot_count {
            let idx = self.index;
            self.index += 1;
            let slot_val = match self.dict.read_slot(self.table_root, idx) {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };
            if slot_val == EMPTY || slot_val == TOMBSTONE {
                continue;
            }
            let (key_bytes, value_bytes) = match self.dict.read_entry(slot_val) {
                Ok(kv) => kv,
                Err(e) => return Some(Err(e)),
            };
            let key = match value::decode(&key_bytes) {
                Ok((v, _)) => v,
                Err(e) => return Some(Err(e)),
            };
            let val = match value::decode(&value_bytes) {
                Ok((v, _)) => v,
                Err(e) => return Some(Err(e)),
            };
            return Some(Ok((key, val)));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let dict = EMDict::open(dir.path(), &config).unwrap();

        dict.put(&Value::Str("a".into()), &Value::Int(1)).unwrap();
        dict.put(&Value::Str("b".into()), &Value::Int(2)).unwrap();
        assert_eq!(dict.get(&Value::Str("a".into())).unwrap(), Value::Int(1));
        assert_eq!(dict.len().unwrap(), 2);
    }

    #[test]
    fn update_replaces_value_without_growing_occupancy() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let dict = EMDict::open(dir.path(), &config).unwrap();
        dict.put(&Value::Str("k".into()), &Value::Int(1)).unwrap();
        dict.put(&Value::Str("k".into()), &Value::Int(2)).unwrap();
        assert_eq!(dict.len().unwrap(), 1);
        assert_eq!(dict.get(&Value::Str("k".into())).unwrap(), Value::Int(2));
    }

    #[test]
    fn delete_then_missing() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let dict = EMDict::open(dir.path(), &config).unwrap();
        dict.put(&Value::Str("k".into()), &Value::Int(1)).unwrap();
        dict.delete(&Value::Str("k".into())).unwrap();
        assert!(matches!(
            dict.get(&Value::Str("k".into())).unwrap_err(),
            StoreError::KeyMissing
        ));
        assert!(!dict.contains(&Value::Str("k".into())).unwrap());
        assert_eq!(dict.len().unwrap(), 0);
    }

    #[test]
    fn delete_missing_key_errors() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let dict = EMDict::open(dir.path(), &config).unwrap();
        assert!(matches!(
            dict.delete(&Value::Str("nope".into())).unwrap_err(),
            StoreError::KeyMissing
        ));
    }

    #[test]
    fn grows_past_initial_slot_count() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            initial_dict_slots: 8,
            ..Default::default()
        };
        let dict = EMDict::open(dir.path(), &config).unwrap();
        for i in 0..100i64 {
            dict.put(&Value::Int(i), &Value::Int(i * 2)).unwrap();
        }
        assert_eq!(dict.len().unwrap(), 100);
        for i in 0..100i64 {
            assert_eq!(dict.get(&Value::Int(i)).unwrap(), Value::Int(i * 2));
        }
    }

    #[test]
    fn seven_of_eight_slots_triggers_rehash_to_sixteen() {
        crate::init_test_tracing();
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            initial_dict_slots: 8,
            ..Default::default()
        };
        let dict = EMDict::open(dir.path(), &config).unwrap();
        for i in 0..7i64 {
            dict.put(&Value::Int(i), &Value::Int(i)).unwrap();
        }
        assert_eq!(dict.container.header().slot_count_or_zero, 16);
        for i in 0..7i64 {
            assert_eq!(dict.get(&Value::Int(i)).unwrap(), Value::Int(i));
        }
    }

    #[test]
    fn iter_items_visits_every_live_entry() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        let dict = EMDict::open(dir.path(), &config).unwrap();
        for i in 0..20i64 {
            dict.put(&Value::Int(i), &Value::Int(i)).unwrap();
        }
        let mut seen: Vec<i64> = dict
            .iter_items()
            .unwrap()
            .map(|r| match r.unwrap().0 {
                Value::Int(v) => v,
                _ => unreachable!(),
            })
            .collect();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::default();
        {
            let dict = EMDict::open(dir.path(), &config).unwrap();
            for i in 0..50i64 {
                dict.put(&Value::Int(i), &Value::Str(format!("v{i}")))
                    .unwrap();
            }
            dict.close().unwrap();
        }
        let dict = EMDict::open(dir.path(), &config).unwrap();
        assert_eq!(dict.len().unwrap(), 50);
        assert_eq!(dict.get(&Value::Int(7)).unwrap(), Value::Str("v7".into()));
    }

    use proptest::prelude::*;

    proptest! {
        /// spec §8 invariant 2: a put always wins the next get, and a
        /// delete always clears contains().
        #[test]
        fn put_get_delete_observe_latest_write(keys in proptest::collection::vec(0i64..64, 1..80)) {
            let dir = tempdir().unwrap();
            let config = StoreConfig { initial_dict_slots: 8, ..Default::default() };
            let dict = EMDict::open(dir.path(), &config).unwrap();
            let mut model: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();

            for (i, k) in keys.iter().enumerate() {
                if i % 5 == 4 {
                    if model.remove(k).is_some() {
                        dict.delete(&Value::Int(*k)).unwrap();
                        prop_assert!(!dict.contains(&Value::Int(*k)).unwrap());
                    }
                } else {
                    model.insert(*k, i as i64);
                    dict.put(&Value::Int(*k), &Value::Int(i as i64)).unwrap();
                    prop_assert_eq!(dict.get(&Value::Int(*k)).unwrap(), Value::Int(i as i64));
                }
            }

            prop_assert_eq!(dict.len().unwrap() as usize, model.len());
            for (k, v) in &model {
                prop_assert_eq!(dict.get(&Value::Int(*k)).unwrap(), Value::Int(*v));
            }
        }

        /// spec §8 invariant 8: rehashing (triggered by growth past the
        /// 3/4 load factor) never loses or duplicates a live entry.
        #[test]
        fn rehash_preserves_the_key_set(n in 20u32..200) {
            let dir = tempdir().unwrap();
            let config = StoreConfig { initial_dict_slots: 8, ..Default::default() };
            let dict = EMDict::open(dir.path(), &config).unwrap();
            for i in 0..n as i64 {
                dict.put(&Value::Int(i), &Value::Int(i)).unwrap();
            }
            let mut seen: Vec<i64> = dict
                .iter_items()
                .unwrap()
                .map(|r| match r.unwrap().0 {
                    Value::Int(v) => v,
                    _ => unreachable!(),
                })
                .collect();
            seen.sort();
            prop_assert_eq!(seen, (0..n as i64).collect::<Vec<_>>());
        }
    }
}
