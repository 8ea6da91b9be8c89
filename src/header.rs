//! The container header file: a fixed 4 KiB, little-endian, CRC-checked
//! record (spec §6). Unlike the hash-table buckets or slab records, which
//! live continuously in mmap (see `window_cache`/`record`), the header is
//! read once at open and rewritten wholesale via tempfile-plus-rename on
//! `flush`/`close`, so it is modeled as a plain buffer, not a
//! `#[repr(C)]` pointer into a live mapping.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::offset::NULL_OFFSET;

pub const HEADER_FILE_SIZE: usize = 4096;
pub const MAGIC: [u8; 4] = *b"PRST";
pub const VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    List,
    Dict,
}

impl ContainerKind {
    fn to_u16(self) -> u16 {
        match self {
            ContainerKind::List => 0,
            ContainerKind::Dict => 1,
        }
    }

    fn from_u16(v: u16) -> Result<Self> {
        match v {
            0 => Ok(ContainerKind::List),
            1 => Ok(ContainerKind::Dict),
            other => Err(StoreError::Corruption(format!(
                "unknown container kind {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub kind: ContainerKind,
    pub extent_size_log2: u8,
    pub extent_count: u64,
    pub free_list_head: u64,
    pub high_water: u64,
    pub hash_seed: u64,
    pub root: u64,
    /// EMList: length. EMDict: occupied count.
    pub length_or_occupied: u64,
    /// EMDict: slot count (power of two). EMList: 0.
    pub slot_count_or_zero: u64,
    /// EMDict: tombstone count. EMList: 0.
    pub tombstones_or_zero: u64,
}

impl Header {
    pub fn new_list(extent_size_log2: u8) -> Self {
        Header {
            kind: ContainerKind::List,
            extent_size_log2,
            extent_count: 0,
            free_list_head: NULL_OFFSET,
            high_water: NULL_OFFSET,
            hash_seed: 0,
            root: NULL_OFFSET,
            length_or_occupied: 0,
            slot_count_or_zero: 0,
            tombstones_or_zero: 0,
        }
    }

    pub fn new_dict(extent_size_log2: u8, hash_seed: u64, slot_count: u32) -> Self {
        Header {
            kind: ContainerKind::Dict,
            extent_size_log2,
            extent_count: 0,
            free_list_head: NULL_OFFSET,
            high_water: NULL_OFFSET,
            hash_seed,
            root: NULL_OFFSET,
            length_or_occupied: 0,
            slot_count_or_zero: slot_count as u64,
            tombstones_or_zero: 0,
        }
    }

    fn serialize(&self) -> [u8; HEADER_FILE_SIZE] {
        let mut buf = [0u8; HEADER_FILE_SIZE];
        let mut w = 0usize;

        buf[w..w + 4].copy_from_slice(&MAGIC);
        w += 4;
        buf[w..w + 2].copy_from_slice(&VERSION.to_le_bytes());
        w += 2;
        buf[w..w + 2].copy_from_slice(&self.kind.to_u16().to_le_bytes());
        w += 2;
        buf[w] = self.extent_size_log2;
        w += 1;
        w += 7; // reserved

        macro_rules! put_u64 {
            ($v:expr) => {{
                buf[w..w + 8].copy_from_slice(&($v as u64).to_le_bytes());
                w += 8;
            }};
        }
        put_u64!(self.extent_count);
        put_u64!(self.free_list_head);
        put_u64!(self.high_water);
        put_u64!(self.hash_seed);
        put_u64!(self.root);
        put_u64!(self.length_or_occupied);
        put_u64!(self.slot_count_or_zero);
        put_u64!(self.tombstones_or_zero);

        let crc = crc32fast::hash(&buf[..w]);
        buf[w..w + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn deserialize(buf: &[u8; HEADER_FILE_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(StoreError::Corruption("bad header magic".to_string()));
        }
        let mut r = 4usize;
        let version = u16::from_le_bytes(buf[r..r + 2].try_into().unwrap());
        r += 2;
        if version != VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported header version {version}"
            )));
        }
        let kind = ContainerKind::from_u16(u16::from_le_bytes(buf[r..r + 2].try_into().unwrap()))?;
        r += 2;
        let extent_size_log2 = buf[r];
        r += 1;
        r += 7; // reserved

        macro_rules! get_u64 {
            () => {{
                let v = u64::from_le_bytes(buf[r..r + 8].try_into().unwrap());
                r += 8;
                v
            }};
        }
        let extent_count = get_u64!();
        let free_list_head = get_u64!();
        let high_water = get_u64!();
        let hash_seed = get_u64!();
        let root = get_u64!();
        let length_or_occupied = get_u64!();
        let slot_count_or_zero = get_u64!();
        let tombstones_or_zero = get_u64!();

        let stored_crc = u32::from_le_bytes(buf[r..r + 4].try_into().unwrap());
        let computed_crc = crc32fast::hash(&buf[..r]);
        if stored_crc != computed_crc {
            return Err(StoreError::Corruption(
                "header CRC mismatch".to_string(),
            ));
        }

        if !(20..=24).contains(&extent_size_log2) {
            return Err(StoreError::Corruption(format!(
                "implausible extent_size_log2 {extent_size_log2}"
            )));
        }

        Ok(Header {
            kind,
            extent_size_log2,
            extent_count,
            free_list_head,
            high_water,
            hash_seed,
            root,
            length_or_occupied,
            slot_count_or_zero,
            tombstones_or_zero,
        })
    }

    pub fn extent_size(&self) -> u64 {
        1u64 << self.extent_size_log2
    }
}

pub fn header_path(dir: &Path) -> PathBuf {
    dir.join("header")
}

pub fn read(dir: &Path) -> Result<Header> {
    let path = header_path(dir);
    let mut file = File::open(&path).map_err(|e| StoreError::io(&path, e))?;
    let mut buf = [0u8; HEADER_FILE_SIZE];
    file.read_exact(&mut buf).map_err(|e| StoreError::io(&path, e))?;
    Header::deserialize(&buf)
}

/// Rewrite the header atomically: write to a tempfile in the same
/// directory, then rename over the existing header so readers never see
/// a torn file (spec §3 invariants, §6).
pub fn write_atomic(dir: &Path, header: &Header) -> Result<()> {
    let path = header_path(dir);
    let buf = header.serialize();

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(&buf).map_err(|e| StoreError::io(dir, e))?;
    tmp.flush().map_err(|e| StoreError::io(dir, e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(dir, e))?;
    tmp.persist(&path)
        .map_err(|e| StoreError::io(&path, e.error))?;
    Ok(())
}

pub fn exists(dir: &Path) -> bool {
    header_path(dir).is_file()
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrips_through_atomic_write() {
        let dir = tempdir().unwrap();
        let mut h = Header::new_dict(22, 0xdead_beef, 256);
        h.extent_count = 3;
        h.root = 128;
        h.length_or_occupied = 42;
        write_atomic(dir.path(), &h).unwrap();

        let reread = read(dir.path()).unwrap();
        assert_eq!(reread.kind, ContainerKind::Dict);
        assert_eq!(reread.extent_count, 3);
        assert_eq!(reread.root, 128);
        assert_eq!(reread.length_or_occupied, 42);
        assert_eq!(reread.hash_seed, 0xdead_beef);
    }

    #[test]
    fn repeated_flush_is_byte_identical() {
        let dir = tempdir().unwrap();
        let h = Header::new_list(22);
        write_atomic(dir.path(), &h).unwrap();
        let first = fs::read(header_path(dir.path())).unwrap();
        write_atomic(dir.path(), &h).unwrap();
        let second = fs::read(header_path(dir.path())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let h = Header::new_list(22);
        write_atomic(dir.path(), &h).unwrap();
        let path = header_path(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read(dir.path()).unwrap_err(),
            StoreError::Corruption(_)
        ));
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let h = Header::new_list(22);
        write_atomic(dir.path(), &h).unwrap();
        let path = header_path(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        // Flip a byte inside the payload region, leaving magic/version intact.
        bytes[20] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read(dir.path()).unwrap_err(),
            StoreError::Corruption(_)
        ));
    }
}
