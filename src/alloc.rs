//! Slab allocator — variable-length record allocation over the logical
//! byte array formed by concatenating all extents (spec §4.3).
//!
//! Free records form a singly linked, in-place list; the allocator holds
//! one unified free-list head (the header layout in spec §6 has exactly
//! one `free_list_head` field, so this resolves the "per size class"
//! wording in §4.3 as referring to the best-fit scan, not a segregated
//! free list — see DESIGN.md).

use crate::error::{Result, StoreError};
use crate::header::Header;
use crate::offset::NULL_OFFSET;
use crate::record::{self, RecordHeader, ALIGNMENT, FLAG_FREE, FLAG_LIVE, HEADER_SIZE, MIN_RECORD, MIN_SPLIT};
use crate::window_cache::WindowCache;

/// Number of free-list candidates scanned before giving up and
/// bump-allocating (spec §4.3).
const SCAN_LIMIT: usize = 8;

fn read_header_at(window: &WindowCache, off: u64) -> Result<RecordHeader> {
    let pinned = window.access(off)?;
    let rec = unsafe { RecordHeader::read(pinned.ptr()) };
    let (_, byte_off) = window.decode_offset(off);
    if byte_off + rec.total_size() > window.extent_size() {
        return Err(StoreError::Corruption(format!(
            "record at offset {off} overruns its extent"
        )));
    }
    if !RecordHeader::is_valid_flag(rec.flags) {
        return Err(StoreError::Corruption(format!(
            "record at offset {off} has invalid flags {}",
            rec.flags
        )));
    }
    Ok(rec)
}

fn write_header_at(window: &WindowCache, off: u64, payload_size: u32, flags: u8) -> Result<()> {
    let pinned = window.access(off)?;
    unsafe { RecordHeader::write(pinned.ptr(), payload_size, flags) };
    window.mark_dirty(off);
    Ok(())
}

fn set_flags_at(window: &WindowCache, off: u64, flags: u8) -> Result<()> {
    let rec = read_header_at(window, off)?;
    write_header_at(window, off, rec.size, flags)
}

fn read_free_next_at(window: &WindowCache, off: u64) -> Result<u64> {
    let pinned = window.access(off)?;
    Ok(unsafe { record::read_free_next(pinned.ptr()) })
}

fn write_free_next_at(window: &WindowCache, off: u64, next: u64) -> Result<()> {
    let pinned = window.access(off)?;
    unsafe { record::write_free_next(pinned.ptr(), next) };
    window.mark_dirty(off);
    Ok(())
}

/// Read the payload bytes of a live record at `off`.
pub fn read_payload(window: &WindowCache, off: u64) -> Result<Vec<u8>> {
    let rec = read_header_at(window, off)?;
    let pinned = window.access(off)?;
    let payload_ptr = RecordHeader::payload_ptr(pinned.ptr());
    let bytes =
        unsafe { std::slice::from_raw_parts(payload_ptr as *const u8, rec.size as usize) }.to_vec();
    Ok(bytes)
}

/// Write `bytes` into the payload of the live record at `off`. Caller
/// must ensure `bytes.len() <= record's declared size.
pub fn write_payload(window: &WindowCache, off: u64, bytes: &[u8]) -> Result<()> {
    let pinned = window.access(off)?;
    let payload_ptr = RecordHeader::payload_ptr(pinned.ptr());
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), payload_ptr, bytes.len()) };
    window.mark_dirty(off);
    Ok(())
}

/// Allocate a record able to hold `payload_len` bytes, returning its
/// offset. The record is flagged live; its payload is uninitialized.
pub fn allocate(window: &WindowCache, header: &mut Header, payload_len: usize) -> Result<u64> {
    let payload_round = record::round_up(payload_len as u64, ALIGNMENT);
    if payload_round > u32::MAX as u64 {
        return Err(StoreError::InvalidValue(format!(
            "payload of {payload_len} bytes exceeds maximum record size"
        )));
    }
    let total = HEADER_SIZE as u64 + payload_round;

    // A record can never straddle an extent boundary (spec §3), and
    // extent 0 permanently reserves its first ALIGNMENT bytes for the
    // null offset (see `ensure_room`), so no extent ever offers more
    // than `extent_size - ALIGNMENT` usable bytes.
    let max_record = window.extent_size() - ALIGNMENT;
    if total > max_record {
        return Err(StoreError::InvalidValue(format!(
            "record of {total} bytes (header + payload) exceeds the extent size of {}",
            window.extent_size()
        )));
    }

    if let Some(off) = try_reuse_free(window, header, total)? {
        tracing::trace!(offset = off, total, "reused free record");
        return Ok(off);
    }

    ensure_room(window, header, total)?;
    let off = header.high_water;
    write_header_at(window, off, payload_round as u32, FLAG_LIVE)?;
    header.high_water += total;
    tracing::trace!(offset = off, total, "bump-allocated record");
    Ok(off)
}

/// Free the live record at `off`, prepending it to the free list.
pub fn free(window: &WindowCache, header: &mut Header, off: u64) -> Result<()> {
    if off == NULL_OFFSET {
        return Ok(());
    }
    let rec = read_header_at(window, off)?;
    write_header_at(window, off, rec.size, FLAG_FREE)?;
    write_free_next_at(window, off, header.free_list_head)?;
    header.free_list_head = off;
    Ok(())
}

fn try_reuse_free(window: &WindowCache, header: &mut Header, total: u64) -> Result<Option<u64>> {
    let mut prev: Option<u64> = None;
    let mut cur = header.free_list_head;

    for _ in 0..SCAN_LIMIT {
        if cur == NULL_OFFSET {
            break;
        }
        let rec = read_header_at(window, cur)?;
        if rec.flags != FLAG_FREE {
            return Err(StoreError::Corruption(format!(
                "free list node at {cur} is not flagged free"
            )));
        }
        let node_total = rec.total_size();

        if node_total >= total {
            let next = read_free_next_at(window, cur)?;
            match prev {
                Some(p) => write_free_next_at(window, p, next)?,
                None => header.free_list_head = next,
            }

            if node_total >= total + MIN_SPLIT {
                let remainder_off = cur + total;
                let remainder_payload = (node_total - total - HEADER_SIZE as u64) as u32;
                write_header_at(window, remainder_off, remainder_payload, FLAG_FREE)?;
                write_free_next_at(window, remainder_off, header.free_list_head)?;
                header.free_list_head = remainder_off;
                write_header_at(window, cur, (total - HEADER_SIZE as u64) as u32, FLAG_LIVE)?;
            } else {
                set_flags_at(window, cur, FLAG_LIVE)?;
            }
            return Ok(Some(cur));
        }

        prev = Some(cur);
        cur = read_free_next_at(window, cur)?;
    }

    Ok(None)
}

/// Ensure the extent backing `header.high_water` has at least `needed`
/// bytes remaining, growing the store by one extent if not. On failure
/// the allocator state (free-list head, high-water) is rolled back to
/// its pre-call value (spec §4.3 "Failure modes").
fn ensure_room(window: &WindowCache, header: &mut Header, needed: u64) -> Result<()> {
    if header.extent_count > 0 {
        let (_, byte_off) = window.decode_offset(header.high_water);
        let remaining = window.extent_size() - byte_off;
        if remaining >= needed {
            return Ok(());
        }
    }

    let snapshot_free = header.free_list_head;
    let snapshot_high = header.high_water;

    if header.extent_count > 0 {
        let (_, byte_off) = window.decode_offset(header.high_water);
        let remaining = window.extent_size() - byte_off;
        if remaining >= MIN_RECORD {
            let remainder_off = header.high_water;
            let remainder_payload = (remaining - HEADER_SIZE as u64) as u32;
            write_header_at(window, remainder_off, remainder_payload, FLAG_FREE)?;
            write_free_next_at(window, remainder_off, header.free_list_head)?;
            header.free_list_head = remainder_off;
        }
    }

    let new_index = header.extent_count as u32;
    if let Err(e) = window.create_extent(new_index) {
        header.free_list_head = snapshot_free;
        header.high_water = snapshot_high;
        tracing::error!(error = %e, "extent creation failed; allocator state rolled back");
        return Err(StoreError::OutOfSpace);
    }

    header.extent_count += 1;
    // Extent 0's first ALIGNMENT bytes are permanently reserved so the
    // encoded offset 0 unambiguously means "null" (spec §3's reserved
    // null offset).
    let start_byte = if new_index == 0 { ALIGNMENT } else { 0 };
    header.high_water = window.encode_offset(new_index, start_byte);
    tracing::debug!(extent_index = new_index, "grew store by one extent");
    Ok(())
}
