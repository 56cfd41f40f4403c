//! Layout of ordinary data pages.
//!
//! ```text
//! +----------+------------------------------+-------------+
//! | FSO (2B) | packed records ...           | free space  |
//! +----------+------------------------------+-------------+
//! ```
//!
//! The free-space offset (FSO) is big-endian and marks the first unused
//! byte. Records are appended at the FSO and never move.

use crate::storage::page::Page;
use crate::storage::PAGE_SIZE;
use byteorder::{BigEndian, ByteOrder};

const FSO_OFFSET: usize = 0;
const FSO_SIZE: usize = 2;

/// Offset of the first record on an empty page.
pub const DATA_OFFSET: usize = FSO_OFFSET + FSO_SIZE;

/// Largest record an empty page can hold.
pub const MAX_FREE_SPACE: usize = PAGE_SIZE - DATA_OFFSET;

/// Bytes of a freshly allocated, empty data page.
pub fn init_raw() -> Box<[u8; PAGE_SIZE]> {
    let mut raw = Box::new([0u8; PAGE_SIZE]);
    set_fso(&mut raw, DATA_OFFSET as u16);
    raw
}

pub fn fso(raw: &[u8; PAGE_SIZE]) -> u16 {
    BigEndian::read_u16(&raw[FSO_OFFSET..FSO_OFFSET + FSO_SIZE])
}

fn set_fso(raw: &mut [u8; PAGE_SIZE], fso: u16) {
    BigEndian::write_u16(&mut raw[FSO_OFFSET..FSO_OFFSET + FSO_SIZE], fso);
}

/// Offset the next record will be written at. A zeroed page whose initial
/// write was lost reads as empty rather than as FSO 0.
pub fn next_offset(raw: &[u8; PAGE_SIZE]) -> u16 {
    fso(raw).max(DATA_OFFSET as u16)
}

pub fn free_space(page: &Page) -> usize {
    PAGE_SIZE.saturating_sub(next_offset(&page.read()) as usize)
}

/// Resets the header of a page whose FSO points into the header itself.
/// Returns whether anything changed.
pub fn repair(page: &Page) -> bool {
    if fso(&page.read()) as usize >= DATA_OFFSET {
        return false;
    }
    set_fso(&mut page.write(), DATA_OFFSET as u16);
    true
}

/// Appends `record` at the FSO and returns its offset. The caller has
/// already checked that it fits.
pub fn insert(page: &Page, record: &[u8]) -> u16 {
    let mut raw = page.write();
    let offset = next_offset(&raw);
    let start = offset as usize;
    raw[start..start + record.len()].copy_from_slice(record);
    set_fso(&mut raw, (start + record.len()) as u16);
    offset
}

/// Replays an insert at a known offset, advancing the FSO past it if needed.
pub fn recover_insert(page: &Page, record: &[u8], offset: u16) {
    let mut raw = page.write();
    let start = offset as usize;
    raw[start..start + record.len()].copy_from_slice(record);

    let end = (start + record.len()) as u16;
    if fso(&raw) < end {
        set_fso(&mut raw, end);
    }
}

/// Replays an in-place update at a known offset. The FSO is untouched.
pub fn recover_update(page: &Page, record: &[u8], offset: u16) {
    let mut raw = page.write();
    let start = offset as usize;
    raw[start..start + record.len()].copy_from_slice(record);
}
