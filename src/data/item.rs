use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::storage::page_cache::PageRef;
use crate::storage::PageId;
use crate::transaction::TransactionId;

use super::journal::Journal;

const OF_VALID: usize = 0;
const OF_SIZE: usize = 1;
/// Length of the `[ValidFlag][Size]` header.
pub const OF_DATA: usize = 3;

const VALID: u8 = 0;
const INVALID: u8 = 1;

/// Record address: page number in the high 32 bits, in-page offset in the
/// low bits. Never changes once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(u64);

impl Uid {
    pub fn new(page_id: PageId, offset: u16) -> Self {
        Self(((page_id.0 as u64) << 32) | offset as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn page_id(&self) -> PageId {
        PageId((self.0 >> 32) as u32)
    }

    pub fn offset(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Uid({}:{})", self.page_id().0, self.offset())
    }
}

/// Wraps `data` in a live DataItem header.
pub fn wrap_raw(data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; OF_DATA + data.len()];
    raw[OF_VALID] = VALID;
    BigEndian::write_u16(&mut raw[OF_SIZE..OF_DATA], data.len() as u16);
    raw[OF_DATA..].copy_from_slice(data);
    raw
}

/// Marks a raw DataItem as logically deleted.
pub fn set_raw_invalid(raw: &mut [u8]) {
    raw[OF_VALID] = INVALID;
}

/// Size field of the DataItem header starting at `raw[0]`.
pub fn raw_size(raw: &[u8]) -> usize {
    BigEndian::read_u16(&raw[OF_SIZE..OF_DATA]) as usize
}

/// A view of one DataItem inside a resident page.
///
/// The item keeps its page resident for as long as it lives. Readers share
/// the item latch; [`DataItem::before`] takes it exclusively.
pub struct DataItem {
    uid: Uid,
    page: PageRef,
    /// Start of the raw bytes within the page.
    start: usize,
    /// Raw length, header included.
    len: usize,
    latch: RwLock<()>,
    journal: Arc<Journal>,
}

impl DataItem {
    pub(crate) fn new(uid: Uid, page: PageRef, len: usize, journal: Arc<Journal>) -> Self {
        Self {
            uid,
            page,
            start: uid.offset() as usize,
            len,
            latch: RwLock::new(()),
            journal,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Length of the data region.
    pub fn len(&self) -> usize {
        self.len - OF_DATA
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_valid(&self) -> bool {
        let _guard = self.latch.read();
        self.page.read()[self.start + OF_VALID] == VALID
    }

    /// Runs `f` over the data region under the shared latch.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let _guard = self.latch.read();
        let page = self.page.read();
        f(&page[self.start + OF_DATA..self.start + self.len])
    }

    /// Copies the data region out.
    pub fn data(&self) -> Vec<u8> {
        self.with_data(<[u8]>::to_vec)
    }

    fn raw(&self) -> Vec<u8> {
        self.page.read()[self.start..self.start + self.len].to_vec()
    }

    /// Shared latch, held across several reads that must agree.
    pub fn rlock(&self) -> RwLockReadGuard<'_, ()> {
        self.latch.read()
    }

    /// Exclusive latch, excluding readers and writers alike.
    pub fn lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.latch.write()
    }

    /// Starts an in-place update: takes the latch exclusively and snapshots
    /// the current bytes. Finish with [`DataItemWriter::after`] or abandon
    /// with [`DataItemWriter::un_before`].
    pub fn before(&self) -> DataItemWriter<'_> {
        let guard = self.latch.write();
        let old_raw = self.raw();
        DataItemWriter {
            item: self,
            _guard: guard,
            old_raw,
            finished: false,
        }
    }

    pub(crate) fn release(self) -> Result<()> {
        self.page.release()
    }
}

impl std::fmt::Debug for DataItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataItem")
            .field("uid", &self.uid)
            .field("len", &self.len())
            .finish()
    }
}

/// An update in progress. Dropping it without calling
/// [`after`](DataItemWriter::after) restores the old bytes.
pub struct DataItemWriter<'a> {
    item: &'a DataItem,
    _guard: RwLockWriteGuard<'a, ()>,
    old_raw: Vec<u8>,
    finished: bool,
}

impl DataItemWriter<'_> {
    /// Current data region.
    pub fn data(&self) -> Vec<u8> {
        let item = self.item;
        item.page.read()[item.start + OF_DATA..item.start + item.len].to_vec()
    }

    /// Overwrites data bytes starting at `at` within the data region.
    /// Fails without writing if the bytes would run past the region.
    pub fn write(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
        let item = self.item;
        let end = at + bytes.len();
        if end > item.len() {
            return Err(Error::DataTooLarge {
                size: end,
                max: item.len(),
            });
        }
        let from = item.start + OF_DATA + at;
        item.page.write()[from..from + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn set_invalid(&mut self) {
        let item = self.item;
        item.page.write()[item.start + OF_VALID] = INVALID;
    }

    /// Replaces the whole raw image, header included.
    pub(crate) fn restore_raw(&mut self, raw: &[u8]) {
        let item = self.item;
        item.page.write()[item.start..item.start + item.len].copy_from_slice(raw);
    }

    /// Abandons the update, restoring the snapshot.
    pub fn un_before(mut self) {
        self.rollback();
    }

    /// Logs the old and new images under `xid` and releases the latch.
    pub fn after(mut self, xid: TransactionId) -> Result<()> {
        let new_raw = self.item.raw();
        self.item
            .journal
            .log_update(xid, self.item.uid, &self.old_raw, &new_raw)?;
        self.finished = true;
        Ok(())
    }

    fn rollback(&mut self) {
        if !self.finished {
            let item = self.item;
            item.page.write()[item.start..item.start + item.len].copy_from_slice(&self.old_raw);
            self.finished = true;
        }
    }
}

impl Drop for DataItemWriter<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}
