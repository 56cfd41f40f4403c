//! Versioned records.
//!
//! An entry is the data region of one DataItem laid out as
//! `[XMIN:8][XMAX:8][Data]`. XMIN is the creating transaction; XMAX is the
//! deleting one, or 0 while the version is current.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::cache::{CacheRef, CacheSource};
use crate::data::{DataItemRef, DataManager, Uid};
use crate::error::{Error, Result};
use crate::transaction::TransactionId;

const OF_XMIN: usize = 0;
const OF_XMAX: usize = OF_XMIN + 8;
const OF_DATA: usize = OF_XMAX + 8;

/// Wraps `data` as a fresh version created by `xid`.
pub fn wrap_entry_raw(xid: TransactionId, data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; OF_DATA + data.len()];
    BigEndian::write_u64(&mut raw[OF_XMIN..OF_XMAX], xid.value());
    raw[OF_DATA..].copy_from_slice(data);
    raw
}

pub struct Entry {
    item: DataItemRef,
}

impl Entry {
    pub fn uid(&self) -> Uid {
        self.item.uid()
    }

    /// Runs `f` over `(xmin, xmax, data)` read under one latch.
    pub fn with_version<R>(&self, f: impl FnOnce(TransactionId, TransactionId, &[u8]) -> R) -> R {
        self.item.with_data(|raw| {
            let xmin = TransactionId::new(BigEndian::read_u64(&raw[OF_XMIN..OF_XMAX]));
            let xmax = TransactionId::new(BigEndian::read_u64(&raw[OF_XMAX..OF_DATA]));
            f(xmin, xmax, &raw[OF_DATA..])
        })
    }

    pub fn xmin(&self) -> TransactionId {
        self.with_version(|xmin, _, _| xmin)
    }

    pub fn xmax(&self) -> TransactionId {
        self.with_version(|_, xmax, _| xmax)
    }

    pub fn data(&self) -> Vec<u8> {
        self.with_version(|_, _, data| data.to_vec())
    }

    /// Stamps this version as deleted by `xid`, through the logged update
    /// protocol.
    pub fn set_xmax(&self, xid: TransactionId) -> Result<()> {
        let mut writer = self.item.before();
        writer.write(OF_XMAX, &xid.value().to_be_bytes())?;
        writer.after(xid)
    }
}

/// Materializes entries from the data manager.
pub struct EntrySource {
    dm: Arc<DataManager>,
}

impl EntrySource {
    pub fn new(dm: Arc<DataManager>) -> Self {
        Self { dm }
    }
}

impl CacheSource for EntrySource {
    type Key = Uid;
    type Value = Entry;

    fn load(&self, uid: Uid) -> Result<Entry> {
        let item = self.dm.read(uid)?.ok_or(Error::NullEntry(uid))?;
        if item.len() < OF_DATA {
            item.release()?;
            return Err(Error::NullEntry(uid));
        }
        Ok(Entry { item })
    }

    fn evict(&self, _uid: Uid, entry: Arc<Entry>) -> Result<()> {
        match Arc::try_unwrap(entry) {
            Ok(entry) => entry.item.release(),
            Err(_) => Ok(()),
        }
    }
}

/// A counted reference to a cached entry.
pub type EntryRef = CacheRef<EntrySource>;
