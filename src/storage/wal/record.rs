//! WAL record types and their binary layout.
//!
//! ```text
//! Insert: [Type=0:1][XID:8][Pgno:4][Offset:2][Raw]
//! Update: [Type=1:1][XID:8][UID:8][OldRaw][NewRaw]
//! ```
//!
//! `OldRaw` and `NewRaw` always have the same length, so an update payload
//! is split at the midpoint of the bytes following the UID.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::data::Uid;
use crate::error::{Error, Result};
use crate::storage::PageId;
use crate::transaction::TransactionId;

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

const INSERT_HEADER_LEN: usize = 1 + 8 + 4 + 2;
const UPDATE_HEADER_LEN: usize = 1 + 8 + 8;

/// A new DataItem written at the page's free-space offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRecord {
    pub xid: TransactionId,
    pub page_id: PageId,
    pub offset: u16,
    /// The full DataItem bytes, header included.
    pub raw: Bytes,
}

/// An in-place rewrite of an existing DataItem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub xid: TransactionId,
    pub uid: Uid,
    pub old_raw: Bytes,
    pub new_raw: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Insert(InsertRecord),
    Update(UpdateRecord),
}

impl LogRecord {
    pub fn insert(xid: TransactionId, page_id: PageId, offset: u16, raw: &[u8]) -> Self {
        LogRecord::Insert(InsertRecord {
            xid,
            page_id,
            offset,
            raw: Bytes::copy_from_slice(raw),
        })
    }

    pub fn update(xid: TransactionId, uid: Uid, old_raw: &[u8], new_raw: &[u8]) -> Self {
        LogRecord::Update(UpdateRecord {
            xid,
            uid,
            old_raw: Bytes::copy_from_slice(old_raw),
            new_raw: Bytes::copy_from_slice(new_raw),
        })
    }

    pub fn xid(&self) -> TransactionId {
        match self {
            LogRecord::Insert(r) => r.xid,
            LogRecord::Update(r) => r.xid,
        }
    }

    pub fn page_id(&self) -> PageId {
        match self {
            LogRecord::Insert(r) => r.page_id,
            LogRecord::Update(r) => r.uid.page_id(),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            LogRecord::Insert(r) => {
                let mut buf = BytesMut::with_capacity(INSERT_HEADER_LEN + r.raw.len());
                buf.put_u8(TYPE_INSERT);
                buf.put_u64(r.xid.value());
                buf.put_u32(r.page_id.0);
                buf.put_u16(r.offset);
                buf.put_slice(&r.raw);
                buf.freeze()
            }
            LogRecord::Update(r) => {
                let mut buf = BytesMut::with_capacity(
                    UPDATE_HEADER_LEN + r.old_raw.len() + r.new_raw.len(),
                );
                buf.put_u8(TYPE_UPDATE);
                buf.put_u64(r.xid.value());
                buf.put_u64(r.uid.as_raw());
                buf.put_slice(&r.old_raw);
                buf.put_slice(&r.new_raw);
                buf.freeze()
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<LogRecord> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(Error::BadLogFile("empty log record".into()));
        }

        match buf.get_u8() {
            TYPE_INSERT => {
                if data.len() < INSERT_HEADER_LEN {
                    return Err(Error::BadLogFile(format!(
                        "insert record of {} bytes is shorter than its header",
                        data.len()
                    )));
                }
                let xid = TransactionId::new(buf.get_u64());
                let page_id = PageId(buf.get_u32());
                let offset = buf.get_u16();
                Ok(LogRecord::Insert(InsertRecord {
                    xid,
                    page_id,
                    offset,
                    raw: Bytes::copy_from_slice(buf),
                }))
            }
            TYPE_UPDATE => {
                if data.len() < UPDATE_HEADER_LEN {
                    return Err(Error::BadLogFile(format!(
                        "update record of {} bytes is shorter than its header",
                        data.len()
                    )));
                }
                let xid = TransactionId::new(buf.get_u64());
                let uid = Uid::from_raw(buf.get_u64());
                if buf.len() % 2 != 0 {
                    return Err(Error::BadLogFile(format!(
                        "update record for {} has unequal old/new images",
                        uid
                    )));
                }
                let (old_raw, new_raw) = buf.split_at(buf.len() / 2);
                Ok(LogRecord::Update(UpdateRecord {
                    xid,
                    uid,
                    old_raw: Bytes::copy_from_slice(old_raw),
                    new_raw: Bytes::copy_from_slice(new_raw),
                }))
            }
            other => Err(Error::BadLogFile(format!(
                "unknown log record type {}",
                other
            ))),
        }
    }
}
