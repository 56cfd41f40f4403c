//! Write-ahead logging of DataItem changes, plus the per-transaction list of
//! changes needed to roll a live transaction back.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::wal::{LogRecord, Logger};
use crate::storage::PageId;
use crate::transaction::TransactionId;

use super::item::Uid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// Undone by clearing the item's valid flag.
    Insert(Uid),
    /// Undone by writing `old_raw` back.
    Update { uid: Uid, old_raw: Bytes },
}

pub struct Journal {
    logger: Arc<Logger>,
    undo: Mutex<HashMap<TransactionId, Vec<UndoAction>>>,
}

impl Journal {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            logger,
            undo: Mutex::new(HashMap::new()),
        }
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn log_insert(
        &self,
        xid: TransactionId,
        page_id: PageId,
        offset: u16,
        raw: &[u8],
    ) -> Result<()> {
        let record = LogRecord::insert(xid, page_id, offset, raw);
        self.logger.append(&record.encode())?;
        self.remember(xid, UndoAction::Insert(Uid::new(page_id, offset)));
        Ok(())
    }

    pub fn log_update(
        &self,
        xid: TransactionId,
        uid: Uid,
        old_raw: &[u8],
        new_raw: &[u8],
    ) -> Result<()> {
        let record = LogRecord::update(xid, uid, old_raw, new_raw);
        self.logger.append(&record.encode())?;
        self.remember(
            xid,
            UndoAction::Update {
                uid,
                old_raw: Bytes::copy_from_slice(old_raw),
            },
        );
        Ok(())
    }

    fn remember(&self, xid: TransactionId, action: UndoAction) {
        // The super transaction is never rolled back.
        if !xid.is_super() {
            self.undo.lock().entry(xid).or_default().push(action);
        }
    }

    /// Removes and returns `xid`'s changes in the order they were made.
    pub fn take(&self, xid: TransactionId) -> Vec<UndoAction> {
        self.undo.lock().remove(&xid).unwrap_or_default()
    }

    /// Replaces `xid`'s pending changes with `actions`, oldest first. Used
    /// when a rollback stops partway, dropping the compensations it logged.
    pub fn restore(&self, xid: TransactionId, actions: Vec<UndoAction>) {
        let mut undo = self.undo.lock();
        if actions.is_empty() {
            undo.remove(&xid);
        } else {
            undo.insert(xid, actions);
        }
    }

    pub fn forget(&self, xid: TransactionId) {
        self.undo.lock().remove(&xid);
    }

    pub fn pending(&self, xid: TransactionId) -> usize {
        self.undo.lock().get(&xid).map_or(0, Vec::len)
    }
}
