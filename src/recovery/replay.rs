//! Log replay against the page cache.
//!
//! Runs once at startup, before any transaction begins:
//! 1. Scan: find the highest page any record touches and truncate the data
//!    file to it.
//! 2. Redo: reapply every record of a transaction that is not active.
//! 3. Undo: reverse the records of each still-active transaction newest
//!    first, logging a compensation record for each, then mark it aborted.
//!
//! Compensations make a second run converge: redo replays the original
//! change and then its compensation.

use std::collections::BTreeMap;
use std::fmt;

use crate::data::item;
use crate::error::Result;
use crate::storage::page::data_page;
use crate::storage::page_cache::PageCache;
use crate::storage::wal::{InsertRecord, LogRecord, Logger, UpdateRecord};
use crate::transaction::{TransactionId, TransactionManager};

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Number of records scanned.
    pub records_analyzed: usize,
    /// Number of records reapplied.
    pub records_redone: usize,
    /// Number of records reversed.
    pub records_undone: usize,
    /// Number of compensation records written while undoing.
    pub clrs_written: usize,
    /// Active transactions marked aborted.
    pub transactions_aborted: usize,
    /// Page count of the data file after truncation.
    pub truncated_to: u32,
}

impl fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records analyzed, {} redone, {} undone, {} transactions aborted, {} pages",
            self.records_analyzed,
            self.records_redone,
            self.records_undone,
            self.transactions_aborted,
            self.truncated_to
        )
    }
}

pub struct Recovery<'a> {
    tm: &'a TransactionManager,
    logger: &'a Logger,
    pages: &'a PageCache,
}

impl<'a> Recovery<'a> {
    pub fn new(tm: &'a TransactionManager, logger: &'a Logger, pages: &'a PageCache) -> Self {
        Self { tm, logger, pages }
    }

    /// Perform full recovery.
    pub fn run(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        self.scan_phase(&mut stats)?;
        log::debug!(
            "recovery scan: {} records, truncated to {} pages",
            stats.records_analyzed,
            stats.truncated_to
        );

        self.redo_phase(&mut stats)?;
        log::debug!("recovery redo: {} records", stats.records_redone);

        self.undo_phase(&mut stats)?;
        log::debug!(
            "recovery undo: {} records, {} transactions aborted",
            stats.records_undone,
            stats.transactions_aborted
        );

        Ok(stats)
    }

    fn for_each_record(&self, mut f: impl FnMut(LogRecord) -> Result<()>) -> Result<()> {
        self.logger.rewind();
        while let Some(payload) = self.logger.next()? {
            f(LogRecord::decode(&payload)?)?;
        }
        Ok(())
    }

    /// Phase 1: find the highest referenced page and drop everything past it.
    fn scan_phase(&self, stats: &mut RecoveryStats) -> Result<()> {
        let mut max_page = 1;
        self.for_each_record(|record| {
            stats.records_analyzed += 1;
            max_page = max_page.max(record.page_id().0);
            Ok(())
        })?;

        self.pages.truncate_to(max_page)?;
        stats.truncated_to = max_page;
        Ok(())
    }

    /// Phase 2: reapply the changes of every transaction that finished.
    fn redo_phase(&self, stats: &mut RecoveryStats) -> Result<()> {
        self.for_each_record(|record| {
            if self.tm.is_active(record.xid()) {
                return Ok(());
            }
            match &record {
                LogRecord::Insert(insert) => self.apply_insert(insert, &insert.raw)?,
                LogRecord::Update(update) => self.apply_update(update, &update.new_raw)?,
            }
            stats.records_redone += 1;
            Ok(())
        })
    }

    /// Phase 3: reverse the changes of every transaction still active.
    fn undo_phase(&self, stats: &mut RecoveryStats) -> Result<()> {
        let mut active: BTreeMap<TransactionId, Vec<LogRecord>> = BTreeMap::new();
        self.for_each_record(|record| {
            if self.tm.is_active(record.xid()) {
                active.entry(record.xid()).or_default().push(record);
            }
            Ok(())
        })?;

        for (xid, records) in active {
            for record in records.iter().rev() {
                let compensation = match record {
                    LogRecord::Insert(insert) => {
                        let mut invalid = insert.raw.to_vec();
                        item::set_raw_invalid(&mut invalid);
                        self.apply_insert(insert, &invalid)?;
                        LogRecord::update(
                            xid,
                            item::Uid::new(insert.page_id, insert.offset),
                            &insert.raw,
                            &invalid,
                        )
                    }
                    LogRecord::Update(update) => {
                        self.apply_update(update, &update.old_raw)?;
                        LogRecord::update(xid, update.uid, &update.new_raw, &update.old_raw)
                    }
                };
                self.logger.append(&compensation.encode())?;
                stats.records_undone += 1;
                stats.clrs_written += 1;
            }
        }

        // Transactions that never logged anything are still active too.
        for xid in self.tm.active_transactions() {
            self.tm.abort(xid)?;
            stats.transactions_aborted += 1;
            log::debug!("recovery aborted {}", xid);
        }
        Ok(())
    }

    fn apply_insert(&self, record: &InsertRecord, raw: &[u8]) -> Result<()> {
        let page = self.pages.get_page(record.page_id)?;
        data_page::recover_insert(&page, raw, record.offset);
        page.release()
    }

    fn apply_update(&self, record: &UpdateRecord, raw: &[u8]) -> Result<()> {
        let page = self.pages.get_page(record.uid.page_id())?;
        data_page::recover_update(&page, raw, record.uid.offset());
        page.release()
    }
}
