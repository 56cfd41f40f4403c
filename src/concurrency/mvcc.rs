//! Multi-Version Concurrency Control (MVCC) implementation.
//!
//! The version manager hands out transactions, wraps inserted data in a
//! version envelope, filters reads through the visibility rules, and
//! serializes deletes of the same record through the lock table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::BoundedRefCache;
use crate::concurrency::lock::LockTable;
use crate::concurrency::version::{self, EntryRef, EntrySource};
use crate::concurrency::visibility;
use crate::data::{DataManager, Uid};
use crate::error::{Error, Result};
use crate::transaction::{TransactionId, TransactionManager};

/// Isolation levels supported by the MVCC system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Each read sees the latest committed version.
    #[default]
    ReadCommitted,
    /// Every read sees the snapshot taken when the transaction began.
    RepeatableRead,
}

impl IsolationLevel {
    /// Whether this isolation level uses a consistent snapshot.
    pub fn uses_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead)
    }
}

/// Why the engine aborted a transaction on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Deadlock,
    ConcurrentUpdate,
}

/// Information about an active transaction.
#[derive(Debug)]
pub struct Transaction {
    xid: TransactionId,
    level: IsolationLevel,
    /// Transactions active when this one began; empty under read committed.
    snapshot: HashSet<TransactionId>,
    fault: Mutex<Option<Fault>>,
    auto_aborted: AtomicBool,
}

impl Transaction {
    pub fn new(xid: TransactionId, level: IsolationLevel, snapshot: HashSet<TransactionId>) -> Self {
        Self {
            xid,
            level,
            snapshot,
            fault: Mutex::new(None),
            auto_aborted: AtomicBool::new(false),
        }
    }

    pub fn xid(&self) -> TransactionId {
        self.xid
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    /// The super transaction is never part of a snapshot.
    pub fn in_snapshot(&self, xid: TransactionId) -> bool {
        !xid.is_super() && self.snapshot.contains(&xid)
    }

    pub fn is_auto_aborted(&self) -> bool {
        self.auto_aborted.load(Ordering::SeqCst)
    }

    /// Fails with the error that made the engine abort this transaction.
    fn check(&self) -> Result<()> {
        match *self.fault.lock() {
            None => Ok(()),
            Some(Fault::Deadlock) => Err(Error::Deadlock(self.xid)),
            Some(Fault::ConcurrentUpdate) => Err(Error::ConcurrentUpdate(self.xid)),
        }
    }
}

pub struct VersionManager {
    tm: Arc<TransactionManager>,
    dm: Arc<DataManager>,
    entries: Arc<BoundedRefCache<EntrySource>>,
    active: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
    lock_table: LockTable,
}

impl VersionManager {
    pub fn new(tm: Arc<TransactionManager>, dm: Arc<DataManager>) -> Self {
        let entries = Arc::new(BoundedRefCache::new(EntrySource::new(Arc::clone(&dm)), 0));
        Self {
            tm,
            dm,
            entries,
            active: Mutex::new(HashMap::new()),
            lock_table: LockTable::new(),
        }
    }

    /// Begins a new transaction.
    pub fn begin(&self, level: IsolationLevel) -> Result<TransactionId> {
        let mut active = self.active.lock();
        let xid = self.tm.begin()?;
        let snapshot = if level.uses_snapshot() {
            active.keys().copied().collect()
        } else {
            HashSet::new()
        };
        active.insert(xid, Arc::new(Transaction::new(xid, level, snapshot)));

        log::debug!("began {} ({:?})", xid, level);
        Ok(xid)
    }

    fn transaction(&self, xid: TransactionId) -> Result<Arc<Transaction>> {
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .ok_or(Error::UnknownTransaction(xid))
    }

    /// `None` when the record is absent.
    fn entry(&self, uid: Uid) -> Result<Option<EntryRef>> {
        match self.entries.get(uid) {
            Ok(entry) => Ok(Some(entry)),
            Err(Error::NullEntry(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the data at `uid` if `xid` can see that version.
    pub fn read(&self, xid: TransactionId, uid: Uid) -> Result<Option<Vec<u8>>> {
        let t = self.transaction(xid)?;
        t.check()?;

        let Some(entry) = self.entry(uid)? else {
            return Ok(None);
        };
        let data = entry.with_version(|xmin, xmax, data| {
            visibility::is_visible(&self.tm, &t, xmin, xmax).then(|| data.to_vec())
        });
        entry.release()?;
        Ok(data)
    }

    /// Stores `data` as a new version created by `xid`.
    pub fn insert(&self, xid: TransactionId, data: &[u8]) -> Result<Uid> {
        let t = self.transaction(xid)?;
        t.check()?;

        let raw = version::wrap_entry_raw(xid, data);
        self.dm.insert(xid, &raw)
    }

    /// Marks the version at `uid` deleted by `xid`.
    ///
    /// Returns `false` if the record is absent, invisible to `xid`, or
    /// already deleted by `xid`. Blocks while another transaction holds the
    /// record. Fails with [`Error::Deadlock`] or [`Error::ConcurrentUpdate`]
    /// after aborting `xid`.
    pub fn delete(&self, xid: TransactionId, uid: Uid) -> Result<bool> {
        let t = self.transaction(xid)?;
        t.check()?;

        let Some(entry) = self.entry(uid)? else {
            return Ok(false);
        };
        let (xmin, xmax) = entry.with_version(|xmin, xmax, _| (xmin, xmax));
        if !visibility::is_visible(&self.tm, &t, xmin, xmax) {
            return Ok(false);
        }

        match self.lock_table.add(xid, uid) {
            Ok(None) => {}
            Ok(Some(waiter)) => waiter.wait(),
            Err(e @ Error::Deadlock(_)) => {
                self.auto_abort(&t, Fault::Deadlock)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let xmax = entry.xmax();
        if xmax == xid {
            return Ok(false);
        }
        if visibility::is_version_skip(&self.tm, &t, xmax) {
            self.auto_abort(&t, Fault::ConcurrentUpdate)?;
            return Err(Error::ConcurrentUpdate(xid));
        }

        entry.set_xmax(xid)?;
        entry.release()?;
        Ok(true)
    }

    /// Commits a transaction. A transaction the engine already aborted
    /// cannot commit; the call reports why.
    pub fn commit(&self, xid: TransactionId) -> Result<()> {
        let t = self.transaction(xid)?;
        t.check()?;

        self.dm.forget(xid);
        self.tm.commit(xid)?;
        self.active.lock().remove(&xid);
        self.lock_table.remove(xid);

        log::debug!("committed {}", xid);
        Ok(())
    }

    /// Aborts a transaction, undoing its changes. For a transaction the
    /// engine already aborted this only forgets it. If undoing fails the
    /// transaction stays registered with its locks held, and the abort can
    /// be retried.
    pub fn abort(&self, xid: TransactionId) -> Result<()> {
        let t = self.transaction(xid)?;
        if !t.is_auto_aborted() {
            self.finish_abort(xid)?;
        }
        self.active.lock().remove(&xid);

        log::debug!("aborted {}", xid);
        Ok(())
    }

    /// Engine-initiated abort. The transaction stays registered, failing
    /// every call with `fault`, until the caller aborts it. If the rollback
    /// fails here the caller's abort performs it again.
    fn auto_abort(&self, t: &Transaction, fault: Fault) -> Result<()> {
        *t.fault.lock() = Some(fault);

        self.finish_abort(t.xid())?;
        t.auto_aborted.store(true, Ordering::SeqCst);

        log::info!("{} aborted by the engine: {:?}", t.xid(), fault);
        Ok(())
    }

    /// Rolls back, then releases locks and records the outcome. Each step is
    /// safe to repeat.
    fn finish_abort(&self, xid: TransactionId) -> Result<()> {
        self.dm.rollback(xid)?;
        self.lock_table.remove(xid);
        self.tm.abort(xid)
    }

    pub fn close(&self) -> Result<()> {
        self.entries.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::data_page;
    use crate::storage::PAGE_SIZE;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn setup() -> anyhow::Result<(TempDir, VersionManager)> {
        setup_with_pages(64)
    }

    fn setup_with_pages(pages: u64) -> anyhow::Result<(TempDir, VersionManager)> {
        let dir = tempdir()?;
        let tm = Arc::new(TransactionManager::create(&dir.path().join("t.xid"))?);
        let dm = Arc::new(DataManager::create(
            &dir.path().join("t.db"),
            &dir.path().join("t.log"),
            pages * PAGE_SIZE as u64,
        )?);
        Ok((dir, VersionManager::new(tm, dm)))
    }

    #[test]
    fn test_insert_commit_read() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let uid = vm.insert(t1, b"hello")?;
        assert_eq!(vm.read(t1, uid)?, Some(b"hello".to_vec()));

        let t2 = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(t2, uid)?, None);

        vm.commit(t1)?;
        assert_eq!(vm.read(t2, uid)?, Some(b"hello".to_vec()));
        Ok(())
    }

    #[test]
    fn test_snapshot_contents() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let t2 = vm.begin(IsolationLevel::RepeatableRead)?;
        let t = vm.transaction(t2)?;
        assert!(t.in_snapshot(t1));
        assert!(!t.in_snapshot(t2));
        assert!(!t.in_snapshot(TransactionId::SUPER));
        assert!(vm.transaction(t1)?.snapshot.is_empty());
        Ok(())
    }

    #[test]
    fn test_delete() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let uid = vm.insert(t1, b"row")?;
        vm.commit(t1)?;

        let t2 = vm.begin(IsolationLevel::ReadCommitted)?;
        assert!(vm.delete(t2, uid)?);
        assert!(!vm.delete(t2, uid)?, "already deleted by itself");
        assert_eq!(vm.read(t2, uid)?, None);

        let t3 = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(t3, uid)?, Some(b"row".to_vec()));

        vm.commit(t2)?;
        assert_eq!(vm.read(t3, uid)?, None);
        assert!(!vm.delete(t3, uid)?, "invisible");
        Ok(())
    }

    #[test]
    fn test_delete_missing_record() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;
        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let missing = Uid::new(crate::storage::PageId(40), 2);

        assert!(!vm.delete(t1, missing)?);
        assert_eq!(vm.read(t1, missing)?, None);
        Ok(())
    }

    #[test]
    fn test_abort_undoes_insert_and_delete() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let kept = vm.insert(t1, b"kept")?;
        vm.commit(t1)?;

        let t2 = vm.begin(IsolationLevel::ReadCommitted)?;
        let dropped = vm.insert(t2, b"dropped")?;
        assert!(vm.delete(t2, kept)?);
        vm.abort(t2)?;

        let t3 = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(t3, kept)?, Some(b"kept".to_vec()));
        assert_eq!(vm.read(t3, dropped)?, None);
        // The rolled-back delete released its lock.
        assert!(vm.delete(t3, kept)?);
        Ok(())
    }

    #[test]
    fn test_repeatable_read_ignores_later_commits() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let uid = vm.insert(t1, b"v1")?;
        vm.commit(t1)?;

        let reader = vm.begin(IsolationLevel::RepeatableRead)?;
        assert_eq!(vm.read(reader, uid)?, Some(b"v1".to_vec()));

        let writer = vm.begin(IsolationLevel::ReadCommitted)?;
        assert!(vm.delete(writer, uid)?);
        let newer = vm.insert(writer, b"v2")?;
        vm.commit(writer)?;

        assert_eq!(vm.read(reader, uid)?, Some(b"v1".to_vec()));
        assert_eq!(vm.read(reader, newer)?, None);
        Ok(())
    }

    #[test]
    fn test_version_skip_aborts() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let uid = vm.insert(t1, b"row")?;
        vm.commit(t1)?;

        let rr = vm.begin(IsolationLevel::RepeatableRead)?;
        let other = vm.begin(IsolationLevel::ReadCommitted)?;
        let extra = vm.insert(rr, b"mine")?;
        assert!(vm.delete(other, uid)?);
        vm.commit(other)?;

        // Still visible to rr, but superseded by a later commit.
        assert!(matches!(
            vm.delete(rr, uid),
            Err(Error::ConcurrentUpdate(x)) if x == rr
        ));
        assert!(matches!(vm.read(rr, uid), Err(Error::ConcurrentUpdate(_))));
        assert!(matches!(vm.commit(rr), Err(Error::ConcurrentUpdate(_))));

        vm.abort(rr)?;
        assert!(matches!(
            vm.read(rr, uid),
            Err(Error::UnknownTransaction(_))
        ));

        // The auto-abort rolled back rr's insert.
        let t = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(t, extra)?, None);
        Ok(())
    }

    #[test]
    fn test_unknown_transaction() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;
        let ghost = TransactionId::new(77);
        assert!(matches!(
            vm.insert(ghost, b"x"),
            Err(Error::UnknownTransaction(_))
        ));
        assert!(matches!(vm.commit(ghost), Err(Error::UnknownTransaction(_))));
        Ok(())
    }

    #[test]
    fn test_version_skip_after_wait() -> anyhow::Result<()> {
        let (_dir, vm) = setup()?;
        let vm = Arc::new(vm);

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let uid = vm.insert(t1, b"row")?;
        vm.commit(t1)?;

        let holder = vm.begin(IsolationLevel::ReadCommitted)?;
        let rr = vm.begin(IsolationLevel::RepeatableRead)?;
        let extra = vm.insert(rr, b"mine")?;
        assert!(vm.delete(holder, uid)?);

        let waiter = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || vm.delete(rr, uid))
        };
        while vm.lock_table.waiting_on(rr) != Some(uid) {
            thread::sleep(Duration::from_millis(5));
        }

        vm.commit(holder)?;
        let result = waiter
            .join()
            .map_err(|_| anyhow::anyhow!("waiter panicked"))?;
        assert!(matches!(result, Err(Error::ConcurrentUpdate(x)) if x == rr));

        assert!(vm.tm.is_aborted(rr));
        assert_eq!(vm.lock_table.holder(uid), None);
        vm.abort(rr)?;

        let t = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(t, extra)?, None);
        assert_eq!(vm.read(t, uid)?, None);
        Ok(())
    }

    #[test]
    fn test_abort_retried_after_cache_full() -> anyhow::Result<()> {
        let (_dir, vm) = setup_with_pages(10)?;

        let t1 = vm.begin(IsolationLevel::ReadCommitted)?;
        let uid = vm.insert(t1, b"row")?;
        // Each filler takes a whole page of its own.
        let full = vec![0u8; data_page::MAX_FREE_SPACE - 3 - 16];
        let fillers = (0..9)
            .map(|_| vm.insert(t1, &full))
            .collect::<Result<Vec<_>>>()?;
        vm.commit(t1)?;

        let t2 = vm.begin(IsolationLevel::ReadCommitted)?;
        assert!(vm.delete(t2, uid)?);

        // Page one plus nine pinned pages leave no room to roll back.
        let mut pinned = Vec::new();
        for filler in &fillers {
            pinned.extend(vm.dm.read(*filler)?);
        }
        assert!(matches!(vm.abort(t2), Err(Error::CacheFull)));
        assert!(vm.transaction(t2).is_ok());
        assert_eq!(vm.lock_table.holder(uid), Some(t2));
        assert!(vm.tm.is_active(t2));

        drop(pinned);
        vm.abort(t2)?;
        assert!(vm.tm.is_aborted(t2));
        assert_eq!(vm.lock_table.holder(uid), None);

        let t3 = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(t3, uid)?, Some(b"row".to_vec()));
        assert!(vm.delete(t3, uid)?);
        Ok(())
    }
}
