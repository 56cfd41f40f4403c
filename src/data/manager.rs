use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{BoundedRefCache, CacheRef, CacheSource};
use crate::error::{Error, Result};
use crate::recovery::Recovery;
use crate::storage::page::{data_page, page_one};
use crate::storage::page_cache::{PageCache, PageRef};
use crate::storage::page_index::PageIndex;
use crate::storage::wal::Logger;
use crate::storage::{PageId, PAGE_SIZE};
use crate::transaction::{TransactionId, TransactionManager};

use super::item::{self, DataItem, Uid, OF_DATA};
use super::journal::{Journal, UndoAction};

/// Page-selection attempts before an insert gives up.
const MAX_INSERT_ATTEMPTS: usize = 5;

const PAGE_ONE: PageId = PageId(1);

/// Materializes DataItems from their pages.
pub struct ItemSource {
    pages: Arc<PageCache>,
    journal: Arc<Journal>,
}

impl ItemSource {
    /// Raw length of the item at `uid`, or `None` when its header does not
    /// lie inside the used region of the page.
    fn item_len(page: &PageRef, uid: Uid) -> Option<usize> {
        let raw = page.read();
        let used = (data_page::fso(&raw) as usize).min(PAGE_SIZE);
        let start = uid.offset() as usize;
        if start < data_page::DATA_OFFSET || start + OF_DATA > used {
            return None;
        }
        let len = OF_DATA + item::raw_size(&raw[start..]);
        (start + len <= used).then_some(len)
    }
}

impl CacheSource for ItemSource {
    type Key = Uid;
    type Value = DataItem;

    fn load(&self, uid: Uid) -> Result<DataItem> {
        if uid.page_id() <= PAGE_ONE || uid.page_id().0 > self.pages.page_count() {
            return Err(Error::NullEntry(uid));
        }

        let page = self.pages.get_page(uid.page_id())?;
        match Self::item_len(&page, uid) {
            Some(len) => Ok(DataItem::new(uid, page, len, Arc::clone(&self.journal))),
            None => {
                page.release()?;
                Err(Error::NullEntry(uid))
            }
        }
    }

    fn evict(&self, _uid: Uid, item: Arc<DataItem>) -> Result<()> {
        match Arc::try_unwrap(item) {
            Ok(item) => item.release(),
            // Still shared after a forced close; the page goes with the last Arc.
            Err(_) => Ok(()),
        }
    }
}

/// A counted reference to a cached DataItem.
pub type DataItemRef = CacheRef<ItemSource>;

pub struct DataManager {
    pages: Arc<PageCache>,
    journal: Arc<Journal>,
    items: Arc<BoundedRefCache<ItemSource>>,
    index: PageIndex,
    page_one: Mutex<Option<PageRef>>,
}

impl DataManager {
    /// Creates a new data file and log. Page one is written with a fresh
    /// validity marker.
    pub fn create(db_path: &Path, log_path: &Path, memory: u64) -> Result<Self> {
        let pages = Arc::new(PageCache::create(db_path, memory)?);
        let logger = Arc::new(Logger::create(log_path)?);
        pages.new_page(&page_one::init_raw())?;

        log::debug!("created data file {:?}", db_path);
        Self::assemble(pages, logger)
    }

    /// Opens an existing data file and log, replaying the log first.
    pub fn open(
        db_path: &Path,
        log_path: &Path,
        memory: u64,
        tm: &TransactionManager,
    ) -> Result<Self> {
        let pages = Arc::new(PageCache::open(db_path, memory)?);
        let logger = Arc::new(Logger::open(log_path)?);

        let clean = {
            let page = pages.get_page(PAGE_ONE)?;
            let clean = page_one::check(&page);
            page.release()?;
            clean
        };
        if !clean {
            log::warn!("{:?} was not shut down cleanly", db_path);
        }

        let stats = Recovery::new(tm, &logger, &pages).run()?;
        log::info!("recovery finished: {}", stats);

        let dm = Self::assemble(pages, logger)?;
        dm.fill_page_index()?;
        if let Some(page) = dm.page_one.lock().as_ref() {
            page_one::set_open(page);
            dm.pages.flush_page(page)?;
        }
        Ok(dm)
    }

    fn assemble(pages: Arc<PageCache>, logger: Arc<Logger>) -> Result<Self> {
        let journal = Arc::new(Journal::new(logger));
        let items = Arc::new(BoundedRefCache::new(
            ItemSource {
                pages: Arc::clone(&pages),
                journal: Arc::clone(&journal),
            },
            0,
        ));
        let page_one = pages.get_page(PAGE_ONE)?;

        Ok(Self {
            pages,
            journal,
            items,
            index: PageIndex::new(),
            page_one: Mutex::new(Some(page_one)),
        })
    }

    fn fill_page_index(&self) -> Result<()> {
        for n in 2..=self.pages.page_count() {
            let page = self.pages.get_page(PageId(n))?;
            if data_page::repair(&page) {
                log::warn!("{} was never initialized, resetting its header", page.id());
            }
            self.index.add(page.id(), data_page::free_space(&page));
            page.release()?;
        }
        Ok(())
    }

    /// Stores `data` as a new DataItem and returns its address.
    pub fn insert(&self, xid: TransactionId, data: &[u8]) -> Result<Uid> {
        let raw = item::wrap_raw(data);
        if raw.len() > data_page::MAX_FREE_SPACE {
            return Err(Error::DataTooLarge {
                size: raw.len(),
                max: data_page::MAX_FREE_SPACE,
            });
        }

        let mut selected = None;
        for _ in 0..MAX_INSERT_ATTEMPTS {
            if let Some(info) = self.index.select(raw.len()) {
                selected = Some(info);
                break;
            }
            let page_id = self.pages.new_page(&data_page::init_raw())?;
            self.index.add(page_id, data_page::MAX_FREE_SPACE);
        }
        let info = selected.ok_or(Error::DatabaseBusy {
            attempts: MAX_INSERT_ATTEMPTS,
        })?;

        let page = match self.pages.get_page(info.page_id) {
            Ok(page) => page,
            Err(e) => {
                self.index.add(info.page_id, info.free_space);
                return Err(e);
            }
        };

        let offset = data_page::next_offset(&page.read());
        let logged = self.journal.log_insert(xid, page.id(), offset, &raw);
        if logged.is_ok() {
            data_page::insert(&page, &raw);
        }
        self.index.add(page.id(), data_page::free_space(&page));
        logged?;

        let uid = Uid::new(page.id(), offset);
        page.release()?;
        Ok(uid)
    }

    /// Fetches the item at `uid`; `None` if it has been invalidated.
    pub fn read(&self, uid: Uid) -> Result<Option<DataItemRef>> {
        let item = self.items.get(uid)?;
        if !item.is_valid() {
            item.release()?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Reverses every change `xid` made, newest first. Each compensation is
    /// itself logged under `xid`. If a step fails, the changes not yet
    /// reversed stay pending so the rollback can be retried.
    pub fn rollback(&self, xid: TransactionId) -> Result<()> {
        let mut actions = self.journal.take(xid);
        let count = actions.len();

        while let Some(action) = actions.pop() {
            if let Err(e) = self.undo(xid, &action) {
                actions.push(action);
                self.journal.restore(xid, actions);
                return Err(e);
            }
        }

        self.journal.forget(xid);
        if count > 0 {
            log::debug!("rolled back {} changes of {}", count, xid);
        }
        Ok(())
    }

    fn undo(&self, xid: TransactionId, action: &UndoAction) -> Result<()> {
        let uid = match action {
            UndoAction::Insert(uid) => *uid,
            UndoAction::Update { uid, .. } => *uid,
        };
        let item = self.items.get(uid)?;
        {
            let mut writer = item.before();
            match action {
                UndoAction::Insert(_) => writer.set_invalid(),
                UndoAction::Update { old_raw, .. } => writer.restore_raw(old_raw),
            }
            writer.after(xid)?;
        }
        item.release()
    }

    /// Drops the rollback record of a committed transaction.
    pub fn forget(&self, xid: TransactionId) {
        self.journal.forget(xid);
    }

    pub fn page_count(&self) -> u32 {
        self.pages.page_count()
    }

    pub fn close(&self) -> Result<()> {
        self.items.close()?;
        self.journal.logger().close()?;

        if let Some(page) = self.page_one.lock().take() {
            page_one::set_close(&page);
            self.pages.flush_page(&page)?;
            page.release()?;
        }
        self.pages.close()
    }
}
