//! Page cache over the data file.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{BoundedRefCache, CacheRef, CacheSource};
use crate::error::{Error, Result};
use crate::storage::disk::{PageManager, PAGE_SIZE};
use crate::storage::page::{Page, PageId};

/// Fewer resident pages than this cannot serve concurrent transactions.
pub const MIN_CACHE_PAGES: usize = 10;

/// Loads pages from and flushes dirty pages to the data file.
pub struct PageSource {
    disk: Mutex<PageManager>,
}

impl PageSource {
    fn flush(&self, page: &Page) -> Result<()> {
        let raw = page.read();
        self.disk.lock().write_page(page.id(), &raw)?;
        page.set_dirty(false);
        Ok(())
    }
}

impl CacheSource for PageSource {
    type Key = PageId;
    type Value = Page;

    fn load(&self, page_id: PageId) -> Result<Page> {
        let mut raw = Box::new([0u8; PAGE_SIZE]);
        self.disk.lock().read_page(page_id, &mut raw)?;
        Ok(Page::new(page_id, raw))
    }

    fn evict(&self, _page_id: PageId, page: Arc<Page>) -> Result<()> {
        if page.is_dirty() {
            self.flush(&page)?;
        }
        Ok(())
    }
}

/// A counted reference to a resident page.
pub type PageRef = CacheRef<PageSource>;

pub struct PageCache {
    cache: Arc<BoundedRefCache<PageSource>>,
    page_count: AtomicU32,
}

impl PageCache {
    pub fn create(path: &Path, memory: u64) -> Result<Self> {
        let capacity = Self::capacity_for(memory)?;
        let disk = PageManager::create(path)?;
        Ok(Self::with_disk(disk, capacity, 0))
    }

    pub fn open(path: &Path, memory: u64) -> Result<Self> {
        let capacity = Self::capacity_for(memory)?;
        let disk = PageManager::open(path)?;
        let pages = disk.num_pages()?;
        Ok(Self::with_disk(disk, capacity, pages))
    }

    fn capacity_for(memory: u64) -> Result<usize> {
        let pages = (memory / PAGE_SIZE as u64) as usize;
        if pages < MIN_CACHE_PAGES {
            return Err(Error::MemoryTooSmall {
                pages,
                min: MIN_CACHE_PAGES,
            });
        }
        Ok(pages)
    }

    fn with_disk(disk: PageManager, capacity: usize, pages: u32) -> Self {
        Self {
            cache: Arc::new(BoundedRefCache::new(
                PageSource {
                    disk: Mutex::new(disk),
                },
                capacity,
            )),
            page_count: AtomicU32::new(pages),
        }
    }

    /// Allocates the next page number and writes `init` there directly.
    /// The new page is not made resident.
    pub fn new_page(&self, init: &[u8; PAGE_SIZE]) -> Result<PageId> {
        let page_id = PageId(self.page_count.fetch_add(1, Ordering::SeqCst) + 1);
        self.cache.source().disk.lock().write_page(page_id, init)?;
        Ok(page_id)
    }

    pub fn get_page(&self, page_id: PageId) -> Result<PageRef> {
        self.cache.get(page_id)
    }

    /// Forces `page` to disk whether or not it is dirty.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        self.cache.source().flush(page)
    }

    /// Shrinks the data file to `max_page` pages. Only used by recovery,
    /// before any page is resident.
    pub fn truncate_to(&self, max_page: u32) -> Result<()> {
        self.cache.source().disk.lock().truncate(max_page)?;
        self.page_count.store(max_page, Ordering::SeqCst);
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub fn resident(&self) -> usize {
        self.cache.resident()
    }

    /// Flushes every dirty resident page.
    pub fn close(&self) -> Result<()> {
        self.cache.close()?;
        self.cache.source().disk.lock().sync()
    }
}
