pub mod data_page;
pub mod page_one;

use crate::storage::PAGE_SIZE;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};

/// 1-based page number inside the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page{}", self.0)
    }
}

/// An in-memory page: one owned buffer plus a dirty flag.
///
/// All byte access goes through [`Page::read`] and [`Page::write`]; taking
/// the write guard marks the page dirty.
pub struct Page {
    id: PageId,
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    dirty: AtomicBool,
}

impl Page {
    pub fn new(id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Self {
        Self {
            id,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        let guard = self.data.write();
        self.dirty.store(true, Ordering::SeqCst);
        guard
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
