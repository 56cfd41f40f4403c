//! Free-space index used to choose a page for a new record.

use crate::storage::{PageId, PAGE_SIZE};
use parking_lot::Mutex;

const INTERVALS_NO: usize = 40;
const THRESHOLD: usize = PAGE_SIZE / INTERVALS_NO;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page_id: PageId,
    pub free_space: usize,
}

/// Pages bucketed by free space into `INTERVALS_NO` fixed-width intervals.
/// A page checked out by [`PageIndex::select`] is absent until re-added.
pub struct PageIndex {
    lists: Mutex<Vec<Vec<PageInfo>>>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(vec![Vec::new(); INTERVALS_NO + 1]),
        }
    }

    pub fn add(&self, page_id: PageId, free_space: usize) {
        let bucket = (free_space / THRESHOLD).min(INTERVALS_NO);
        self.lists.lock()[bucket].push(PageInfo {
            page_id,
            free_space,
        });
    }

    /// Removes and returns the first page with at least `need` free bytes.
    pub fn select(&self, need: usize) -> Option<PageInfo> {
        let start = (need / THRESHOLD + 1).min(INTERVALS_NO);
        let mut lists = self.lists.lock();
        for list in lists[start..].iter_mut() {
            if let Some(pos) = list.iter().position(|info| info.free_space >= need) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.lists.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}
