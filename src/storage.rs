//! Storage layer implementation for vibestore.
//!
//! This module provides the foundation for persistent data storage using a page-based
//! architecture. Key components:
//!
//! - **Page**: Fixed-size (8KB) blocks of data, the basic unit of I/O
//! - **PageManager**: Handles reading/writing pages to disk
//! - **PageCache**: Reference-counted cache of resident pages
//! - **PageIndex**: Free-space buckets used to pick a page for an insert
//! - **Logger**: Checksummed write-ahead log
//!
//! Every page mutation is logged before it is applied in memory, so the
//! data file may lag behind the log until a dirty page is evicted.

pub mod disk;
pub mod page;
pub mod page_cache;
pub mod page_index;
pub mod wal;

pub use disk::{PageManager, PAGE_SIZE};
pub use page::{Page, PageId};
pub use page_cache::{PageCache, PageRef};
pub use page_index::PageIndex;
pub use wal::Logger;
