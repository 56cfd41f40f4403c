//! Concurrency control module.
//!
//! This module implements multi-version concurrency control on top of the
//! data manager:
//! - Versioned entries stamped with creator and deleter
//! - Visibility rules for read committed and repeatable read
//! - Record locks with deadlock detection

pub mod lock;
pub mod mvcc;
pub mod version;
pub mod visibility;

pub use lock::{LockTable, Waiter};
pub use mvcc::{IsolationLevel, Transaction, VersionManager};
pub use version::{Entry, EntryRef};
