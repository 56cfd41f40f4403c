//! Crash recovery module.
//!
//! This module restores the data file from the write-ahead log at startup:
//! - Truncation of pages allocated but never logged
//! - Redo of every finished transaction, in log order
//! - Undo of every transaction still active at the crash, newest change first

pub mod replay;

pub use replay::{Recovery, RecoveryStats};
