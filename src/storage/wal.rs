//! Write-Ahead Logging (WAL) module.
//!
//! This module implements the write-ahead log beneath the data manager:
//! - Insert and update record encoding
//! - An append-only, checksummed log file with a sequential read cursor
//! - Bad-tail detection and truncation on open

pub mod logger;
pub mod record;

pub use logger::Logger;
pub use record::{InsertRecord, LogRecord, UpdateRecord};
