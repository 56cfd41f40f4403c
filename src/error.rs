//! Error types shared by every layer of the engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::data::Uid;
use crate::transaction::TransactionId;

/// Errors that can occur in the storage engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Cache is full: no room for another resident resource")]
    CacheFull,

    #[error("Data too large: {size} bytes exceeds the page capacity of {max} bytes")]
    DataTooLarge { size: usize, max: usize },

    #[error("Database is busy: no page with enough free space after {attempts} attempts")]
    DatabaseBusy { attempts: usize },

    #[error("Deadlock detected: {0} was aborted")]
    Deadlock(TransactionId),

    #[error("Concurrent update: {0} was aborted")]
    ConcurrentUpdate(TransactionId),

    #[error("Corrupt transaction log: {0}")]
    CorruptTransactionLog(String),

    #[error("Bad log file: {0}")]
    BadLogFile(String),

    #[error("Memory too small: {pages} cache pages (min: {min})")]
    MemoryTooSmall { pages: usize, min: usize },

    #[error("Null entry: no live record at {0}")]
    NullEntry(Uid),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TransactionId),

    #[error("File already exists: {0:?}")]
    FileExists(PathBuf),

    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors after which the caller may retry the transaction or operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CacheFull
                | Error::DatabaseBusy { .. }
                | Error::Deadlock(_)
                | Error::ConcurrentUpdate(_)
        )
    }

    /// Integrity or configuration failures the process cannot continue past.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptTransactionLog(_)
                | Error::BadLogFile(_)
                | Error::MemoryTooSmall { .. }
                | Error::Io(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
