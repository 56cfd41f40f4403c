//! Durable transaction status table.
//!
//! The status file is `[Counter:8][Status:1]*Counter`: an 8-byte big-endian
//! count of issued XIDs followed by one status byte per XID, XID 1 first.
//! Every write is forced before the call returns. An in-memory mirror of
//! the status bytes serves the point reads.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};

use super::id::TransactionId;
use super::state::TransactionState;
use crate::error::{Error, Result};

const HEADER_LEN: u64 = 8;
const STATUS_LEN: u64 = 1;

struct StatusFile {
    file: File,
    counter: u64,
}

impl StatusFile {
    fn position(xid: TransactionId) -> u64 {
        HEADER_LEN + (xid.value() - 1) * STATUS_LEN
    }

    fn write_status(&mut self, xid: TransactionId, state: TransactionState) -> Result<()> {
        self.file.seek(SeekFrom::Start(Self::position(xid)))?;
        self.file.write_all(&[state.to_byte()])?;
        self.file.sync_data()?;
        Ok(())
    }

    fn write_counter(&mut self, counter: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_u64::<BigEndian>(counter)?;
        self.file.sync_data()?;
        self.counter = counter;
        Ok(())
    }
}

/// The transaction manager is the authoritative record of transaction outcome.
pub struct TransactionManager {
    file: Mutex<StatusFile>,
    /// `states[i]` is the status of XID `i + 1`.
    states: RwLock<Vec<TransactionState>>,
}

impl TransactionManager {
    /// Creates a new, empty status file.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::FileExists(path.to_path_buf()),
                _ => Error::Io(e),
            })?;

        file.write_u64::<BigEndian>(0)?;
        file.sync_all()?;

        Ok(Self {
            file: Mutex::new(StatusFile { file, counter: 0 }),
            states: RwLock::new(Vec::new()),
        })
    }

    /// Opens an existing status file and validates its length.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
                _ => Error::Io(e),
            })?;

        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(Error::CorruptTransactionLog(format!(
                "file is {} bytes, shorter than the {} byte header",
                len, HEADER_LEN
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let counter = file.read_u64::<BigEndian>()?;
        let expected = counter
            .checked_mul(STATUS_LEN)
            .and_then(|body| body.checked_add(HEADER_LEN));
        if expected != Some(len) {
            return Err(Error::CorruptTransactionLog(format!(
                "header counts {} transactions but file is {} bytes",
                counter, len
            )));
        }

        let mut raw = Vec::with_capacity(counter as usize);
        file.read_to_end(&mut raw)?;
        let states = raw
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                TransactionState::from_byte(byte).ok_or_else(|| {
                    Error::CorruptTransactionLog(format!(
                        "invalid status byte {} for Txn{}",
                        byte,
                        i + 1
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            file: Mutex::new(StatusFile { file, counter }),
            states: RwLock::new(states),
        })
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> Result<TransactionId> {
        let mut file = self.file.lock();
        let xid = TransactionId::new(file.counter + 1);

        file.write_status(xid, TransactionState::Active)?;
        file.write_counter(xid.value())?;
        self.states.write().push(TransactionState::Active);

        Ok(xid)
    }

    /// Commits a transaction.
    pub fn commit(&self, xid: TransactionId) -> Result<()> {
        self.set_state(xid, TransactionState::Committed)
    }

    /// Aborts a transaction.
    pub fn abort(&self, xid: TransactionId) -> Result<()> {
        self.set_state(xid, TransactionState::Aborted)
    }

    fn set_state(&self, xid: TransactionId, state: TransactionState) -> Result<()> {
        let mut file = self.file.lock();
        if xid.is_super() || xid.value() > file.counter {
            return Err(Error::UnknownTransaction(xid));
        }

        file.write_status(xid, state)?;
        self.states.write()[(xid.value() - 1) as usize] = state;
        Ok(())
    }

    /// Gets the state of a transaction, `None` for XIDs never issued.
    pub fn state(&self, xid: TransactionId) -> Option<TransactionState> {
        if xid.is_super() {
            return Some(TransactionState::Committed);
        }
        self.states.read().get((xid.value() - 1) as usize).copied()
    }

    pub fn is_active(&self, xid: TransactionId) -> bool {
        self.state(xid).is_some_and(|s| s.is_active())
    }

    pub fn is_committed(&self, xid: TransactionId) -> bool {
        self.state(xid).is_some_and(|s| s.is_committed())
    }

    pub fn is_aborted(&self, xid: TransactionId) -> bool {
        self.state(xid).is_some_and(|s| s.is_aborted())
    }

    /// Returns every XID still marked active.
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.states
            .read()
            .iter()
            .enumerate()
            .filter(|(_, state)| state.is_active())
            .map(|(i, _)| TransactionId::new(i as u64 + 1))
            .collect()
    }

    /// Number of XIDs issued so far.
    pub fn transaction_count(&self) -> u64 {
        self.file.lock().counter
    }

    pub fn close(&self) -> Result<()> {
        self.file.lock().file.sync_all()?;
        Ok(())
    }
}
