//! Append-only, checksummed log file.
//!
//! ```text
//! [XCheckSum:4][Record]*[BadTail?]
//! Record = [Size:4][Checksum:4][Payload:Size]
//! ```
//!
//! `Checksum` covers the payload. `XCheckSum` accumulates over the full
//! bytes of every record in file order and is rewritten after each append.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{Error, Result};

const SEED: i32 = 13331;
const HEADER_LEN: u64 = 4;
const RECORD_HEADER_LEN: usize = 8;

/// Folds `data` into the rolling checksum `acc`.
pub fn checksum(acc: i32, data: &[u8]) -> i32 {
    data.iter()
        .fold(acc, |acc, &b| acc.wrapping_mul(SEED).wrapping_add(b as i8 as i32))
}

struct LogFile {
    file: File,
    x_checksum: i32,
    /// End of the last verified record.
    len: u64,
    /// Read cursor used by `next`.
    position: u64,
}

impl LogFile {
    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_i32::<BigEndian>(self.x_checksum)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Parses the record starting at `pos` in `data`, returning the full record
/// bytes if it is complete and its checksum verifies.
fn verified_record(data: &[u8], pos: usize) -> Option<&[u8]> {
    let header = data.get(pos..pos + RECORD_HEADER_LEN)?;
    let size = BigEndian::read_u32(&header[0..4]) as usize;
    let expected = BigEndian::read_i32(&header[4..8]);

    let end = pos.checked_add(RECORD_HEADER_LEN)?.checked_add(size)?;
    let record = data.get(pos..end)?;
    if checksum(0, &record[RECORD_HEADER_LEN..]) != expected {
        return None;
    }
    Some(record)
}

pub struct Logger {
    inner: Mutex<LogFile>,
}

impl Logger {
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

        file.write_i32::<BigEndian>(0)?;
        file.sync_all()?;

        Ok(Self {
            inner: Mutex::new(LogFile {
                file,
                x_checksum: 0,
                len: HEADER_LEN,
                position: HEADER_LEN,
            }),
        })
    }

    /// Opens an existing log, validating every record against the stored
    /// `XCheckSum` and truncating an unverifiable tail.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
                _ => Error::Io(e),
            })?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if (data.len() as u64) < HEADER_LEN {
            return Err(Error::BadLogFile(format!(
                "log is {} bytes, shorter than its header",
                data.len()
            )));
        }
        let stored = BigEndian::read_i32(&data[0..4]);

        // (end offset, cumulative checksum) after each verified record.
        let mut pos = HEADER_LEN as usize;
        let mut acc = 0i32;
        let mut boundaries = vec![(pos, acc)];
        while let Some(record) = verified_record(&data, pos) {
            acc = checksum(acc, record);
            pos += record.len();
            boundaries.push((pos, acc));
        }

        let last = boundaries.len() - 1;
        let accepted = if stored == boundaries[last].1 {
            boundaries[last]
        } else if last > 0 && stored == boundaries[last - 1].1 {
            log::warn!(
                "log header predates the last record, dropping record at offset {}",
                boundaries[last - 1].0
            );
            boundaries[last - 1]
        } else {
            return Err(Error::BadLogFile(format!(
                "checksum mismatch: header {} does not match any record boundary",
                stored
            )));
        };

        let (len, x_checksum) = (accepted.0 as u64, accepted.1);
        if len < data.len() as u64 {
            log::info!(
                "truncating bad log tail: {} bytes at offset {}",
                data.len() as u64 - len,
                len
            );
            file.set_len(len)?;
            file.sync_all()?;
        }

        Ok(Self {
            inner: Mutex::new(LogFile {
                file,
                x_checksum,
                len,
                position: HEADER_LEN,
            }),
        })
    }

    /// Appends one record and forces it, then updates and forces the header.
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.put_u32(payload.len() as u32);
        record.put_i32(checksum(0, payload));
        record.put_slice(payload);

        let mut log = self.inner.lock();
        let end = log.len;
        log.file.seek(SeekFrom::Start(end))?;
        log.file.write_all(&record)?;
        log.file.sync_data()?;

        log.len += record.len() as u64;
        log.x_checksum = checksum(log.x_checksum, &record);
        log.write_header()
    }

    /// Moves the read cursor back to the first record.
    pub fn rewind(&self) {
        self.inner.lock().position = HEADER_LEN;
    }

    /// Returns the payload of the next record, or `None` at the end of the
    /// valid records. A record failing its checksum ends the sequence.
    pub fn next(&self) -> Result<Option<Bytes>> {
        let mut log = self.inner.lock();
        let LogFile {
            file,
            len,
            position,
            ..
        } = &mut *log;

        if *position + RECORD_HEADER_LEN as u64 > *len {
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_LEN];
        file.seek(SeekFrom::Start(*position))?;
        file.read_exact(&mut header)?;
        let size = BigEndian::read_u32(&header[0..4]) as u64;
        let expected = BigEndian::read_i32(&header[4..8]);

        if *position + RECORD_HEADER_LEN as u64 + size > *len {
            return Ok(None);
        }

        let mut payload = vec![0u8; size as usize];
        file.read_exact(&mut payload)?;
        if checksum(0, &payload) != expected {
            return Ok(None);
        }

        *position += RECORD_HEADER_LEN as u64 + size;
        Ok(Some(Bytes::from(payload)))
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}
