use crate::error::{Error, Result};
use crate::storage::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// Raw page I/O over a single data file. Page numbers start at 1; page `n`
/// lives at byte offset `(n - 1) * PAGE_SIZE`.
pub struct PageManager {
    file: File,
}

impl PageManager {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::FileExists(path.to_path_buf()),
                _ => Error::Io(e),
            })?;

        Ok(Self { file })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
                _ => Error::Io(e),
            })?;

        Ok(Self { file })
    }

    /// Reads one page. Bytes past the end of the file read as zero.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        buf.fill(0);

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Writes one page and forces it to stable storage, extending the file
    /// if necessary.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let offset = Self::page_offset(page_id);

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.sync_all()?;

        Ok(())
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    /// Shrinks (or grows) the file to exactly `pages` pages.
    pub fn truncate(&mut self, pages: u32) -> Result<()> {
        self.file.set_len(pages as u64 * PAGE_SIZE as u64)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        (page_id.0 as u64).saturating_sub(1) * PAGE_SIZE as u64
    }
}
