use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::concurrency::VersionManager;
use crate::data::DataManager;
use crate::error::{Error, Result};
use crate::transaction::TransactionManager;

/// Runtime settings for an open database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Bytes of page cache. Divided by the page size to get the number of
    /// resident pages.
    pub memory: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            memory: 64 * 1024 * 1024,
        }
    }
}

/// The three files backing a database at base path `P`.
#[derive(Debug, Clone)]
struct DatabaseFiles {
    data: PathBuf,
    log: PathBuf,
    xid: PathBuf,
}

impl DatabaseFiles {
    fn new(base: &Path) -> Self {
        Self {
            data: with_suffix(base, "db"),
            log: with_suffix(base, "log"),
            xid: with_suffix(base, "xid"),
        }
    }

    fn all(&self) -> [&Path; 3] {
        [&self.data, &self.log, &self.xid]
    }
}

/// Appends `.suffix` to the full base path, keeping any dots it already has.
fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// High-level database interface that wires the transaction, data and
/// version managers over one set of files.
pub struct Database {
    tm: Arc<TransactionManager>,
    dm: Arc<DataManager>,
    vm: Arc<VersionManager>,
}

impl Database {
    /// Create a new database at the specified base path
    pub fn create(path: &Path, config: DatabaseConfig) -> Result<Self> {
        let files = DatabaseFiles::new(path);
        if let Some(existing) = files.all().into_iter().find(|p| p.exists()) {
            return Err(Error::FileExists(existing.to_path_buf()));
        }

        let tm = Arc::new(TransactionManager::create(&files.xid)?);
        let dm = Arc::new(DataManager::create(&files.data, &files.log, config.memory)?);

        log::info!("created database at {:?}", path);
        Ok(Self::assemble(tm, dm))
    }

    /// Open an existing database, recovering it from its log
    pub fn open(path: &Path, config: DatabaseConfig) -> Result<Self> {
        let files = DatabaseFiles::new(path);

        let tm = Arc::new(TransactionManager::open(&files.xid)?);
        let dm = Arc::new(DataManager::open(
            &files.data,
            &files.log,
            config.memory,
            &tm,
        )?);

        log::info!(
            "opened database at {:?} ({} pages, {} transactions)",
            path,
            dm.page_count(),
            tm.transaction_count()
        );
        Ok(Self::assemble(tm, dm))
    }

    fn assemble(tm: Arc<TransactionManager>, dm: Arc<DataManager>) -> Self {
        let vm = Arc::new(VersionManager::new(Arc::clone(&tm), Arc::clone(&dm)));
        Self { tm, dm, vm }
    }

    pub fn vm(&self) -> &Arc<VersionManager> {
        &self.vm
    }

    pub fn dm(&self) -> &Arc<DataManager> {
        &self.dm
    }

    pub fn tm(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    /// Shuts down cleanly. Dropping a database without closing it leaves
    /// page one marked as an unclean shutdown.
    pub fn close(&self) -> Result<()> {
        self.vm.close()?;
        self.dm.close()?;
        self.tm.close()?;
        log::info!("closed database");
        Ok(())
    }
}
