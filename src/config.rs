use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tempdir::TempDir;

use crate::{
    Error, Result, Translog,
    translog::{DISK_DRIVE_SECTOR_SIZE, MAX_FILE_NUMBER},
};

const DEFAULT_PATH: &str = "default.translog";

/// The largest page size whose overhead and chunk lengths still fit the
/// 16-bit length fields of the chunk format.
const MAX_PAGE_SIZE: usize = 65_024;

/// When the log directory itself is fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirPolicy {
    /// Never sync the directory.
    Never,
    /// Sync the directory during the first flush after a log file was
    /// created or removed.
    NewFile,
    /// Sync the directory on every flush.
    Always,
}

/// What happens to log files that are purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Purged files are closed and deleted.
    Immediate,
    /// Purged files are closed and left in place for an external process
    /// to archive or remove.
    External,
}

macro_rules! supported {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return Err(Error::Unsupported($msg.to_owned()));
        }
    };
}

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    }
}

/// Top-level configuration for the transaction log.
///
/// # Examples
///
/// ```
/// let _config = translog::Config::new()
///     .path("/path/to/log".to_owned())
///     .page_size(8192)
///     .buffers(8)
///     .flush_every_ms(Some(200));
/// ```
///
/// ```
/// // Read-only mode
/// let _config = translog::Config::new()
///     .path("/path/to/log".to_owned())
///     .read_only(true);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    #[doc(hidden)]
    pub path: PathBuf,
    #[doc(hidden)]
    pub page_size: usize,
    #[doc(hidden)]
    pub buffer_size: usize,
    #[doc(hidden)]
    pub buffers: usize,
    #[doc(hidden)]
    pub file_size: usize,
    #[doc(hidden)]
    pub page_crc: bool,
    #[doc(hidden)]
    pub sector_protection: bool,
    #[doc(hidden)]
    pub record_crc: bool,
    #[doc(hidden)]
    pub read_only: bool,
    #[doc(hidden)]
    pub sync_dir: SyncDirPolicy,
    #[doc(hidden)]
    pub purge: PurgeMode,
    #[doc(hidden)]
    pub server_id: u32,
    #[doc(hidden)]
    pub server_version: u32,
    #[doc(hidden)]
    pub cache_capacity: usize,
    #[doc(hidden)]
    pub flush_every_ms: Option<u64>,
    #[doc(hidden)]
    pub temporary: bool,
    pub(crate) tempdir_deleter: Option<Arc<TempDir>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: PathBuf::from(DEFAULT_PATH),
            page_size: 8 * 1024,
            buffer_size: 1024 * 1024,
            buffers: 8,
            file_size: 1024 * 1024 * 1024,
            page_crc: true,
            sector_protection: true,
            record_crc: false,
            read_only: false,
            sync_dir: SyncDirPolicy::NewFile,
            purge: PurgeMode::Immediate,
            server_id: 1,
            server_version: 0,
            cache_capacity: 8 * 1024 * 1024,
            flush_every_ms: Some(500),
            temporary: false,
            tempdir_deleter: None,
        }
    }
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Config::default()
    }

    /// Set the path of the log directory (builder).
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Config {
        self.path = path.as_ref().to_path_buf();
        self
    }

    builder!(
        (page_size, usize, "size of a log page. MUST be a multiple of 512!"),
        (buffer_size, usize, "size of each write buffer in the ring. MUST be a multiple of the page size"),
        (buffers, usize, "number of write buffers in the ring"),
        (file_size, usize, "size at which a new log file is started"),
        (page_crc, bool, "store a CRC32 of every page payload in its header"),
        (sector_protection, bool, "stamp every disk sector of a page so torn writes can be detected"),
        (record_crc, bool, "append a CRC32 to every variable-length record"),
        (read_only, bool, "whether to run in read-only mode"),
        (sync_dir, SyncDirPolicy, "when the log directory is fsynced"),
        (purge, PurgeMode, "what happens to purged log files"),
        (server_id, u32, "server id written into new log file headers"),
        (server_version, u32, "server version written into new log file headers"),
        (cache_capacity, usize, "maximum size in bytes of the page read cache"),
        (flush_every_ms, Option<u64>, "number of ms between periodic group-commit flushes"),
        (temporary, bool, "deletes the log after drop. if no path is set, uses a fresh temporary directory")
    );

    /// Opens the log described by this configuration, recovering it if
    /// it already exists.
    pub fn open(&self) -> Result<Translog> {
        let mut config = self.clone();
        config.validate()?;

        if config.temporary && config.path == PathBuf::from(DEFAULT_PATH) {
            let tempdir = TempDir::new("translog")?;
            config.path = tempdir.path().to_path_buf();
            config.tempdir_deleter = Some(Arc::new(tempdir));
        }

        Translog::start(config)
    }

    pub(crate) fn page_flags(&self) -> u8 {
        use crate::translog::{PAGE_CRC, PAGE_RECORD_CRC, PAGE_SECTOR_PROTECTION};

        let mut flags = 0;
        if self.page_crc {
            flags |= PAGE_CRC;
        }
        if self.sector_protection {
            flags |= PAGE_SECTOR_PROTECTION;
        }
        if self.record_crc {
            flags |= PAGE_RECORD_CRC;
        }
        flags
    }

    fn validate(&self) -> Result<()> {
        supported!(
            self.page_size >= DISK_DRIVE_SECTOR_SIZE,
            "page_size must be at least one disk sector"
        );
        supported!(
            self.page_size % DISK_DRIVE_SECTOR_SIZE == 0,
            "page_size must be a multiple of 512"
        );
        supported!(
            self.page_size <= MAX_PAGE_SIZE,
            format!("page_size must not exceed {}", MAX_PAGE_SIZE)
        );
        supported!(self.buffers >= 2, "the ring needs at least two buffers");
        supported!(
            self.buffer_size % self.page_size == 0,
            "buffer_size must be a multiple of page_size"
        );
        supported!(
            self.buffer_size >= 2 * self.page_size,
            "buffer_size must hold at least two pages"
        );
        supported!(
            self.file_size % self.page_size == 0,
            "file_size must be a multiple of page_size"
        );
        supported!(
            self.file_size >= 2 * self.page_size,
            "file_size must hold the file header page and one log page"
        );
        supported!(
            self.file_size <= u32::MAX as usize,
            "file_size must fit in the 32-bit offset of a log address"
        );
        supported!(
            self.file_size / self.page_size <= MAX_FILE_NUMBER as usize,
            "file_size holds more pages than a 3-byte page number can address"
        );
        Ok(())
    }
}
