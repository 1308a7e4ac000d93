//! The set of log files in the log directory, from the lowest live file to
//! the one currently written.

use std::{
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use fault_injection::{fallible, maybe};
use fs2::FileExt;
use parking_lot::RwLock;

use crate::{
    Config, Error, PurgeMode, Result, SyncDirPolicy,
    translog::lsn::{LSN_STORE_SIZE, Lsn, load_u24, store_u24},
};

const WARN: &str = "DO_NOT_PUT_YOUR_FILES_HERE";
pub(crate) const FILE_PREFIX: &str = "aria_log.";

const MAGIC: [u8; 12] =
    [0xFE, 0xFE, 0x0B, 0x01, b'M', b'A', b'R', b'I', b'A', b'L', b'O', b'G'];
pub(crate) const LOG_FORMAT_VERSION: u32 = 10_000;

// file header layout
const TIMESTAMP_OFFSET: usize = 12;
const VERSION_OFFSET: usize = 20;
const SERVER_VERSION_OFFSET: usize = 24;
const SERVER_ID_OFFSET: usize = 28;
const PAGE_SIZE_OFFSET: usize = 32;
const FILE_NUMBER_OFFSET: usize = 34;
const MAX_LSN_OFFSET: usize = 37;
pub(crate) const FILE_HEADER_LEN: usize = MAX_LSN_OFFSET + LSN_STORE_SIZE;

/// The header stored at the start of page 0 of every log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub timestamp: u64,
    pub version: u32,
    pub server_version: u32,
    pub server_id: u32,
    pub page_size: u16,
    pub file_number: u32,
    /// Address of the last record that starts in this file, set once the
    /// file is finished.
    pub max_lsn: Lsn,
}

impl FileHeader {
    pub(crate) fn serialize(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0; FILE_HEADER_LEN];
        buf[..MAGIC.len()].copy_from_slice(&MAGIC);
        buf[TIMESTAMP_OFFSET..VERSION_OFFSET].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[VERSION_OFFSET..SERVER_VERSION_OFFSET].copy_from_slice(&self.version.to_le_bytes());
        buf[SERVER_VERSION_OFFSET..SERVER_ID_OFFSET]
            .copy_from_slice(&self.server_version.to_le_bytes());
        buf[SERVER_ID_OFFSET..PAGE_SIZE_OFFSET].copy_from_slice(&self.server_id.to_le_bytes());
        buf[PAGE_SIZE_OFFSET..FILE_NUMBER_OFFSET]
            .copy_from_slice(&self.page_size.to_le_bytes());
        store_u24(&mut buf[FILE_NUMBER_OFFSET..], self.file_number);
        buf[MAX_LSN_OFFSET..].copy_from_slice(&self.max_lsn.store());
        buf
    }

    pub(crate) fn deserialize(buf: &[u8], file_number: u32) -> Result<FileHeader> {
        let at = Lsn::new(file_number, 0);
        if buf.len() < FILE_HEADER_LEN || buf[..MAGIC.len()] != MAGIC {
            return Err(Error::corruption(at, "bad log file magic"));
        }

        let u32_at = |offset: usize| {
            u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
        };

        let mut timestamp = [0; 8];
        timestamp.copy_from_slice(&buf[TIMESTAMP_OFFSET..VERSION_OFFSET]);

        let header = FileHeader {
            timestamp: u64::from_le_bytes(timestamp),
            version: u32_at(VERSION_OFFSET),
            server_version: u32_at(SERVER_VERSION_OFFSET),
            server_id: u32_at(SERVER_ID_OFFSET),
            page_size: u16::from_le_bytes([buf[PAGE_SIZE_OFFSET], buf[PAGE_SIZE_OFFSET + 1]]),
            file_number: load_u24(&buf[FILE_NUMBER_OFFSET..]),
            max_lsn: Lsn::load(&buf[MAX_LSN_OFFSET..]),
        };

        if header.file_number != file_number {
            return Err(Error::corruption(
                at,
                format!("file header claims to be file {}", header.file_number),
            ));
        }
        if header.version != LOG_FORMAT_VERSION {
            return Err(Error::Unsupported(format!(
                "log file {} has format version {}, expected {}",
                file_number, header.version, LOG_FORMAT_VERSION
            )));
        }

        Ok(header)
    }
}

#[cfg(unix)]
pub(crate) mod sys_io {
    use std::io;
    use std::os::unix::fs::FileExt;

    use super::*;

    pub(crate) fn read_exact_at<F: FileExt>(
        file: &F,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.read_exact_at(buf, offset))
    }

    pub(crate) fn write_all_at<F: FileExt>(
        file: &F,
        buf: &[u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.write_all_at(buf, offset))
    }
}

#[cfg(windows)]
pub(crate) mod sys_io {
    use std::io;
    use std::os::windows::fs::FileExt;

    use super::*;

    pub(crate) fn read_exact_at<F: FileExt>(
        file: &F,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_read(buf, offset)) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        if !buf.is_empty() {
            Err(annotate!(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "log file ended inside a page"
            )))
        } else {
            Ok(())
        }
    }

    pub(crate) fn write_all_at<F: FileExt>(
        file: &F,
        mut buf: &[u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_write(buf, offset)) {
                Ok(0) => {
                    return Err(annotate!(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write to log file",
                    )));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct LogFile {
    pub number: u32,
    pub file: fs::File,
    /// Set when recovery found damage in this file and cut it back.
    was_recovered: AtomicBool,
    is_sync: AtomicBool,
    /// Bytes written so far. Writes within a file land in address order.
    len: AtomicU64,
}

impl LogFile {
    fn new(number: u32, file: fs::File, len: u64) -> LogFile {
        LogFile {
            number,
            file,
            was_recovered: AtomicBool::new(false),
            is_sync: AtomicBool::new(true),
            len: AtomicU64::new(len),
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        sys_io::read_exact_at(&self.file, buf, offset)
    }

    /// Positional write. The file stays unsynced until the next
    /// `FileManager::sync_files`.
    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.is_sync.store(false, Ordering::Release);
        sys_io::write_all_at(&self.file, buf, offset)?;
        self.len.fetch_max(offset + buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn truncate(&self, len: u64) -> io::Result<()> {
        fallible!(self.file.set_len(len));
        self.len.store(len, Ordering::Release);
        self.is_sync.store(false, Ordering::Release);
        self.mark_recovered();
        Ok(())
    }

    pub(crate) fn mark_recovered(&self) {
        self.was_recovered.store(true, Ordering::Release);
    }

    pub(crate) fn was_recovered(&self) -> bool {
        self.was_recovered.load(Ordering::Acquire)
    }

    fn sync(&self) -> io::Result<()> {
        if self.is_sync.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = maybe!(self.file.sync_all()) {
            self.is_sync.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Files {
    /// Number of the first entry of `table`.
    min: u32,
    table: VecDeque<Arc<LogFile>>,
}

impl Files {
    fn get(&self, number: u32) -> Option<&Arc<LogFile>> {
        let index = number.checked_sub(self.min)?;
        self.table.get(index as usize)
    }
}

#[derive(Debug)]
pub(crate) struct FileManager {
    dir: PathBuf,
    page_size: usize,
    server_id: u32,
    server_version: u32,
    read_only: bool,
    sync_dir: SyncDirPolicy,
    purge: PurgeMode,
    files: RwLock<Files>,
    dir_dirty: AtomicBool,
    directory_lock: fs::File,
}

impl FileManager {
    /// Opens (and for a writable log creates) the log directory and takes
    /// the directory lock.
    pub(crate) fn open(config: &Config) -> Result<FileManager> {
        if !config.read_only {
            if let Err(e) = fs::read_dir(&config.path) {
                if e.kind() == io::ErrorKind::NotFound {
                    fallible!(fs::create_dir_all(&config.path));
                }
            }
            let _ = fs::File::create(config.path.join(WARN));
        }

        let directory_lock = fallible!(fs::File::open(&config.path));
        if config.read_only {
            fallible!(FileExt::try_lock_shared(&directory_lock));
        } else {
            fallible!(FileExt::try_lock_exclusive(&directory_lock));
        }

        Ok(FileManager {
            dir: config.path.clone(),
            page_size: config.page_size,
            server_id: config.server_id,
            server_version: config.server_version,
            read_only: config.read_only,
            sync_dir: config.sync_dir,
            purge: config.purge,
            files: RwLock::new(Files::default()),
            dir_dirty: AtomicBool::new(false),
            directory_lock,
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn directory_lock(&self) -> &fs::File {
        &self.directory_lock
    }

    pub(crate) fn file_path(&self, number: u32) -> PathBuf {
        file_path(&self.dir, number)
    }

    /// Numbers of the log files present in the directory, ascending.
    pub(crate) fn list(&self) -> Result<Vec<u32>> {
        let mut numbers = vec![];
        for dir_entry_res in fallible!(fs::read_dir(&self.dir)) {
            let dir_entry = fallible!(dir_entry_res);
            let Ok(file_name) = dir_entry.file_name().into_string() else {
                continue;
            };
            let Some(suffix) = file_name.strip_prefix(FILE_PREFIX) else {
                continue;
            };
            match suffix.parse::<u32>() {
                Ok(number) if suffix.len() == 8 => numbers.push(number),
                _ => log::warn!("ignoring unexpected file {:?} in log directory", file_name),
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    pub(crate) fn exists(&self, number: u32) -> bool {
        self.file_path(number).exists()
    }

    /// Opens an existing file and reads its header. Does not register it.
    pub(crate) fn open_existing(&self, number: u32) -> Result<(LogFile, FileHeader)> {
        let mut options = fs::OpenOptions::new();
        options.read(true).write(!self.read_only);
        let file = fallible!(options.open(self.file_path(number)));
        let len = fallible!(file.metadata()).len();

        let mut buf = [0; FILE_HEADER_LEN];
        if len < FILE_HEADER_LEN as u64 {
            return Err(Error::corruption(Lsn::new(number, 0), "log file shorter than its header"));
        }
        fallible!(sys_io::read_exact_at(&file, &mut buf, 0));

        let header = FileHeader::deserialize(&buf, number)?;
        if header.page_size as usize != self.page_size {
            return Err(Error::Unsupported(format!(
                "log file {} was written with {} byte pages but the configured page size is {}",
                number, header.page_size, self.page_size
            )));
        }

        Ok((LogFile::new(number, file, len), header))
    }

    /// Registers recovered files, lowest first.
    pub(crate) fn install(&self, recovered: Vec<LogFile>) {
        let mut files = self.files.write();
        files.min = recovered.first().map_or(0, |f| f.number);
        files.table = recovered.into_iter().map(Arc::new).collect();
    }

    /// Creates the next log file, writing its header page.
    pub(crate) fn create(&self, number: u32) -> Result<Arc<LogFile>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();

        let header = FileHeader {
            timestamp,
            version: LOG_FORMAT_VERSION,
            server_version: self.server_version,
            server_id: self.server_id,
            page_size: self.page_size as u16,
            file_number: number,
            max_lsn: Lsn::IMPOSSIBLE,
        };

        let mut page = vec![0; self.page_size];
        page[..FILE_HEADER_LEN].copy_from_slice(&header.serialize());

        let mut options = fs::OpenOptions::new();
        options.create_new(true).read(true).write(true);
        let file = fallible!(options.open(self.file_path(number)));
        let log_file = Arc::new(LogFile::new(number, file, 0));
        log_file.write_at(&page, 0)?;

        let mut files = self.files.write();
        if files.table.is_empty() {
            files.min = number;
        }
        assert_eq!(files.min + files.table.len() as u32, number);
        files.table.push_back(log_file.clone());
        drop(files);

        self.dir_dirty.store(true, Ordering::Release);
        log::info!("created log file {:?}", self.file_path(number));

        Ok(log_file)
    }

    pub(crate) fn get(&self, number: u32) -> Result<Arc<LogFile>> {
        self.files.read().get(number).cloned().ok_or_else(|| {
            Error::Unsupported(format!("log file {} is not part of the log", number))
        })
    }

    pub(crate) fn min_file(&self) -> u32 {
        self.files.read().min
    }

    pub(crate) fn max_file(&self) -> u32 {
        let files = self.files.read();
        files.min + (files.table.len() as u32).saturating_sub(1)
    }

    /// Where the pages of `number` end: the written length for finished
    /// files, at least `file_size` for the file being written.
    pub(crate) fn file_end(&self, number: u32, file_size: usize) -> Option<u64> {
        let files = self.files.read();
        let file = files.get(number)?;
        let is_last = number + 1 == files.min + files.table.len() as u32;
        if is_last { Some(file.len().max(file_size as u64)) } else { Some(file.len()) }
    }

    /// Stores the address of the last record of a finished file in its header.
    pub(crate) fn set_max_lsn(&self, number: u32, max_lsn: Lsn) -> Result<()> {
        let file = self.get(number)?;
        file.write_at(&max_lsn.store(), MAX_LSN_OFFSET as u64)?;
        Ok(())
    }

    /// Numbers of the registered files recovery had to repair.
    pub(crate) fn recovered_files(&self) -> Vec<u32> {
        let files = self.files.read();
        files.table.iter().filter(|file| file.was_recovered()).map(|file| file.number).collect()
    }

    /// fsyncs every file written since its last sync, then the directory
    /// if the sync policy asks for it.
    pub(crate) fn sync_files(&self) -> Result<()> {
        let files: Vec<Arc<LogFile>> = self.files.read().table.iter().cloned().collect();
        for file in files {
            file.sync()?;
        }

        let sync_dir = match self.sync_dir {
            SyncDirPolicy::Never => false,
            SyncDirPolicy::NewFile => self.dir_dirty.swap(false, Ordering::AcqRel),
            SyncDirPolicy::Always => true,
        };
        if sync_dir {
            log::trace!("syncing log directory {:?}", self.dir);
            if let Err(e) = maybe!(self.directory_lock.sync_all()) {
                self.dir_dirty.store(true, Ordering::Release);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Drops every file below `number` from the log. Returns how many were
    /// purged.
    pub(crate) fn purge_below(&self, number: u32) -> Result<usize> {
        let mut purged = vec![];
        {
            let mut files = self.files.write();
            while files.min < number && files.table.len() > 1 {
                if let Some(file) = files.table.pop_front() {
                    purged.push(file);
                }
                files.min += 1;
            }
        }

        for file in &purged {
            let path = self.file_path(file.number);
            match self.purge {
                PurgeMode::Immediate => {
                    log::debug!("removing purged log file {:?}", path);
                    fallible!(fs::remove_file(&path));
                    self.dir_dirty.store(true, Ordering::Release);
                }
                PurgeMode::External => {
                    log::debug!("leaving purged log file {:?} in place", path);
                }
            }
        }

        Ok(purged.len())
    }

    /// Removes a file that never became part of the log, such as a last
    /// file whose header did not make it to disk.
    pub(crate) fn remove_unregistered(&self, number: u32) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let path = self.file_path(number);
        log::warn!("removing unusable log file {:?}", path);
        fallible!(fs::remove_file(&path));
        self.dir_dirty.store(true, Ordering::Release);
        Ok(())
    }
}

pub(crate) fn file_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{:08}", number))
}

/// Finds the lowest file of the contiguous run of files ending at `hi`.
/// `exists(hi)` must hold.
pub(crate) fn lowest_file<F: Fn(u32) -> bool>(lo: u32, hi: u32, exists: F) -> u32 {
    let (mut lo, mut hi) = (lo.min(hi), hi);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if exists(mid) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layout() {
        let header = FileHeader {
            timestamp: 0x0102_0304_0506_0708,
            version: LOG_FORMAT_VERSION,
            server_version: 80_036,
            server_id: 7,
            page_size: 8192,
            file_number: 42,
            max_lsn: Lsn::new(42, 0x1234),
        };
        let buf = header.serialize();
        assert_eq!(buf.len(), 44);
        assert_eq!(&buf[4..12], b"MARIALOG");
        assert_eq!(FileHeader::deserialize(&buf, 42).unwrap(), header);

        assert!(matches!(
            FileHeader::deserialize(&buf, 43),
            Err(Error::Corruption { .. })
        ));

        let mut bad = buf;
        bad[5] = b'X';
        assert!(FileHeader::deserialize(&bad, 42).is_err());
    }

    #[test]
    fn file_names() {
        let path = file_path(Path::new("/log"), 3);
        assert_eq!(path, Path::new("/log/aria_log.00000003"));
    }

    #[test]
    fn lowest_file_search() {
        let present = |n: u32| (5..=9).contains(&n);
        assert_eq!(lowest_file(1, 9, present), 5);
        assert_eq!(lowest_file(5, 9, present), 5);
        assert_eq!(lowest_file(7, 9, present), 7);
        assert_eq!(lowest_file(9, 9, present), 9);
    }
}
