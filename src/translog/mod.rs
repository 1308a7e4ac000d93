//! The write-ahead transaction log.
//!
//! Records are appended into a ring of page-formatted write buffers under a
//! single log lock that only reserves space; the record bytes are copied in
//! after the lock is released. Buffers reach the log files in ring order,
//! and `flush` makes everything below an address durable.

mod buffer;
mod chunk;
mod control;
mod file_manager;
mod flush;
mod lsn;
mod page;
mod page_cache;
mod reader;
mod record;
mod recovery;
mod writer;

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicPtr, Ordering},
    },
};

use parking_lot::{Condvar, Mutex};

use crate::{Config, Error, Result, flusher::Flusher};

use self::{
    buffer::{BufferState, Ring},
    control::ControlState,
    file_manager::FileManager,
    flush::FlushProgress,
    page::PageGeometry,
    page_cache::PageCache,
    reader::Reader,
    recovery::Recovered,
    writer::Cursor,
};

pub use self::{
    lsn::{
        LSN_STORE_SIZE, Lsn, MAX_FILE_NUMBER, TranslogAddress, decode_diff, diff_size,
        encode_diff,
    },
    page::{DISK_DRIVE_SECTOR_SIZE, PAGE_CRC, PAGE_RECORD_CRC, PAGE_SECTOR_PROTECTION},
    reader::Iter,
    record::{Record, RecordClass, RecordKind, Transaction},
};

fn set_error(global_error: &AtomicPtr<(io::ErrorKind, String)>, error: &io::Error) {
    let kind = error.kind();
    let reason = error.to_string();

    let boxed = Box::new((kind, reason));
    let ptr = Box::into_raw(boxed);

    if global_error
        .compare_exchange(std::ptr::null_mut(), ptr, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // global fatal error already installed, drop this one
        unsafe {
            drop(Box::from_raw(ptr));
        }
    }
}

/// State shared by every handle of an open log and its flusher thread.
pub(crate) struct Shared {
    pub config: Config,
    pub geometry: PageGeometry,
    pub files: FileManager,
    pub cache: PageCache,
    pub ring: Ring,
    /// The log lock. Held only to reserve space and write headers.
    pub log: Mutex<Cursor>,
    pub flush: Mutex<FlushProgress>,
    pub flush_cv: Condvar,
    pub control: Mutex<ControlState>,
    global_error: AtomicPtr<(io::ErrorKind, String)>,
}

impl Shared {
    fn new(config: Config) -> Result<Shared> {
        let files = FileManager::open(&config)?;
        Ok(Shared {
            geometry: PageGeometry::new(config.page_size, config.page_flags()),
            cache: PageCache::new(config.cache_capacity),
            ring: Ring::new(config.buffers, config.buffer_size),
            log: Mutex::new(Cursor::default()),
            flush: Mutex::new(FlushProgress::default()),
            flush_cv: Condvar::new(),
            control: Mutex::new(ControlState::default()),
            global_error: AtomicPtr::default(),
            files,
            config,
        })
    }

    pub(crate) fn check_error(&self) -> Result<()> {
        let err_ptr: *const (io::ErrorKind, String) = self.global_error.load(Ordering::Acquire);

        if err_ptr.is_null() {
            Ok(())
        } else {
            let deref: &(io::ErrorKind, String) = unsafe { &*err_ptr };
            Err(Error::Io(io::Error::new(deref.0, deref.1.clone())))
        }
    }

    fn has_failed(&self) -> bool {
        !self.global_error.load(Ordering::Acquire).is_null()
    }

    /// Makes the log read-only after an I/O failure. Wakes every thread
    /// waiting on the ring or on a flush so they see the error.
    pub(crate) fn fail(&self, error: Error) -> Error {
        if !matches!(error, Error::Io(_)) || self.has_failed() {
            return error;
        }

        log::error!("log write failed, refusing further writes: {}", error);
        let io_error: io::Error = error.clone().into();
        set_error(&self.global_error, &io_error);

        self.ring.notify_all();

        // having held the mutex makes this linearized
        // with the notify below.
        drop(self.flush.lock());
        let _notified = self.flush_cv.notify_all();

        error
    }

    /// Takes over the state recovery found on disk.
    fn resume(&self, recovered: Recovered) {
        let page_size = self.config.page_size;
        let seq = 1;
        let buf = self.ring.buffer_for(seq);

        let (buf_start, page_counter) = match &recovered.tail {
            Some(tail) => (recovered.horizon.page_start(page_size), tail.write_counter),
            None => (recovered.horizon, 0),
        };

        let mut log = self.log.lock();
        {
            let mut meta = buf.lock();
            meta.state = BufferState::Active;
            meta.seq = seq;
            meta.file = buf_start.file();
            meta.offset = buf_start;
            meta.size = 0;
            meta.writers = 0;
            meta.first_page_counter = page_counter;
            meta.closes_file = None;
        }

        if let Some(tail) = &recovered.tail {
            // the buffer is ours alone until the log lock is released
            unsafe { buf.write_at(0, &tail.bytes) };
        }

        *log = Cursor {
            horizon: recovered.horizon,
            seq,
            buf_start,
            page_counter,
            last_lsn: recovered.last_lsn,
        };
        drop(log);

        self.flush.lock().flushed = recovered.horizon;
        *self.control.lock() = recovered.control;
    }

    pub(crate) fn horizon(&self) -> Lsn {
        self.log.lock().horizon
    }

    pub(crate) fn flushed(&self) -> Lsn {
        self.flush.lock().flushed
    }

    pub(crate) fn log_start(&self) -> Lsn {
        Lsn::new(self.files.min_file(), self.config.page_size as u32)
    }

    pub(crate) fn reader(&self, end: Lsn) -> Reader<'_, Shared> {
        Reader::new(self, self.config.page_size, end)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();

        let err_ptr = self.global_error.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !err_ptr.is_null() {
            unsafe {
                drop(Box::from_raw(err_ptr));
            }
        }
    }
}

impl Shared {
    fn close(&self) {
        if self.config.temporary {
            // a generated tempdir removes itself
            if self.config.tempdir_deleter.is_none() {
                log::debug!("removing temporary log at {:?}", self.config.path);
                if let Err(e) = std::fs::remove_dir_all(&self.config.path) {
                    log::error!("failed to remove temporary log {:?}: {}", self.config.path, e);
                }
            }
            return;
        }
        if self.config.read_only || self.has_failed() {
            return;
        }
        if let Err(e) = self.flush_all() {
            log::error!("failed to flush log on shutdown: {}", e);
        }
    }
}

/// An open transaction log.
///
/// Handles are cheap to clone and may be shared across threads. The log is
/// flushed and closed when the last handle drops.
///
/// # Examples
///
/// ```
/// use translog::{Config, RecordKind, Transaction};
///
/// let log = Config::new().temporary(true).flush_every_ms(None).open()?;
///
/// let mut trn = Transaction::new(1, 0);
/// let lsn = log.write_record(RecordKind::RedoInsertRow, &mut trn, b"row")?;
/// log.flush(lsn)?;
///
/// assert_eq!(log.read_record(lsn)?.body, b"row");
/// # Ok::<(), translog::Error>(())
/// ```
#[derive(Clone)]
pub struct Translog {
    // the flusher is declared first so it is joined before
    // the shared state can be dropped.
    flusher: Arc<Mutex<Option<Flusher>>>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Translog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translog")
            .field("path", &self.shared.config.path)
            .field("horizon", &self.horizon())
            .field("flushed", &self.flushed())
            .finish()
    }
}

impl Translog {
    /// Opens the log described by `config`, recovering whatever a previous
    /// process left behind. Called through `Config::open`.
    pub(crate) fn start(config: Config) -> Result<Translog> {
        log::trace!("opening log at {:?}", config.path);
        let shared = Shared::new(config)?;

        let recovered = recovery::recover(&shared)?;
        log::info!(
            "log at {:?} recovered, horizon {} last record {}",
            shared.config.path,
            recovered.horizon,
            recovered.last_lsn
        );
        shared.resume(recovered);

        let shared = Arc::new(shared);

        let flusher = match shared.config.flush_every_ms {
            Some(flush_every_ms) if !shared.config.read_only => Some(Flusher::new(
                "translog flusher".to_owned(),
                shared.clone(),
                flush_every_ms,
            )?),
            _ => None,
        };

        Ok(Translog { flusher: Arc::new(Mutex::new(flusher)), shared })
    }

    /// Appends a record to the log and returns its address.
    ///
    /// The transaction's bookkeeping (`rec_lsn`, `undo_lsn`,
    /// `first_undo_lsn`, `commit_lsn`) is updated under the log lock. The
    /// first record of a transaction with a long id is preceded by a
    /// `LongTransactionId` record.
    ///
    /// The record is durable only once `flush` has been called with an
    /// address at or past it.
    pub fn write_record(
        &self,
        kind: RecordKind,
        trn: &mut Transaction,
        body: &[u8],
    ) -> Result<Lsn> {
        self.shared.write_record(kind, trn, body)
    }

    /// Makes every record at or below `lsn` durable. Concurrent callers
    /// share one flush pass.
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        self.shared.flush(lsn)
    }

    /// Makes everything written so far durable.
    pub fn flush_all(&self) -> Result<()> {
        self.shared.flush_all()
    }

    /// Reads back the record at `lsn`, flushing the log up to it first.
    pub fn read_record(&self, lsn: Lsn) -> Result<Record> {
        self.shared.check_error()?;
        let start = self.log_start();
        let horizon = self.horizon();
        if lsn < start || lsn >= horizon {
            return Err(Error::Unsupported(format!(
                "{} is outside of the log [{}, {})",
                lsn, start, horizon
            )));
        }

        self.shared.flush(lsn)?;
        self.shared.reader(self.flushed()).read(lsn)
    }

    /// Iterates over every record from the start of the log.
    pub fn iter(&self) -> Result<Iter> {
        self.iter_from(self.log_start())
    }

    /// Iterates over the records starting at `lsn`, which must be the
    /// address of a record or of a page start. Everything written before
    /// the call is flushed and visited.
    pub fn iter_from(&self, lsn: Lsn) -> Result<Iter> {
        self.shared.check_error()?;
        let lsn = lsn.max(self.log_start());
        self.shared.flush_all()?;
        Ok(Iter::new(self.shared.clone(), lsn, self.flushed()))
    }

    /// The address the next record will be written at or after.
    pub fn horizon(&self) -> Lsn {
        self.shared.horizon()
    }

    /// Everything below this address is durable.
    pub fn flushed(&self) -> Lsn {
        self.shared.flushed()
    }

    /// The first address still present in the log files.
    pub fn log_start(&self) -> Lsn {
        self.shared.log_start()
    }

    /// The address of the most recently written record.
    pub fn last_lsn(&self) -> Lsn {
        self.shared.log.lock().last_lsn
    }

    /// The most recent checkpoint, `Lsn::IMPOSSIBLE` if none was taken.
    pub fn last_checkpoint(&self) -> Lsn {
        self.shared.control.lock().checkpoint
    }

    /// Records `lsn` as the last checkpoint in the control file after
    /// making the log durable up to it.
    pub fn checkpoint(&self, lsn: Lsn) -> Result<()> {
        self.shared.checkpoint(lsn)
    }

    /// Removes the log files that lie wholly below `lsn`. Files at or past
    /// the last checkpoint or the flushed horizon are kept. Returns the
    /// number of files purged.
    ///
    /// Records before the checkpoint may lose groups that lived in a
    /// purged file. Replay from the checkpoint with `iter_from`.
    pub fn purge(&self, lsn: Lsn) -> Result<usize> {
        self.shared.purge(lsn)
    }

    /// Whether the log refuses writes, either because it was opened
    /// read-only or because an I/O error made it so.
    pub fn is_read_only(&self) -> bool {
        self.shared.config.read_only || self.shared.has_failed()
    }

    /// Numbers of the log files currently making up the log.
    pub fn files(&self) -> std::ops::RangeInclusive<u32> {
        self.shared.files.min_file()..=self.shared.files.max_file()
    }

    /// Numbers of the log files that recovery found damaged and cut back
    /// when this log was opened.
    pub fn recovered_files(&self) -> Vec<u32> {
        self.shared.files.recovered_files()
    }
}

impl Shared {
    pub(crate) fn checkpoint(&self, lsn: Lsn) -> Result<()> {
        self.check_error()?;
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        if lsn.is_impossible() || lsn >= self.horizon() {
            return Err(Error::Unsupported(format!(
                "cannot checkpoint at {}, which is not in the written log",
                lsn
            )));
        }

        self.flush(lsn)?;

        let mut control = self.control.lock();
        let next = ControlState {
            checkpoint: lsn,
            min_file: self.files.min_file(),
            last_file: self.files.max_file(),
        };
        control::write(self.files.dir(), self.files.directory_lock(), &next)
            .map_err(|e| self.fail(e))?;
        *control = next;
        log::debug!("checkpoint at {}", lsn);
        Ok(())
    }

    pub(crate) fn purge(&self, lsn: Lsn) -> Result<usize> {
        self.check_error()?;
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }

        let flushed = self.flushed();
        let mut control = self.control.lock();
        if control.checkpoint.is_impossible() {
            log::debug!("not purging, no checkpoint was taken yet");
            return Ok(0);
        }

        let below = lsn.file().min(control.checkpoint.file()).min(flushed.file());
        let old_min = self.files.min_file();
        let purged = self.files.purge_below(below).map_err(|e| self.fail(e))?;
        if purged == 0 {
            return Ok(0);
        }

        let new_min = self.files.min_file();
        for file in old_min..new_min {
            self.cache.flush_all(file);
        }

        let next = ControlState { min_file: new_min, ..*control };
        control::write(self.files.dir(), self.files.directory_lock(), &next)
            .map_err(|e| self.fail(e))?;
        *control = next;

        log::info!("purged {} log files, log now starts in file {}", purged, new_min);
        Ok(purged)
    }
}
