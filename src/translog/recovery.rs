//! Finding the end of the log after a restart.
//!
//! The lowest live file is found by binary search from the control file's
//! hint, headers are checked for every file, then the last file is walked
//! forward from the last checkpoint (or its first page) until a page fails
//! validation or is not full. The last record found is read back in full;
//! if that fails the log is cut back to just before it.

use rayon::prelude::*;

use crate::{
    Error, PageError, Result,
    translog::{
        Lsn, Shared,
        chunk::Chunks,
        control::{self, ControlState},
        file_manager::{FileHeader, LogFile, lowest_file},
        page::{FILLER, PageView, SECTOR_EPOCH_TOLERANCE},
    },
};

/// The still-valid head of the page holding the horizon.
#[derive(Debug)]
pub(crate) struct Tail {
    /// Clean bytes from the page start up to the horizon.
    pub bytes: Vec<u8>,
    /// Counter the page is written with next.
    pub write_counter: u8,
}

#[derive(Debug)]
pub(crate) struct Recovered {
    pub horizon: Lsn,
    pub last_lsn: Lsn,
    pub tail: Option<Tail>,
    pub control: ControlState,
}

/// A page as recovery found it on disk, in its clean form.
struct LoadedPage {
    clean: Vec<u8>,
    write_counter: u8,
    /// Offset of the torn sector. `clean` was cut back in front of it.
    torn_at: Option<usize>,
}

/// The outcome of walking the last file forward.
#[derive(Debug, Default)]
struct Scan {
    horizon: Lsn,
    last_start: Lsn,
    prev_start: Lsn,
    /// Page number, clean contents and counter of a partially valid last
    /// page.
    tail_page: Option<(u32, Vec<u8>, u8)>,
    /// The tail page was cut back and must be rewritten.
    damaged: bool,
}

pub(crate) fn recover(shared: &Shared) -> Result<Recovered> {
    let files = &shared.files;
    let control = control::read(files.dir())?;
    let present = files.list()?;

    let Some(&max) = present.last() else {
        return start_fresh(shared, control);
    };

    let hint = control.map_or(1, |c| c.min_file.max(1)).min(max);
    let lowest = lowest_file(hint, max, |n| files.exists(n));
    for stale in present.iter().filter(|n| **n < lowest) {
        log::warn!(
            "ignoring log file {:?}, it is not contiguous with the rest of the log",
            files.file_path(*stale)
        );
    }

    let mut opened: Vec<Result<(LogFile, FileHeader)>> =
        (lowest..=max).into_par_iter().map(|n| files.open_existing(n)).collect();

    // a crash while creating the last file can leave it without a header
    if let Some(Err(Error::Corruption { .. })) = opened.last() {
        if !shared.config.read_only {
            log::warn!("last log file {} has no valid header", max);
            opened.pop();
            files.remove_unregistered(max)?;
        }
    }

    let (log_files, headers): (Vec<LogFile>, Vec<FileHeader>) =
        opened.into_iter().collect::<Result<Vec<_>>>()?.into_iter().unzip();
    if log_files.is_empty() {
        return start_fresh(shared, control);
    }
    files.install(log_files);

    let mut control = control.unwrap_or_default();
    let last = files.max_file();
    let page_size = shared.config.page_size;

    let mut scan = scan_forward(shared, last, control.checkpoint)?;
    if scan.last_start.is_impossible() {
        let (last_start, prev_start) = scan_backward(shared, last, scan.horizon)?;
        scan.last_start = last_start;
        scan.prev_start = prev_start;
    }
    if scan.last_start.is_impossible() {
        scan.last_start = headers
            .iter()
            .rev()
            .map(|header| header.max_lsn)
            .find(|lsn| !lsn.is_impossible())
            .unwrap_or(Lsn::IMPOSSIBLE);
    }

    let mut horizon = scan.horizon;
    let mut last_lsn = scan.last_start;

    if !last_lsn.is_impossible() {
        if let Err(e) = shared.reader(horizon).read(last_lsn) {
            if last_lsn.file() != last {
                return Err(e);
            }
            log::warn!(
                "last record at {} is incomplete ({}), cutting the log back to it",
                last_lsn,
                e
            );
            let cut = last_lsn;
            let page = cut.page_number(page_size);
            files.get(last)?.mark_recovered();
            let clean = shared.page_clean(last, page)?;
            for stale in page + 1..=horizon.page_number(page_size) {
                shared.cache.invalidate(last, stale);
            }
            scan.tail_page = Some((page, clean, 0));
            scan.damaged = true;
            horizon = cut;
            last_lsn = scan.prev_start;
        }
    }

    let mut tail = None;
    if let Some((page, mut clean, counter)) = scan.tail_page.take() {
        let used = horizon.page_offset(page_size);
        clean[used..].fill(FILLER);

        let counter = if scan.damaged && !shared.config.read_only {
            rewrite_page(shared, last, page, &clean)?;
            0
        } else {
            counter
        };
        shared.cache.write(last, page, &clean);

        if counter >= SECTOR_EPOCH_TOLERANCE {
            // the page cannot take another rewrite, continue on the next
            horizon = horizon.page_start(page_size).add(page_size);
        } else {
            clean.truncate(used);
            tail = Some(Tail { bytes: clean, write_counter: counter + 1 });
        }
    }

    if !shared.config.read_only {
        let file = files.get(last)?;
        let keep = match &tail {
            Some(_) => u64::from(horizon.page_start(page_size).offset()) + page_size as u64,
            None => u64::from(horizon.offset()),
        };
        if file.len() > keep {
            log::warn!("truncating log file {} from {} to {} bytes", last, file.len(), keep);
            file.truncate(keep)?;
        }
    }

    if control.checkpoint >= horizon {
        log::warn!(
            "checkpoint {} lies past the recovered end of the log {}, forgetting it",
            control.checkpoint,
            horizon
        );
        control.checkpoint = Lsn::IMPOSSIBLE;
    }
    control.min_file = files.min_file();
    control.last_file = last;

    if !shared.config.read_only {
        control::write(files.dir(), files.directory_lock(), &control)?;
        files.sync_files()?;
    }

    Ok(Recovered { horizon, last_lsn, tail, control })
}

fn start_fresh(shared: &Shared, control: Option<ControlState>) -> Result<Recovered> {
    if shared.config.read_only {
        return Err(Error::Unsupported(format!(
            "there is no log at {:?} to open read-only",
            shared.config.path
        )));
    }

    let first = control.map_or(1, |c| c.last_file + 1).max(1);
    log::info!("starting a new log at {:?} with file {}", shared.config.path, first);
    shared.files.create(first)?;

    let control = ControlState { checkpoint: Lsn::IMPOSSIBLE, min_file: first, last_file: first };
    control::write(shared.files.dir(), shared.files.directory_lock(), &control)?;
    shared.files.sync_files()?;

    Ok(Recovered {
        horizon: Lsn::new(first, shared.config.page_size as u32),
        last_lsn: Lsn::IMPOSSIBLE,
        tail: None,
        control,
    })
}

impl Shared {
    /// Reads and validates a page without going through the cache.
    /// `None` if it fails validation and nothing of it can be kept.
    fn load_page(&self, file: &LogFile, page: u32) -> Result<Option<LoadedPage>> {
        let page_size = self.config.page_size;
        let mut buf = vec![0; page_size];
        file.read_at(&mut buf, u64::from(page) * page_size as u64)?;

        match self.geometry.validate(&mut buf, page, file.number) {
            Ok(check) => Ok(Some(LoadedPage {
                clean: buf,
                write_counter: check.write_counter,
                torn_at: None,
            })),
            Err(PageError::SectorCorrupt { torn_at, kept, write_counter }) => {
                log::warn!(
                    "log page {} of file {} has a torn sector at byte {}, keeping {} bytes",
                    page,
                    file.number,
                    torn_at,
                    kept
                );
                Ok(Some(LoadedPage { clean: buf, write_counter, torn_at: Some(torn_at) }))
            }
            Err(error) => {
                log::warn!("log page {} of file {} is invalid: {}", page, file.number, error);
                Ok(None)
            }
        }
    }

    fn page_clean(&self, file: u32, page: u32) -> Result<Vec<u8>> {
        use crate::translog::reader::PageSource;

        Ok(self.page(file, page)?.to_vec())
    }
}

fn scan_forward(shared: &Shared, last: u32, checkpoint: Lsn) -> Result<Scan> {
    let page_size = shared.config.page_size;
    let file = shared.files.get(last)?;
    let pages = (file.len() / page_size as u64) as u32;

    let first_page = if checkpoint.file() == last && checkpoint.offset() as usize >= page_size {
        checkpoint.page_number(page_size)
    } else {
        1
    };

    let mut scan = Scan { horizon: Lsn::new(last, first_page * page_size as u32), ..Scan::default() };

    for page in first_page..pages {
        let page_start = Lsn::new(last, page * page_size as u32);
        let Some(LoadedPage { mut clean, write_counter, torn_at }) =
            shared.load_page(&file, page)?
        else {
            scan.horizon = page_start;
            file.mark_recovered();
            break;
        };

        let header_len = PageView::new(&clean).header_len();
        let mut chunks = Chunks::new(&clean, header_len);
        let mut bad_chunk = false;
        for chunk in &mut chunks {
            match chunk {
                Ok(chunk) if chunk.kind.starts_record() => {
                    scan.prev_start = scan.last_start;
                    scan.last_start = page_start.add(chunk.offset);
                }
                Ok(_) => {}
                Err(offset) => {
                    log::warn!("unparseable chunk at {}", page_start.add(offset));
                    bad_chunk = true;
                }
            }
        }
        let end = chunks.end();

        // pages padded with filler are only partial at the end of the file
        let is_last = page + 1 == pages;
        if torn_at.is_none() && !bad_chunk && (end == page_size || !is_last) {
            scan.horizon = page_start.add(page_size);
            shared.cache.write(last, page, &clean);
            continue;
        }

        clean[end..].fill(FILLER);
        scan.horizon = page_start.add(end);
        scan.damaged = torn_at.is_some() || bad_chunk;
        if scan.damaged {
            file.mark_recovered();
        }
        scan.tail_page = Some((page, clean, write_counter));
        break;
    }

    Ok(scan)
}

/// Finds the last two record starts of `last` below `before`, walking back
/// page by page.
fn scan_backward(shared: &Shared, last: u32, before: Lsn) -> Result<(Lsn, Lsn)> {
    let page_size = shared.config.page_size;
    let file = shared.files.get(last)?;
    let mut found: Vec<Lsn> = vec![];

    let mut page = before.page_number(page_size);
    while page >= 1 && found.len() < 2 {
        let page_start = Lsn::new(last, page * page_size as u32);
        if let Some(LoadedPage { clean, .. }) = shared.load_page(&file, page)? {
            let header_len = PageView::new(&clean).header_len();
            let starts: Vec<Lsn> = Chunks::new(&clean, header_len)
                .map_while(|chunk| chunk.ok())
                .filter(|chunk| chunk.kind.starts_record())
                .map(|chunk| page_start.add(chunk.offset))
                .filter(|lsn| *lsn < before)
                .collect();
            for lsn in starts.into_iter().rev() {
                found.push(lsn);
            }
        }
        page -= 1;
    }

    let last_start = found.first().copied().unwrap_or(Lsn::IMPOSSIBLE);
    let prev_start = found.get(1).copied().unwrap_or(Lsn::IMPOSSIBLE);
    Ok((last_start, prev_start))
}

/// Writes the cut-back tail page over its damaged on-disk version.
fn rewrite_page(shared: &Shared, last: u32, page: u32, clean: &[u8]) -> Result<()> {
    let page_size = shared.config.page_size;
    let file = shared.files.get(last)?;

    let mut sealed = clean.to_vec();
    shared.geometry.seal(&mut sealed, 0);
    file.write_at(&sealed, u64::from(page) * page_size as u64)?;
    file.truncate(u64::from(page + 1) * page_size as u64)?;
    Ok(())
}
