//! Getting buffers to disk.
//!
//! Buffers are written in `seq` order, by whichever thread closed them.
//! `flush` adds durability on top: one caller at a time forces the active
//! buffer closed, waits for every closed buffer to be written, fsyncs, and
//! publishes the new `flushed` address. Callers arriving during a pass
//! wait for it and return if it covered them.

use std::time::Duration;

use crate::{
    Error, Result,
    translog::{
        Lsn, Shared,
        buffer::{BufferState, IoBuf},
        page::{FILLER, SECTOR_EPOCH_TOLERANCE},
        writer::{Cursor, Pending},
    },
};

const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub(crate) struct FlushProgress {
    /// A flush pass is running.
    pub in_progress: bool,
    /// Everything below this address is durable. Never decreases.
    pub flushed: Lsn,
}

/// What a flusher needs to know about a buffer it is writing.
#[derive(Debug, Clone, Copy)]
struct WriteJob {
    file: u32,
    offset: Lsn,
    size: usize,
    first_page_counter: u8,
    closes_file: Option<Lsn>,
}

impl Shared {
    /// Makes every byte of the record at `lsn` durable.
    pub(crate) fn flush(&self, lsn: Lsn) -> Result<()> {
        if self.config.read_only {
            return Ok(());
        }
        self.check_error()?;

        let want = lsn.successor().min(self.horizon());

        let mut progress = self.flush.lock();
        loop {
            self.check_error()?;
            if progress.flushed >= want {
                return Ok(());
            }

            if progress.in_progress {
                let _timed_out = self.flush_cv.wait_for(&mut progress, WAIT_SLICE);
                continue;
            }

            progress.in_progress = true;
            drop(progress);

            let res = self.flush_pass();

            progress = self.flush.lock();
            progress.in_progress = false;
            if let Ok(flushed) = res {
                debug_assert!(flushed >= progress.flushed);
                progress.flushed = progress.flushed.max(flushed);
                log::trace!("log flushed up to {}", progress.flushed);
            }
            let _notified = self.flush_cv.notify_all();

            res?;
        }
    }

    pub(crate) fn flush_all(&self) -> Result<()> {
        self.flush(Lsn::MAX)
    }

    /// Forces out everything written so far and syncs it. Returns the
    /// address everything below which is now durable.
    fn flush_pass(&self) -> Result<Lsn> {
        let mut pending = Pending::default();
        let mut log = self.log.lock();
        let finished = self.force_finish(&mut log, &mut pending);
        drop(log);
        let (horizon, last_closed) = finished?;

        for seq in self.ring.last_sent() + 1..=last_closed {
            self.flush_buffer(seq)?;
        }

        self.files.sync_files().map_err(|e| self.fail(e))?;
        Ok(horizon)
    }

    /// Closes the active buffer if it holds anything. A partially filled
    /// last page is carried into the next buffer and rewritten there with
    /// the next rewrite counter. Returns the horizon and the `seq` of the
    /// last closed buffer.
    fn force_finish(&self, log: &mut Cursor, pending: &mut Pending) -> Result<(Lsn, u64)> {
        if log.horizon == log.buf_start {
            return Ok((log.horizon, log.seq - 1));
        }

        let page_size = self.config.page_size;
        if log.horizon.page_offset(page_size) == 0 {
            let horizon = log.horizon;
            self.close_active(log, pending, None);
            self.activate(log, horizon, None, 0)?;
        } else {
            self.wait_for_writers(log.seq)?;

            if log.page_counter >= SECTOR_EPOCH_TOLERANCE {
                log::debug!("page at {} rewritten too often, padding it", log.horizon);
                self.pad_page(log);
                let horizon = log.horizon;
                self.close_active(log, pending, None);
                self.activate(log, horizon, None, 0)?;
            } else {
                let page_start = log.horizon.page_start(page_size);
                let carried = (log.horizon.offset() - page_start.offset()) as usize;
                let counter = log.page_counter + 1;
                self.close_active(log, pending, None);
                self.activate(log, page_start, Some(carried), counter)?;
            }
        }

        Ok((log.horizon, log.seq - 1))
    }

    /// Waits until no copies are in flight into the buffer of `seq`.
    fn wait_for_writers(&self, seq: u64) -> Result<()> {
        let buf = self.ring.buffer_for(seq);
        let mut meta = buf.lock();
        while meta.writers > 0 {
            self.check_error()?;
            meta.wait(buf);
        }
        Ok(())
    }

    /// Writes out the closed buffer of `seq` once its copies have landed
    /// and every earlier buffer has been written. Returns right away if it
    /// was already written.
    pub(crate) fn flush_buffer(&self, seq: u64) -> Result<()> {
        let buf = self.ring.buffer_for(seq);

        let job = {
            let mut meta = buf.lock();
            loop {
                self.check_error()?;
                if meta.seq != seq {
                    return Ok(());
                }
                match meta.state {
                    BufferState::Free => return Ok(()),
                    BufferState::Active => {
                        return Err(Error::ReportableBug(format!(
                            "asked to write buffer {} while it is still active",
                            seq
                        )));
                    }
                    // another thread is writing it
                    BufferState::Flushing => meta.wait(buf),
                    BufferState::Draining if meta.writers > 0 => meta.wait(buf),
                    BufferState::Draining => break,
                }
            }

            meta.state = BufferState::Flushing;
            WriteJob {
                file: meta.file,
                offset: meta.offset,
                size: meta.size,
                first_page_counter: meta.first_page_counter,
                closes_file: meta.closes_file,
            }
        };

        let mut sent = self.ring.sent.lock();
        while sent.last_seq + 1 != seq {
            self.check_error()?;
            let _timed_out = self.ring.sent_cv.wait_for(&mut sent, WAIT_SLICE);
        }
        drop(sent);

        if let Err(e) = self.write_buffer(buf, &job) {
            return Err(self.fail(e));
        }
        self.ring.mark_sent(seq);

        let mut meta = buf.lock();
        meta.state = BufferState::Free;
        drop(meta);
        buf.notify_all();

        log::trace!("buffer {} written, {} bytes at {}", seq, job.size, job.offset);
        Ok(())
    }

    /// Writes the pages of a buffer. The last page is padded with filler,
    /// every page goes through the page cache in its clean form and to
    /// disk sealed.
    fn write_buffer(&self, buf: &IoBuf, job: &WriteJob) -> Result<()> {
        let page_size = self.config.page_size;
        let file = self.files.get(job.file)?;

        if job.size > 0 {
            // the buffer is Flushing, nobody writes into it
            let mut out = unsafe { buf.read(0, job.size) }.to_vec();
            out.resize(job.size.next_multiple_of(page_size), FILLER);

            let first_page = job.offset.page_number(page_size);
            for (i, page) in out.chunks_mut(page_size).enumerate() {
                self.cache.write(job.file, first_page + i as u32, page);
                let counter = if i == 0 { job.first_page_counter } else { 0 };
                self.geometry.seal(page, counter);
            }

            file.write_at(&out, u64::from(job.offset.offset()))?;
        }

        if let Some(max_lsn) = job.closes_file {
            self.files.set_max_lsn(job.file, max_lsn)?;
        }
        Ok(())
    }
}
