//! Appending records.
//!
//! Space is reserved and chunk headers are written under the log lock.
//! Record bytes are copied into the reserved ranges after the lock is
//! released, with the target buffer's writer count keeping it from being
//! flushed until the copies land. Every lock hold closes at most one
//! buffer, and buffers closed during a hold are written out by the same
//! thread right after it.

use std::ops::Range;

use crate::{
    Error, Result,
    translog::{
        Lsn, RecordKind, Shared, Transaction,
        buffer::BufferState,
        chunk::{
            CONTINUATION_HEADER_LEN, FIXED_HEADER_LEN, GROUP_ENTRY_SIZE, LNGTH_HEADER_LEN,
            MAX_GROUP_CHUNKS, MAX_HEAD_HEADER_LEN, NOHDR_HEADER_LEN, continuation_header,
            fixed_header, head_header_len, length_header, multi_group_header,
            multi_group_header_len, no_header, one_group_header, single_header,
        },
        lsn::MAX_FILE_NUMBER,
        page::FILLER,
    },
};

/// Smallest room a group chunk is started in: a length header and one
/// byte of data.
const MIN_GROUP_ROOM: usize = LNGTH_HEADER_LEN + 1;

/// Places a chunk 0 may be tried at: where the log is, a fresh buffer,
/// then a fresh file.
const CHUNK0_ATTEMPTS: usize = 3;

/// The log cursor, guarded by the log lock.
#[derive(Debug, Default)]
pub(crate) struct Cursor {
    /// Where the next byte of the log goes.
    pub horizon: Lsn,
    /// `seq` of the active buffer.
    pub seq: u64,
    /// Address of the first byte of the active buffer.
    pub buf_start: Lsn,
    /// Rewrite counter of the page holding the horizon.
    pub page_counter: u8,
    /// Address of the last record written.
    pub last_lsn: Lsn,
}

/// Work left over from a log lock hold.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    /// `(buffer index, buffer offset, source range)` copies to perform.
    copies: Vec<(usize, usize, Range<usize>)>,
    /// Buffers whose writer count was raised during the hold.
    touched: Vec<usize>,
    /// Buffers closed during the hold, to be written out by this thread.
    pub closed: Vec<u64>,
}

/// How a record's bytes are split into chunks: a no-header chunk taking
/// the rest of the page, or a length chunk.
fn chunk_for(room: usize, remaining: usize) -> (Vec<u8>, usize) {
    if remaining >= room - NOHDR_HEADER_LEN {
        (no_header().to_vec(), room - NOHDR_HEADER_LEN)
    } else if remaining + LNGTH_HEADER_LEN <= room {
        (length_header(remaining).to_vec(), remaining)
    } else {
        // one byte spills over so the page is filled exactly
        (length_header(room - LNGTH_HEADER_LEN).to_vec(), room - LNGTH_HEADER_LEN)
    }
}

/// Pages a run of `len` bytes occupies when every page carries `per_page`.
fn pages_for(len: usize, per_page: usize) -> usize {
    len.div_ceil(per_page)
}

impl Shared {
    pub(crate) fn write_record(
        &self,
        kind: RecordKind,
        trn: &mut Transaction,
        body: &[u8],
    ) -> Result<Lsn> {
        self.check_error()?;
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        kind.check_body(body)?;

        if trn.needs_long_id() && kind != RecordKind::LongTransactionId {
            let long_id = trn.long_id_body();
            self.write_one(RecordKind::LongTransactionId, trn, &long_id)?;
        }

        self.write_one(kind, trn, body)
    }

    fn write_one(&self, kind: RecordKind, trn: &mut Transaction, body: &[u8]) -> Result<Lsn> {
        if kind.is_fixed() {
            return self.hold(&[], |log, pending| {
                self.append_fixed(log, pending, kind, trn, body)
            });
        }

        let mut tail = Vec::with_capacity(body.len() + 4);
        kind.encode_tail(body, self.config.record_crc, &mut tail);

        let placed = self.hold(&tail, |log, pending| {
            self.append_in_buffer(log, pending, kind, trn, body, &tail)
        })?;

        match placed {
            Some(lsn) => Ok(lsn),
            None => self.write_multi_group(kind, trn, body, &tail),
        }
    }

    /// Runs `f` under the log lock, then performs the copies it queued from
    /// `src` and writes out any buffer it closed.
    fn hold<T, F>(&self, src: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(&mut Cursor, &mut Pending) -> Result<T>,
    {
        let mut pending = Pending::default();
        let mut log = self.log.lock();
        let res = f(&mut log, &mut pending);
        drop(log);

        let completed = self.complete(pending, src);
        let value = res?;
        completed?;
        Ok(value)
    }

    pub(crate) fn complete(&self, pending: Pending, src: &[u8]) -> Result<()> {
        for (index, at, range) in pending.copies {
            let buf = &self.ring.buffers[index];
            // the range was reserved under the log lock and the buffer
            // cannot be flushed until our writer count is released below
            unsafe { buf.write_at(at, &src[range]) };
        }

        for index in pending.touched {
            let buf = &self.ring.buffers[index];
            let mut meta = buf.lock();
            meta.writers -= 1;
            let drained = meta.writers == 0;
            drop(meta);
            if drained {
                buf.notify_all();
            }
        }

        for seq in pending.closed {
            self.flush_buffer(seq)?;
        }
        Ok(())
    }

    fn append_fixed(
        &self,
        log: &mut Cursor,
        pending: &mut Pending,
        kind: RecordKind,
        trn: &mut Transaction,
        body: &[u8],
    ) -> Result<Lsn> {
        let need = FIXED_HEADER_LEN + body.len() + kind.max_encoded_lsns_len();
        self.ensure_room(log, pending, need)?;

        let lsn = log.horizon;
        let stored = kind.encode(lsn, body, false);
        self.put(log, &fixed_header(kind, trn.short_id));
        self.put(log, &stored);

        kind.write_hook(lsn, trn, body);
        log.last_lsn = lsn;
        Ok(lsn)
    }

    /// Writes a variable-length record as a single chunk or as one group
    /// of chunks inside the active buffer. `None` if it needs more groups.
    fn append_in_buffer(
        &self,
        log: &mut Cursor,
        pending: &mut Pending,
        kind: RecordKind,
        trn: &mut Transaction,
        body: &[u8],
        tail: &[u8],
    ) -> Result<Option<Lsn>> {
        let room =
            self.ensure_room(log, pending, MAX_HEAD_HEADER_LEN + kind.max_encoded_lsns_len() + 1)?;

        let lsn = log.horizon;
        let mut prefix = vec![];
        kind.encode_lsns(lsn, body, &mut prefix);
        let rec_len = prefix.len() + tail.len();
        let header_len = head_header_len(rec_len);

        if header_len + rec_len <= room && rec_len < u16::MAX as usize {
            log::trace!("{:?} record of {} bytes at {} fits one chunk", kind, rec_len, lsn);
            self.put(log, &single_header(kind, trn.short_id, rec_len));
            self.put(log, &prefix);
            self.reserve(log, pending, 0..tail.len());
        } else {
            let first = room - header_len - prefix.len();
            if !self.fits_one_group(log, tail.len() - first) {
                return Ok(None);
            }

            log::trace!("{:?} record of {} bytes at {} written as one group", kind, rec_len, lsn);
            self.put(log, &one_group_header(kind, trn.short_id, rec_len));
            self.put(log, &prefix);
            self.reserve(log, pending, 0..first);

            let payload = self.geometry.payload();
            let mut at = first;
            while at < tail.len() {
                self.begin_page(log, pending)?;
                let (header, n) = chunk_for(payload, tail.len() - at);
                self.put(log, &header);
                self.reserve(log, pending, at..at + n);
                at += n;
            }
        }

        kind.write_hook(lsn, trn, body);
        log.last_lsn = lsn;
        Ok(Some(lsn))
    }

    /// Whether `rest` bytes following a head chunk that fills the current
    /// page fit in whole pages of the active buffer and file.
    fn fits_one_group(&self, log: &Cursor, mut rest: usize) -> bool {
        let payload = self.geometry.payload();
        let mut pages = 0;
        while rest > 0 {
            if pages + 1 >= MAX_GROUP_CHUNKS {
                return false;
            }
            let (_, n) = chunk_for(payload, rest);
            rest -= n;
            pages += 1;
        }

        let current = log.horizon.page_number(self.config.page_size) as usize;
        current + pages < self.page_limit(log)
    }

    /// First page number that is outside both the active buffer and the
    /// current file.
    fn page_limit(&self, log: &Cursor) -> usize {
        let page_size = self.config.page_size;
        let buffer_end = (log.buf_start.offset() as usize + self.config.buffer_size) / page_size;
        buffer_end.min(self.config.file_size / page_size)
    }

    fn write_multi_group(
        &self,
        kind: RecordKind,
        trn: &mut Transaction,
        body: &[u8],
        tail: &[u8],
    ) -> Result<Lsn> {
        self.check_multi_group(kind, tail.len())?;
        log::debug!("{:?} record of {} bytes written as multiple groups", kind, tail.len());

        let mut groups: Vec<(Lsn, u8)> = vec![];
        let mut at = 0;
        while at < tail.len() {
            let (addr, chunks, written) =
                self.hold(tail, |log, pending| self.append_group(log, pending, tail, at))?;
            groups.push((addr, chunks));
            at += written;
        }

        place_within(CHUNK0_ATTEMPTS, || {
            self.hold(&[], |log, pending| {
                self.append_chunk0(log, pending, kind, trn, body, tail.len(), &groups)
            })
        })
    }

    /// Upper bound of the groups a record of `tail_len` bytes is cut into.
    fn max_groups(&self, tail_len: usize) -> usize {
        let page_size = self.config.page_size;
        let pages = (self.config.buffer_size / page_size)
            .min(MAX_GROUP_CHUNKS)
            .min(self.config.file_size / page_size - 1);
        // a group started on the last page of a buffer may hold one byte,
        // the group after it starts in an empty buffer
        let full_group = (pages.max(2) - 1) * (self.geometry.payload() - LNGTH_HEADER_LEN);
        2 * (tail_len / full_group + 1)
    }

    /// Pages a chunk-0 carrying `stream` bytes occupies, starting with
    /// `first` bytes of room after its header.
    fn chunk0_pages(&self, stream: usize, first: usize) -> usize {
        let per_page = self.geometry.payload() - CONTINUATION_HEADER_LEN;
        1 + pages_for(stream.saturating_sub(first), per_page)
    }

    fn check_multi_group(&self, kind: RecordKind, tail_len: usize) -> Result<()> {
        let page_size = self.config.page_size;
        let groups = self.max_groups(tail_len);
        let stream = groups * GROUP_ENTRY_SIZE + kind.max_encoded_lsns_len();
        let header_len = multi_group_header_len(tail_len + kind.max_encoded_lsns_len());
        let first = self.geometry.payload() - header_len;
        let pages = self.chunk0_pages(stream, first);
        let max_pages =
            (self.config.buffer_size / page_size).min(self.config.file_size / page_size - 1);

        if groups > u16::MAX as usize || pages > max_pages {
            return Err(Error::Unsupported(format!(
                "a {:?} record of {} bytes needs a group table larger than a write buffer",
                kind, tail_len
            )));
        }
        Ok(())
    }

    /// Writes one group of chunks of `tail[at..]`, returning its address,
    /// chunk count and the bytes it took.
    fn append_group(
        &self,
        log: &mut Cursor,
        pending: &mut Pending,
        tail: &[u8],
        at: usize,
    ) -> Result<(Lsn, u8, usize)> {
        let mut room = self.ensure_room(log, pending, MIN_GROUP_ROOM)?;
        let addr = log.horizon;
        let limit = self.page_limit(log);
        let payload = self.geometry.payload();

        let mut written = 0;
        let mut chunks = 0;
        loop {
            let (header, n) = chunk_for(room, tail.len() - at - written);
            self.put(log, &header);
            self.reserve(log, pending, at + written..at + written + n);
            written += n;
            chunks += 1;

            if at + written == tail.len() || chunks == MAX_GROUP_CHUNKS {
                break;
            }
            if log.horizon.page_number(self.config.page_size) as usize >= limit {
                break;
            }
            self.begin_page(log, pending)?;
            room = payload;
        }

        log::trace!("group of {} chunks, {} bytes at {}", chunks, written, addr);
        Ok((addr, chunks as u8, written))
    }

    /// Writes the head of a multi-group record: the group table followed by
    /// the compressed LSNs. The record's LSN is assigned here.
    ///
    /// The head and its continuation pages must land in the active buffer.
    /// When they do not fit, the buffer is ended instead and `None` tells
    /// the caller to retry in a new hold.
    #[allow(clippy::too_many_arguments)]
    fn append_chunk0(
        &self,
        log: &mut Cursor,
        pending: &mut Pending,
        kind: RecordKind,
        trn: &mut Transaction,
        body: &[u8],
        tail_len: usize,
        groups: &[(Lsn, u8)],
    ) -> Result<Option<Lsn>> {
        let page_size = self.config.page_size;
        let lsns_max = kind.max_encoded_lsns_len();
        let table_len = groups.len() * GROUP_ENTRY_SIZE;
        let header_max = multi_group_header_len(tail_len + lsns_max);
        let fresh_pages =
            self.chunk0_pages(table_len + lsns_max, self.geometry.payload() - header_max);

        let offset = log.horizon.page_offset(page_size);
        let page = log.horizon.page_number(page_size) as usize;
        let (first_page, pages) = if offset != 0 && page_size - offset > header_max {
            (page, self.chunk0_pages(table_len + lsns_max, page_size - offset - header_max))
        } else if offset != 0 {
            (page + 1, fresh_pages)
        } else {
            (page, fresh_pages)
        };
        if first_page + pages > self.page_limit(log) {
            self.skip_to_fresh_buffer(log, pending, fresh_pages)?;
            return Ok(None);
        }

        let room = self.ensure_room(log, pending, header_max + 1)?;

        let lsn = log.horizon;
        let mut stream = Vec::with_capacity(table_len + lsns_max);
        for (addr, chunks) in groups {
            stream.extend_from_slice(&addr.store());
            stream.push(*chunks);
        }
        kind.encode_lsns(lsn, body, &mut stream);
        let rec_len = tail_len + stream.len() - table_len;

        let header_len = multi_group_header_len(rec_len);
        let here = stream.len().min(room - header_len);
        self.put(log, &multi_group_header(kind, trn.short_id, rec_len, groups.len(), here));
        self.put(log, &stream[..here]);

        let per_page = self.geometry.payload() - CONTINUATION_HEADER_LEN;
        let mut at = here;
        while at < stream.len() {
            self.begin_page(log, pending)?;
            let n = (stream.len() - at).min(per_page);
            self.put(log, &continuation_header(n));
            self.put(log, &stream[at..at + n]);
            at += n;
        }

        kind.write_hook(lsn, trn, body);
        log.last_lsn = lsn;
        Ok(Some(lsn))
    }

    /// Makes sure the current page has `need` bytes of room, starting a new
    /// page if not. Returns the room left in the page.
    fn ensure_room(&self, log: &mut Cursor, pending: &mut Pending, need: usize) -> Result<usize> {
        let page_size = self.config.page_size;
        if log.horizon.page_offset(page_size) == 0 {
            self.begin_page(log, pending)?;
        } else if page_size - log.horizon.page_offset(page_size) < need {
            self.pad_page(log);
            self.begin_page(log, pending)?;
        }
        Ok(page_size - log.horizon.page_offset(page_size))
    }

    /// Writes the header of the page starting at the horizon, moving to a
    /// new buffer or a new file first when the current one is full.
    pub(crate) fn begin_page(&self, log: &mut Cursor, pending: &mut Pending) -> Result<()> {
        debug_assert_eq!(log.horizon.page_offset(self.config.page_size), 0);

        if log.horizon.offset() as usize >= self.config.file_size {
            self.rotate(log, pending)?;
        } else if (log.horizon.offset() - log.buf_start.offset()) as usize
            == self.config.buffer_size
        {
            let horizon = log.horizon;
            self.close_active(log, pending, None);
            self.activate(log, horizon, None, 0)?;
        }

        let page_size = self.config.page_size;
        let mut header = vec![0; self.geometry.page_overhead()];
        let (page_no, file_no) = (log.horizon.page_number(page_size), log.horizon.file());
        self.geometry.write_header(&mut header, page_no, file_no);
        self.put(log, &header);
        log.page_counter = 0;
        Ok(())
    }

    /// Fills the rest of the current page.
    pub(crate) fn pad_page(&self, log: &mut Cursor) {
        let page_size = self.config.page_size;
        let offset = log.horizon.page_offset(page_size);
        if offset == 0 {
            return;
        }
        let len = page_size - offset;
        let buf = self.ring.buffer_for(log.seq);
        let at = (log.horizon.offset() - log.buf_start.offset()) as usize;
        // bytes at the horizon belong to whoever holds the log lock
        unsafe { buf.fill_at(at, len, FILLER) };
        log.horizon = log.horizon.add(len);
    }

    /// Ends the active buffer after the current page so the next bytes go
    /// into an empty buffer, in a new file if fewer than `pages` pages are
    /// left in this one.
    fn skip_to_fresh_buffer(
        &self,
        log: &mut Cursor,
        pending: &mut Pending,
        pages: usize,
    ) -> Result<()> {
        self.pad_page(log);
        let left = self.config.file_size.saturating_sub(log.horizon.offset() as usize);
        if left / self.config.page_size < pages {
            self.rotate(log, pending)
        } else {
            let horizon = log.horizon;
            self.close_active(log, pending, None);
            self.activate(log, horizon, None, 0)
        }
    }

    /// Starts the next log file.
    fn rotate(&self, log: &mut Cursor, pending: &mut Pending) -> Result<()> {
        let file = log.horizon.file();
        let next = file + 1;
        if next > MAX_FILE_NUMBER {
            return Err(Error::Unsupported(format!(
                "the log ran out of file numbers after file {}",
                file
            )));
        }

        let closes_file = (log.last_lsn.file() == file).then_some(log.last_lsn);
        self.close_active(log, pending, closes_file);
        self.files.create(next).map_err(|e| self.fail(e))?;
        log::debug!("log moved on to file {}", next);

        self.activate(log, Lsn::new(next, self.config.page_size as u32), None, 0)
    }

    pub(crate) fn close_active(
        &self,
        log: &mut Cursor,
        pending: &mut Pending,
        closes_file: Option<Lsn>,
    ) {
        let buf = self.ring.buffer_for(log.seq);
        let mut meta = buf.lock();
        debug_assert_eq!(meta.state, BufferState::Active);
        debug_assert_eq!(meta.seq, log.seq);
        meta.state = BufferState::Draining;
        meta.size = (log.horizon.offset() - log.buf_start.offset()) as usize;
        meta.closes_file = closes_file;
        log::trace!("buffer {} closed with {} bytes at {}", log.seq, meta.size, log.buf_start);
        drop(meta);

        pending.closed.push(log.seq);
    }

    /// Makes the next buffer in the ring active at `offset`, waiting for it
    /// to be written out first. With `carried`, that many bytes of the
    /// previous buffer's last page are copied in front.
    pub(crate) fn activate(
        &self,
        log: &mut Cursor,
        offset: Lsn,
        carried: Option<usize>,
        page_counter: u8,
    ) -> Result<()> {
        let next = log.seq + 1;
        let buf = self.ring.buffer_for(next);

        let mut meta = buf.lock();
        while meta.state != BufferState::Free {
            self.check_error()?;
            meta.wait(buf);
        }
        meta.state = BufferState::Active;
        meta.seq = next;
        meta.file = offset.file();
        meta.offset = offset;
        meta.size = 0;
        meta.writers = 0;
        meta.first_page_counter = page_counter;
        meta.closes_file = None;
        drop(meta);

        if let Some(len) = carried {
            let prev = self.ring.buffer_for(log.seq);
            let at = (offset.offset() - log.buf_start.offset()) as usize;
            // the previous buffer has no writers left and is only read by
            // its flusher
            unsafe { buf.write_at(0, prev.read(at, len)) };
        } else {
            log.horizon = offset;
        }

        log.seq = next;
        log.buf_start = offset;
        log.page_counter = page_counter;
        Ok(())
    }

    /// Writes `bytes` at the horizon.
    fn put(&self, log: &mut Cursor, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let buf = self.ring.buffer_for(log.seq);
        let at = (log.horizon.offset() - log.buf_start.offset()) as usize;
        unsafe { buf.write_at(at, bytes) };
        log.horizon = log.horizon.add(bytes.len());
    }

    /// Reserves room at the horizon for `range` of the hold's source, to be
    /// copied once the log lock is released.
    fn reserve(&self, log: &mut Cursor, pending: &mut Pending, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let buf = self.ring.buffer_for(log.seq);
        if !pending.touched.contains(&buf.index) {
            buf.lock().writers += 1;
            pending.touched.push(buf.index);
        }

        let at = (log.horizon.offset() - log.buf_start.offset()) as usize;
        log.horizon = log.horizon.add(range.len());
        pending.copies.push((buf.index, at, range));
    }
}

/// Calls `place` until it returns an address, at most `attempts` times.
fn place_within<F>(attempts: usize, mut place: F) -> Result<Lsn>
where
    F: FnMut() -> Result<Option<Lsn>>,
{
    for _ in 0..attempts {
        if let Some(lsn) = place()? {
            return Ok(lsn);
        }
    }
    Err(Error::ReportableBug(format!(
        "chunk 0 of a multi-group record found no room in {} attempts",
        attempts
    )))
}
