//! Reading records back.

use std::sync::Arc;

use crate::{
    Error, PageError, Result,
    translog::{
        Lsn, Record, RecordKind, Shared,
        chunk::{
            CONTINUATION_HEADER_LEN, ChunkKind, FIXED_HEADER_LEN, GROUP_ENTRY_SIZE, HeadLayout,
            LNGTH_HEADER_LEN, NOHDR_HEADER_LEN, REC_TYPE_MASK, chunk_len, parse_head,
        },
        page::{FILLER, PAGE_RECORD_CRC, PageView},
    },
};

/// Where a reader gets validated, clean pages from.
pub(crate) trait PageSource {
    fn page(&self, file: u32, page: u32) -> Result<Arc<[u8]>>;

    /// The offset the pages of `file` end at, `None` if it is not part of
    /// the log.
    fn file_end(&self, file: u32) -> Option<u64>;
}

impl PageSource for Shared {
    fn page(&self, file: u32, page: u32) -> Result<Arc<[u8]>> {
        if let Some(cached) = self.cache.get(file, page) {
            return Ok(cached);
        }

        let page_size = self.config.page_size;
        let log_file = self.files.get(file)?;
        let mut buf = vec![0; page_size];
        log_file.read_at(&mut buf, u64::from(page) * page_size as u64)?;

        match self.geometry.validate(&mut buf, page, file) {
            Ok(_) => {}
            // only a read-only log leaves a torn page on disk, its horizon
            // was cut back to the part that survived
            Err(PageError::SectorCorrupt { kept, .. }) => {
                log::debug!("reading salvaged page {} of file {}, {} bytes kept", page, file, kept)
            }
            Err(error) => {
                return Err(Error::BadPage { at: Lsn::new(file, page * page_size as u32), error });
            }
        }

        Ok(self.cache.write(file, page, &buf))
    }

    fn file_end(&self, file: u32) -> Option<u64> {
        self.files.file_end(file, self.config.file_size)
    }
}

/// Reads records that lie wholly below `end`.
pub(crate) struct Reader<'a, S: ?Sized> {
    source: &'a S,
    page_size: usize,
    end: Lsn,
}

fn u16_at(page: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([page[at], page[at + 1]])
}

impl<'a, S: PageSource + ?Sized> Reader<'a, S> {
    pub(crate) fn new(source: &'a S, page_size: usize, end: Lsn) -> Reader<'a, S> {
        Reader { source, page_size, end }
    }

    fn page_at(&self, at: Lsn) -> Result<Arc<[u8]>> {
        self.source.page(at.file(), at.page_number(self.page_size))
    }

    fn check_end(&self, at: Lsn, len: usize) -> Result<()> {
        if at.add(len) > self.end {
            Err(Error::corruption(at, "record runs past the end of the log"))
        } else {
            Ok(())
        }
    }

    /// The start of the page after the one holding `at`, skipping over to
    /// the next file past the end of the current one.
    fn next_page(&self, at: Lsn) -> Result<Lsn> {
        let page_size = self.page_size;
        let next = at.page_start(page_size).add(page_size);
        let file_end = self
            .source
            .file_end(at.file())
            .ok_or_else(|| Error::corruption(at, "record continues past the log files"))?;

        if u64::from(next.offset()) >= file_end {
            Ok(Lsn::new(at.file() + 1, page_size as u32))
        } else {
            Ok(next)
        }
    }

    /// Data of the no-header or length chunk at `at`.
    fn data_chunk<'p>(&self, page: &'p [u8], at: Lsn) -> Result<&'p [u8]> {
        let offset = at.page_offset(self.page_size);
        let header_len = match page.get(offset).copied().and_then(ChunkKind::of) {
            Some(ChunkKind::NoHeader) => NOHDR_HEADER_LEN,
            Some(ChunkKind::Length) => LNGTH_HEADER_LEN,
            _ => return Err(Error::corruption(at, "expected a record data chunk")),
        };
        let len =
            chunk_len(page, offset).ok_or_else(|| Error::corruption(at, "bad chunk length"))?;
        self.check_end(at, len)?;
        Ok(&page[offset + header_len..offset + len])
    }

    /// The first chunk of the page after the one holding `at`.
    fn first_chunk_after(&self, at: Lsn) -> Result<(Lsn, Arc<[u8]>)> {
        let next = self.next_page(at)?;
        let page = self.page_at(next)?;
        let header_len = PageView::new(&*page).header_len();
        Ok((next.add(header_len), page))
    }

    pub(crate) fn read(&self, lsn: Lsn) -> Result<Record> {
        if lsn >= self.end {
            return Err(Error::corruption(lsn, "record starts past the end of the log"));
        }

        let page = self.page_at(lsn)?;
        let offset = lsn.page_offset(self.page_size);
        let record_crc = PageView::new(&*page).flags() & PAGE_RECORD_CRC != 0;
        let first = page.get(offset).copied().unwrap_or(FILLER);

        match ChunkKind::of(first) {
            Some(ChunkKind::Fixed) => {
                let kind = RecordKind::from_code(first & REC_TYPE_MASK)
                    .ok_or_else(|| Error::corruption(lsn, "unknown record type"))?;
                let data = page
                    .get(offset + FIXED_HEADER_LEN..)
                    .ok_or_else(|| Error::corruption(lsn, "truncated fixed record"))?;
                let len = kind
                    .stored_fixed_len(data)
                    .filter(|len| *len <= data.len())
                    .ok_or_else(|| Error::corruption(lsn, "truncated fixed record"))?;
                self.check_end(lsn, FIXED_HEADER_LEN + len)?;

                Ok(Record {
                    lsn,
                    kind,
                    short_trid: u16_at(&page, offset + 1),
                    body: kind.decode(lsn, &data[..len], false)?,
                })
            }
            Some(ChunkKind::Head) => {
                let head = parse_head(&page, offset)
                    .ok_or_else(|| Error::corruption(lsn, "bad record head"))?;
                let here = &page[head.data_start..head.data_start + head.data_len];
                self.check_end(lsn, head.data_start + head.data_len - offset)?;

                let stored = match head.layout {
                    HeadLayout::Single => here.to_vec(),
                    HeadLayout::OneGroup => self.read_one_group(lsn, here, head.rec_len)?,
                    HeadLayout::MultiGroup { groups } => {
                        let stream = Stream {
                            reader: self,
                            at: lsn,
                            page: page.clone(),
                            pos: head.data_start,
                            left: head.data_len,
                        };
                        self.read_multi_group(lsn, stream, groups, head.rec_len)?
                    }
                };

                Ok(Record {
                    lsn,
                    kind: head.kind,
                    short_trid: head.short_trid,
                    body: head.kind.decode(lsn, &stored, record_crc)?,
                })
            }
            _ => Err(Error::corruption(lsn, "no record starts here")),
        }
    }

    fn read_one_group(&self, lsn: Lsn, here: &[u8], rec_len: usize) -> Result<Vec<u8>> {
        let mut stored = Vec::with_capacity(rec_len);
        stored.extend_from_slice(here);

        let mut at = lsn;
        while stored.len() < rec_len {
            let (chunk_at, page) = self.first_chunk_after(at)?;
            stored.extend_from_slice(self.data_chunk(&page, chunk_at)?);
            at = chunk_at;
        }

        if stored.len() != rec_len {
            return Err(Error::corruption(lsn, "record chunks overrun its length"));
        }
        Ok(stored)
    }

    fn read_multi_group(
        &self,
        lsn: Lsn,
        mut stream: Stream<'_, 'a, S>,
        groups: usize,
        rec_len: usize,
    ) -> Result<Vec<u8>> {
        let table = stream.take(groups * GROUP_ENTRY_SIZE)?;

        let mut tail = vec![];
        for entry in table.chunks(GROUP_ENTRY_SIZE) {
            let addr = Lsn::load(entry);
            let chunks = entry[GROUP_ENTRY_SIZE - 1];
            if addr >= lsn || chunks == 0 {
                return Err(Error::corruption(lsn, "bad group descriptor"));
            }
            self.read_group(addr, chunks, &mut tail)?;
        }

        let lsn_part = rec_len
            .checked_sub(tail.len())
            .ok_or_else(|| Error::corruption(lsn, "groups hold more than the record"))?;
        let mut stored = stream.take(lsn_part)?;
        stored.extend_from_slice(&tail);
        Ok(stored)
    }

    fn read_group(&self, addr: Lsn, chunks: u8, out: &mut Vec<u8>) -> Result<()> {
        let page = self.page_at(addr)?;
        out.extend_from_slice(self.data_chunk(&page, addr)?);

        let mut at = addr;
        for _ in 1..chunks {
            let (chunk_at, page) = self.first_chunk_after(at)?;
            out.extend_from_slice(self.data_chunk(&page, chunk_at)?);
            at = chunk_at;
        }
        Ok(())
    }
}

/// The bytes carried by a multi-group head and its continuation chunks.
struct Stream<'r, 'a, S: ?Sized> {
    reader: &'r Reader<'a, S>,
    /// Address of the chunk being consumed.
    at: Lsn,
    page: Arc<[u8]>,
    pos: usize,
    left: usize,
}

impl<S: PageSource + ?Sized> Stream<'_, '_, S> {
    fn take(&mut self, mut n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while n > 0 {
            if self.left == 0 {
                let (chunk_at, page) = self.reader.first_chunk_after(self.at)?;
                let offset = chunk_at.page_offset(self.reader.page_size);
                if page.get(offset).copied().and_then(ChunkKind::of)
                    != Some(ChunkKind::Continuation)
                {
                    return Err(Error::corruption(chunk_at, "expected a record head continuation"));
                }
                let len = chunk_len(&page, offset)
                    .ok_or_else(|| Error::corruption(chunk_at, "bad chunk length"))?;
                self.reader.check_end(chunk_at, len)?;

                self.at = chunk_at;
                self.pos = offset + CONTINUATION_HEADER_LEN;
                self.left = len - CONTINUATION_HEADER_LEN;
                self.page = page;
            }

            let k = n.min(self.left);
            out.extend_from_slice(&self.page[self.pos..self.pos + k]);
            self.pos += k;
            self.left -= k;
            n -= k;
        }
        Ok(out)
    }
}

/// An iterator over the records of the log, in address order.
///
/// Yields an error and stops at the first record that cannot be read.
pub struct Iter {
    shared: Arc<Shared>,
    next: Lsn,
    end: Lsn,
    done: bool,
}

impl Iter {
    pub(crate) fn new(shared: Arc<Shared>, from: Lsn, end: Lsn) -> Iter {
        Iter { shared, next: from, end, done: false }
    }

    fn fail(&mut self, error: Error) -> Option<Result<Record>> {
        self.done = true;
        Some(Err(error))
    }
}

impl Iterator for Iter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Result<Record>> {
        let page_size = self.shared.config.page_size;

        loop {
            if self.done || self.next >= self.end {
                self.done = true;
                return None;
            }

            if self.next.page_offset(page_size) == 0 {
                let file = self.next.file();
                let file_end = self.shared.file_end(file).unwrap_or(0);
                if self.next.offset() == 0 {
                    self.next = Lsn::new(file, page_size as u32);
                    continue;
                }
                if u64::from(self.next.offset()) >= file_end {
                    self.next = Lsn::new(file + 1, page_size as u32);
                    continue;
                }
            }

            let page = match self.shared.page(self.next.file(), self.next.page_number(page_size)) {
                Ok(page) => page,
                Err(e) => return self.fail(e),
            };

            let header_len = PageView::new(&*page).header_len();
            if self.next.page_offset(page_size) < header_len {
                self.next = self.next.page_start(page_size).add(header_len);
                continue;
            }

            let offset = self.next.page_offset(page_size);
            if page[offset] == FILLER {
                self.next = self.next.page_start(page_size).add(page_size);
                continue;
            }

            let Some(kind) = ChunkKind::of(page[offset]) else {
                let at = self.next;
                return self.fail(Error::corruption(at, "unparseable chunk"));
            };
            let Some(len) = chunk_len(&page, offset) else {
                let at = self.next;
                return self.fail(Error::corruption(at, "bad chunk length"));
            };

            let at = self.next;
            self.next = at.add(len);

            if kind.starts_record() {
                let read = self.shared.reader(self.end).read(at);
                if read.is_err() {
                    self.done = true;
                }
                return Some(read);
            }
        }
    }
}
