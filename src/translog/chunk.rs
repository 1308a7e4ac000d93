//! Chunks are the units records are cut into. A chunk never crosses a
//! page boundary. The top two bits of its first byte give the type:
//!
//! * `00` head chunk (`LSN` chunk) of a variable-length record. The low
//!   six bits are the record type, `0x3F` marks a continuation of a
//!   multi-group head.
//!   `[type][short trid: 2][record length: 1-5][chunk length: 2]` then:
//!   * chunk length `1..=0xFFFE`, or `0` with an empty record: the whole
//!     record follows.
//!   * `0` with a non-empty record: the record runs to the end of the page
//!     and continues in the following pages (one group).
//!   * `0xFFFF`: `[group count: 2][stream bytes here: 2]` followed by the
//!     start of the stream of group descriptors and compressed LSNs.
//! * `01` fixed-length record: `[type][short trid: 2][data]`.
//! * `10` data running to the end of the page, one byte of header.
//! * `11` data with a length: `[0xC0][length: 2][data]`.
//!
//! A first byte of `0xFF` is page filler and ends the chunks of a page.

use crate::translog::{
    RecordKind,
    lsn::{LSN_STORE_SIZE, decode_varlen, encode_varlen, varlen_size},
    page::FILLER,
};

pub const CHUNK_TYPE_MASK: u8 = 0xC0;
pub const CHUNK_LSN: u8 = 0x00;
pub const CHUNK_FIXED: u8 = 0x40;
pub const CHUNK_NOHDR: u8 = 0x80;
pub const CHUNK_LNGTH: u8 = 0xC0;
pub const CHUNK0_CONTINUATION: u8 = 0x3F;
pub const REC_TYPE_MASK: u8 = 0x3F;

const SHORT_TRID_SIZE: usize = 2;
const CHUNK_LEN_SIZE: usize = 2;
const MULTI_GROUP: u16 = 0xFFFF;

pub const FIXED_HEADER_LEN: usize = 1 + SHORT_TRID_SIZE;
pub const NOHDR_HEADER_LEN: usize = 1;
pub const LNGTH_HEADER_LEN: usize = 1 + CHUNK_LEN_SIZE;
pub const CONTINUATION_HEADER_LEN: usize = 1 + CHUNK_LEN_SIZE;

/// A group descriptor: address of its first chunk and how many chunks it has.
pub const GROUP_ENTRY_SIZE: usize = LSN_STORE_SIZE + 1;
pub const MAX_GROUP_CHUNKS: usize = u8::MAX as usize;

/// The longest head header: a 5-byte record length plus the multi-group
/// group count and stream length.
pub const MAX_HEAD_HEADER_LEN: usize = 1 + SHORT_TRID_SIZE + 5 + CHUNK_LEN_SIZE + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Head,
    Continuation,
    Fixed,
    NoHeader,
    Length,
}

impl ChunkKind {
    /// `None` for page filler and for first bytes no writer produces.
    pub fn of(first: u8) -> Option<ChunkKind> {
        let low = first & REC_TYPE_MASK;
        match first & CHUNK_TYPE_MASK {
            CHUNK_LSN if low == CHUNK0_CONTINUATION => Some(ChunkKind::Continuation),
            CHUNK_LSN if low != 0 => Some(ChunkKind::Head),
            CHUNK_FIXED if low != 0 && low != REC_TYPE_MASK => Some(ChunkKind::Fixed),
            CHUNK_NOHDR if low == 0 => Some(ChunkKind::NoHeader),
            CHUNK_LNGTH if low == 0 => Some(ChunkKind::Length),
            _ => None,
        }
    }

    /// Whether a chunk of this kind starts a record.
    pub fn starts_record(self) -> bool {
        matches!(self, ChunkKind::Head | ChunkKind::Fixed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: usize,
    pub len: usize,
    pub kind: ChunkKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLayout {
    Single,
    OneGroup,
    MultiGroup { groups: usize },
}

/// The decoded header of a head chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadChunk {
    pub kind: RecordKind,
    pub short_trid: u16,
    /// Stored length of the whole record.
    pub rec_len: usize,
    pub layout: HeadLayout,
    /// Page offset of the data carried by this chunk.
    pub data_start: usize,
    pub data_len: usize,
}

fn u16_at(page: &[u8], at: usize) -> Option<u16> {
    let b = page.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

pub fn parse_head(page: &[u8], offset: usize) -> Option<HeadChunk> {
    let first = *page.get(offset)?;
    if ChunkKind::of(first) != Some(ChunkKind::Head) {
        return None;
    }
    let kind = RecordKind::from_code(first & REC_TYPE_MASK)?;
    let short_trid = u16_at(page, offset + 1)?;

    let mut at = offset + 1 + SHORT_TRID_SIZE;
    let (rec_len, prefix) = decode_varlen(page.get(at..)?)?;
    at += prefix;

    let chunk_len = u16_at(page, at)?;
    at += CHUNK_LEN_SIZE;

    let (layout, data_len) = if chunk_len == MULTI_GROUP {
        let groups = u16_at(page, at)? as usize;
        let here = u16_at(page, at + 2)? as usize;
        at += 4;
        if groups == 0 {
            return None;
        }
        (HeadLayout::MultiGroup { groups }, here)
    } else if chunk_len == 0 && rec_len > 0 {
        (HeadLayout::OneGroup, page.len().checked_sub(at)?)
    } else if chunk_len as usize == rec_len {
        (HeadLayout::Single, rec_len)
    } else {
        return None;
    };

    if at + data_len > page.len() {
        return None;
    }

    Some(HeadChunk { kind, short_trid, rec_len, layout, data_start: at, data_len })
}

/// Total length of the chunk at `offset`, header included. `None` for
/// filler, garbage, or a chunk that would overrun the page.
pub fn chunk_len(page: &[u8], offset: usize) -> Option<usize> {
    let kind = ChunkKind::of(*page.get(offset)?)?;
    let len = match kind {
        ChunkKind::Head => {
            let head = parse_head(page, offset)?;
            head.data_start + head.data_len - offset
        }
        ChunkKind::Continuation | ChunkKind::Length => {
            let len = u16_at(page, offset + 1)? as usize;
            if len == 0 {
                return None;
            }
            LNGTH_HEADER_LEN + len
        }
        ChunkKind::Fixed => {
            let rec_kind = RecordKind::from_code(page[offset] & REC_TYPE_MASK)?;
            let data = page.get(offset + FIXED_HEADER_LEN..)?;
            FIXED_HEADER_LEN + rec_kind.stored_fixed_len(data)?
        }
        ChunkKind::NoHeader => page.len() - offset,
    };

    if offset + len > page.len() { None } else { Some(len) }
}

/// Walks the chunks of a page from `offset` up to the filler or the end of
/// the page. Yields `Err(offset)` once for bytes that do not parse.
pub struct Chunks<'a> {
    page: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Chunks<'a> {
    pub fn new(page: &'a [u8], offset: usize) -> Chunks<'a> {
        Chunks { page, offset, done: false }
    }

    /// Where the walk stopped: the first filler byte, the end of the page,
    /// or the unparseable chunk.
    pub fn end(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<Chunk, usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.page.len() || self.page[self.offset] == FILLER {
            self.done = true;
            return None;
        }

        let offset = self.offset;
        let Some(len) = chunk_len(self.page, offset) else {
            self.done = true;
            return Some(Err(offset));
        };
        let kind = ChunkKind::of(self.page[offset])?;

        self.offset += len;
        Some(Ok(Chunk { offset, len, kind }))
    }
}

/// Header of a head chunk whose data follows in full.
pub fn single_header(kind: RecordKind, short_trid: u16, rec_len: usize) -> Vec<u8> {
    debug_assert!(rec_len < MULTI_GROUP as usize);
    head_header(kind, short_trid, rec_len, rec_len as u16)
}

/// Header of a head chunk whose data runs on past the end of the page.
pub fn one_group_header(kind: RecordKind, short_trid: u16, rec_len: usize) -> Vec<u8> {
    head_header(kind, short_trid, rec_len, 0)
}

pub fn multi_group_header(
    kind: RecordKind,
    short_trid: u16,
    rec_len: usize,
    groups: usize,
    here: usize,
) -> Vec<u8> {
    let mut header = head_header(kind, short_trid, rec_len, MULTI_GROUP);
    header.extend_from_slice(&(groups as u16).to_le_bytes());
    header.extend_from_slice(&(here as u16).to_le_bytes());
    header
}

/// Length of the header written by `single_header` and `one_group_header`.
pub fn head_header_len(rec_len: usize) -> usize {
    1 + SHORT_TRID_SIZE + varlen_size(rec_len) + CHUNK_LEN_SIZE
}

pub fn multi_group_header_len(rec_len: usize) -> usize {
    head_header_len(rec_len) + 4
}

fn head_header(kind: RecordKind, short_trid: u16, rec_len: usize, chunk_len: u16) -> Vec<u8> {
    let mut header = Vec::with_capacity(MAX_HEAD_HEADER_LEN);
    header.push(CHUNK_LSN | kind.code());
    header.extend_from_slice(&short_trid.to_le_bytes());
    encode_varlen(rec_len, &mut header);
    header.extend_from_slice(&chunk_len.to_le_bytes());
    header
}

pub fn fixed_header(kind: RecordKind, short_trid: u16) -> [u8; FIXED_HEADER_LEN] {
    let trid = short_trid.to_le_bytes();
    [CHUNK_FIXED | kind.code(), trid[0], trid[1]]
}

pub fn length_header(len: usize) -> [u8; LNGTH_HEADER_LEN] {
    debug_assert!(len > 0 && len < MULTI_GROUP as usize);
    let len = (len as u16).to_le_bytes();
    [CHUNK_LNGTH, len[0], len[1]]
}

pub fn continuation_header(len: usize) -> [u8; CONTINUATION_HEADER_LEN] {
    debug_assert!(len > 0 && len < MULTI_GROUP as usize);
    let len = (len as u16).to_le_bytes();
    [CHUNK_LSN | CHUNK0_CONTINUATION, len[0], len[1]]
}

pub fn no_header() -> [u8; NOHDR_HEADER_LEN] {
    [CHUNK_NOHDR]
}

#[cfg(test)]
mod test {
    use super::*;

    fn page_of(chunks: &[&[u8]], size: usize) -> Vec<u8> {
        let mut page = vec![FILLER; size];
        let mut at = 0;
        for chunk in chunks {
            page[at..at + chunk.len()].copy_from_slice(chunk);
            at += chunk.len();
        }
        page
    }

    #[test]
    fn chunk_kinds() {
        assert_eq!(ChunkKind::of(FILLER), None);
        assert_eq!(ChunkKind::of(0x00), None);
        assert_eq!(ChunkKind::of(0x3F), Some(ChunkKind::Continuation));
        assert_eq!(ChunkKind::of(0x05), Some(ChunkKind::Head));
        assert_eq!(ChunkKind::of(0x45), Some(ChunkKind::Fixed));
        assert_eq!(ChunkKind::of(0x80), Some(ChunkKind::NoHeader));
        assert_eq!(ChunkKind::of(0x81), None);
        assert_eq!(ChunkKind::of(0xC0), Some(ChunkKind::Length));
        assert_eq!(ChunkKind::of(0xC1), None);
    }

    #[test]
    fn walk_mixed_chunks() {
        let mut single = single_header(RecordKind::RedoInsertRow, 7, 5);
        single.extend_from_slice(b"hello");

        // a commit carries no data
        let fixed = fixed_header(RecordKind::Commit, 7);
        let commit_len = fixed.len();

        let mut lngth = length_header(4).to_vec();
        lngth.extend_from_slice(b"tail");

        let page = page_of(&[&single[..], &fixed[..], &lngth[..]], 128);

        let chunks: Vec<Chunk> = Chunks::new(&page, 0).map(Result::unwrap).collect();
        assert_eq!(
            chunks,
            vec![
                Chunk { offset: 0, len: single.len(), kind: ChunkKind::Head },
                Chunk { offset: single.len(), len: commit_len, kind: ChunkKind::Fixed },
                Chunk {
                    offset: single.len() + commit_len,
                    len: lngth.len(),
                    kind: ChunkKind::Length
                },
            ]
        );

        let head = parse_head(&page, 0).unwrap();
        assert_eq!(head.kind, RecordKind::RedoInsertRow);
        assert_eq!(head.short_trid, 7);
        assert_eq!(head.layout, HeadLayout::Single);
        assert_eq!(&page[head.data_start..head.data_start + head.data_len], b"hello");
    }

    #[test]
    fn one_group_head_runs_to_page_end() {
        let header = one_group_header(RecordKind::RedoInsertRow, 1, 1000);
        let page = page_of(&[&header[..]], 256);
        let head = parse_head(&page, 0).unwrap();
        assert_eq!(head.layout, HeadLayout::OneGroup);
        assert_eq!(head.rec_len, 1000);
        assert_eq!(head.data_start + head.data_len, 256);
        assert_eq!(chunk_len(&page, 0), Some(256));
    }

    #[test]
    fn multi_group_head() {
        let mut chunk = multi_group_header(RecordKind::Checkpoint, 0, 100_000, 3, 10);
        let header_len = chunk.len();
        assert_eq!(header_len, multi_group_header_len(100_000));
        chunk.extend_from_slice(&[1; 10]);
        let page = page_of(&[&chunk[..]], 512);

        let head = parse_head(&page, 0).unwrap();
        assert_eq!(head.layout, HeadLayout::MultiGroup { groups: 3 });
        assert_eq!(head.data_start, header_len);
        assert_eq!(head.data_len, 10);
        assert_eq!(chunk_len(&page, 0), Some(header_len + 10));
    }

    #[test]
    fn garbage_stops_the_walk() {
        let mut lngth = length_header(4).to_vec();
        lngth.extend_from_slice(b"data");
        // a length chunk claiming more bytes than the page has
        let bad = [CHUNK_LNGTH, 0xFF, 0x00];
        let page = page_of(&[&lngth[..], &bad[..]], 64);

        let mut walk = Chunks::new(&page, 0);
        assert!(walk.next().unwrap().is_ok());
        assert_eq!(walk.next(), Some(Err(lngth.len())));
        assert_eq!(walk.next(), None);
        assert_eq!(walk.end(), lngth.len());
    }
}
