//! Log addresses and the small integer codecs used inside chunk headers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bytes an address occupies on disk: a 3-byte file number followed by a
/// 4-byte offset.
pub const LSN_STORE_SIZE: usize = 7;

/// The largest file number a stored address can carry.
pub const MAX_FILE_NUMBER: u32 = 0x00FF_FFFF;

/// Size of the escape form of a compressed LSN: the `00 01` marker
/// followed by the full stored address.
pub const LSN_ESCAPE_SIZE: usize = 2 + LSN_STORE_SIZE;

/// Largest delta each compressed form can carry, by encoded size.
const DIFF_2_MAX: u64 = 0x3FFF;
const DIFF_3_MAX: u64 = 0x3F_FFFF;
const DIFF_4_MAX: u64 = 0x3FFF_FFFF;
const DIFF_5_MAX: u64 = 0x3F_FFFF_FFFF;

/// Record length prefix markers.
const VARLEN_2: u8 = 251;
const VARLEN_3: u8 = 252;
const VARLEN_4: u8 = 253;
const VARLEN_1_LIMIT: usize = 250;

/// A position in the log: `(file_number << 32) | offset`.
///
/// A record's LSN is the address of the chunk that starts it. Addresses
/// are totally ordered, first by file then by offset.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Lsn(u64);

/// Every record address is an LSN.
pub type TranslogAddress = Lsn;

impl Lsn {
    /// Never the address of a record.
    pub const IMPOSSIBLE: Lsn = Lsn(0);

    /// Greater than every address.
    pub const MAX: Lsn = Lsn(u64::MAX);

    /// Builds an address from its file number and offset.
    pub const fn new(file: u32, offset: u32) -> Lsn {
        Lsn(((file as u64) << 32) | offset as u64)
    }

    /// Builds an address from its packed 64-bit form.
    pub const fn from_u64(raw: u64) -> Lsn {
        Lsn(raw)
    }

    /// The packed 64-bit form.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The log file this address points into.
    pub const fn file(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Byte offset within the file.
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_impossible(self) -> bool {
        self.0 == 0
    }

    /// The address `n` bytes further into the same file.
    pub(crate) fn add(self, n: usize) -> Lsn {
        let offset = self.offset() as usize + n;
        assert!(offset <= u32::MAX as usize, "log offset overflow");
        Lsn::new(self.file(), offset as u32)
    }

    /// The address one byte later in the packed order.
    pub(crate) fn successor(self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }

    /// Index of the page this address falls into.
    pub(crate) fn page_number(self, page_size: usize) -> u32 {
        (self.offset() as usize / page_size) as u32
    }

    /// Offset of this address within its page.
    pub(crate) fn page_offset(self, page_size: usize) -> usize {
        self.offset() as usize % page_size
    }

    /// The start of the page this address falls into.
    pub(crate) fn page_start(self, page_size: usize) -> Lsn {
        Lsn::new(self.file(), self.offset() - self.page_offset(page_size) as u32)
    }

    /// The 7-byte on-disk form.
    pub fn store(self) -> [u8; LSN_STORE_SIZE] {
        let mut buf = [0; LSN_STORE_SIZE];
        store_u24(&mut buf[..3], self.file());
        buf[3..].copy_from_slice(&self.offset().to_le_bytes());
        buf
    }

    /// Reads the 7-byte on-disk form from the front of `buf`.
    pub fn load(buf: &[u8]) -> Lsn {
        let file = load_u24(&buf[..3]);
        let offset = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]);
        Lsn::new(file, offset)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},0x{:x})", self.file(), self.offset())
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},0x{:x})", self.file(), self.offset())
    }
}

pub(crate) fn store_u24(buf: &mut [u8], value: u32) {
    debug_assert!(value <= MAX_FILE_NUMBER);
    buf[..3].copy_from_slice(&value.to_le_bytes()[..3]);
}

pub(crate) fn load_u24(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], 0])
}

/// Number of bytes `target` occupies when compressed against `base`.
pub fn diff_size(base: Lsn, target: Lsn) -> usize {
    if needs_escape(base, target) {
        LSN_ESCAPE_SIZE
    } else {
        compressed_size(base.0 - target.0)
    }
}

fn compressed_size(diff: u64) -> usize {
    if diff <= DIFF_2_MAX {
        2
    } else if diff <= DIFF_3_MAX {
        3
    } else if diff <= DIFF_4_MAX {
        4
    } else {
        5
    }
}

fn needs_escape(base: Lsn, target: Lsn) -> bool {
    // a delta of exactly 1 spells the escape marker
    target > base || base.0 - target.0 == 1 || base.0 - target.0 > DIFF_5_MAX
}

/// Appends `target` compressed relative to `base`, the LSN of the record
/// that refers to it.
pub fn encode_diff(base: Lsn, target: Lsn, out: &mut Vec<u8>) {
    if needs_escape(base, target) {
        out.extend_from_slice(&[0x00, 0x01]);
        out.extend_from_slice(&target.store());
        return;
    }

    let diff = base.0 - target.0;
    match compressed_size(diff) {
        2 => {
            out.push((diff >> 8) as u8);
            out.push(diff as u8);
        }
        3 => {
            out.push(0x40 | (diff >> 16) as u8);
            out.extend_from_slice(&(diff as u16).to_le_bytes());
        }
        4 => {
            out.push(0x80 | (diff >> 24) as u8);
            out.extend_from_slice(&(diff as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xC0 | (diff >> 32) as u8);
            out.extend_from_slice(&(diff as u32).to_le_bytes());
        }
    }
}

/// Size of the compressed LSN at the front of `src`, judged from its first
/// two bytes.
pub fn encoded_diff_size(src: &[u8]) -> Option<usize> {
    let first = *src.first()?;
    Some(match first & 0xC0 {
        0x00 => {
            if first == 0 && *src.get(1)? == 1 {
                LSN_ESCAPE_SIZE
            } else {
                2
            }
        }
        0x40 => 3,
        0x80 => 4,
        _ => 5,
    })
}

/// Decodes a compressed LSN from the front of `src`, returning it and the
/// number of bytes consumed. `None` if `src` is short or the delta points
/// before the start of the address space.
pub fn decode_diff(base: Lsn, src: &[u8]) -> Option<(Lsn, usize)> {
    let size = encoded_diff_size(src)?;
    let bytes = src.get(..size)?;
    let high = u64::from(bytes[0] & 0x3F);

    let diff = match size {
        LSN_ESCAPE_SIZE => return Some((Lsn::load(&bytes[2..]), size)),
        2 => (high << 8) | u64::from(bytes[1]),
        3 => (high << 16) | u64::from(u16::from_le_bytes([bytes[1], bytes[2]])),
        4 => (high << 24) | u64::from(load_u24(&bytes[1..4])),
        _ => {
            (high << 32)
                | u64::from(u32::from_le_bytes([
                    bytes[1], bytes[2], bytes[3], bytes[4],
                ]))
        }
    };

    let raw = base.0.checked_sub(diff)?;
    Some((Lsn(raw), size))
}

/// Size of the record length prefix for a record of `len` stored bytes.
pub fn varlen_size(len: usize) -> usize {
    if len < VARLEN_1_LIMIT {
        1
    } else if len < 1 << 16 {
        3
    } else if len < 1 << 24 {
        4
    } else {
        5
    }
}

/// Appends the record length prefix.
pub fn encode_varlen(len: usize, out: &mut Vec<u8>) {
    debug_assert!(len <= u32::MAX as usize);
    match varlen_size(len) {
        1 => out.push(len as u8),
        3 => {
            out.push(VARLEN_2);
            out.extend_from_slice(&(len as u16).to_le_bytes());
        }
        4 => {
            out.push(VARLEN_3);
            out.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(VARLEN_4);
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
}

/// Decodes a record length prefix, returning the length and the prefix
/// size. Rejects the reserved first bytes 250, 254 and 255.
pub fn decode_varlen(src: &[u8]) -> Option<(usize, usize)> {
    let first = *src.first()?;
    match first {
        0..=249 => Some((first as usize, 1)),
        VARLEN_2 => {
            let b = src.get(1..3)?;
            Some((u16::from_le_bytes([b[0], b[1]]) as usize, 3))
        }
        VARLEN_3 => Some((load_u24(src.get(1..4)?) as usize, 4)),
        VARLEN_4 => {
            let b = src.get(1..5)?;
            Some((u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize, 5))
        }
        _ => None,
    }
}
