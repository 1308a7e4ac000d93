//! Log page layout.
//!
//! ```text
//! offset  size              field
//! 0       3                 page number within the file
//! 3       3                 file number
//! 6       1                 flags (PAGE_CRC | PAGE_SECTOR_PROTECTION | PAGE_RECORD_CRC)
//! 7       4 (if PAGE_CRC)   crc32 of the payload
//! ..      page_size / 512   sector table (if PAGE_SECTOR_PROTECTION)
//! ..                        payload: chunks, then 0xFF filler
//! ```
//!
//! With sector protection every sector but the first has its first byte
//! replaced by the page's write epoch, the original byte living in the
//! sector table. Entry 0 of the table holds the epoch base of the page,
//! the epoch of a write is the base plus the page's rewrite counter. A
//! sector whose epoch runs backwards (or jumps too far) did not make it to
//! disk in the last write.

use crate::{
    PageError,
    translog::chunk::Chunks,
    translog::lsn::{load_u24, store_u24},
};

/// Granularity of atomic writes assumed for the underlying device.
pub const DISK_DRIVE_SECTOR_SIZE: usize = 512;

/// Unused page space is filled with this byte. It is also the first byte
/// no chunk can start with.
pub const FILLER: u8 = 0xFF;

pub const PAGE_CRC: u8 = 0x1;
pub const PAGE_SECTOR_PROTECTION: u8 = 0x2;
pub const PAGE_RECORD_CRC: u8 = 0x4;
const PAGE_FLAGS_MASK: u8 = PAGE_CRC | PAGE_SECTOR_PROTECTION | PAGE_RECORD_CRC;

const PAGE_NUMBER_OFFSET: usize = 0;
const FILE_NUMBER_OFFSET: usize = 3;
const FLAGS_OFFSET: usize = 6;
const CRC_OFFSET: usize = 7;

/// Size of the fixed part of every page header.
pub const PAGE_HEADER_BASE: usize = 7;
const CRC_SIZE: usize = 4;

/// Largest epoch step tolerated between two consecutive sectors. This is
/// an empirical value and also bounds how often one page may be rewritten.
pub(crate) const SECTOR_EPOCH_TOLERANCE: u8 = (DISK_DRIVE_SECTOR_SIZE / 3) as u8;

fn header_len(flags: u8, page_size: usize) -> usize {
    let mut len = PAGE_HEADER_BASE;
    if flags & PAGE_CRC != 0 {
        len += CRC_SIZE;
    }
    if flags & PAGE_SECTOR_PROTECTION != 0 {
        len += page_size / DISK_DRIVE_SECTOR_SIZE;
    }
    len
}

/// Page size dependent layout, with the header length of every flag
/// combination precomputed.
#[derive(Debug, Clone)]
pub struct PageGeometry {
    page_size: usize,
    flags: u8,
    overhead: [usize; 8],
}

/// The outcome of a successful page validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCheck {
    /// The rewrite counter the page was last written with.
    pub write_counter: u8,
}

impl PageGeometry {
    /// `flags` are the flags new pages are written with.
    pub fn new(page_size: usize, flags: u8) -> PageGeometry {
        let mut overhead = [0; 8];
        for (flags, slot) in overhead.iter_mut().enumerate() {
            *slot = header_len(flags as u8, page_size);
        }
        PageGeometry { page_size, flags: flags & PAGE_FLAGS_MASK, overhead }
    }

    /// Header length of a page written with `flags`.
    pub fn overhead(&self, flags: u8) -> usize {
        self.overhead[(flags & PAGE_FLAGS_MASK) as usize]
    }

    /// Header length of new pages.
    pub fn page_overhead(&self) -> usize {
        self.overhead(self.flags)
    }

    /// Payload bytes of a new page.
    pub fn payload(&self) -> usize {
        self.page_size - self.page_overhead()
    }

    fn sectors(&self) -> usize {
        self.page_size / DISK_DRIVE_SECTOR_SIZE
    }

    /// Writes the header of a fresh page at the front of `page`, returning
    /// its length. The CRC and sector table are filled in by `seal`.
    pub fn write_header(&self, page: &mut [u8], page_no: u32, file_no: u32) -> usize {
        let overhead = self.page_overhead();
        let mut view = PageView::new(&mut page[..overhead]);
        view.set_page_number(page_no);
        view.set_file_number(file_no);
        view.set_flags(self.flags);

        let header = view.into_inner();
        header[PAGE_HEADER_BASE..].fill(0);
        if self.flags & PAGE_SECTOR_PROTECTION != 0 {
            header[overhead - self.sectors()] = page_no as u8;
        }
        overhead
    }

    /// Turns a clean, filler-padded page into its on-disk image: stores the
    /// payload CRC, then stamps every sector with the epoch of this write.
    pub fn seal(&self, page: &mut [u8], write_counter: u8) {
        debug_assert_eq!(page.len(), self.page_size);
        debug_assert!(write_counter <= SECTOR_EPOCH_TOLERANCE);

        let flags = page[FLAGS_OFFSET];
        let overhead = self.overhead(flags);

        if flags & PAGE_CRC != 0 {
            let crc = crc32fast::hash(&page[overhead..]);
            PageView::new(&mut *page).set_crc(crc);
        }

        if flags & PAGE_SECTOR_PROTECTION != 0 {
            let table = overhead - self.sectors();
            let epoch = page[table].wrapping_add(write_counter);
            for sector in 1..self.sectors() {
                let offset = sector * DISK_DRIVE_SECTOR_SIZE;
                page[table + sector] = page[offset];
                page[offset] = epoch;
            }
        }
    }

    /// Checks an on-disk page image and restores its clean form in place.
    ///
    /// On a torn write the page is still cut back to the chunks that end
    /// before the torn sector, with filler after them, and
    /// `PageError::SectorCorrupt` says where the tear was and how much of
    /// the page is left.
    pub fn validate(
        &self,
        page: &mut [u8],
        page_no: u32,
        file_no: u32,
    ) -> Result<PageCheck, PageError> {
        let view = PageView::new(&*page);
        if view.page_number() != page_no || view.file_number() != file_no {
            return Err(PageError::PageMismatch);
        }

        let flags = view.flags();
        if flags & !PAGE_FLAGS_MASK != 0 {
            return Err(PageError::BadFlags);
        }

        let overhead = self.overhead(flags);
        let mut write_counter = 0;

        if flags & PAGE_SECTOR_PROTECTION != 0 {
            let table = overhead - self.sectors();
            let base = page[table];

            for sector in 1..self.sectors() {
                let step = page[sector * DISK_DRIVE_SECTOR_SIZE].wrapping_sub(base);
                if step <= SECTOR_EPOCH_TOLERANCE {
                    write_counter = write_counter.max(step);
                }
            }

            let mut current = base;
            for sector in 1..self.sectors() {
                let offset = sector * DISK_DRIVE_SECTOR_SIZE;
                let test = page[offset];

                let torn = if test < current {
                    0xFF - u32::from(current) + u32::from(test)
                        > u32::from(SECTOR_EPOCH_TOLERANCE)
                } else {
                    test - current > SECTOR_EPOCH_TOLERANCE
                };

                if torn {
                    let kept = recover_up_to_sector(page, overhead, offset);
                    return Err(PageError::SectorCorrupt { torn_at: offset, kept, write_counter });
                }

                page[offset] = page[table + sector];
                current = test;
            }
        }

        if flags & PAGE_CRC != 0 {
            let crc = crc32fast::hash(&page[overhead..]);
            if crc != PageView::new(&*page).crc() {
                return Err(PageError::CrcMismatch);
            }
        }

        Ok(PageCheck { write_counter })
    }
}

/// Cuts the page back to the last chunk that ends at or before
/// `torn_offset`, returning where the kept part ends. Chunks after one
/// that does not parse are dropped too.
fn recover_up_to_sector(page: &mut [u8], overhead: usize, torn_offset: usize) -> usize {
    let mut valid_end = overhead;

    for chunk in Chunks::new(page, overhead) {
        let Ok(chunk) = chunk else {
            break;
        };
        if chunk.offset >= torn_offset {
            break;
        }
        let end = chunk.offset + chunk.len;
        if end <= torn_offset {
            valid_end = end;
        } else {
            break;
        }
    }

    page[valid_end..].fill(FILLER);
    valid_end
}

/// Typed access to the header fields of a page.
pub struct PageView<B> {
    bytes: B,
}

impl<B: AsRef<[u8]>> PageView<B> {
    pub fn new(bytes: B) -> PageView<B> {
        PageView { bytes }
    }

    pub fn into_inner(self) -> B {
        self.bytes
    }

    pub fn page_number(&self) -> u32 {
        load_u24(&self.bytes.as_ref()[PAGE_NUMBER_OFFSET..])
    }

    pub fn file_number(&self) -> u32 {
        load_u24(&self.bytes.as_ref()[FILE_NUMBER_OFFSET..])
    }

    pub fn flags(&self) -> u8 {
        self.bytes.as_ref()[FLAGS_OFFSET]
    }

    /// Header length, derived from the flags and the page length.
    pub fn header_len(&self) -> usize {
        header_len(self.flags(), self.bytes.as_ref().len())
    }

    pub fn crc(&self) -> u32 {
        let b = &self.bytes.as_ref()[CRC_OFFSET..CRC_OFFSET + CRC_SIZE];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// The sector table, if the page is protected.
    #[cfg(test)]
    pub fn sector_table(&self) -> Option<&[u8]> {
        if self.flags() & PAGE_SECTOR_PROTECTION == 0 {
            return None;
        }
        let bytes = self.bytes.as_ref();
        let end = self.header_len();
        let start = end - bytes.len() / DISK_DRIVE_SECTOR_SIZE;
        Some(&bytes[start..end])
    }

}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PageView<B> {
    pub fn set_page_number(&mut self, page_no: u32) {
        store_u24(&mut self.bytes.as_mut()[PAGE_NUMBER_OFFSET..], page_no);
    }

    pub fn set_file_number(&mut self, file_no: u32) {
        store_u24(&mut self.bytes.as_mut()[FILE_NUMBER_OFFSET..], file_no);
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.bytes.as_mut()[FLAGS_OFFSET] = flags;
    }

    pub fn set_crc(&mut self, crc: u32) {
        self.bytes.as_mut()[CRC_OFFSET..CRC_OFFSET + CRC_SIZE]
            .copy_from_slice(&crc.to_le_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::translog::chunk::CHUNK_LNGTH;

    const ALL: u8 = PAGE_CRC | PAGE_SECTOR_PROTECTION;

    /// A clean page holding length-prefixed chunks of the given sizes.
    fn page_with_chunks(geometry: &PageGeometry, sizes: &[usize]) -> Vec<u8> {
        let mut page = vec![FILLER; geometry.page_size];
        let mut at = geometry.write_header(&mut page, 5, 2);
        for (i, size) in sizes.iter().enumerate() {
            page[at] = CHUNK_LNGTH;
            page[at + 1..at + 3].copy_from_slice(&(*size as u16).to_le_bytes());
            page[at + 3..at + 3 + size].fill(i as u8);
            at += 3 + size;
        }
        page
    }

    #[test]
    fn overhead_table() {
        let geometry = PageGeometry::new(8192, ALL);
        assert_eq!(geometry.overhead(0), 7);
        assert_eq!(geometry.overhead(PAGE_CRC), 11);
        assert_eq!(geometry.overhead(PAGE_SECTOR_PROTECTION), 7 + 16);
        assert_eq!(geometry.overhead(ALL), 11 + 16);
        assert_eq!(geometry.overhead(ALL | PAGE_RECORD_CRC), 11 + 16);
        assert_eq!(geometry.payload(), 8192 - 27);
    }

    #[test]
    fn sealed_page_validates() {
        let geometry = PageGeometry::new(2048, ALL);
        let clean = page_with_chunks(&geometry, &[100, 700, 900]);

        let mut disk = clean.clone();
        geometry.seal(&mut disk, 3);
        assert_ne!(disk, clean);

        let check = geometry.validate(&mut disk, 5, 2).unwrap();
        assert_eq!(check, PageCheck { write_counter: 3 });

        let overhead = geometry.page_overhead();
        assert_eq!(disk[overhead..], clean[overhead..]);
        assert_eq!(PageView::new(&disk).sector_table().unwrap()[0], 5);
    }

    #[test]
    fn page_position_is_checked() {
        let geometry = PageGeometry::new(1024, ALL);
        let mut disk = page_with_chunks(&geometry, &[10]);
        geometry.seal(&mut disk, 0);

        assert_eq!(
            geometry.validate(&mut disk.clone(), 6, 2),
            Err(PageError::PageMismatch)
        );
        assert_eq!(
            geometry.validate(&mut disk.clone(), 5, 3),
            Err(PageError::PageMismatch)
        );

        disk[FLAGS_OFFSET] |= 0x10;
        assert_eq!(geometry.validate(&mut disk, 5, 2), Err(PageError::BadFlags));
    }

    #[test]
    fn crc_detects_every_single_bit_flip() {
        let geometry = PageGeometry::new(512, PAGE_CRC);
        let mut disk = page_with_chunks(&geometry, &[40, 200]);
        geometry.seal(&mut disk, 0);

        let overhead = geometry.page_overhead();
        for byte in overhead..disk.len() {
            for bit in 0..8 {
                let mut flipped = disk.clone();
                flipped[byte] ^= 1 << bit;
                assert_eq!(
                    geometry.validate(&mut flipped, 5, 2),
                    Err(PageError::CrcMismatch),
                    "flip of bit {} in byte {} went unnoticed",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn torn_rewrite_keeps_chunks_before_the_torn_sector() {
        let geometry = PageGeometry::new(2048, ALL);

        // first write of the page holds one chunk
        let mut old = page_with_chunks(&geometry, &[300]);
        geometry.seal(&mut old, 0);

        // the rewrite adds chunks reaching into sectors 2 and 3
        let clean = page_with_chunks(&geometry, &[300, 400, 600]);
        let mut new = clean.clone();
        geometry.seal(&mut new, 1);

        // only sectors 0 and 1 of the rewrite reach the disk
        let mut torn = old.clone();
        torn[..2 * DISK_DRIVE_SECTOR_SIZE]
            .copy_from_slice(&new[..2 * DISK_DRIVE_SECTOR_SIZE]);

        // the 400 byte chunk ends in sector 1, the 600 byte one does not
        let overhead = geometry.page_overhead();
        let kept = overhead + 303 + 403;
        assert!(kept < 2 * DISK_DRIVE_SECTOR_SIZE);

        assert_eq!(
            geometry.validate(&mut torn, 5, 2),
            Err(PageError::SectorCorrupt {
                torn_at: 2 * DISK_DRIVE_SECTOR_SIZE,
                kept,
                write_counter: 1,
            })
        );
        assert_eq!(torn[overhead..kept], clean[overhead..kept]);
        assert!(torn[kept..].iter().all(|b| *b == FILLER));
    }

    #[test]
    fn unprotected_pages_skip_sector_checks() {
        let geometry = PageGeometry::new(1024, 0);
        let clean = page_with_chunks(&geometry, &[10, 20]);
        let mut disk = clean.clone();
        geometry.seal(&mut disk, 0);
        assert_eq!(disk, clean);
        assert!(PageView::new(&disk).sector_table().is_none());
        geometry.validate(&mut disk, 5, 2).unwrap();
    }
}
