#![forbid(unsafe_code)]
//! Identifiers, the crate error type, and the shared page header layout.

use std::fmt;

use serde::Serialize;

/// Checksum helpers used by page and log encoders.
pub mod checksum;

/// Number of a page within the database file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

/// Log sequence number assigned by the write-ahead log.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

/// Owner tag stamped into page headers by higher layers.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct TableId(pub u32);

impl PageId {
    /// The reserved header page.
    pub const META: PageId = PageId(0);
}

impl Lsn {
    /// Sentinel for "no record".
    pub const ZERO: Lsn = Lsn(0);

    /// Returns the next sequence number.
    pub fn next(self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }
}

/// Errors surfaced by every storage component.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// Underlying file operation failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// No free extent could satisfy the request, even after growing.
    #[error("out of space: no free extent of {requested} pages")]
    OutOfSpace {
        /// Pages requested by the caller.
        requested: u64,
    },
    /// Stored and computed page checksums disagree.
    #[error("checksum mismatch on page {page}: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Page whose bytes failed verification.
        page: u64,
        /// Checksum stored in the page header.
        expected: u32,
        /// Checksum computed over the bytes read.
        actual: u32,
    },
    /// The log ends in a way recovery cannot reconcile.
    #[error("torn write: {0}")]
    TornWrite(&'static str),
    /// An extent argument is malformed or conflicts with allocator state.
    #[error("invalid extent [{start}, +{len}): {reason}")]
    InvalidExtent {
        /// First page of the rejected extent.
        start: u64,
        /// Length of the rejected extent.
        len: u64,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// Persistent structures failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    pub(crate) fn invalid_extent(start: u64, len: u64, reason: &'static str) -> Self {
        StrataError::InvalidExtent { start, len, reason }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<u32> for TableId {
    fn from(value: u32) -> Self {
        TableId(value)
    }
}

pub mod page {
    //! Shared on-disk page metadata used by pager components.

    use core::convert::TryFrom;

    use super::checksum::{page_crc32, ChecksumPath};
    use super::{Lsn, PageId, Result, StrataError, TableId};
    use crate::primitives::bytes::be;

    /// Magic prefix of every formatted page.
    pub const PAGE_MAGIC: [u8; 4] = *b"STRP";
    /// Current page format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Page size used when options do not choose one.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest accepted page size.
    pub const MIN_PAGE_SIZE: u32 = 1024;
    /// Largest accepted page size.
    pub const MAX_PAGE_SIZE: u32 = 64 * 1024;
    /// Bytes occupied by [`PageHeader`].
    pub const PAGE_HDR_LEN: usize = 40;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const RESERVED: usize = 7;
        pub const PAGE_SIZE: Range<usize> = 8..12;
        pub const PAGE_NO: Range<usize> = 12..20;
        pub const TABLE_ID: Range<usize> = 20..24;
        pub const RESERVED_WORD: Range<usize> = 24..28;
        pub const PAGE_LSN: Range<usize> = 28..36;
        pub const CRC32: Range<usize> = 36..40;
    }

    /// Validates a page size chosen at creation time.
    pub fn validate_page_size(page_size: u32) -> Result<()> {
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
        {
            return Err(StrataError::Invalid(
                "page size must be a power of two between 1 KiB and 64 KiB",
            ));
        }
        Ok(())
    }

    /// Role a page plays in the file.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub enum PageKind {
        /// Database header page (page 0).
        Meta = 1,
        /// Allocator snapshot chain page.
        FreeList = 2,
        /// Table data page.
        Table = 3,
        /// Index page.
        Index = 4,
        /// Overflow continuation page.
        Overflow = 5,
    }

    impl PageKind {
        /// Wire value of the kind.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }

        /// Lowercase name used by tooling.
        pub const fn as_str(self) -> &'static str {
            match self {
                PageKind::Meta => "meta",
                PageKind::FreeList => "freelist",
                PageKind::Table => "table",
                PageKind::Index => "index",
                PageKind::Overflow => "overflow",
            }
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = StrataError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Meta),
                2 => Ok(PageKind::FreeList),
                3 => Ok(PageKind::Table),
                4 => Ok(PageKind::Index),
                5 => Ok(PageKind::Overflow),
                _ => Err(StrataError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded fixed header found at the start of every page.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version the page was written with.
        pub format_version: u16,
        /// What the page holds.
        pub kind: PageKind,
        /// Page size recorded at write time.
        pub page_size: u32,
        /// Self-identifying page number.
        pub page_no: PageId,
        /// Owner tag supplied by the caller of `create_page`.
        pub table_id: TableId,
        /// LSN of the last logged image of this page.
        pub page_lsn: Lsn,
        /// Checksum over page number, salt and page bytes.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Builds a header with a zero checksum.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, table_id: TableId) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(StrataError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                table_id,
                page_lsn: Lsn::ZERO,
                crc32: 0,
            })
        }

        /// Returns the header with `page_lsn` replaced.
        pub fn with_lsn(mut self, lsn: Lsn) -> Self {
            self.page_lsn = lsn;
            self
        }

        /// Returns the header with `crc32` replaced.
        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(StrataError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::TABLE_ID].copy_from_slice(&self.table_id.0.to_be_bytes());
            hdr[header::RESERVED_WORD].fill(0);
            hdr[header::PAGE_LSN].copy_from_slice(&self.page_lsn.0.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Parses and validates a header.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(StrataError::Corruption("page header truncated"));
            }
            if src[header::MAGIC] != PAGE_MAGIC {
                return Err(StrataError::Corruption("invalid page magic"));
            }
            let format_version = be::u16_at(src, header::FORMAT_VERSION.start)?;
            if format_version != PAGE_FORMAT_VERSION {
                return Err(StrataError::Corruption("unsupported page format version"));
            }
            if src[header::RESERVED] != 0 {
                return Err(StrataError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(src[header::PAGE_KIND])?;
            let page_size = be::u32_at(src, header::PAGE_SIZE.start)?;
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(StrataError::Corruption("page size smaller than header"));
            }
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no: PageId(be::u64_at(src, header::PAGE_NO.start)?),
                table_id: TableId(be::u32_at(src, header::TABLE_ID.start)?),
                page_lsn: Lsn(be::u64_at(src, header::PAGE_LSN.start)?),
                crc32: be::u32_at(src, header::CRC32.start)?,
            })
        }
    }

    /// Zeroes the checksum field so the page can be hashed.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(StrataError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Reads the stored checksum without validating the rest of the header.
    pub fn stored_crc32(buf: &[u8]) -> Result<u32> {
        be::u32_at(buf, header::CRC32.start)
    }

    /// Computes the checksum of a full page image and stores it in the header.
    pub fn seal(buf: &mut [u8], page_no: PageId, salt: u64, path: ChecksumPath) -> Result<()> {
        clear_crc32(buf)?;
        let crc = page_crc32(path, page_no.0, salt, buf);
        buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Verifies a full page image read from disk, checksum first, then the
    /// header. Any flipped byte surfaces as `ChecksumMismatch`.
    pub fn verify(buf: &[u8], page_no: PageId, salt: u64, path: ChecksumPath) -> Result<PageHeader> {
        let expected = stored_crc32(buf)?;
        let mut scratch = buf.to_vec();
        clear_crc32(&mut scratch)?;
        let actual = page_crc32(path, page_no.0, salt, &scratch);
        if actual != expected {
            return Err(StrataError::ChecksumMismatch {
                page: page_no.0,
                expected,
                actual,
            });
        }
        let header = PageHeader::decode(buf)?;
        if header.page_no != page_no {
            return Err(StrataError::Corruption("page number does not match location"));
        }
        if header.page_size as usize != buf.len() {
            return Err(StrataError::Corruption("page size does not match file"));
        }
        Ok(header)
    }

    /// Overwrites the `page_lsn` field in place.
    pub fn set_page_lsn(buf: &mut [u8], lsn: Lsn) -> Result<()> {
        if buf.len() < header::PAGE_LSN.end {
            return Err(StrataError::Invalid("page header buffer too small"));
        }
        buf[header::PAGE_LSN].copy_from_slice(&lsn.0.to_be_bytes());
        Ok(())
    }
}
