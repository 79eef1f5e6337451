use std::fmt;
use std::io::ErrorKind;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};
use serde::Serialize;

use super::options::StorageMode;
use crate::primitives::bytes::be;
use crate::primitives::io::FileIo;
use crate::types::checksum::{page_crc32, ChecksumPath};
use crate::types::page::{self, validate_page_size, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{Lsn, PageId, Result, StrataError, TableId};

const META_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 4;
const META_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 6;
const META_STORAGE_MODE: usize = PAGE_HDR_LEN + 6;
const META_RESERVED: usize = PAGE_HDR_LEN + 7;
const META_SALT: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const META_WAL_SALT: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const META_TOTAL_PAGES: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const META_LAST_CHECKPOINT_LSN: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const META_SNAPSHOT_HEAD: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const META_SNAPSHOT_EXTENTS: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 56;
const META_SNAPSHOT_PAGES: Range<usize> = PAGE_HDR_LEN + 56..PAGE_HDR_LEN + 64;
const META_END: usize = PAGE_HDR_LEN + 64;

/// Database header stored in page 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Meta {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// On-disk format version.
    pub format_version: u16,
    /// Layout policy chosen at creation.
    pub storage_mode: StorageMode,
    /// Salt folded into every page checksum.
    pub salt: u64,
    /// Salt tying the log file to this database.
    pub wal_salt: u64,
    /// Pages covered by the allocator at the last checkpoint.
    pub total_pages: u64,
    /// Highest LSN reflected in the file and snapshot.
    pub last_checkpoint_lsn: Lsn,
    /// First page of the allocator snapshot chain, 0 if none.
    pub snapshot_head: PageId,
    /// Free extents recorded in the snapshot.
    pub snapshot_extents: u64,
    /// Pages in the snapshot chain.
    pub snapshot_pages: u64,
}

impl Meta {
    /// Fresh header for a new file: only page 0 exists.
    pub fn fresh(page_size: u32, storage_mode: StorageMode) -> Result<Self> {
        validate_page_size(page_size)?;
        let mut rng = OsRng;
        Ok(Self {
            page_size,
            format_version: page::PAGE_FORMAT_VERSION,
            storage_mode,
            salt: rng.next_u64(),
            wal_salt: rng.next_u64(),
            total_pages: 1,
            last_checkpoint_lsn: Lsn::ZERO,
            snapshot_head: PageId(0),
            snapshot_extents: 0,
            snapshot_pages: 0,
        })
    }
}

/// Creates the header page of a new file and syncs it.
pub fn create_meta(
    io: &dyn FileIo,
    page_size: u32,
    storage_mode: StorageMode,
    path: ChecksumPath,
) -> Result<Meta> {
    let meta = Meta::fresh(page_size, storage_mode)?;
    write_meta(io, &meta, path)?;
    Ok(meta)
}

/// Encodes `meta` into page 0 and syncs.
pub fn write_meta(io: &dyn FileIo, meta: &Meta, path: ChecksumPath) -> Result<()> {
    let mut buf = vec![0u8; meta.page_size as usize];
    write_meta_page(&mut buf, meta, path)?;
    io.write_at(0, &buf)?;
    io.sync_all()
}

/// Loads and verifies the header page.
///
/// The page size is read from a fixed offset first so the whole page can be
/// fetched and checksummed.
pub fn load_meta(io: &dyn FileIo, path: ChecksumPath) -> Result<Meta> {
    let mut probe = [0u8; META_END];
    read_or_corrupt(io, 0, &mut probe)?;
    let page_size = be::u32_at(&probe, META_PAGE_SIZE.start)?;
    validate_page_size(page_size).map_err(|_| StrataError::Corruption("meta page size invalid"))?;
    let mut buf = vec![0u8; page_size as usize];
    read_or_corrupt(io, 0, &mut buf)?;
    read_meta_page(&buf, path)
}

fn read_or_corrupt(io: &dyn FileIo, off: u64, dst: &mut [u8]) -> Result<()> {
    match io.read_at(off, dst) {
        Ok(()) => Ok(()),
        Err(StrataError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            Err(StrataError::Corruption("meta page truncated"))
        }
        Err(err) => Err(err),
    }
}

/// Encodes metadata into a page buffer with header and checksum.
pub fn write_meta_page(buf: &mut [u8], meta: &Meta, path: ChecksumPath) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() < page_size || page_size < META_END {
        return Err(StrataError::Invalid("meta buffer too small"));
    }
    let buf = &mut buf[..page_size];
    buf.fill(0);
    PageHeader::new(PageId(0), PageKind::Meta, meta.page_size, TableId(0))?
        .with_lsn(meta.last_checkpoint_lsn)
        .encode(buf)?;
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FORMAT_VERSION].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_STORAGE_MODE] = meta.storage_mode as u8;
    buf[META_RESERVED] = 0;
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_WAL_SALT].copy_from_slice(&meta.wal_salt.to_be_bytes());
    buf[META_TOTAL_PAGES].copy_from_slice(&meta.total_pages.to_be_bytes());
    buf[META_LAST_CHECKPOINT_LSN].copy_from_slice(&meta.last_checkpoint_lsn.0.to_be_bytes());
    buf[META_SNAPSHOT_HEAD].copy_from_slice(&meta.snapshot_head.0.to_be_bytes());
    buf[META_SNAPSHOT_EXTENTS].copy_from_slice(&meta.snapshot_extents.to_be_bytes());
    buf[META_SNAPSHOT_PAGES].copy_from_slice(&meta.snapshot_pages.to_be_bytes());
    page::clear_crc32(buf)?;
    let crc = page_crc32(path, 0, meta.salt, buf);
    buf[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Decodes and verifies a header page.
pub fn read_meta_page(buf: &[u8], path: ChecksumPath) -> Result<Meta> {
    if buf.len() < META_END {
        return Err(StrataError::Corruption("meta page truncated"));
    }
    let page_size = be::u32_at(buf, META_PAGE_SIZE.start)?;
    let len = page_size as usize;
    if buf.len() < len || len < META_END {
        return Err(StrataError::Corruption("meta page truncated"));
    }
    let salt = be::u64_at(buf, META_SALT.start)?;
    let stored = page::stored_crc32(buf)?;
    let mut scratch = buf[..len].to_vec();
    page::clear_crc32(&mut scratch)?;
    let actual = page_crc32(path, 0, salt, &scratch);
    if actual != stored {
        return Err(StrataError::ChecksumMismatch {
            page: 0,
            expected: stored,
            actual,
        });
    }
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::Meta || header.page_no != PageId(0) {
        return Err(StrataError::Corruption("meta page has wrong kind"));
    }
    if header.page_size != page_size {
        return Err(StrataError::Corruption("meta page size disagrees with header"));
    }
    if buf[META_RESERVED] != 0 {
        return Err(StrataError::Corruption("meta reserved field non-zero"));
    }
    let format_version = be::u16_at(buf, META_FORMAT_VERSION.start)?;
    if format_version != page::PAGE_FORMAT_VERSION {
        return Err(StrataError::Corruption("unsupported meta format version"));
    }
    let meta = Meta {
        page_size,
        format_version,
        storage_mode: StorageMode::from_u8(buf[META_STORAGE_MODE])?,
        salt,
        wal_salt: be::u64_at(buf, META_WAL_SALT.start)?,
        total_pages: be::u64_at(buf, META_TOTAL_PAGES.start)?,
        last_checkpoint_lsn: Lsn(be::u64_at(buf, META_LAST_CHECKPOINT_LSN.start)?),
        snapshot_head: PageId(be::u64_at(buf, META_SNAPSHOT_HEAD.start)?),
        snapshot_extents: be::u64_at(buf, META_SNAPSHOT_EXTENTS.start)?,
        snapshot_pages: be::u64_at(buf, META_SNAPSHOT_PAGES.start)?,
    };
    if meta.total_pages == 0 {
        return Err(StrataError::Corruption("meta total_pages is zero"));
    }
    if meta.snapshot_head.0 >= meta.total_pages {
        return Err(StrataError::Corruption("snapshot head beyond end of file"));
    }
    Ok(meta)
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta(page_size={}, format_version={}, storage_mode={}, total_pages={}, last_checkpoint_lsn={}, snapshot_head={}, snapshot_extents={}, snapshot_pages={})",
            self.page_size,
            self.format_version,
            self.storage_mode.as_str(),
            self.total_pages,
            self.last_checkpoint_lsn.0,
            self.snapshot_head.0,
            self.snapshot_extents,
            self.snapshot_pages,
        )
    }
}
