//! Allocator snapshot: the free extent set written as a chain of
//! `FreeList` pages at checkpoint time.
//!
//! Payload layout per page: `next u64 | count u32 | reserved u32` followed by
//! `count` entries of `start u64 | len u64`.

use std::collections::HashSet;

use super::meta::Meta;
use crate::primitives::alloc::Extent;
use crate::primitives::bytes::be;
use crate::primitives::io::FileIo;
use crate::types::checksum::ChecksumPath;
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{Lsn, PageId, Result, StrataError, TableId};

const CHAIN_HDR_LEN: usize = 16;
const ENTRY_LEN: usize = 16;

/// Extents that fit in one snapshot page.
pub fn snapshot_page_capacity(page_size: u32) -> usize {
    (page_size as usize).saturating_sub(PAGE_HDR_LEN + CHAIN_HDR_LEN) / ENTRY_LEN
}

/// Pages needed to hold `extent_count` extents.
pub fn snapshot_pages_needed(extent_count: usize, page_size: u32) -> usize {
    let cap = snapshot_page_capacity(page_size).max(1);
    extent_count.div_ceil(cap)
}

/// Decoded contents of one snapshot page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPage {
    /// Next page in the chain, 0 at the end.
    pub next: PageId,
    /// Extents stored on this page.
    pub extents: Vec<Extent>,
}

/// Encodes one snapshot page, including header and checksum.
pub fn encode_snapshot_page(
    buf: &mut [u8],
    page_id: PageId,
    meta: &Meta,
    next: PageId,
    extents: &[Extent],
    lsn: Lsn,
    path: ChecksumPath,
) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() != page_size {
        return Err(StrataError::Invalid("snapshot page buffer size mismatch"));
    }
    if extents.len() > snapshot_page_capacity(meta.page_size) {
        return Err(StrataError::Invalid("too many extents for one snapshot page"));
    }
    buf.fill(0);
    PageHeader::new(page_id, PageKind::FreeList, meta.page_size, TableId(0))?
        .with_lsn(lsn)
        .encode(buf)?;
    let payload = &mut buf[PAGE_HDR_LEN..];
    be::put_u64(payload, 0, next.0)?;
    be::put_u32(payload, 8, extents.len() as u32)?;
    for (idx, extent) in extents.iter().enumerate() {
        let off = CHAIN_HDR_LEN + idx * ENTRY_LEN;
        be::put_u64(payload, off, extent.start.0)?;
        be::put_u64(payload, off + 8, extent.len)?;
    }
    page::seal(buf, page_id, meta.salt, path)
}

/// Verifies and decodes one snapshot page.
pub fn decode_snapshot_page(
    buf: &[u8],
    page_id: PageId,
    meta: &Meta,
    path: ChecksumPath,
) -> Result<SnapshotPage> {
    let header = page::verify(buf, page_id, meta.salt, path)?;
    if header.kind != PageKind::FreeList {
        return Err(StrataError::Corruption("snapshot page kind mismatch"));
    }
    let payload = &buf[PAGE_HDR_LEN..];
    let next = PageId(be::u64_at(payload, 0)?);
    let count = be::u32_at(payload, 8)? as usize;
    if be::u32_at(payload, 12)? != 0 {
        return Err(StrataError::Corruption("snapshot page reserved non-zero"));
    }
    if count > snapshot_page_capacity(meta.page_size) {
        return Err(StrataError::Corruption("snapshot page count exceeds capacity"));
    }
    let mut extents = Vec::with_capacity(count);
    for idx in 0..count {
        let off = CHAIN_HDR_LEN + idx * ENTRY_LEN;
        let start = PageId(be::u64_at(payload, off)?);
        let len = be::u64_at(payload, off + 8)?;
        extents.push(Extent::new(start, len));
    }
    Ok(SnapshotPage { next, extents })
}

/// Writes `extents` across `pages` (in chain order). Pages beyond what the
/// extents need are written with a zero count. Does not sync.
pub fn write_snapshot(
    io: &dyn FileIo,
    meta: &Meta,
    pages: &[PageId],
    extents: &[Extent],
    lsn: Lsn,
    path: ChecksumPath,
) -> Result<()> {
    let cap = snapshot_page_capacity(meta.page_size);
    if extents.len() > cap * pages.len() {
        return Err(StrataError::Invalid("snapshot pages cannot hold every extent"));
    }
    let mut chunks = extents.chunks(cap.max(1));
    let mut buf = vec![0u8; meta.page_size as usize];
    for (idx, &page_id) in pages.iter().enumerate() {
        let next = pages.get(idx + 1).copied().unwrap_or(PageId(0));
        let chunk = chunks.next().unwrap_or(&[]);
        encode_snapshot_page(&mut buf, page_id, meta, next, chunk, lsn, path)?;
        io.write_at(page_offset(page_id, meta.page_size), &buf)?;
    }
    Ok(())
}

/// Loaded snapshot chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedSnapshot {
    /// Free extents in chain order.
    pub extents: Vec<Extent>,
    /// Pages the chain occupies.
    pub pages: Vec<PageId>,
}

/// Follows the chain named by `meta`, verifying every page.
pub fn read_snapshot(io: &dyn FileIo, meta: &Meta, path: ChecksumPath) -> Result<LoadedSnapshot> {
    let mut loaded = LoadedSnapshot::default();
    let mut seen = HashSet::new();
    let mut current = meta.snapshot_head;
    let mut buf = vec![0u8; meta.page_size as usize];
    while current.0 != 0 {
        if current.0 >= meta.total_pages {
            return Err(StrataError::Corruption("snapshot chain points past end of file"));
        }
        if !seen.insert(current) || loaded.pages.len() as u64 >= meta.snapshot_pages {
            return Err(StrataError::Corruption("snapshot chain longer than recorded"));
        }
        io.read_at(page_offset(current, meta.page_size), &mut buf)?;
        let page = decode_snapshot_page(&buf, current, meta, path)?;
        loaded.pages.push(current);
        loaded.extents.extend(page.extents);
        current = page.next;
    }
    if loaded.pages.len() as u64 != meta.snapshot_pages {
        return Err(StrataError::Corruption("snapshot chain shorter than recorded"));
    }
    if loaded.extents.len() as u64 != meta.snapshot_extents {
        return Err(StrataError::Corruption("snapshot extent count mismatch"));
    }
    Ok(loaded)
}

pub(crate) fn page_offset(page: PageId, page_size: u32) -> u64 {
    page.0 * page_size as u64
}
