use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_manager;
use crate::admin::{AdminError, Result};
use crate::primitives::pager::is_unwritten;
use crate::types::page::{self, PageHeader};
use crate::types::{PageId, StrataError};

/// Decoded view of one on-disk page.
#[derive(Debug, Clone, Serialize)]
pub struct PageDump {
    /// Page number.
    pub page: u64,
    /// Whether the allocator currently considers the page free.
    pub free: bool,
    /// True for an all-zero page that was never written.
    pub unwritten: bool,
    /// Page kind from the header, if it decodes.
    pub kind: Option<String>,
    /// Owning table from the header.
    pub table_id: Option<u32>,
    /// LSN of the last logged change written back.
    pub page_lsn: Option<u64>,
    /// Stored checksum.
    pub crc32: Option<u32>,
    /// Whether the stored checksum matches the bytes.
    pub checksum_ok: bool,
    /// Raw page bytes, hex encoded.
    pub hex: String,
}

/// Reads page `page` straight from disk after writing back cached changes.
pub fn dump_page(path: impl AsRef<Path>, opts: &AdminOpenOptions, page: u64) -> Result<PageDump> {
    let manager = open_manager(path.as_ref(), opts)?;
    let id = PageId(page);
    if page >= manager.total_pages() {
        return Err(AdminError::Message(format!(
            "page {page} is beyond the last page ({})",
            manager.total_pages().saturating_sub(1)
        )));
    }
    manager.flush_dirty_pages()?;
    let raw = manager.read_raw_page(id)?;
    let unwritten = is_unwritten(&raw);
    let header = PageHeader::decode(&raw).ok();
    let checksum_ok = match page::verify(&raw, id, manager.salt(), manager.checksum_path()) {
        Ok(_) => true,
        Err(StrataError::ChecksumMismatch { .. }) | Err(StrataError::Corruption(_)) => false,
        Err(err) => return Err(err.into()),
    };
    Ok(PageDump {
        page,
        free: manager.is_free(id),
        unwritten,
        kind: header.as_ref().map(|h| h.kind.as_str().to_string()),
        table_id: header.as_ref().map(|h| h.table_id.0),
        page_lsn: header.as_ref().map(|h| h.page_lsn.0),
        crc32: header.as_ref().map(|h| h.crc32),
        checksum_ok,
        hex: hex::encode(&raw),
    })
}
