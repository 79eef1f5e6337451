use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering as AtomicOrdering;

use parking_lot::RwLockReadGuard;
use tracing::{debug, warn};

use super::manager::{is_unwritten, PageManager};
use crate::primitives::alloc::Extent;
use crate::primitives::wal::WalEntry;
use crate::types::page::{self, PageKind, PAGE_HDR_LEN};
use crate::types::{Lsn, PageId, Result, StrataError, TableId};

/// Unit of work against a [`PageManager`].
///
/// Page writes stay private until [`commit`](Transaction::commit).
/// Allocations are reserved immediately so concurrent transactions never
/// receive the same pages; frees are applied at commit. Dropping an
/// uncommitted transaction rolls it back.
pub struct Transaction<'a> {
    pm: &'a PageManager,
    _gate: RwLockReadGuard<'a, ()>,
    writes: BTreeMap<PageId, Vec<u8>>,
    reserved: Vec<Extent>,
    freed: Vec<Extent>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(pm: &'a PageManager, gate: RwLockReadGuard<'a, ()>) -> Self {
        Self {
            pm,
            _gate: gate,
            writes: BTreeMap::new(),
            reserved: Vec::new(),
            freed: Vec::new(),
            finished: false,
        }
    }

    /// Reserves one page and gives it a fresh header of `kind`.
    pub fn create_page(&mut self, table_id: TableId, kind: PageKind) -> Result<PageId> {
        let extent = self.pm.allocate_pages(1)?;
        self.reserved.push(extent);
        let image = self.pm.blank_image(extent.start, kind, table_id)?;
        self.writes.insert(extent.start, image);
        Ok(extent.start)
    }

    /// Reserves `len` contiguous pages without writing them.
    pub fn allocate_extent(&mut self, len: u64) -> Result<Extent> {
        let extent = self.pm.allocate_pages(len)?;
        self.reserved.push(extent);
        Ok(extent)
    }

    /// Replaces the payload of `id`; shorter payloads are zero-padded.
    ///
    /// A page that has never been written gets an `Overflow` header.
    pub fn write_page(&mut self, id: PageId, payload: &[u8]) -> Result<()> {
        if payload.len() > self.pm.payload_size() {
            return Err(StrataError::Invalid("payload larger than a page"));
        }
        let image = self.image_mut(id)?;
        let body = &mut image[PAGE_HDR_LEN..];
        body[..payload.len()].copy_from_slice(payload);
        body[payload.len()..].fill(0);
        Ok(())
    }

    /// Payload of `id` as this transaction sees it.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        if self.is_freed(id) {
            return Err(StrataError::Invalid("page freed in this transaction"));
        }
        match self.writes.get(&id) {
            Some(image) => Ok(image[PAGE_HDR_LEN..].to_vec()),
            None => self.pm.read_page(id),
        }
    }

    /// Frees one page at commit.
    pub fn free_page(&mut self, id: PageId) -> Result<()> {
        self.free_extent(Extent::new(id, 1))
    }

    /// Frees `extent` at commit. The whole range must be allocated now.
    pub fn free_extent(&mut self, extent: Extent) -> Result<()> {
        let (start, len) = (extent.start.0, extent.len);
        if len == 0 {
            return Err(StrataError::invalid_extent(start, len, "zero-length extent"));
        }
        if extent.contains(PageId::META) {
            return Err(StrataError::invalid_extent(start, len, "page 0 holds the file header"));
        }
        if !self.pm.allocator().is_range_allocated(extent) {
            return Err(StrataError::invalid_extent(start, len, "range is not allocated"));
        }
        let end = start + len;
        if self
            .freed
            .iter()
            .any(|f| f.start.0 < end && start < f.start.0 + f.len)
        {
            return Err(StrataError::invalid_extent(start, len, "already freed in this transaction"));
        }
        self.writes.retain(|page, _| !extent.contains(*page));
        self.freed.push(extent);
        Ok(())
    }

    /// Buffers the current image of `id` so commit re-logs it.
    pub(crate) fn touch_page(&mut self, id: PageId) -> Result<()> {
        self.image_mut(id).map(|_| ())
    }

    fn is_freed(&self, id: PageId) -> bool {
        self.freed.iter().any(|extent| extent.contains(id))
    }

    fn image_mut(&mut self, id: PageId) -> Result<&mut Vec<u8>> {
        if self.is_freed(id) {
            return Err(StrataError::Invalid("page freed in this transaction"));
        }
        match self.writes.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let current = self.pm.fetch(id)?;
                let image = if is_unwritten(&current) {
                    self.pm.blank_image(id, PageKind::Overflow, TableId(0))?
                } else {
                    current.to_vec()
                };
                Ok(entry.insert(image))
            }
        }
    }

    /// Logs the transaction and installs its pages. Returns the LSN of its
    /// last record.
    pub fn commit(mut self) -> Result<Lsn> {
        let pm = self.pm;
        let result = self.commit_inner();
        drop(self);
        if result.is_ok() {
            pm.maybe_autocheckpoint();
        }
        result
    }

    fn commit_inner(&mut self) -> Result<Lsn> {
        let pm = self.pm;
        pm.ensure_healthy()?;
        let image_count = self.writes.len() as u64;
        let mut entries: Vec<WalEntry> =
            Vec::with_capacity(self.reserved.len() + self.freed.len() + self.writes.len());
        entries.extend(self.reserved.iter().map(|e| WalEntry::allocate(*e)));
        entries.extend(self.freed.iter().map(|e| WalEntry::free(*e)));
        entries.extend(
            self.writes
                .iter()
                .map(|(page, image)| WalEntry::page_image(*page, image.clone())),
        );
        let entries = match entries.pop() {
            Some(last) => {
                entries.push(last.committing());
                entries
            }
            None => vec![WalEntry::commit()],
        };

        let ticket = {
            let _commit = pm.commit_lock().lock();
            let allocator = pm.allocator();
            for extent in &self.freed {
                if !allocator.is_range_allocated(*extent) {
                    return Err(StrataError::invalid_extent(
                        extent.start.0,
                        extent.len,
                        "range is not allocated",
                    ));
                }
            }
            for extent in &self.freed {
                allocator.free(*extent)?;
            }
            self.finished = true;
            pm.committer().enqueue(entries, pm.sync_mode())
        };
        // The frees and reservations are already visible to other
        // transactions, so a failed log write cannot be undone in memory.
        let last = ticket.wait().inspect_err(|err| {
            warn!(error = %err, freed = self.freed.len(), "pager.txn.commit_failed");
            pm.poison();
        })?;

        // Page images are the trailing records of the group.
        let first_image_lsn = last.0 + 1 - image_count;
        let mut images = Vec::with_capacity(self.writes.len());
        for (idx, (page, mut image)) in std::mem::take(&mut self.writes).into_iter().enumerate() {
            let lsn = Lsn(first_image_lsn + idx as u64);
            page::set_page_lsn(&mut image, lsn)?;
            images.push((page, image, lsn));
        }
        pm.install_committed(images);
        pm.counters().commits.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(
            lsn = last.0,
            reserved = self.reserved.len(),
            freed = self.freed.len(),
            pages = image_count,
            "pager.txn.commit"
        );
        Ok(last)
    }

    /// Discards buffered writes and returns reserved pages.
    pub fn rollback(self) {
        drop(self);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for extent in self.reserved.drain(..) {
            if let Err(err) = self.pm.allocator().free(extent) {
                warn!(start = extent.start.0, len = extent.len, error = %err, "pager.txn.rollback_free_failed");
            }
        }
        self.pm
            .counters()
            .rollbacks
            .fetch_add(1, AtomicOrdering::Relaxed);
        debug!(pages = self.writes.len(), "pager.txn.rollback");
    }
}
