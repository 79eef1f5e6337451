use std::collections::BTreeMap;
use std::fmt;
use std::io::IoSlice;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cache::{PageCache, Placement};
use super::meta::{create_meta, load_meta, write_meta, Meta};
use super::options::StorageOptions;
use super::recovery::{self, RecoveryReport};
use super::snapshot::{page_offset, read_snapshot, snapshot_pages_needed, write_snapshot};
use super::txn::Transaction;
use crate::primitives::alloc::{
    AllocationStrategy, AllocatorSnapshot, AllocatorStats, Extent, ExtentAllocator,
};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::wal::{
    CommitterStats, Wal, WalCommitter, WalEntry, WalOptions, WalStats, WalSyncMode,
};
use crate::types::checksum::ChecksumPath;
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{Lsn, PageId, Result, StrataError, TableId};

/// Attempts at placing a missed page before serving it uncached.
const MAX_PLACEMENT_ATTEMPTS: usize = 3;

/// How [`PageManager::checkpoint`] treats open transactions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointMode {
    /// Block until every open transaction has finished.
    Force,
    /// Skip the checkpoint if any transaction is open.
    BestEffort,
}

/// Outcome of a completed checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckpointReport {
    /// LSN now recorded in the header.
    pub lsn: Lsn,
    /// Dirty pages written back before the snapshot.
    pub pages_flushed: usize,
    /// Free extents in the new snapshot.
    pub snapshot_extents: u64,
    /// Pages holding the new snapshot.
    pub snapshot_pages: u64,
    /// Pages covered by the allocator.
    pub total_pages: u64,
    /// False when nothing had changed since the previous checkpoint.
    pub wrote_snapshot: bool,
}

/// Statistics about page manager performance.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PagerStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of page evictions from cache.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub dirty_writebacks: u64,
    /// Reads rejected because the stored checksum disagreed.
    pub checksum_failures: u64,
    /// Write-back passes that wrote at least one page.
    pub flushes: u64,
    /// Times the file was grown.
    pub growths: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back or dropped.
    pub rollbacks: u64,
    /// Checkpoints that wrote a snapshot.
    pub checkpoints: u64,
    /// Pages currently cached.
    pub cached_pages: u64,
    /// Cached pages waiting for write-back.
    pub dirty_pages: u64,
}

impl fmt::Display for PagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} writebacks={} checksum_failures={} flushes={} growths={} commits={} rollbacks={} checkpoints={}",
            self.hits,
            self.misses,
            self.evictions,
            self.dirty_writebacks,
            self.checksum_failures,
            self.flushes,
            self.growths,
            self.commits,
            self.rollbacks,
            self.checkpoints,
        )
    }
}

#[derive(Default)]
pub(crate) struct PagerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    dirty_writebacks: AtomicU64,
    checksum_failures: AtomicU64,
    flushes: AtomicU64,
    growths: AtomicU64,
    pub(crate) commits: AtomicU64,
    pub(crate) rollbacks: AtomicU64,
    checkpoints: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, AtomicOrdering::Relaxed);
}

/// Read-only page image held in the cache until the guard drops.
///
/// Dereferences to the payload (the bytes after the page header).
pub struct PinnedPage {
    id: PageId,
    data: Arc<[u8]>,
    pins: Option<Arc<AtomicU32>>,
}

impl PinnedPage {
    /// Page this guard refers to.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[PAGE_HDR_LEN..]
    }

    /// Decoded header, or `None` for a page that was never written.
    pub fn header(&self) -> Result<Option<PageHeader>> {
        if is_unwritten(&self.data) {
            return Ok(None);
        }
        PageHeader::decode(&self.data).map(Some)
    }
}

impl Deref for PinnedPage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        if let Some(pins) = self.pins.take() {
            pins.fetch_sub(1, AtomicOrdering::AcqRel);
        }
    }
}

pub(crate) fn is_unwritten(image: &[u8]) -> bool {
    image.iter().all(|&b| b == 0)
}

/// Appends `-wal` to the database path.
pub fn wal_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push("-wal");
    PathBuf::from(os)
}

/// Page and extent storage over one database file plus its log.
///
/// Every mutation is a transaction: records reach the log before the cache
/// sees the new image, and the page file is only written during write-back
/// and checkpoints.
pub struct PageManager {
    path: PathBuf,
    options: StorageOptions,
    checksum_path: ChecksumPath,
    page_size: u32,
    salt: u64,
    strategy: AllocationStrategy,
    sync_mode: WalSyncMode,
    verify_on_read: AtomicBool,
    poisoned: AtomicBool,
    io: Arc<dyn FileIo>,
    wal: Arc<Wal>,
    committer: WalCommitter,
    allocator: ExtentAllocator,
    cache: RwLock<PageCache>,
    dirty: Mutex<BTreeMap<PageId, Lsn>>,
    meta: Mutex<Meta>,
    snapshot_pages: Mutex<Vec<PageId>>,
    commit_lock: Mutex<()>,
    checkpoint_gate: RwLock<()>,
    grow_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    counters: PagerCounters,
    recovery: RecoveryReport,
}

impl PageManager {
    /// Creates a new database at `path`. Fails if a non-empty file exists.
    pub fn create(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let path = path.as_ref();
        if std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false) {
            return Err(StrataError::Invalid("database file already exists"));
        }
        Self::open(path, options)
    }

    /// Opens `path`, creating it if missing or empty, and replays the log.
    pub fn open(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
        let wal_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(wal_path(&path))?);
        Self::open_with_io(path, options, io, wal_io)
    }

    pub(crate) fn open_with_io(
        path: PathBuf,
        options: StorageOptions,
        io: Arc<dyn FileIo>,
        wal_io: Arc<dyn FileIo>,
    ) -> Result<Self> {
        let checksum_path = options.checksum_path.resolve();
        let meta = if io.is_empty()? {
            // A log left behind by an earlier file with this name belongs to
            // a different salt.
            wal_io.truncate(0)?;
            let meta = create_meta(io.as_ref(), options.page_size, options.storage_mode, checksum_path)?;
            info!(
                path = %path.display(),
                page_size = meta.page_size,
                storage_mode = meta.storage_mode.as_str(),
                "pager.create"
            );
            meta
        } else {
            load_meta(io.as_ref(), checksum_path)?
        };

        let snapshot = read_snapshot(io.as_ref(), &meta, checksum_path)?;
        let allocator = ExtentAllocator::new(meta.total_pages);
        allocator.load_extents(meta.total_pages, &snapshot.extents)?;
        allocator.coalesce();

        let wal = Arc::new(Wal::open(
            wal_io,
            WalOptions::new(meta.page_size, meta.wal_salt, meta.last_checkpoint_lsn.next()),
        )?);
        let report = recovery::replay(io.as_ref(), &wal, &allocator, &meta, checksum_path)?;

        let strategy = meta.storage_mode.strategy(options.default_strategy);
        let committer = WalCommitter::new(Arc::clone(&wal), options.commit_config());
        let manager = Self {
            path,
            checksum_path,
            page_size: meta.page_size,
            salt: meta.salt,
            strategy,
            sync_mode: options.synchronous.wal_sync_mode(),
            verify_on_read: AtomicBool::new(options.verify_on_read),
            poisoned: AtomicBool::new(false),
            cache: RwLock::new(PageCache::new(options.cache_pages)),
            options,
            io,
            wal,
            committer,
            allocator,
            dirty: Mutex::new(BTreeMap::new()),
            meta: Mutex::new(meta),
            snapshot_pages: Mutex::new(snapshot.pages),
            commit_lock: Mutex::new(()),
            checkpoint_gate: RwLock::new(()),
            grow_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            counters: PagerCounters::default(),
            recovery: report,
        };
        manager.settle_log()?;
        info!(
            path = %manager.path.display(),
            page_size = manager.page_size,
            total_pages = manager.allocator.total_pages(),
            free_extents = manager.allocator.extent_count(),
            strategy = manager.strategy.as_str(),
            "pager.open"
        );
        Ok(manager)
    }

    /// After replay the log either holds records (fold them into a
    /// checkpoint) or is empty but may still be numbered from before the
    /// last checkpoint.
    fn settle_log(&self) -> Result<()> {
        let expected_start = self.meta.lock().last_checkpoint_lsn.next();
        if !self.wal.is_empty()? {
            let _gate = self.checkpoint_gate.write();
            self.checkpoint_locked()?;
        } else if self.wal.start_lsn() != expected_start {
            self.wal.reset(expected_start)?;
        }
        Ok(())
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of each page in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Bytes available to consumers in each page.
    pub fn payload_size(&self) -> usize {
        self.page_size as usize - PAGE_HDR_LEN
    }

    /// Options the manager was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Strategy used for allocations.
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Checksum implementation in use.
    pub fn checksum_path(&self) -> ChecksumPath {
        self.checksum_path
    }

    /// Salt folded into page checksums.
    pub fn salt(&self) -> u64 {
        self.salt
    }

    /// Copy of the header page contents.
    pub fn meta(&self) -> Meta {
        self.meta.lock().clone()
    }

    /// What replay did when this manager was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Enables or disables checksum verification on cache misses.
    pub fn set_checksum_verification(&self, enabled: bool) {
        self.verify_on_read.store(enabled, AtomicOrdering::Relaxed);
    }

    /// Starts a transaction. Blocks while a forced checkpoint is running.
    pub fn begin_transaction(&self) -> Transaction<'_> {
        Transaction::new(self, self.checkpoint_gate.read_recursive())
    }

    /// Allocates one page, stamps a fresh header, and commits.
    #[doc(alias = "allocate_page")]
    pub fn create_page(&self, table_id: TableId, kind: PageKind) -> Result<PageId> {
        let mut txn = self.begin_transaction();
        let id = txn.create_page(table_id, kind)?;
        txn.commit()?;
        Ok(id)
    }

    /// Allocates `len` contiguous pages and commits. Their contents are
    /// whatever the file held until they are written.
    pub fn allocate_extent(&self, len: u64) -> Result<Extent> {
        let mut txn = self.begin_transaction();
        let extent = txn.allocate_extent(len)?;
        txn.commit()?;
        Ok(extent)
    }

    /// Replaces the payload of `id` and commits. Returns the record's LSN.
    pub fn write_page(&self, id: PageId, payload: &[u8]) -> Result<Lsn> {
        let mut txn = self.begin_transaction();
        txn.write_page(id, payload)?;
        txn.commit()
    }

    /// Re-logs the current image of `id` so it is written back at the next
    /// flush.
    pub fn mark_dirty(&self, id: PageId) -> Result<Lsn> {
        let mut txn = self.begin_transaction();
        txn.touch_page(id)?;
        txn.commit()
    }

    /// Frees a single page and commits.
    pub fn free_page(&self, id: PageId) -> Result<()> {
        let mut txn = self.begin_transaction();
        txn.free_page(id)?;
        txn.commit()?;
        Ok(())
    }

    /// Frees `extent` and commits.
    pub fn free_extent(&self, extent: Extent) -> Result<()> {
        let mut txn = self.begin_transaction();
        txn.free_extent(extent)?;
        txn.commit()?;
        Ok(())
    }

    /// Copy of the payload of `id`.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let data = self.fetch(id)?;
        Ok(data[PAGE_HDR_LEN..].to_vec())
    }

    /// Calls `f` with the payload of `id` without copying it.
    pub fn with_page<R>(&self, id: PageId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let data = self.fetch(id)?;
        Ok(f(&data[PAGE_HDR_LEN..]))
    }

    /// Pins `id` in the cache for as long as the guard lives.
    pub fn pin_page(&self, id: PageId) -> Result<PinnedPage> {
        self.check_readable(id)?;
        if let Some((data, pins)) = self.cache.read().pin(id) {
            bump(&self.counters.hits);
            return Ok(PinnedPage {
                id,
                data,
                pins: Some(pins),
            });
        }
        bump(&self.counters.misses);
        let data = self.cache_miss(id)?;
        Ok(match self.cache.read().pin(id) {
            Some((data, pins)) => PinnedPage {
                id,
                data,
                pins: Some(pins),
            },
            None => PinnedPage {
                id,
                data,
                pins: None,
            },
        })
    }

    /// Header of `id`, or `None` if the page was never written.
    pub fn page_header(&self, id: PageId) -> Result<Option<PageHeader>> {
        let data = self.fetch(id)?;
        if is_unwritten(&data) {
            return Ok(None);
        }
        PageHeader::decode(&data).map(Some)
    }

    /// Raw on-disk bytes of any page, bypassing the cache and verification.
    pub fn read_raw_page(&self, id: PageId) -> Result<Vec<u8>> {
        if id.0 >= self.allocator.total_pages() {
            return Err(StrataError::Invalid("page beyond end of file"));
        }
        let mut buf = vec![0u8; self.page_size as usize];
        self.io.read_at(page_offset(id, self.page_size), &mut buf)?;
        Ok(buf)
    }

    /// Writes every dirty page back, log first. Returns pages written.
    pub fn flush_dirty_pages(&self) -> Result<usize> {
        let _flush = self.flush_lock.lock();
        let pending: Vec<(PageId, Lsn)> = self
            .dirty
            .lock()
            .iter()
            .map(|(&page, &lsn)| (page, lsn))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let images: Vec<(PageId, Arc<[u8]>, Lsn)> = {
            let cache = self.cache.read();
            pending
                .iter()
                .filter_map(|&(page, _)| cache.dirty_image(page).map(|(data, lsn)| (page, data, lsn)))
                .collect()
        };
        if let Some(max_lsn) = images.iter().map(|(_, _, lsn)| *lsn).max() {
            self.wal.sync_to(max_lsn)?;
        }
        let mut sealed = Vec::with_capacity(images.len());
        for (page, data, lsn) in &images {
            let mut buf = data.to_vec();
            page::set_page_lsn(&mut buf, *lsn)?;
            page::seal(&mut buf, *page, self.salt, self.checksum_path)?;
            sealed.push(buf);
        }
        let mut run_start = 0;
        while run_start < images.len() {
            let mut run_end = run_start + 1;
            while run_end < images.len() && images[run_end].0 .0 == images[run_end - 1].0 .0 + 1 {
                run_end += 1;
            }
            let slices: Vec<IoSlice<'_>> = sealed[run_start..run_end]
                .iter()
                .map(|buf| IoSlice::new(buf))
                .collect();
            self.io
                .writev_at(page_offset(images[run_start].0, self.page_size), &slices)?;
            run_start = run_end;
        }
        if !images.is_empty() {
            self.io.sync_all()?;
        }
        {
            let mut cache = self.cache.write();
            for (page, _, lsn) in &images {
                cache.mark_clean(*page, *lsn);
            }
        }
        {
            let mut dirty = self.dirty.lock();
            for (page, lsn) in &pending {
                if dirty.get(page) == Some(lsn) {
                    dirty.remove(page);
                }
            }
        }
        let written = images.len();
        if written > 0 {
            bump(&self.counters.flushes);
            self.counters
                .dirty_writebacks
                .fetch_add(written as u64, AtomicOrdering::Relaxed);
        }
        debug!(pages = written, "pager.flush");
        Ok(written)
    }

    /// Drops every clean, unpinned cached page. Returns how many were dropped.
    pub fn purge_cache(&self) -> usize {
        self.cache.write().purge()
    }

    /// Writes back dirty pages, records a new allocator snapshot and header,
    /// and empties the log. Returns `None` if `BestEffort` found open
    /// transactions.
    ///
    /// `Force` must not be called from a thread that holds an open
    /// transaction.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<Option<CheckpointReport>> {
        let _gate = match mode {
            CheckpointMode::Force => self.checkpoint_gate.write(),
            CheckpointMode::BestEffort => match self.checkpoint_gate.try_write() {
                Some(gate) => gate,
                None => {
                    debug!("pager.checkpoint.skipped");
                    return Ok(None);
                }
            },
        };
        self.checkpoint_locked().map(Some)
    }

    fn checkpoint_locked(&self) -> Result<CheckpointReport> {
        self.ensure_healthy()?;
        if self.wal.is_empty()? && self.dirty.lock().is_empty() {
            let meta = self.meta.lock().clone();
            return Ok(CheckpointReport {
                lsn: meta.last_checkpoint_lsn,
                pages_flushed: 0,
                snapshot_extents: meta.snapshot_extents,
                snapshot_pages: meta.snapshot_pages,
                total_pages: meta.total_pages,
                wrote_snapshot: false,
            });
        }
        let pages_flushed = self.flush_dirty_pages()?;

        // Freeing the old chain can add one extent per page and growing adds
        // at most one more; allocating from the front never adds any.
        let old_pages = self.snapshot_pages.lock().clone();
        let estimate =
            snapshot_pages_needed(self.allocator.extent_count() + old_pages.len() + 1, self.page_size);
        let mut new_pages = Vec::with_capacity(estimate);
        for _ in 0..estimate {
            new_pages.push(self.allocate_with(1, AllocationStrategy::FirstFit)?.start);
        }
        new_pages.sort();
        for &page in &old_pages {
            self.allocator.free(Extent::new(page, 1))?;
        }
        let extents = self.allocator.extents();
        let total_pages = self.allocator.total_pages();
        let lsn = Lsn(self.wal.next_lsn().0.saturating_sub(1));

        let mut meta = self.meta.lock().clone();
        write_snapshot(self.io.as_ref(), &meta, &new_pages, &extents, lsn, self.checksum_path)?;
        self.ensure_file_len(total_pages)?;
        self.io.sync_all()?;

        meta.total_pages = total_pages;
        meta.last_checkpoint_lsn = lsn;
        meta.snapshot_head = new_pages.first().copied().unwrap_or(PageId(0));
        meta.snapshot_extents = extents.len() as u64;
        meta.snapshot_pages = new_pages.len() as u64;
        write_meta(self.io.as_ref(), &meta, self.checksum_path)?;
        self.wal.reset(lsn.next())?;

        let report = CheckpointReport {
            lsn,
            pages_flushed,
            snapshot_extents: meta.snapshot_extents,
            snapshot_pages: meta.snapshot_pages,
            total_pages,
            wrote_snapshot: true,
        };
        *self.meta.lock() = meta;
        *self.snapshot_pages.lock() = new_pages;
        bump(&self.counters.checkpoints);
        info!(
            lsn = lsn.0,
            pages_flushed,
            snapshot_extents = report.snapshot_extents,
            snapshot_pages = report.snapshot_pages,
            total_pages,
            "pager.checkpoint.applied"
        );
        Ok(report)
    }

    /// Runs a best-effort checkpoint once the log outgrows its segment size.
    pub(crate) fn maybe_autocheckpoint(&self) {
        let len = match self.wal.len() {
            Ok(len) => len,
            Err(err) => {
                warn!(error = %err, "pager.autocheckpoint.len_failed");
                return;
            }
        };
        if len <= self.options.wal_segment_size {
            return;
        }
        if let Err(err) = self.checkpoint(CheckpointMode::BestEffort) {
            warn!(error = %err, wal_len = len, "pager.autocheckpoint.failed");
        }
    }

    /// Checkpoints and closes. Dropping without calling this leaves the log
    /// to be replayed at the next open.
    pub fn close(self) -> Result<()> {
        self.checkpoint(CheckpointMode::Force)?;
        Ok(())
    }

    /// Merges adjacent free extents. Returns how many were eliminated.
    pub fn coalesce(&self) -> usize {
        self.allocator.coalesce()
    }

    /// Number of free extents.
    pub fn extent_count(&self) -> usize {
        self.allocator.extent_count()
    }

    /// Pages covered by the allocator.
    pub fn total_pages(&self) -> u64 {
        self.allocator.total_pages()
    }

    /// Pages currently free.
    pub fn free_pages(&self) -> u64 {
        self.allocator.free_pages()
    }

    /// True if `id` is currently free.
    pub fn is_free(&self, id: PageId) -> bool {
        self.allocator.is_free(id)
    }

    /// Length of the largest free extent.
    pub fn largest_extent(&self) -> u64 {
        self.allocator.largest_extent()
    }

    /// Consistent copy of the allocator's free extents.
    pub fn allocator_snapshot(&self) -> AllocatorSnapshot {
        self.allocator.snapshot()
    }

    /// Allocator counters.
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// Full structural check of the allocator.
    pub fn check_allocator(&self) -> Result<()> {
        self.allocator.check_invariants()
    }

    /// Pages currently holding the allocator snapshot.
    pub fn snapshot_page_ids(&self) -> Vec<PageId> {
        self.snapshot_pages.lock().clone()
    }

    /// Log counters.
    pub fn wal_stats(&self) -> WalStats {
        self.wal.stats()
    }

    /// Current log size in bytes.
    pub fn wal_len(&self) -> Result<u64> {
        self.wal.len()
    }

    /// Group-commit counters.
    pub fn committer_stats(&self) -> CommitterStats {
        self.committer.stats()
    }

    /// Returns a snapshot of page manager statistics.
    pub fn stats(&self) -> PagerStats {
        let (cached_pages, cached_dirty) = {
            let cache = self.cache.read();
            (cache.len() as u64, cache.dirty_count() as u64)
        };
        let c = &self.counters;
        PagerStats {
            hits: c.hits.load(AtomicOrdering::Relaxed),
            misses: c.misses.load(AtomicOrdering::Relaxed),
            evictions: c.evictions.load(AtomicOrdering::Relaxed),
            dirty_writebacks: c.dirty_writebacks.load(AtomicOrdering::Relaxed),
            checksum_failures: c.checksum_failures.load(AtomicOrdering::Relaxed),
            flushes: c.flushes.load(AtomicOrdering::Relaxed),
            growths: c.growths.load(AtomicOrdering::Relaxed),
            commits: c.commits.load(AtomicOrdering::Relaxed),
            rollbacks: c.rollbacks.load(AtomicOrdering::Relaxed),
            checkpoints: c.checkpoints.load(AtomicOrdering::Relaxed),
            cached_pages,
            dirty_pages: cached_dirty,
        }
    }

    // ---- crate-internal plumbing used by transactions ----

    pub(crate) fn counters(&self) -> &PagerCounters {
        &self.counters
    }

    pub(crate) fn allocator(&self) -> &ExtentAllocator {
        &self.allocator
    }

    pub(crate) fn committer(&self) -> &WalCommitter {
        &self.committer
    }

    pub(crate) fn sync_mode(&self) -> WalSyncMode {
        self.sync_mode
    }

    pub(crate) fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    /// Marks the in-memory state as diverged from the log. Commits and
    /// checkpoints fail until the file is reopened.
    pub(crate) fn poison(&self) {
        if !self.poisoned.swap(true, AtomicOrdering::AcqRel) {
            warn!(path = %self.path.display(), "pager.poisoned");
        }
    }

    /// True once a commit failed after changing the allocator.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn ensure_healthy(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(StrataError::Invalid("a failed commit left the page manager unusable; reopen it"));
        }
        Ok(())
    }

    /// Allocates with the open-time strategy, growing the file once if needed.
    pub(crate) fn allocate_pages(&self, count: u64) -> Result<Extent> {
        self.allocate_with(count, self.strategy)
    }

    fn allocate_with(&self, count: u64, strategy: AllocationStrategy) -> Result<Extent> {
        match self.allocator.allocate(count, strategy) {
            Err(StrataError::OutOfSpace { .. }) => self.grow_and_allocate(count, strategy),
            other => other,
        }
    }

    fn grow_and_allocate(&self, count: u64, strategy: AllocationStrategy) -> Result<Extent> {
        let _grow = self.grow_lock.lock();
        // Another thread may have grown the file while this one waited.
        match self.allocator.allocate(count, strategy) {
            Err(StrataError::OutOfSpace { .. }) => {}
            other => return other,
        }
        let additional = self.options.growth_pages.max(count);
        let old_total = self.allocator.total_pages();
        let new_total = old_total
            .checked_add(additional)
            .ok_or(StrataError::Invalid("page count overflow"))?;
        self.ensure_file_len(new_total)?;
        self.committer
            .commit(vec![WalEntry::grow(new_total).committing()], self.sync_mode)?;
        self.allocator.grow(additional)?;
        bump(&self.counters.growths);
        info!(old_total, new_total, requested = count, "pager.grow");
        self.allocator.allocate(count, strategy)
    }

    fn ensure_file_len(&self, total_pages: u64) -> Result<()> {
        let want = total_pages
            .checked_mul(self.page_size as u64)
            .ok_or(StrataError::Invalid("file length overflow"))?;
        if self.io.len()? < want {
            self.io.truncate(want)?;
        }
        Ok(())
    }

    pub(crate) fn check_readable(&self, id: PageId) -> Result<()> {
        if id == PageId::META {
            return Err(StrataError::Invalid("page 0 holds the file header"));
        }
        if id.0 >= self.allocator.total_pages() || self.allocator.is_free(id) {
            return Err(StrataError::Invalid("page is not allocated"));
        }
        Ok(())
    }

    /// Full current image of `id`, through the cache.
    pub(crate) fn fetch(&self, id: PageId) -> Result<Arc<[u8]>> {
        self.check_readable(id)?;
        if let Some(data) = self.cache.read().get(id) {
            bump(&self.counters.hits);
            return Ok(data);
        }
        bump(&self.counters.misses);
        self.cache_miss(id)
    }

    /// Loads `id` under the cache write lock so a concurrent write-back and
    /// eviction cannot slip an older image in behind a newer one.
    fn cache_miss(&self, id: PageId) -> Result<Arc<[u8]>> {
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let mut cache = self.cache.write();
            if let Some(data) = cache.get(id) {
                return Ok(data);
            }
            let (data, lsn) = self.load_page(id)?;
            match cache.insert_clean(id, Arc::clone(&data), lsn) {
                Placement::Stored { evicted } => {
                    if evicted {
                        bump(&self.counters.evictions);
                    }
                    return Ok(data);
                }
                Placement::Kept => return Ok(cache.get(id).unwrap_or(data)),
                Placement::NeedsFlush => {
                    drop(cache);
                    self.flush_dirty_pages()?;
                }
            }
        }
        debug!(page = id.0, "pager.cache.serve_uncached");
        self.load_page(id).map(|(data, _)| data)
    }

    fn load_page(&self, id: PageId) -> Result<(Arc<[u8]>, Lsn)> {
        let mut buf = vec![0u8; self.page_size as usize];
        self.io.read_at(page_offset(id, self.page_size), &mut buf)?;
        if is_unwritten(&buf) {
            return Ok((Arc::from(buf), Lsn::ZERO));
        }
        let header = if self.verify_on_read.load(AtomicOrdering::Relaxed) {
            match page::verify(&buf, id, self.salt, self.checksum_path) {
                Ok(header) => header,
                Err(err @ StrataError::ChecksumMismatch { .. }) => {
                    bump(&self.counters.checksum_failures);
                    warn!(page = id.0, error = %err, "pager.read.checksum_mismatch");
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        } else {
            PageHeader::decode(&buf)?
        };
        Ok((Arc::from(buf), header.page_lsn))
    }

    /// Installs committed images as dirty and records them for write-back.
    pub(crate) fn install_committed(&self, images: Vec<(PageId, Vec<u8>, Lsn)>) {
        if images.is_empty() {
            return;
        }
        let mut marks: Vec<(PageId, Lsn)> = Vec::with_capacity(images.len());
        {
            let mut cache = self.cache.write();
            for (page, image, lsn) in images {
                match cache.install_dirty(page, Arc::from(image), lsn) {
                    Placement::Stored { evicted } => {
                        if evicted {
                            bump(&self.counters.evictions);
                        }
                        marks.push((page, lsn));
                    }
                    // A later commit already installed this page.
                    Placement::Kept | Placement::NeedsFlush => {}
                }
            }
        }
        {
            let mut dirty = self.dirty.lock();
            for (page, lsn) in marks {
                let entry = dirty.entry(page).or_insert(lsn);
                if *entry < lsn {
                    *entry = lsn;
                }
            }
        }
        // Committed images may push the cache past capacity; write them back
        // so later misses find clean victims.
        if self.cache.read().over_capacity() {
            if let Err(err) = self.flush_dirty_pages() {
                warn!(error = %err, "pager.flush.after_commit_failed");
            }
        }
    }

    /// Builds a fresh image with a header for `id`.
    pub(crate) fn blank_image(&self, id: PageId, kind: PageKind, table_id: TableId) -> Result<Vec<u8>> {
        let mut image = vec![0u8; self.page_size as usize];
        PageHeader::new(id, kind, self.page_size, table_id)?.encode(&mut image)?;
        Ok(image)
    }
}

impl fmt::Debug for PageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageManager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("strategy", &self.strategy)
            .field("total_pages", &self.allocator.total_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_options() -> StorageOptions {
        StorageOptions {
            page_size: 1024,
            cache_pages: 4,
            growth_pages: 8,
            ..StorageOptions::default()
        }
    }

    #[test]
    fn fresh_file_has_only_the_header_page() {
        let dir = tempdir().unwrap();
        let pm = PageManager::open(dir.path().join("fresh.db"), small_options()).unwrap();
        assert_eq!(pm.total_pages(), 1);
        assert_eq!(pm.free_pages(), 0);
        assert!(matches!(pm.read_page(PageId(0)), Err(StrataError::Invalid(_))));
        assert!(matches!(pm.read_page(PageId(3)), Err(StrataError::Invalid(_))));
    }

    #[test]
    fn create_write_read_through_cache() {
        let dir = tempdir().unwrap();
        let pm = PageManager::open(dir.path().join("rw.db"), small_options()).unwrap();
        let id = pm.create_page(TableId(7), PageKind::Table).unwrap();
        assert_eq!(pm.stats().growths, 1);
        pm.write_page(id, b"hello").unwrap();
        let payload = pm.read_page(id).unwrap();
        assert_eq!(payload.len(), pm.payload_size());
        assert_eq!(&payload[..5], b"hello");
        let header = pm.page_header(id).unwrap().unwrap();
        assert_eq!(header.kind, PageKind::Table);
        assert_eq!(header.table_id, TableId(7));
        assert_eq!(pm.with_page(id, |p| p[4]).unwrap(), b'o');
    }

    #[test]
    fn eviction_flushes_dirty_pages_first() {
        let dir = tempdir().unwrap();
        let pm = PageManager::open(dir.path().join("evict.db"), small_options()).unwrap();
        let mut ids = Vec::new();
        for i in 0..10u8 {
            let id = pm.create_page(TableId(1), PageKind::Table).unwrap();
            pm.write_page(id, &[i; 8]).unwrap();
            ids.push(id);
        }
        pm.flush_dirty_pages().unwrap();
        assert!(pm.stats().dirty_writebacks >= 10);
        pm.purge_cache();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(pm.read_page(*id).unwrap()[..8], [i as u8; 8]);
        }
        let stats = pm.stats();
        assert!(stats.misses >= 10);
        assert!(stats.evictions > 0);
        assert_eq!(stats.dirty_pages, 0);
    }

    #[test]
    fn pinned_page_keeps_its_image() {
        let dir = tempdir().unwrap();
        let pm = PageManager::open(dir.path().join("pin.db"), small_options()).unwrap();
        let id = pm.create_page(TableId(1), PageKind::Index).unwrap();
        pm.write_page(id, b"v1").unwrap();
        let pinned = pm.pin_page(id).unwrap();
        pm.write_page(id, b"v2").unwrap();
        assert_eq!(&pinned[..2], b"v1");
        assert_eq!(&pm.read_page(id).unwrap()[..2], b"v2");
        assert_eq!(pinned.header().unwrap().unwrap().kind, PageKind::Index);
    }

    #[test]
    fn checkpoint_persists_snapshot_and_resets_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckpt.db");
        let (extents, total) = {
            let pm = PageManager::open(&path, small_options()).unwrap();
            let a = pm.allocate_extent(3).unwrap();
            let b = pm.create_page(TableId(2), PageKind::Table).unwrap();
            pm.free_extent(a).unwrap();
            pm.write_page(b, b"kept").unwrap();
            let report = pm.checkpoint(CheckpointMode::Force).unwrap().unwrap();
            assert!(report.wrote_snapshot);
            assert_eq!(pm.meta().last_checkpoint_lsn, report.lsn);
            assert!(pm.wal_len().unwrap() <= crate::primitives::wal::FILE_HEADER_LEN as u64);
            let snap = pm.allocator_snapshot();
            (snap.extents, snap.total_pages)
        };
        let pm = PageManager::open(&path, small_options()).unwrap();
        let snap = pm.allocator_snapshot();
        assert_eq!(snap.total_pages, total);
        assert_eq!(snap.extents, extents);
        assert_eq!(pm.recovery_report().records_applied, 0);
    }

    #[test]
    fn idle_checkpoint_writes_nothing() {
        let dir = tempdir().unwrap();
        let pm = PageManager::open(dir.path().join("idle.db"), small_options()).unwrap();
        let report = pm.checkpoint(CheckpointMode::Force).unwrap().unwrap();
        assert!(!report.wrote_snapshot);
        assert_eq!(pm.total_pages(), 1);
    }

    #[test]
    fn best_effort_checkpoint_skips_open_transactions() {
        let dir = tempdir().unwrap();
        let pm = PageManager::open(dir.path().join("gate.db"), small_options()).unwrap();
        let txn = pm.begin_transaction();
        assert!(pm.checkpoint(CheckpointMode::BestEffort).unwrap().is_none());
        txn.rollback();
        assert!(pm.checkpoint(CheckpointMode::BestEffort).unwrap().is_some());
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.db");
        PageManager::create(&path, small_options()).unwrap();
        assert!(matches!(
            PageManager::create(&path, small_options()),
            Err(StrataError::Invalid(_))
        ));
    }
}
