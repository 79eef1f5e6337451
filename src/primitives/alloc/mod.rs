#![forbid(unsafe_code)]
//! Extent allocator over the pages of one database file.
//!
//! Free space is tracked twice: [`FreeExtentStore`] orders extents by start
//! page for neighbor merging and first-fit scans, and [`FreeSpaceIndex`]
//! buckets them by length for best-fit and worst-fit queries. Both live
//! behind a single mutex and are changed together in every mutation.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{PageId, Result, StrataError};

/// Start-ordered free extent store.
pub mod store;
/// Length-bucketed free extent index.
pub mod space_index;

pub use space_index::FreeSpaceIndex;
pub use store::FreeExtentStore;

/// A contiguous run of pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct Extent {
    /// First page of the run.
    pub start: PageId,
    /// Number of pages.
    pub len: u64,
}

impl Extent {
    /// Builds an extent.
    pub fn new(start: PageId, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last page, or `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.start.0.checked_add(self.len)
    }

    /// True if `page` lies inside the extent.
    pub fn contains(&self, page: PageId) -> bool {
        page.0 >= self.start.0 && self.end().is_some_and(|end| page.0 < end)
    }

    /// Pages in ascending order.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        (0..self.len).map(move |off| PageId(self.start.0 + off))
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, +{})", self.start.0, self.len)
    }
}

/// How [`ExtentAllocator::allocate`] picks among sufficient free extents.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Lowest start page whose extent is large enough.
    #[default]
    FirstFit,
    /// Smallest sufficient extent, ties by lowest start.
    BestFit,
    /// Largest extent, ties by lowest start.
    WorstFit,
}

impl AllocationStrategy {
    /// Name used in configuration and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStrategy::FirstFit => "first_fit",
            AllocationStrategy::BestFit => "best_fit",
            AllocationStrategy::WorstFit => "worst_fit",
        }
    }
}

impl FromStr for AllocationStrategy {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "first_fit" | "firstfit" => Ok(AllocationStrategy::FirstFit),
            "best_fit" | "bestfit" => Ok(AllocationStrategy::BestFit),
            "worst_fit" | "worstfit" => Ok(AllocationStrategy::WorstFit),
            _ => Err(StrataError::Invalid("unknown allocation strategy")),
        }
    }
}

/// Counters kept by the allocator.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AllocatorStats {
    /// Successful `allocate` calls.
    pub allocations: u64,
    /// Successful `free` calls.
    pub frees: u64,
    /// Neighbor merges performed at insert time and by `coalesce`.
    pub merges: u64,
    /// `allocate` calls that found no sufficient extent.
    pub failed_allocations: u64,
    /// Explicit `coalesce` passes.
    pub coalesce_passes: u64,
}

/// Point-in-time copy of allocator state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocatorSnapshot {
    /// Pages covered by the allocator.
    pub total_pages: u64,
    /// Free extents in start order.
    pub extents: Vec<Extent>,
}

#[derive(Debug, Default)]
struct AllocState {
    total_pages: u64,
    store: FreeExtentStore,
    index: FreeSpaceIndex,
    stats: AllocatorStats,
}

/// Thread-safe extent allocator.
#[derive(Debug, Default)]
pub struct ExtentAllocator {
    state: Mutex<AllocState>,
}

impl ExtentAllocator {
    /// Allocator over `total_pages` pages, all of them allocated.
    pub fn new(total_pages: u64) -> Self {
        Self {
            state: Mutex::new(AllocState {
                total_pages,
                ..AllocState::default()
            }),
        }
    }

    /// Allocator over `total_pages` pages with `extents` free.
    pub fn with_extents(total_pages: u64, extents: &[Extent]) -> Result<Self> {
        let alloc = Self::default();
        alloc.load_extents(total_pages, extents)?;
        Ok(alloc)
    }

    /// Hands out `page_count` contiguous pages carved from the front of the
    /// extent `strategy` selects.
    pub fn allocate(&self, page_count: u64, strategy: AllocationStrategy) -> Result<Extent> {
        if page_count == 0 {
            return Err(StrataError::invalid_extent(0, 0, "allocation of zero pages"));
        }
        let mut state = self.state.lock();
        let candidate = match strategy {
            AllocationStrategy::FirstFit => state.index.lowest_start_at_least(page_count),
            AllocationStrategy::BestFit => state.index.smallest_at_least(page_count),
            AllocationStrategy::WorstFit => state
                .index
                .largest()
                .filter(|&(_, len)| len >= page_count),
        };
        let Some((start, len)) = candidate else {
            state.stats.failed_allocations += 1;
            trace!(page_count, strategy = strategy.as_str(), "alloc.allocate.out_of_space");
            return Err(StrataError::OutOfSpace {
                requested: page_count,
            });
        };
        state.take(start, len);
        if len > page_count {
            state.put(start + page_count, len - page_count);
        }
        state.stats.allocations += 1;
        state.debug_check();
        trace!(start, page_count, strategy = strategy.as_str(), "alloc.allocate");
        Ok(Extent::new(PageId(start), page_count))
    }

    /// Returns an extent to the free set, merging with its immediate
    /// neighbors only.
    pub fn free(&self, extent: Extent) -> Result<()> {
        let mut state = self.state.lock();
        state.free_range(extent.start.0, extent.len)?;
        state.stats.frees += 1;
        state.debug_check();
        trace!(start = extent.start.0, len = extent.len, "alloc.free");
        Ok(())
    }

    /// Merges every run of adjacent free extents. Returns how many extents
    /// were eliminated; a second call returns zero.
    pub fn coalesce(&self) -> usize {
        let mut state = self.state.lock();
        state.stats.coalesce_passes += 1;
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(state.store.len());
        for (start, len) in state.store.iter() {
            match merged.last_mut() {
                Some(last) if last.0 + last.1 == start => last.1 += len,
                _ => merged.push((start, len)),
            }
        }
        let eliminated = state.store.len() - merged.len();
        if eliminated > 0 {
            state.store.clear();
            state.index.clear();
            for (start, len) in merged {
                state.put(start, len);
            }
            state.stats.merges += eliminated as u64;
        }
        state.debug_check();
        debug!(eliminated, extents = state.store.len(), "alloc.coalesce");
        eliminated
    }

    /// Replaces all state with `extents` over `total_pages`, without merging
    /// adjacent entries. Input order does not matter.
    pub fn load_extents(&self, total_pages: u64, extents: &[Extent]) -> Result<()> {
        let mut sorted: Vec<Extent> = extents.to_vec();
        sorted.sort_by_key(|e| e.start);
        let mut prev_end = 0u64;
        for extent in &sorted {
            let start = extent.start.0;
            if extent.len == 0 {
                return Err(StrataError::invalid_extent(start, 0, "zero-length extent"));
            }
            let end = extent
                .end()
                .filter(|&end| end <= total_pages)
                .ok_or_else(|| {
                    StrataError::invalid_extent(start, extent.len, "extent beyond end of file")
                })?;
            if start < prev_end {
                return Err(StrataError::invalid_extent(
                    start,
                    extent.len,
                    "overlaps another loaded extent",
                ));
            }
            prev_end = end;
        }
        let mut state = self.state.lock();
        state.store.clear();
        state.index.clear();
        state.total_pages = total_pages;
        for extent in sorted {
            state.put(extent.start.0, extent.len);
        }
        state.debug_check();
        debug!(total_pages, extents = state.store.len(), "alloc.load");
        Ok(())
    }

    /// Extends the file by `additional` pages and frees the new tail.
    /// Returns the new page total.
    pub fn grow(&self, additional: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let old_total = state.total_pages;
        if additional == 0 {
            return Ok(old_total);
        }
        let new_total = old_total
            .checked_add(additional)
            .ok_or(StrataError::Invalid("page count overflow"))?;
        state.total_pages = new_total;
        state.free_range(old_total, additional)?;
        state.debug_check();
        debug!(old_total, new_total, "alloc.grow");
        Ok(new_total)
    }

    /// Marks an exact range allocated. The range must lie inside a single
    /// free extent; used when replaying logged allocations.
    pub fn allocate_at(&self, extent: Extent) -> Result<()> {
        let start = extent.start.0;
        let len = extent.len;
        if len == 0 {
            return Err(StrataError::invalid_extent(start, len, "zero-length extent"));
        }
        let end = extent
            .end()
            .ok_or_else(|| StrataError::invalid_extent(start, len, "extent overflows"))?;
        let mut state = self.state.lock();
        let (host_start, host_len) = state
            .store
            .at_or_before(start)
            .filter(|&(s, l)| s + l >= end)
            .ok_or_else(|| StrataError::invalid_extent(start, len, "range is not free"))?;
        state.take(host_start, host_len);
        if start > host_start {
            state.put(host_start, start - host_start);
        }
        let host_end = host_start + host_len;
        if host_end > end {
            state.put(end, host_end - end);
        }
        state.debug_check();
        Ok(())
    }

    /// True if `page` is inside a free extent.
    pub fn is_free(&self, page: PageId) -> bool {
        let state = self.state.lock();
        state
            .store
            .at_or_before(page.0)
            .is_some_and(|(s, l)| page.0 < s + l)
    }

    /// True if every page of `extent` is free.
    pub fn is_range_free(&self, extent: Extent) -> bool {
        let Some(end) = extent.end() else {
            return false;
        };
        let state = self.state.lock();
        state
            .store
            .at_or_before(extent.start.0)
            .is_some_and(|(s, l)| end <= s + l)
    }

    /// True if `extent` lies inside the file and no page of it is free.
    pub fn is_range_allocated(&self, extent: Extent) -> bool {
        let Some(end) = extent.end() else {
            return false;
        };
        let state = self.state.lock();
        if extent.len == 0 || end > state.total_pages {
            return false;
        }
        let start = extent.start.0;
        let left_clear = state
            .store
            .at_or_before(start)
            .map_or(true, |(s, l)| s + l <= start);
        let right_clear = state.store.at_or_after(start).map_or(true, |(s, _)| s >= end);
        left_clear && right_clear
    }

    /// Number of free extents.
    pub fn extent_count(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Pages covered by the allocator.
    pub fn total_pages(&self) -> u64 {
        self.state.lock().total_pages
    }

    /// Pages currently free.
    pub fn free_pages(&self) -> u64 {
        self.state.lock().store.free_pages()
    }

    /// Pages currently allocated.
    pub fn allocated_pages(&self) -> u64 {
        let state = self.state.lock();
        state.total_pages - state.store.free_pages()
    }

    /// Length of the largest free extent, zero when none.
    pub fn largest_extent(&self) -> u64 {
        self.state
            .lock()
            .index
            .largest()
            .map(|(_, len)| len)
            .unwrap_or(0)
    }

    /// Free extents in start order.
    pub fn extents(&self) -> Vec<Extent> {
        self.state
            .lock()
            .store
            .iter()
            .map(|(s, l)| Extent::new(PageId(s), l))
            .collect()
    }

    /// Consistent copy of page total and free extents.
    pub fn snapshot(&self) -> AllocatorSnapshot {
        let state = self.state.lock();
        AllocatorSnapshot {
            total_pages: state.total_pages,
            extents: state
                .store
                .iter()
                .map(|(s, l)| Extent::new(PageId(s), l))
                .collect(),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AllocatorStats {
        self.state.lock().stats.clone()
    }

    /// Full structural validation of the store and index.
    pub fn check_invariants(&self) -> Result<()> {
        self.state.lock().check()
    }
}

impl AllocState {
    fn put(&mut self, start: u64, len: u64) {
        self.store.insert(start, len);
        self.index.insert(len, start);
    }

    fn take(&mut self, start: u64, len: u64) {
        self.store.remove(start);
        self.index.remove(len, start);
    }

    fn free_range(&mut self, start: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(StrataError::invalid_extent(start, len, "zero-length extent"));
        }
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.total_pages)
            .ok_or_else(|| StrataError::invalid_extent(start, len, "extent beyond end of file"))?;
        let left = self.store.at_or_before(start);
        if let Some((ls, ll)) = left {
            if ls + ll > start {
                return Err(StrataError::invalid_extent(start, len, "overlaps free extent"));
            }
        }
        let right = self.store.at_or_after(start);
        if let Some((rs, _)) = right {
            if rs < end {
                return Err(StrataError::invalid_extent(start, len, "overlaps free extent"));
            }
        }
        let mut new_start = start;
        let mut new_len = len;
        if let Some((ls, ll)) = left.filter(|&(ls, ll)| ls + ll == start) {
            self.take(ls, ll);
            new_start = ls;
            new_len += ll;
            self.stats.merges += 1;
        }
        if let Some((rs, rl)) = right.filter(|&(rs, _)| rs == end) {
            self.take(rs, rl);
            new_len += rl;
            self.stats.merges += 1;
        }
        self.put(new_start, new_len);
        Ok(())
    }

    /// Constant-time agreement check run after every mutation in debug builds.
    fn debug_check(&self) {
        debug_assert_eq!(self.store.len(), self.index.len(), "store/index size drift");
        debug_assert!(self.store.free_pages() <= self.total_pages, "free pages exceed total");
    }

    fn check(&self) -> Result<()> {
        if self.store.len() != self.index.len() {
            return Err(StrataError::Corruption("free space index out of sync with store"));
        }
        let mut prev_end = 0u64;
        let mut sum = 0u64;
        for (start, len) in self.store.iter() {
            if len == 0 {
                return Err(StrataError::Corruption("zero-length free extent"));
            }
            if start < prev_end {
                return Err(StrataError::Corruption("free extents overlap"));
            }
            if !self.index.contains(len, start) {
                return Err(StrataError::Corruption("free extent missing from size index"));
            }
            prev_end = start
                .checked_add(len)
                .ok_or(StrataError::Corruption("free extent overflows"))?;
            sum += len;
        }
        if prev_end > self.total_pages {
            return Err(StrataError::Corruption("free extent beyond end of file"));
        }
        if sum != self.store.free_pages() {
            return Err(StrataError::Corruption("free page total drifted"));
        }
        Ok(())
    }
}
