//! Fixed-capacity page cache with CLOCK replacement.
//!
//! Frames hold full page images behind an `Arc` so readers can keep a page
//! alive after the cache lock is released. Installing a newer image swaps the
//! `Arc`; pinned readers keep the version they pinned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::types::{Lsn, PageId};

pub(crate) struct Frame {
    pub(crate) page: PageId,
    pub(crate) data: Arc<[u8]>,
    pub(crate) page_lsn: Lsn,
    pub(crate) dirty: bool,
    reference: AtomicBool,
    pins: Arc<AtomicU32>,
}

impl Frame {
    fn new(page: PageId, data: Arc<[u8]>, page_lsn: Lsn, dirty: bool) -> Self {
        Self {
            page,
            data,
            page_lsn,
            dirty,
            reference: AtomicBool::new(false),
            pins: Arc::new(AtomicU32::new(0)),
        }
    }

    fn pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// Outcome of placing an image in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// The image now lives in the cache.
    Stored { evicted: bool },
    /// A newer or dirty image was already cached; nothing changed.
    Kept,
    /// Every candidate frame is dirty; write some back and retry.
    NeedsFlush,
}

pub(crate) struct PageCache {
    capacity: usize,
    frames: Vec<Frame>,
    map: HashMap<PageId, usize>,
    hand: usize,
}

impl PageCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Vec::with_capacity(capacity),
            map: HashMap::with_capacity(capacity),
            hand: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn over_capacity(&self) -> bool {
        self.frames.len() > self.capacity
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.frames.iter().filter(|f| f.dirty).count()
    }

    /// Returns the cached image and marks the frame referenced.
    pub(crate) fn get(&self, page: PageId) -> Option<Arc<[u8]>> {
        let idx = *self.map.get(&page)?;
        let frame = &self.frames[idx];
        frame.reference.store(true, Ordering::Relaxed);
        Some(Arc::clone(&frame.data))
    }

    /// Like [`get`](Self::get) but also takes a pin on the frame.
    pub(crate) fn pin(&self, page: PageId) -> Option<(Arc<[u8]>, Arc<AtomicU32>)> {
        let idx = *self.map.get(&page)?;
        let frame = &self.frames[idx];
        frame.reference.store(true, Ordering::Relaxed);
        frame.pins.fetch_add(1, Ordering::AcqRel);
        Some((Arc::clone(&frame.data), Arc::clone(&frame.pins)))
    }

    /// Caches an image read from disk. A cached copy always wins because it
    /// is at least as new as the file.
    pub(crate) fn insert_clean(&mut self, page: PageId, data: Arc<[u8]>, page_lsn: Lsn) -> Placement {
        if self.map.contains_key(&page) {
            return Placement::Kept;
        }
        self.place(page, data, page_lsn, false)
    }

    /// Installs a committed image. Older LSNs never replace newer ones,
    /// whether or not the newer image has been written back.
    pub(crate) fn install_dirty(&mut self, page: PageId, data: Arc<[u8]>, page_lsn: Lsn) -> Placement {
        if let Some(&idx) = self.map.get(&page) {
            let frame = &mut self.frames[idx];
            if frame.page_lsn >= page_lsn {
                return Placement::Kept;
            }
            frame.data = data;
            frame.page_lsn = page_lsn;
            frame.dirty = true;
            frame.reference.store(true, Ordering::Relaxed);
            return Placement::Stored { evicted: false };
        }
        self.place(page, data, page_lsn, true)
    }

    /// Clears the dirty bit if the frame still holds the image written back.
    pub(crate) fn mark_clean(&mut self, page: PageId, page_lsn: Lsn) {
        if let Some(&idx) = self.map.get(&page) {
            let frame = &mut self.frames[idx];
            if frame.page_lsn == page_lsn {
                frame.dirty = false;
            }
        }
    }

    /// Dirty image and LSN for `page`, if any.
    pub(crate) fn dirty_image(&self, page: PageId) -> Option<(Arc<[u8]>, Lsn)> {
        let idx = *self.map.get(&page)?;
        let frame = &self.frames[idx];
        frame
            .dirty
            .then(|| (Arc::clone(&frame.data), frame.page_lsn))
    }

    /// Drops every clean, unpinned frame. Returns how many were dropped.
    pub(crate) fn purge(&mut self) -> usize {
        let before = self.frames.len();
        self.frames.retain(|f| f.dirty || f.pinned());
        self.map.clear();
        for (idx, frame) in self.frames.iter().enumerate() {
            self.map.insert(frame.page, idx);
        }
        self.hand = 0;
        before - self.frames.len()
    }

    fn place(&mut self, page: PageId, data: Arc<[u8]>, page_lsn: Lsn, dirty: bool) -> Placement {
        if self.frames.len() < self.capacity {
            self.map.insert(page, self.frames.len());
            self.frames.push(Frame::new(page, data, page_lsn, dirty));
            return Placement::Stored { evicted: false };
        }
        match self.run_clock() {
            Some(idx) => {
                let old = self.frames[idx].page;
                self.map.remove(&old);
                self.frames[idx] = Frame::new(page, data, page_lsn, dirty);
                self.map.insert(page, idx);
                Placement::Stored { evicted: true }
            }
            None if self.frames.iter().any(|f| f.dirty && !f.pinned()) && !dirty => {
                Placement::NeedsFlush
            }
            None => {
                // Only pinned frames, or a committed image that must not be
                // lost: exceed capacity until pins drop.
                self.map.insert(page, self.frames.len());
                self.frames.push(Frame::new(page, data, page_lsn, dirty));
                Placement::Stored { evicted: false }
            }
        }
    }

    /// Sweeps at most two full rotations looking for an unreferenced, clean,
    /// unpinned frame.
    fn run_clock(&mut self) -> Option<usize> {
        let len = self.frames.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len * 2 {
            let idx = self.hand % len;
            self.hand = (idx + 1) % len;
            let frame = &self.frames[idx];
            if frame.dirty || frame.pinned() {
                continue;
            }
            if frame.reference.swap(false, Ordering::Relaxed) {
                continue;
            }
            return Some(idx);
        }
        None
    }
}
