use std::collections::BTreeMap;

/// Free extents ordered by start page.
///
/// Stored as `start -> len`. The store itself does no merging or overlap
/// checking; [`super::ExtentAllocator`] owns those rules and keeps the
/// [`super::FreeSpaceIndex`] in step with every change made here.
#[derive(Clone, Debug, Default)]
pub struct FreeExtentStore {
    map: BTreeMap<u64, u64>,
    free_pages: u64,
}

impl FreeExtentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `[start, start + len)`. Returns the previous length if an
    /// extent already started at `start`.
    pub fn insert(&mut self, start: u64, len: u64) -> Option<u64> {
        let prev = self.map.insert(start, len);
        self.free_pages += len;
        if let Some(old) = prev {
            self.free_pages -= old;
        }
        prev
    }

    /// Removes the extent starting at `start`.
    pub fn remove(&mut self, start: u64) -> Option<u64> {
        let len = self.map.remove(&start)?;
        self.free_pages -= len;
        Some(len)
    }

    /// Length of the extent starting exactly at `start`.
    pub fn get(&self, start: u64) -> Option<u64> {
        self.map.get(&start).copied()
    }

    /// Last extent whose start is `<= page`.
    pub fn at_or_before(&self, page: u64) -> Option<(u64, u64)> {
        self.map.range(..=page).next_back().map(|(&s, &l)| (s, l))
    }

    /// First extent whose start is `>= page`.
    pub fn at_or_after(&self, page: u64) -> Option<(u64, u64)> {
        self.map.range(page..).next().map(|(&s, &l)| (s, l))
    }

    /// Iterates `(start, len)` in start order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map.iter().map(|(&s, &l)| (s, l))
    }

    /// Number of extents.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no extent is stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of all extent lengths.
    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    /// Drops every extent.
    pub fn clear(&mut self) {
        self.map.clear();
        self.free_pages = 0;
    }
}
