use std::collections::{BTreeMap, BTreeSet};

/// Free extents bucketed by length.
///
/// Each bucket holds the start pages of every free extent with that exact
/// length, so size queries cost O(log B) in the number of distinct lengths
/// and ties resolve to the lowest start page.
#[derive(Clone, Debug, Default)]
pub struct FreeSpaceIndex {
    buckets: BTreeMap<u64, BTreeSet<u64>>,
    entries: usize,
}

impl FreeSpaceIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an extent. Returns false if it was already present.
    pub fn insert(&mut self, len: u64, start: u64) -> bool {
        let added = self.buckets.entry(len).or_default().insert(start);
        if added {
            self.entries += 1;
        }
        added
    }

    /// Forgets an extent. Returns false if it was not present.
    pub fn remove(&mut self, len: u64, start: u64) -> bool {
        let Some(bucket) = self.buckets.get_mut(&len) else {
            return false;
        };
        let removed = bucket.remove(&start);
        if bucket.is_empty() {
            self.buckets.remove(&len);
        }
        if removed {
            self.entries -= 1;
        }
        removed
    }

    /// Smallest extent with at least `min_len` pages as `(start, len)`.
    pub fn smallest_at_least(&self, min_len: u64) -> Option<(u64, u64)> {
        let (&len, bucket) = self.buckets.range(min_len..).next()?;
        bucket.first().map(|&start| (start, len))
    }

    /// Lowest-starting extent with at least `min_len` pages as `(start, len)`.
    ///
    /// Visits one bucket per distinct qualifying length, which is bounded by
    /// the square root of the page total rather than the extent count.
    pub fn lowest_start_at_least(&self, min_len: u64) -> Option<(u64, u64)> {
        self.buckets
            .range(min_len..)
            .filter_map(|(&len, bucket)| bucket.first().map(|&start| (start, len)))
            .min_by_key(|&(start, _)| start)
    }

    /// Largest extent as `(start, len)`.
    pub fn largest(&self) -> Option<(u64, u64)> {
        let (&len, bucket) = self.buckets.last_key_value()?;
        bucket.first().map(|&start| (start, len))
    }

    /// True if `(len, start)` is indexed.
    pub fn contains(&self, len: u64, start: u64) -> bool {
        self.buckets
            .get(&len)
            .is_some_and(|bucket| bucket.contains(&start))
    }

    /// Number of indexed extents.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of distinct lengths.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.entries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_at_least_prefers_tight_fit_then_low_start() {
        let mut idx = FreeSpaceIndex::new();
        idx.insert(8, 100);
        idx.insert(4, 60);
        idx.insert(4, 20);
        idx.insert(2, 5);
        assert_eq!(idx.smallest_at_least(3), Some((20, 4)));
        assert_eq!(idx.smallest_at_least(5), Some((100, 8)));
        assert_eq!(idx.smallest_at_least(9), None);
        assert_eq!(idx.bucket_count(), 3);
    }

    #[test]
    fn largest_ties_go_to_lowest_start() {
        let mut idx = FreeSpaceIndex::new();
        idx.insert(16, 300);
        idx.insert(16, 40);
        idx.insert(3, 1);
        assert_eq!(idx.largest(), Some((40, 16)));
    }

    #[test]
    fn lowest_start_spans_buckets() {
        let mut index = FreeSpaceIndex::new();
        index.insert(2, 10);
        index.insert(8, 20);
        index.insert(4, 40);
        index.insert(16, 5);
        assert_eq!(index.lowest_start_at_least(3), Some((5, 16)));
        assert_eq!(index.lowest_start_at_least(1), Some((5, 16)));
        index.remove(16, 5);
        assert_eq!(index.lowest_start_at_least(3), Some((20, 8)));
        assert_eq!(index.lowest_start_at_least(17), None);
    }

    #[test]
    fn empty_buckets_are_dropped() {
        let mut idx = FreeSpaceIndex::new();
        idx.insert(4, 10);
        assert!(idx.remove(4, 10));
        assert!(!idx.remove(4, 10));
        assert_eq!(idx.bucket_count(), 0);
        assert!(idx.is_empty());
        assert_eq!(idx.largest(), None);
    }
}
