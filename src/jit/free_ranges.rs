//! Free code-space tracking.
//!
//! A set of disjoint half-open address ranges, indexed both by start address
//! (for merging and carving) and by size (for "largest free range" queries).

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default, Clone)]
pub struct RangeSizeSet {
    /// start -> end
    by_start: BTreeMap<usize, usize>,
    /// (size, start)
    by_size: BTreeSet<(usize, usize)>,
}

impl RangeSizeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn clear(&mut self) {
        self.by_start.clear();
        self.by_size.clear();
    }

    pub fn total_size(&self) -> usize {
        self.by_start.iter().map(|(start, end)| end - start).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.by_start.iter().map(|(&start, &end)| (start, end))
    }

    /// The largest free range; ties go to the higher address.
    pub fn largest(&self) -> Option<(usize, usize)> {
        self.by_size.last().map(|&(size, start)| (start, start + size))
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.by_start
            .range(..=addr)
            .next_back()
            .is_some_and(|(_, &end)| addr < end)
    }

    fn add_raw(&mut self, start: usize, end: usize) {
        self.by_start.insert(start, end);
        self.by_size.insert((end - start, start));
    }

    fn remove_raw(&mut self, start: usize) -> Option<usize> {
        let end = self.by_start.remove(&start)?;
        self.by_size.remove(&(end - start, start));
        Some(end)
    }

    /// Add `[start, end)`, merging with any overlapping or touching range.
    pub fn insert(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let (mut start, mut end) = (start, end);

        // Absorb a predecessor that reaches `start`.
        if let Some((&prev_start, &prev_end)) = self.by_start.range(..=start).next_back()
            && prev_end >= start
        {
            self.remove_raw(prev_start);
            start = prev_start;
            end = end.max(prev_end);
        }
        // Absorb every successor that begins at or before `end`.
        while let Some((&next_start, &next_end)) = self.by_start.range(start..).next()
            && next_start <= end
        {
            self.remove_raw(next_start);
            end = end.max(next_end);
        }
        self.add_raw(start, end);
    }

    /// Remove `[start, end)`, splitting ranges that straddle it.
    pub fn erase(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let overlapping: Vec<(usize, usize)> = self
            .by_start
            .range(..end)
            .filter(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.remove_raw(s);
            if s < start {
                self.add_raw(s, start);
            }
            if e > end {
                self.add_raw(end, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_neighbours() {
        let mut set = RangeSizeSet::new();
        set.insert(0, 10);
        set.insert(20, 30);
        assert_eq!(set.len(), 2);
        set.insert(10, 20);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 30)]);
        set.insert(5, 40);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 40)]);
    }

    #[test]
    fn test_erase_splits() {
        let mut set = RangeSizeSet::new();
        set.insert(0, 100);
        set.erase(40, 60);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 40), (60, 100)]);
        assert_eq!(set.total_size(), 80);
        assert!(set.contains(39));
        assert!(!set.contains(40));
        set.erase(0, 100);
        assert!(set.is_empty());
    }

    #[test]
    fn test_largest_follows_updates() {
        let mut set = RangeSizeSet::new();
        set.insert(0, 16);
        set.insert(100, 164);
        assert_eq!(set.largest(), Some((100, 164)));
        set.erase(100, 150);
        assert_eq!(set.largest(), Some((0, 16)));
        set.clear();
        assert_eq!(set.largest(), None);
    }
}
