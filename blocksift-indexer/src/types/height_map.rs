//! Ordered start-height map over data sources (or anything range-scoped).
//!
//! [`BlockHeightMap`] answers "what is the active set at height H?" in
//! O(log n) by precomputing the active set at every *change point*, that
//! is, every height where a range starts or ends.

use std::collections::{BTreeMap, BTreeSet};

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK HEIGHT MAP
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable map from heights to the set of values active there.
///
/// Built from `(start, end, value)` ranges; rebuilt wholesale when the set
/// changes (dynamic data sources).
#[derive(Debug, Clone)]
pub struct BlockHeightMap<T> {
    /// Active set at each change point. Lookup takes the greatest change
    /// point at or below the queried height.
    entries: BTreeMap<u64, Vec<T>>,
}

impl<T> Default for BlockHeightMap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Clone> BlockHeightMap<T> {
    /// Build from `(start, inclusive end, value)` ranges.
    #[must_use]
    pub fn new(ranges: Vec<(u64, Option<u64>, T)>) -> Self {
        let mut boundaries: BTreeSet<u64> = BTreeSet::new();
        for (start, end, _) in &ranges {
            boundaries.insert(*start);
            if let Some(end) = end {
                // The set changes on the block after an inclusive end.
                boundaries.insert(end.saturating_add(1));
            }
        }

        let entries = boundaries
            .into_iter()
            .map(|boundary| {
                let active: Vec<T> = ranges
                    .iter()
                    .filter(|(start, end, _)| {
                        *start <= boundary && end.is_none_or(|end| boundary <= end)
                    })
                    .map(|(_, _, value)| value.clone())
                    .collect();
                (boundary, active)
            })
            .collect();

        Self { entries }
    }

    /// Active set at a height. Empty before the first range starts.
    #[must_use]
    pub fn at(&self, height: u64) -> &[T] {
        self.entries
            .range(..=height)
            .next_back()
            .map_or(&[], |(_, active)| active.as_slice())
    }

    /// Lowest height at which anything is active.
    #[must_use]
    pub fn first_start(&self) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, active)| !active.is_empty())
            .map(|(height, _)| *height)
    }

    /// The change points with their active sets, ascending.
    pub fn change_points(&self) -> impl Iterator<Item = (u64, &[T])> {
        self.entries
            .iter()
            .map(|(height, active)| (*height, active.as_slice()))
    }

    /// First change point strictly above the given height.
    #[must_use]
    pub fn next_change_after(&self, height: u64) -> Option<u64> {
        self.entries
            .range(height + 1..)
            .next()
            .map(|(change, _)| *change)
    }

    /// Whether the map holds no ranges at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> BlockHeightMap<&'static str> {
        BlockHeightMap::new(vec![
            (100, None, "a"),
            (150, Some(199), "b"),
            (300, None, "c"),
        ])
    }

    #[test]
    fn lookup_before_first_start_is_empty() {
        assert!(map().at(99).is_empty());
    }

    #[test]
    fn lookup_hits_active_ranges() {
        let m = map();
        assert_eq!(m.at(100), &["a"]);
        assert_eq!(m.at(149), &["a"]);
        assert_eq!(m.at(150), &["a", "b"]);
        assert_eq!(m.at(199), &["a", "b"]);
        // "b" ends inclusively at 199.
        assert_eq!(m.at(200), &["a"]);
        assert_eq!(m.at(300), &["a", "c"]);
        assert_eq!(m.at(1_000_000), &["a", "c"]);
    }

    #[test]
    fn first_start() {
        assert_eq!(map().first_start(), Some(100));
        assert_eq!(BlockHeightMap::<&str>::new(vec![]).first_start(), None);
    }

    #[test]
    fn change_points_are_sorted() {
        let points: Vec<u64> = map().change_points().map(|(h, _)| h).collect();
        assert_eq!(points, vec![100, 150, 200, 300]);
    }

    #[test]
    fn next_change_after() {
        let m = map();
        assert_eq!(m.next_change_after(100), Some(150));
        assert_eq!(m.next_change_after(150), Some(200));
        assert_eq!(m.next_change_after(300), None);
    }
}
