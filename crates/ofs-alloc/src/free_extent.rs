//! In-memory index of unoccupied byte ranges.

use ofs_error::{OfsError, Result};
use std::collections::BTreeMap;
use tracing::trace;

/// One contiguous free range `[offset, offset + length)` of a block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtent {
    pub offset: u64,
    pub length: u64,
    /// Flags of the block group the range belongs to.
    pub flags: u64,
}

impl FreeExtent {
    #[must_use]
    pub fn new(offset: u64, length: u64, flags: u64) -> Self {
        Self {
            offset,
            length,
            flags,
        }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    #[must_use]
    pub fn contains(&self, point: u64) -> bool {
        point >= self.offset && point < self.end()
    }

    /// Shrink `self` to its overlap with `other`.
    ///
    /// Returns `false` and leaves `self` untouched when the two ranges are
    /// disjoint.
    pub fn intersect(&mut self, other: &Self) -> bool {
        if self.offset >= other.end() || self.end() <= other.offset {
            return false;
        }
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        self.offset = start;
        self.length = end - start;
        true
    }
}

/// Free extents ordered by offset, never overlapping.
#[derive(Debug, Clone, Default)]
pub struct FreeExtentTree {
    extents: BTreeMap<u64, FreeExtent>,
}

impl FreeExtentTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `extent`. Empty ranges are `BadData`; a range touching the
    /// bytes of an indexed extent is `BadValue`.
    pub fn insert(&mut self, extent: FreeExtent) -> Result<()> {
        if extent.length == 0 {
            return Err(OfsError::BadData(format!(
                "empty free extent at {:#x}",
                extent.offset
            )));
        }
        if let Some(existing) = self.overlapping(&extent) {
            return Err(OfsError::BadValue(format!(
                "free extent [{:#x}, {:#x}) overlaps [{:#x}, {:#x})",
                extent.offset,
                extent.end(),
                existing.offset,
                existing.end()
            )));
        }
        self.extents.insert(extent.offset, extent);
        Ok(())
    }

    fn overlapping(&self, extent: &FreeExtent) -> Option<&FreeExtent> {
        let below = self
            .extents
            .range(..=extent.offset)
            .next_back()
            .map(|(_, existing)| existing)
            .filter(|existing| existing.end() > extent.offset);
        below.or_else(|| {
            self.extents
                .range(extent.offset..)
                .next()
                .map(|(_, existing)| existing)
                .filter(|existing| existing.offset < extent.end())
        })
    }

    /// The extent containing byte `point`.
    #[must_use]
    pub fn find(&self, point: u64) -> Option<&FreeExtent> {
        self.extents
            .range(..=point)
            .next_back()
            .map(|(_, extent)| extent)
            .filter(|extent| extent.contains(point))
    }

    /// Lowest extent at least `length` bytes long.
    #[must_use]
    pub fn find_fit(&self, length: u64) -> Option<&FreeExtent> {
        self.extents.values().find(|extent| extent.length >= length)
    }

    pub fn remove(&mut self, offset: u64) -> Option<FreeExtent> {
        self.extents.remove(&offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FreeExtent> {
        self.extents.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    #[must_use]
    pub fn total_free(&self) -> u64 {
        self.extents
            .values()
            .fold(0_u64, |total, extent| total.saturating_add(extent.length))
    }

    /// Log every extent in offset order.
    pub fn dump_in_order(&self, node_size: u32) {
        let node_size = u64::from(node_size.max(1));
        for extent in self.extents.values() {
            trace!(
                offset = extent.offset,
                node = extent.offset / node_size,
                length_nodes = extent.length / node_size,
                flags = extent.flags,
                "free_extent"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn intersect_clips_to_overlap() {
        let mut extent = FreeExtent::new(100, 100, 0);
        assert!(extent.intersect(&FreeExtent::new(150, 100, 0)));
        assert_eq!((extent.offset, extent.length), (150, 50));

        let mut extent = FreeExtent::new(100, 100, 0);
        assert!(extent.intersect(&FreeExtent::new(50, 100, 0)));
        assert_eq!((extent.offset, extent.length), (100, 50));

        let mut extent = FreeExtent::new(100, 100, 0);
        assert!(!extent.intersect(&FreeExtent::new(200, 10, 0)));
        assert_eq!((extent.offset, extent.length), (100, 100));
    }

    #[test]
    fn insert_rejects_empty_and_overlapping() {
        let mut tree = FreeExtentTree::new();
        tree.insert(FreeExtent::new(100, 100, 1)).expect("first");
        assert!(matches!(
            tree.insert(FreeExtent::new(300, 0, 1)),
            Err(OfsError::BadData(_))
        ));
        for clash in [(150, 10), (50, 51), (199, 5), (0, 1000)] {
            assert!(matches!(
                tree.insert(FreeExtent::new(clash.0, clash.1, 1)),
                Err(OfsError::BadValue(_))
            ));
        }
        tree.insert(FreeExtent::new(200, 50, 1)).expect("adjacent");
        tree.insert(FreeExtent::new(0, 100, 1)).expect("adjacent below");
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.total_free(), 250);
    }

    #[test]
    fn point_and_fit_queries() {
        let mut tree = FreeExtentTree::new();
        for (offset, length) in [(0, 100), (200, 300), (600, 400)] {
            tree.insert(FreeExtent::new(offset, length, 4)).expect("insert");
        }
        assert_eq!(tree.find(250).map(|e| e.offset), Some(200));
        assert_eq!(tree.find(499).map(|e| e.offset), Some(200));
        assert!(tree.find(500).is_none());
        assert!(tree.find(100).is_none());
        assert_eq!(tree.find_fit(150).map(|e| e.offset), Some(200));
        assert_eq!(tree.find_fit(350).map(|e| e.offset), Some(600));
        assert!(tree.find_fit(401).is_none());

        assert_eq!(tree.remove(200).map(|e| e.length), Some(300));
        assert!(tree.remove(200).is_none());
        assert_eq!(
            tree.iter().map(|e| e.offset).collect::<Vec<_>>(),
            vec![0, 600]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn accepted_extents_stay_disjoint(
            ranges in proptest::collection::vec((0_u64..10_000, 1_u64..500), 1..64)
        ) {
            let mut tree = FreeExtentTree::new();
            for (offset, length) in ranges {
                let _ = tree.insert(FreeExtent::new(offset, length, 0));
            }
            let extents: Vec<FreeExtent> = tree.iter().copied().collect();
            for pair in extents.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].offset);
            }
            for extent in &extents {
                prop_assert_eq!(tree.find(extent.offset), Some(extent));
                prop_assert_eq!(tree.find(extent.end() - 1), Some(extent));
            }
        }
    }
}
