// Copyright (c) 2025 Ngh Table Contributors
//
// The navigation tree: a complete binary tree of 32-bit bitmap words over
// fixed-size buckets, used to prune `fetch` traversals to only the buckets
// that can possibly hold a level-l neighbor.
//
// Bit j of a word means "some live entry at level j+1 exists in this
// subtree". Level 1 never appears here (it lives in the table's roommate
// field), so bit 0 can be safely repurposed as a dirty flag: mutators OR it
// in bottom-up during a batch, and the top-down rebuild at the end of the
// batch clears it while recomputing the real bits from scratch.

use std::sync::atomic::{AtomicU32, Ordering};

use super::slot::EntryStore;

const DIRTY_BIT: u32 = 1;

pub struct NavigationTree {
    words: Box<[AtomicU32]>,
    leaves: u32,
    bucket_size: u32,
}

impl NavigationTree {
    /// Build a fresh, all-clean tree over `capacity / bucket_size` leaves.
    pub fn new(capacity: u32, bucket_size: u32) -> Self {
        debug_assert!(bucket_size > 0);
        debug_assert_eq!(capacity % bucket_size, 0);
        let leaves = capacity / bucket_size;
        let node_count = 2 * leaves as usize - 1;
        Self {
            words: (0..node_count).map(|_| AtomicU32::new(0)).collect(),
            leaves,
            bucket_size,
        }
    }

    pub fn node_count(&self) -> usize {
        self.words.len()
    }

    pub fn leaves(&self) -> u32 {
        self.leaves
    }

    #[inline]
    fn leaf_start(&self) -> usize {
        self.leaves as usize - 1
    }

    #[inline]
    fn parent(i: usize) -> usize {
        (i - 1) / 2
    }

    #[inline]
    pub(crate) fn left(i: usize) -> usize {
        2 * i + 1
    }

    #[inline]
    pub(crate) fn right(i: usize) -> usize {
        2 * i + 2
    }

    #[inline]
    pub fn leaf_for_slot(&self, slot: u32) -> usize {
        self.leaf_start() + (slot / self.bucket_size) as usize
    }

    /// The bit within a node word that corresponds to `level` (2..=32).
    #[inline]
    pub fn level_bit(level: u32) -> u32 {
        debug_assert!((2..=32).contains(&level), "level {level} has no tree bit");
        1u32 << (level - 1)
    }

    #[inline]
    pub fn word(&self, node: usize) -> u32 {
        self.words[node].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn is_leaf(&self, node: usize) -> bool {
        node >= self.leaf_start()
    }

    /// The slot range covered by a leaf node, for `fetch`'s bucket scan.
    pub(crate) fn bucket_range(&self, node: usize) -> std::ops::Range<u32> {
        debug_assert!(self.is_leaf(node));
        let bucket = (node - self.leaf_start()) as u32;
        let start = bucket * self.bucket_size;
        start..start + self.bucket_size
    }

    /// Bottom-up lazy marking after a single slot write. ORs the dirty bit
    /// into the owning leaf and climbs toward the root, stopping at the
    /// first ancestor that was already dirty: whichever writer marked that
    /// ancestor first already continued all the way to the root, so this
    /// walk doesn't need to repeat the climb.
    pub fn mark_dirty(&self, slot: u32) {
        let mut i = self.leaf_for_slot(slot);
        loop {
            let prev = self.words[i].fetch_or(DIRTY_BIT, Ordering::AcqRel);
            if prev & DIRTY_BIT != 0 || i == 0 {
                return;
            }
            i = Self::parent(i);
        }
    }

    /// Work-efficient parallel top-down rebuild. Clean subtrees (dirty bit
    /// unset) are pruned immediately. A dirty leaf is recomputed from its
    /// bucket's actual contents; a dirty internal node recurses into both
    /// children in parallel, then folds their (now clean) words together.
    pub fn rebuild(&self, entries: &EntryStore) {
        if self.words.is_empty() {
            return;
        }
        self.rebuild_node(0, entries);
    }

    fn rebuild_node(&self, node: usize, entries: &EntryStore) {
        let word = self.words[node].load(Ordering::Relaxed);
        if word & DIRTY_BIT == 0 {
            return;
        }

        if self.is_leaf(node) {
            let bucket = (node - self.leaf_start()) as u32;
            let start = bucket * self.bucket_size;
            let mut recomputed = 0u32;
            for slot in start..start + self.bucket_size {
                if let Some((_, level)) = entries.occupied_entry(slot) {
                    if level >= 2 {
                        recomputed |= Self::level_bit(level);
                    }
                }
            }
            // bit 0 is naturally clear: level 1 never lives in a bucket.
            self.words[node].store(recomputed, Ordering::Relaxed);
        } else {
            let (l, r) = (Self::left(node), Self::right(node));
            rayon::join(
                || self.rebuild_node(l, entries),
                || self.rebuild_node(r, entries),
            );
            let merged = self.words[l].load(Ordering::Relaxed) | self.words[r].load(Ordering::Relaxed);
            self.words[node].store(merged, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tree_is_clean() {
        let tree = NavigationTree::new(16, 4);
        assert_eq!(tree.node_count(), 2 * 4 - 1);
        for i in 0..tree.node_count() {
            assert_eq!(tree.word(i), 0);
        }
    }

    #[test]
    fn mark_and_rebuild_reflects_bucket_contents() {
        let entries = EntryStore::new(16);
        let tree = NavigationTree::new(16, 4);

        let idx = entries.insert(5, 3, 16);
        tree.mark_dirty(idx);
        tree.rebuild(&entries);

        let leaf = tree.leaf_for_slot(idx);
        assert_eq!(tree.word(leaf), NavigationTree::level_bit(3));
        assert_eq!(tree.word(0) & NavigationTree::level_bit(3), NavigationTree::level_bit(3));
    }

    #[test]
    fn rebuild_clears_dirty_bit_when_bucket_becomes_empty() {
        let entries = EntryStore::new(16);
        let tree = NavigationTree::new(16, 4);

        let idx = entries.insert(5, 3, 16);
        tree.mark_dirty(idx);
        tree.rebuild(&entries);

        entries.remove(5, 16, true);
        tree.mark_dirty(idx);
        tree.rebuild(&entries);

        let leaf = tree.leaf_for_slot(idx);
        assert_eq!(tree.word(leaf), 0);
    }

    #[test]
    fn dirty_walk_stops_at_already_dirty_ancestor() {
        let tree = NavigationTree::new(64, 4);
        tree.mark_dirty(0);
        // Root must be dirty after marking any leaf.
        assert_eq!(tree.word(0) & 1, 1);
        // Marking a different leaf should short-circuit but still leave the
        // root dirty (it never gets un-marked outside of rebuild).
        tree.mark_dirty(60);
        assert_eq!(tree.word(0) & 1, 1);
    }
}
