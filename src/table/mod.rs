// Copyright (c) 2025 Ngh Table Contributors
//
// The table facade: batch insert/update/delete/find, level-selective fetch,
// and the capacity-growth path that ties the entry store and the navigation
// tree together.
//
// Concurrency model: mutating batch operations (`batch_insert`,
// `batch_update`, `batch_delete`) take `&mut self` because they may resize
// the table, which replaces its buffers outright. Within one such call the
// per-key work runs in parallel over a shared (`&self`) view — every write
// goes through the atomics in `EntryStore` and `NavigationTree`, so distinct
// keys landing in the same bucket via hash collision never race. Read-only
// operations (`batch_find`, `fetch`, `size`, `to_sorted_sequence`) take
// `&self` and may run concurrently with each other, but never concurrently
// with a mutating batch — that's the single-writer-epoch, multi-reader-in-
// between contract the whole module is built around.

mod counters;
mod hash;
mod slot;
mod tree;

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::error::{Result, TableError};
use counters::LevelCounters;
use slot::{EntryStore, RESERVED_KEY};
use tree::NavigationTree;

/// A concurrent, bucketed open-addressing hash table mapping 32-bit keys to
/// an integer level in `[1, 32]`, augmented with a navigation tree for fast
/// level-selective fetch.
///
/// `B` is the bucket size (and, equivalently, the leaf fan-in of the
/// navigation tree). Capacity is always a multiple of `B`. Typical values
/// are 8, 16, 32 or 64; 16 is the default because it keeps a bucket within
/// a couple of cache lines while still giving `fetch` a wide enough leaf to
/// amortize the cost of descending to it.
pub struct Table<const B: usize = 16> {
    entries: EntryStore,
    tree: NavigationTree,
    counters: LevelCounters,
    /// The at-most-one live level-1 neighbor, stored outside the main
    /// table. `RESERVED_KEY` means absent.
    roommate: AtomicU32,
    used: AtomicU32,
    capacity: u32,
}

/// Raw pointer wrapper so `fetch`'s parallel descent can write into a
/// preallocated `Vec<u32>` from multiple worker threads. Each write target
/// index comes from a single atomic fetch-and-add, so distinct threads never
/// touch the same cell.
struct FetchBuf {
    ptr: *mut u32,
    len: usize,
}

unsafe impl Send for FetchBuf {}
unsafe impl Sync for FetchBuf {}

fn round_up_capacity(n: u32, bucket_size: u32) -> Option<u32> {
    let buckets = n.div_ceil(bucket_size);
    buckets.checked_mul(bucket_size)
}

/// Load factor 0.75 expressed as an integer ratio, to keep capacity math
/// exact instead of going through floating point.
const LOAD_FACTOR_NUM: u64 = 3;
const LOAD_FACTOR_DEN: u64 = 4;
const EXPAND_FACTOR: u64 = 2;

/// Smallest capacity whose load factor (`LOAD_FACTOR_NUM / LOAD_FACTOR_DEN`)
/// can hold `needed` live entries, i.e. `ceil(needed / load_factor)`.
fn capacity_for_load_factor(needed: u64) -> u64 {
    (needed * LOAD_FACTOR_DEN + LOAD_FACTOR_NUM - 1) / LOAD_FACTOR_NUM
}

impl<const B: usize> Table<B> {
    /// Create a table whose capacity is `initial_capacity` rounded up to the
    /// next multiple of `B` (and at least `B`).
    pub fn new(initial_capacity: u32) -> Result<Self> {
        if B == 0 {
            return Err(TableError::InvalidBucketSize(B));
        }
        let bucket_size = B as u32;
        let capacity = round_up_capacity(initial_capacity.max(bucket_size), bucket_size)
            .ok_or(TableError::CapacityOverflow(initial_capacity as usize))?;

        Ok(Self {
            entries: EntryStore::new(capacity),
            tree: NavigationTree::new(capacity, bucket_size),
            counters: LevelCounters::new(),
            roommate: AtomicU32::new(RESERVED_KEY),
            used: AtomicU32::new(0),
            capacity,
        })
    }

    /// Number of live entries: the main table's `used` count plus one if the
    /// roommate is occupied.
    pub fn size(&self) -> u32 {
        self.used.load(Ordering::Relaxed)
            + if self.roommate.load(Ordering::Relaxed) != RESERVED_KEY {
                1
            } else {
                0
            }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Exact number of live entries at `level`, maintained incrementally.
    pub fn level_count(&self, level: u32) -> u32 {
        self.counters.get(level)
    }

    // ---------------------------------------------------------------
    // Batch mutation
    // ---------------------------------------------------------------

    /// Insert `(key, level)` pairs in parallel, growing capacity first if
    /// needed. Duplicate keys within `items`, or a level-1 key that already
    /// has a roommate, are caller errors and abort the process.
    pub fn batch_insert(&mut self, items: &[(u32, u32)]) {
        self.ensure_capacity(items.len() as u32);

        let this: &Self = &*self;
        let capacity = this.capacity;
        items.par_iter().for_each(|&(key, level)| {
            debug_assert_ne!(key, RESERVED_KEY, "reserved key used as a real key");
            if level == 1 {
                this.insert_roommate(key);
            } else {
                let idx = this.entries.insert(key, level, capacity);
                this.tree.mark_dirty(idx);
                this.used.fetch_add(1, Ordering::Relaxed);
                this.counters.inc(level);
            }
        });

        self.tree.rebuild(&self.entries);
    }

    /// Update every key in `items` to its paired new level. Every key must
    /// already exist (in the main table or as the roommate); a missing key
    /// aborts the process.
    pub fn batch_update(&mut self, items: &[(u32, u32)]) {
        let this: &Self = &*self;
        let capacity = this.capacity;
        items.par_iter().for_each(|&(key, new_level)| {
            this.update_one(key, new_level, capacity);
        });
        self.tree.rebuild(&self.entries);
    }

    /// Delete every key in `keys`. Every key must already exist (in the main
    /// table or as the roommate); a missing key aborts the process.
    pub fn batch_delete(&mut self, keys: &[u32]) {
        let this: &Self = &*self;
        let capacity = this.capacity;
        keys.par_iter().for_each(|&key| {
            this.delete_one(key, capacity);
        });
        self.tree.rebuild(&self.entries);
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Look up every key in `keys` in parallel, preserving order. `0` means
    /// not found.
    pub fn batch_find(&self, keys: &[u32]) -> Vec<u32> {
        keys.par_iter().map(|&key| self.find_one(key)).collect()
    }

    /// Return up to `k` keys at exactly `level`, traversing only the
    /// navigation-tree subtrees that can contain one. Must only be called
    /// between batches (the tree must be in its rebuilt, canonical state).
    pub fn fetch(&self, k: u32, level: u32) -> Vec<u32> {
        debug_assert!((1..=32).contains(&level), "level {level} out of range");

        if level == 1 {
            if k == 0 {
                return Vec::new();
            }
            let roommate = self.roommate.load(Ordering::Acquire);
            return if roommate != RESERVED_KEY {
                vec![roommate]
            } else {
                Vec::new()
            };
        }

        let exact = self.counters.get(level);
        let k = k.min(exact) as usize;
        if k == 0 {
            return Vec::new();
        }

        let mut out = vec![0u32; k];
        let buf = FetchBuf {
            ptr: out.as_mut_ptr(),
            len: k,
        };
        let written = AtomicU32::new(0);
        self.fetch_descend(0, level, k, &written, &buf);
        out
    }

    /// All live entries as `(key, level)` pairs, sorted by key. Intended for
    /// debugging and tests, not for hot-path use.
    pub fn to_sorted_sequence(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let roommate = self.roommate.load(Ordering::Acquire);
        if roommate != RESERVED_KEY {
            out.push((roommate, 1));
        }
        for slot in 0..self.capacity {
            if let Some(entry) = self.entries.occupied_entry(slot) {
                out.push(entry);
            }
        }
        out.sort_unstable_by_key(|&(key, _)| key);
        out
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn find_one(&self, key: u32) -> u32 {
        if self.roommate.load(Ordering::Acquire) == key {
            1
        } else {
            self.entries.find(key, self.capacity)
        }
    }

    /// CAS the roommate field from absent to `key`, or abort on a duplicate
    /// level-1 insert.
    fn claim_roommate(&self, key: u32) {
        if self
            .roommate
            .compare_exchange(RESERVED_KEY, key, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::error!(key, "duplicate level-1 insert: roommate slot already occupied");
            std::process::abort();
        }
        self.counters.inc(1);
    }

    /// `insert(key, 1)`: claim the roommate, then repair any stale main-table
    /// entry for the same key left over from a previous level >= 2 insert.
    fn insert_roommate(&self, key: u32) {
        self.claim_roommate(key);
        if let Some((slot, old_level)) = self.entries.remove(key, self.capacity, false) {
            self.tree.mark_dirty(slot);
            self.used.fetch_sub(1, Ordering::Relaxed);
            self.counters.dec(old_level);
        }
    }

    fn update_one(&self, key: u32, new_level: u32, capacity: u32) {
        if self.roommate.load(Ordering::Acquire) == key {
            if new_level == 1 {
                return; // no-op: updating the roommate's key to level 1
            }
            // Demote the roommate into the main table at its new level.
            self.roommate.store(RESERVED_KEY, Ordering::Release);
            self.counters.dec(1);
            let idx = self.entries.insert(key, new_level, capacity);
            self.tree.mark_dirty(idx);
            self.used.fetch_add(1, Ordering::Relaxed);
            self.counters.inc(new_level);
            return;
        }

        match self.entries.locate(key, capacity) {
            Some((slot, old_level)) => {
                if new_level == 1 {
                    self.entries.remove(key, capacity, true);
                    self.tree.mark_dirty(slot);
                    self.used.fetch_sub(1, Ordering::Relaxed);
                    self.counters.dec(old_level);
                    self.claim_roommate(key);
                } else if new_level != old_level {
                    self.entries.overwrite_level(slot, key, new_level);
                    self.tree.mark_dirty(slot);
                    self.counters.dec(old_level);
                    self.counters.inc(new_level);
                }
            }
            None => {
                tracing::error!(key, "batch_update: key does not exist");
                std::process::abort();
            }
        }
    }

    fn delete_one(&self, key: u32, capacity: u32) {
        if self
            .roommate
            .compare_exchange(key, RESERVED_KEY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.counters.dec(1);
            return;
        }

        match self.entries.remove(key, capacity, true) {
            Some((slot, old_level)) => {
                self.tree.mark_dirty(slot);
                self.used.fetch_sub(1, Ordering::Relaxed);
                self.counters.dec(old_level);
            }
            None => unreachable!("remove(check = true) aborts instead of returning None"),
        }
    }

    fn fetch_descend(&self, node: usize, level: u32, k: usize, written: &AtomicU32, buf: &FetchBuf) {
        if written.load(Ordering::Relaxed) as usize >= k {
            return;
        }
        if self.tree.word(node) & NavigationTree::level_bit(level) == 0 {
            return; // pruned: no level-`level` entry anywhere in this subtree
        }

        if self.tree.is_leaf(node) {
            for slot in self.tree.bucket_range(node) {
                if written.load(Ordering::Relaxed) as usize >= k {
                    break;
                }
                if let Some((key, found_level)) = self.entries.occupied_entry(slot) {
                    if found_level == level {
                        let idx = written.fetch_add(1, Ordering::Relaxed) as usize;
                        if idx < buf.len {
                            unsafe {
                                *buf.ptr.add(idx) = key;
                            }
                        }
                    }
                }
            }
        } else {
            let (left, right) = (NavigationTree::left(node), NavigationTree::right(node));
            rayon::join(
                || self.fetch_descend(left, level, k, written, buf),
                || self.fetch_descend(right, level, k, written, buf),
            );
        }
    }

    fn ensure_capacity(&mut self, incoming: u32) {
        let threshold = (self.capacity as u64 * LOAD_FACTOR_NUM) / LOAD_FACTOR_DEN;
        let projected = self.used.load(Ordering::Relaxed) as u64 + incoming as u64;
        if projected > threshold {
            self.grow(incoming);
        }
    }

    /// New capacity = `max(ceil((used + incoming) / load_factor), capacity *
    /// expand_factor)`, rounded up to a multiple of `B`. This is stricter
    /// than a literal `max(used + incoming, capacity * expand_factor)` would
    /// be: sizing to just fit the incoming entries would leave the table at
    /// load factor 1.0 right after the batch that triggered the resize,
    /// violating the `capacity * load_factor >= used` invariant the moment
    /// the batch completes. Allocates fresh buffers, re-inserts every live
    /// main-table entry in parallel, and rebuilds the tree. The roommate is
    /// left untouched (it lives outside both buffers) but its contribution
    /// to `L[1]` is restored after the counter reset. Not safe to run
    /// concurrently with any other table operation.
    fn grow(&mut self, incoming: u32) {
        let bucket_size = B as u32;
        let old_capacity = self.capacity;
        let used = self.used.load(Ordering::Relaxed);
        let needed = used.saturating_add(incoming) as u64;
        let target = capacity_for_load_factor(needed).max(self.capacity as u64 * EXPAND_FACTOR);
        let target = target.min(u32::MAX as u64) as u32;
        let new_capacity =
            round_up_capacity(target, bucket_size).unwrap_or(u32::MAX - (u32::MAX % bucket_size));

        tracing::info!(old_capacity, new_capacity, "table capacity growth triggered");

        let old_entries = std::mem::replace(&mut self.entries, EntryStore::new(new_capacity));
        self.tree = NavigationTree::new(new_capacity, bucket_size);
        self.capacity = new_capacity;
        self.used.store(0, Ordering::Relaxed);
        self.counters.reset();
        if self.roommate.load(Ordering::Relaxed) != RESERVED_KEY {
            self.counters.inc(1);
        }

        let this: &Self = &*self;
        (0..old_capacity).into_par_iter().for_each(|slot| {
            if let Some((key, level)) = old_entries.occupied_entry(slot) {
                let idx = this.entries.insert(key, level, new_capacity);
                this.tree.mark_dirty(idx);
                this.used.fetch_add(1, Ordering::Relaxed);
                this.counters.inc(level);
            }
        });

        self.tree.rebuild(&self.entries);
        // old_entries is dropped here, freeing the previous generation.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rounds_capacity_up_to_bucket_multiple() {
        let table = Table::<16>::new(10).unwrap();
        assert_eq!(table.capacity(), 16);
        let table = Table::<16>::new(17).unwrap();
        assert_eq!(table.capacity(), 32);
    }

    #[test]
    fn rejects_zero_bucket_size() {
        assert_eq!(
            Table::<0>::new(16).unwrap_err(),
            TableError::InvalidBucketSize(0)
        );
    }

    #[test]
    fn insert_find_size() {
        let mut table = Table::<16>::new(128).unwrap();
        table.batch_insert(&[(1, 5), (2, 9), (3, 32)]);
        assert_eq!(table.size(), 3);
        assert_eq!(table.batch_find(&[1, 2, 3, 4]), vec![5, 9, 32, 0]);
    }

    #[test]
    fn insert_then_delete_restores_empty() {
        let mut table = Table::<16>::new(128).unwrap();
        let items: Vec<_> = (0..50).map(|i| (i, 2 + (i % 31))).collect();
        table.batch_insert(&items);
        assert_eq!(table.size(), 50);

        let keys: Vec<u32> = items.iter().map(|&(k, _)| k).collect();
        table.batch_delete(&keys);
        assert_eq!(table.size(), 0);
        for level in 1..=32 {
            assert_eq!(table.level_count(level), 0);
        }
    }

    #[test]
    fn roommate_promotion_demotes_main_table_entry() {
        let mut table = Table::<16>::new(64).unwrap();
        table.batch_insert(&[(10, 5)]);
        assert_eq!(table.batch_find(&[10]), vec![5]);

        table.batch_insert(&[(10, 1)]);
        assert_eq!(table.batch_find(&[10]), vec![1]);
        assert_eq!(table.level_count(5), 0);
        assert_eq!(table.level_count(1), 1);
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn update_to_single_level_then_fetch() {
        let mut table = Table::<16>::new(256).unwrap();
        let items: Vec<_> = (0..100).map(|i| (i, 2 + (i % 31))).collect();
        table.batch_insert(&items);

        let updates: Vec<_> = items.iter().map(|&(k, _)| (k, 2)).collect();
        table.batch_update(&updates);

        let mut fetched = table.fetch(100, 2);
        fetched.sort_unstable();
        let mut expected: Vec<u32> = items.iter().map(|&(k, _)| k).collect();
        expected.sort_unstable();
        assert_eq!(fetched, expected);

        for level in 3..=32 {
            assert!(table.fetch(100, level).is_empty());
        }
    }

    #[test]
    fn fetch_respects_k_and_exact_level() {
        let mut table = Table::<16>::new(256).unwrap();
        table.batch_insert(&[(1, 4), (2, 4), (3, 4), (4, 5)]);

        assert_eq!(table.fetch(0, 4).len(), 0);
        let all_fours = table.fetch(100, 4);
        assert_eq!(all_fours.len(), 3);
        let capped = table.fetch(2, 4);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn resize_under_load() {
        const BUCKET: usize = 8;
        let mut table = Table::<BUCKET>::new(2 * BUCKET as u32).unwrap();
        let n = 10 * BUCKET as u32;
        let items: Vec<_> = (0..n).map(|i| (i, 2 + (i % 31))).collect();
        table.batch_insert(&items);

        assert_eq!(table.size(), n);
        let min_capacity = (n as f64 / 0.75).ceil() as u32;
        assert!(table.capacity() >= min_capacity);
        assert_eq!(table.capacity() % BUCKET as u32, 0);

        for &(key, level) in &items {
            assert_eq!(table.batch_find(&[key])[0], level);
        }
    }

    #[test]
    fn to_sorted_sequence_is_strictly_increasing() {
        let mut table = Table::<16>::new(256).unwrap();
        table.batch_insert(&[(5, 3), (1, 2), (9, 4), (3, 1)]);
        let seq = table.to_sorted_sequence();
        for pair in seq.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        assert_eq!(seq.len(), 4);
    }
}
