// Copyright (c) 2025 Ngh Table Contributors
//
// Per-level atomic occupancy counters.
//
// Index 0 is unused (level 0 means "empty slot", never a live entry).
// Index 1 tracks roommate presence: 0 or 1, never anything else.

use std::sync::atomic::{AtomicU32, Ordering};

pub const MAX_LEVEL: usize = 32;

pub struct LevelCounters {
    counts: [AtomicU32; MAX_LEVEL + 1],
}

impl LevelCounters {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    #[inline]
    pub fn get(&self, level: u32) -> u32 {
        self.counts[level as usize].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn inc(&self, level: u32) {
        self.counts[level as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self, level: u32) {
        self.counts[level as usize].fetch_sub(1, Ordering::Relaxed);
    }

    /// Reset every counter to zero, used on resize before live entries are
    /// re-inserted into the freshly allocated store.
    pub fn reset(&self) {
        for c in &self.counts {
            c.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for LevelCounters {
    fn default() -> Self {
        Self::new()
    }
}
