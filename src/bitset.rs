// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

use std::sync::atomic::{AtomicU64, Ordering};

/// Single-word atomic bitset, usable in place inside shared memory.
///
/// This backs the channel occupancy hint map: one bit per sample slot, so the
/// slot count is fixed at the width of the word. Bits are hints only; setting
/// an already-set bit is benign and a set bit may outlive the holder it was
/// set for. The authoritative liveness signal is the per-slot ref count.
#[repr(transparent)]
pub struct AtomicBitSet64(AtomicU64);

impl AtomicBitSet64 {
    pub const BITS: usize = u64::BITS as usize;

    pub const fn new(bits: u64) -> Self {
        Self(AtomicU64::new(bits))
    }

    pub fn snapshot(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn is_set(&self, bit: usize) -> bool {
        self.snapshot() & (1u64 << bit) != 0
    }

    pub fn is_full(&self) -> bool {
        self.snapshot() == u64::MAX
    }

    pub fn set(&self, bit: usize) {
        self.0.fetch_or(1u64 << bit, Ordering::Relaxed);
    }

    /// Flips a bit. Used to drop a hint whose holder count just reached zero;
    /// the caller must know the bit is currently set.
    pub fn toggle(&self, bit: usize) {
        self.0.fetch_xor(1u64 << bit, Ordering::Relaxed);
    }

    /// Clears a bit whether or not it is set.
    pub fn clear(&self, bit: usize) {
        self.0.fetch_and(!(1u64 << bit), Ordering::Relaxed);
    }

    pub fn find_first_set(&self) -> Option<usize> {
        first_set(self.snapshot())
    }

    pub fn find_first_clear(&self) -> Option<usize> {
        first_clear(self.snapshot())
    }
}

/// Position of the lowest set bit, if any.
pub const fn first_set(word: u64) -> Option<usize> {
    if word == 0 {
        None
    } else {
        Some(word.trailing_zeros() as usize)
    }
}

/// Position of the lowest clear bit, if any.
pub const fn first_clear(word: u64) -> Option<usize> {
    if word == u64::MAX {
        None
    } else {
        Some(word.trailing_ones() as usize)
    }
}
