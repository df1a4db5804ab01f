//! Bump allocation inside one arena ("striping") of a value segment.
//!
//! An arena hands out space by advancing its free cursor and never reuses a
//! hole: frees only lower the used byte count, and once that reaches zero the
//! whole arena is reset. The reset bumps the generation so any handle still
//! pointing into the old contents can be recognised as stale.

use crate::layout::{StripingAllocator, POOL_DOING};
use std::sync::atomic::Ordering;

impl StripingAllocator {
    /// Set up the arena at `base..base + size` of value segment `segment`.
    pub(crate) fn init(&self, segment: u32, striping: u32, base: i64, size: i64) {
        self.segment.store(segment, Ordering::Relaxed);
        self.striping.store(striping, Ordering::Relaxed);
        self.total.store(size, Ordering::Relaxed);
        self.base.store(base, Ordering::Relaxed);
        self.end.store(base + size, Ordering::Relaxed);
        self.in_which_pool.store(POOL_DOING, Ordering::Relaxed);
        self.last_alloc_time.store(0, Ordering::Relaxed);
        self.reset();
    }

    /// Take `size` bytes, returning their offset in the value segment.
    pub(crate) fn alloc(&self, size: usize, now: i64) -> Option<i64> {
        let size = size as i64;
        let free = self.free.load(Ordering::Relaxed);
        if free + size > self.end.load(Ordering::Relaxed) {
            self.fail_times.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.free.store(free + size, Ordering::Relaxed);
        self.used.fetch_add(size, Ordering::Relaxed);
        self.last_alloc_time.store(now, Ordering::Relaxed);
        Some(free)
    }

    /// Give back `size` bytes. True when nothing is in use any more and the
    /// arena should be reset.
    pub(crate) fn release(&self, size: usize) -> bool {
        let used = self.used.fetch_sub(size as i64, Ordering::Relaxed) - size as i64;
        if used < 0 {
            tracing::error!(
                segment = self.segment.load(Ordering::Relaxed),
                striping = self.striping.load(Ordering::Relaxed),
                used,
                "striping used bytes went negative"
            );
        }
        used <= 0
    }

    /// Rewind to empty. Every entry allocated before is invalidated.
    pub(crate) fn reset(&self) {
        self.free
            .store(self.base.load(Ordering::Relaxed), Ordering::Relaxed);
        self.used.store(0, Ordering::Relaxed);
        self.fail_times.store(0, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes left before the end of the arena.
    #[inline]
    pub(crate) fn free_size(&self) -> i64 {
        self.end.load(Ordering::Relaxed) - self.free.load(Ordering::Relaxed)
    }
}
