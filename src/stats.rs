//! Statistics kept in the region, and the snapshot handed to callers.
//!
//! Counters are shared by every attached process. Readers bump the `get`
//! counters without the lock, everything else is only changed by the writer.

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::layout::{Counter, LockCounter, MemoryUsage, RecycleCounter, ShmStats};
use crate::region::Region;
use std::sync::atomic::Ordering;

/// Total and successful operations of one kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct OpStats {
    /// Attempts.
    pub total: i64,
    /// Attempts that succeeded.
    pub success: i64,
}

/// Recycling passes of one mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct RecycleStats {
    /// Passes started.
    pub total: i64,
    /// Passes that reached their goal.
    pub success: i64,
    /// Successful passes that evicted entries which had not expired.
    pub force: i64,
    /// Unix time of the last pass.
    pub last_recycle_time: i64,
}

/// Write lock contention.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LockStats {
    /// Acquisitions.
    pub total: i64,
    /// Sleeps while waiting.
    pub retry: i64,
    /// Inspections of the holder.
    pub detect_deadlock: i64,
    /// Locks taken over from a dead or overdue holder.
    pub unlock_deadlock: i64,
    /// Unix time of the last inspection.
    pub last_detect_deadlock_time: i64,
    /// Unix time of the last take over.
    pub last_unlock_deadlock_time: i64,
}

/// Memory of the value segments, in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct MemoryStats {
    /// Upper bound of value segment memory.
    pub max: i64,
    /// Value segment memory mapped so far.
    pub alloced: i64,
    /// Size of the metadata segment.
    pub used_common: i64,
    /// Bytes taken by live and not yet reclaimed entries, headers included.
    pub used_entry: i64,
    /// Key bytes of live entries.
    pub used_key: i64,
    /// Value bytes of live entries.
    pub used_value: i64,
}

/// A point in time copy of the cache statistics.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CacheStats {
    /// Live keys.
    pub key_count: u32,
    /// Live key limit.
    pub max_key_count: u32,
    /// Hash table buckets.
    pub capacity: u32,
    /// Value segments created.
    pub segment_count: u32,
    /// Value segment limit.
    pub max_segments: u32,
    /// Arenas across all created segments.
    pub striping_count: u32,
    /// Arenas that may still allocate.
    pub doing_stripings: usize,
    /// Arenas waiting to be emptied.
    pub done_stripings: usize,

    /// `set` calls, `incr` included.
    pub set: OpStats,
    /// `get` calls. A hit is a success, an expired key is not.
    pub get: OpStats,
    /// `delete` calls.
    pub del: OpStats,
    /// `incr` calls.
    pub incr: OpStats,

    /// Entries removed by recycling.
    pub clear_ht_entry_total: i64,
    /// Entries removed by recycling before they expired.
    pub clear_ht_entry_valid: i64,
    /// Recycling because the key limit was reached.
    pub recycle_key: RecycleStats,
    /// Recycling because the value memory was exhausted.
    pub recycle_striping: RecycleStats,

    /// Write lock contention.
    pub lock: LockStats,
    /// Value memory.
    pub memory: MemoryStats,

    /// Unix time the region was created.
    pub init_time: i64,
    /// Unix time of the last clear.
    pub last_clear_time: i64,

    /// Share of successful gets since the last calculation.
    pub hit_ratio: Option<f64>,
    /// Gets per second since the last calculation.
    pub get_qps: Option<f64>,
}

impl Counter {
    fn snapshot(&self) -> OpStats {
        OpStats {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
    }
}

impl RecycleCounter {
    fn snapshot(&self) -> RecycleStats {
        RecycleStats {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            force: self.force.load(Ordering::Relaxed),
            last_recycle_time: self.last_recycle_time.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.force.store(0, Ordering::Relaxed);
        self.last_recycle_time.store(0, Ordering::Relaxed);
    }
}

impl LockCounter {
    fn snapshot(&self) -> LockStats {
        LockStats {
            total: self.total.load(Ordering::Relaxed),
            retry: self.retry.load(Ordering::Relaxed),
            detect_deadlock: self.detect_deadlock.load(Ordering::Relaxed),
            unlock_deadlock: self.unlock_deadlock.load(Ordering::Relaxed),
            last_detect_deadlock_time: self.last_detect_deadlock_time.load(Ordering::Relaxed),
            last_unlock_deadlock_time: self.last_unlock_deadlock_time.load(Ordering::Relaxed),
        }
    }
}

impl MemoryUsage {
    pub(crate) fn reset(&self) {
        self.alloced.store(0, Ordering::Relaxed);
        self.used_common.store(0, Ordering::Relaxed);
        self.used_entry.store(0, Ordering::Relaxed);
        self.used_key.store(0, Ordering::Relaxed);
        self.used_value.store(0, Ordering::Relaxed);
    }
}

impl ShmStats {
    /// Zero the operation and recycling counters. Lock counters survive
    /// since the lock word they describe does.
    pub(crate) fn reset(&self, now: i64) {
        self.set.reset();
        self.get.reset();
        self.del.reset();
        self.incr.reset();
        self.clear_ht_entry_total.store(0, Ordering::Relaxed);
        self.clear_ht_entry_valid.store(0, Ordering::Relaxed);
        self.recycle_key.reset();
        self.recycle_striping.reset();
        self.last_get.reset();
        self.last_calc_time.store(now, Ordering::Relaxed);
    }

    /// Hit ratio and qps of gets since the last call, then start a new
    /// window.
    fn calc_hit_ratio(&self, now: i64) -> (Option<f64>, Option<f64>) {
        let total = self.get.total.load(Ordering::Relaxed);
        let success = self.get.success.load(Ordering::Relaxed);
        let last_total = self.last_get.total.swap(total, Ordering::Relaxed);
        let last_success = self.last_get.success.swap(success, Ordering::Relaxed);
        let last_time = self.last_calc_time.swap(now, Ordering::Relaxed);

        let gets = total - last_total;
        let hits = success - last_success;
        let hit_ratio = (gets > 0).then(|| hits as f64 / gets as f64);
        let seconds = now - last_time;
        let get_qps = (seconds > 0).then(|| gets as f64 / seconds as f64);
        (hit_ratio, get_qps)
    }
}

impl Region {
    /// Copy the statistics out. With `calc_hit_ratio` the hit ratio window is
    /// closed and a new one started.
    pub(crate) fn snapshot(&self, calc_hit_ratio: bool, now: i64) -> CacheStats {
        let info = self.info();
        let geometry = self.geometry();
        let stats = &info.stats;
        let usage = &info.usage;
        let (hit_ratio, get_qps) = if calc_hit_ratio {
            stats.calc_hit_ratio(now)
        } else {
            (None, None)
        };
        CacheStats {
            key_count: info.hashtable.count.load(Ordering::Acquire),
            max_key_count: geometry.max_key_count,
            capacity: geometry.capacity,
            segment_count: info.segment_count.load(Ordering::Acquire),
            max_segments: geometry.max_segments,
            striping_count: info.striping_count.load(Ordering::Relaxed),
            doing_stripings: self.doing_pool().len(),
            done_stripings: self.done_pool().len(),
            set: stats.set.snapshot(),
            get: stats.get.snapshot(),
            del: stats.del.snapshot(),
            incr: stats.incr.snapshot(),
            clear_ht_entry_total: stats.clear_ht_entry_total.load(Ordering::Relaxed),
            clear_ht_entry_valid: stats.clear_ht_entry_valid.load(Ordering::Relaxed),
            recycle_key: stats.recycle_key.snapshot(),
            recycle_striping: stats.recycle_striping.snapshot(),
            lock: stats.lock.snapshot(),
            memory: MemoryStats {
                max: (geometry.max_segments as u64 * geometry.segment_size) as i64,
                alloced: usage.alloced.load(Ordering::Relaxed),
                used_common: usage.used_common.load(Ordering::Relaxed),
                used_entry: usage.used_entry.load(Ordering::Relaxed),
                used_key: usage.used_key.load(Ordering::Relaxed),
                used_value: usage.used_value.load(Ordering::Relaxed),
            },
            init_time: info.init_time,
            last_clear_time: stats.last_clear_time.load(Ordering::Relaxed),
            hit_ratio,
            get_qps,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::layout::ShmStats;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_hit_ratio_window() {
        let stats = ShmStats::default();
        stats.last_calc_time.store(100, Ordering::Relaxed);
        stats.get.total.store(10, Ordering::Relaxed);
        stats.get.success.store(4, Ordering::Relaxed);

        let (ratio, qps) = stats.calc_hit_ratio(105);
        assert_eq!(ratio, Some(0.4));
        assert_eq!(qps, Some(2.0));

        // An empty window has no ratio.
        let (ratio, qps) = stats.calc_hit_ratio(105);
        assert_eq!(ratio, None);
        assert_eq!(qps, None);

        stats.get.total.store(12, Ordering::Relaxed);
        stats.get.success.store(6, Ordering::Relaxed);
        let (ratio, _) = stats.calc_hit_ratio(106);
        assert_eq!(ratio, Some(1.0));
    }

    #[test]
    fn test_reset_keeps_lock_counters() {
        let stats = ShmStats::default();
        stats.set.total.store(3, Ordering::Relaxed);
        stats.recycle_key.force.store(2, Ordering::Relaxed);
        stats.lock.total.store(9, Ordering::Relaxed);
        stats.reset(77);
        assert_eq!(stats.set.total.load(Ordering::Relaxed), 0);
        assert_eq!(stats.recycle_key.force.load(Ordering::Relaxed), 0);
        assert_eq!(stats.lock.total.load(Ordering::Relaxed), 9);
        assert_eq!(stats.last_calc_time.load(Ordering::Relaxed), 77);
    }
}
