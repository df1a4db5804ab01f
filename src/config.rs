//! Cache configuration.
//!
//! The values here describe the geometry of a region when it is first
//! created. Processes attaching to an existing region adopt the geometry that
//! was persisted by its creator, so only the policy sections (`va_policy`,
//! `lock_policy`, `recycle_key_once`) take effect per process.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::layout::{mem_align, ENTRY_HEADER_SIZE, MAX_KEY_SIZE, VALUE_SEGMENT_HEADER_SIZE};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// The largest value segment index an entry offset can encode.
pub(crate) const MAX_SEGMENT_COUNT: u64 = 0x7FFF;

/// Policy of the value allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ValueAllocatorPolicy {
    /// Average key time-to-live in seconds. When positive, an exhausted arena
    /// whose last allocation is older than this is recycled ahead of creating
    /// a new segment. `<= 0` never recycles before the memory limit.
    pub avg_key_ttl: i64,
    /// An arena whose remaining space is at or below this many bytes after a
    /// failed allocation is moved to the exhausted pool.
    pub discard_memory_size: u32,
    /// An arena that failed more than this many allocations is moved to the
    /// exhausted pool.
    pub max_fail_times: u32,
    /// Microseconds to sleep after a recycle pass that removed unexpired
    /// entries. 0 never sleeps.
    pub sleep_us_when_recycle_valid_entries: u64,
}

impl Default for ValueAllocatorPolicy {
    fn default() -> Self {
        ValueAllocatorPolicy {
            avg_key_ttl: 0,
            discard_memory_size: 128,
            max_fail_times: 5,
            sleep_us_when_recycle_valid_entries: 1000,
        }
    }
}

/// Policy of the cross-process write lock.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct LockPolicy {
    /// Sleep between lock attempts once spinning gives up.
    pub trylock_interval_us: u64,
    /// How often a waiting writer inspects the holder for a deadlock.
    pub detect_deadlock_interval_ms: u64,
    /// A holder that kept the lock longer than this is considered stuck and
    /// the lock is taken over. 0 only takes over from dead holders.
    pub max_hold_ms: u64,
    /// Give up with [CacheError::LockTimeout] after this long. 0 waits forever.
    pub timeout_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            trylock_interval_us: 200,
            detect_deadlock_interval_ms: 1000,
            max_hold_ms: 30_000,
            timeout_ms: 60_000,
        }
    }
}

/// The configuration of a cache region.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct Config {
    /// Value memory mapped when the region is created. At least one segment is
    /// always created.
    pub min_memory: u64,
    /// Upper bound of value memory. Determines the maximum segment count.
    pub max_memory: u64,
    /// Size of each value segment.
    pub segment_size: u64,
    /// Size of each arena inside a value segment.
    pub striping_size: u64,
    /// Maximum number of live keys.
    pub max_key_count: u32,
    /// Maximum value length in bytes.
    pub max_value_size: u32,
    /// Number of keys evicted at once when `max_key_count` is reached. `<= 0`
    /// evicts until an arena is empty.
    pub recycle_key_once: i32,
    /// Value allocator policy.
    pub va_policy: ValueAllocatorPolicy,
    /// Lock policy.
    pub lock_policy: LockPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_memory: 0,
            max_memory: 256 * MB,
            segment_size: 8 * MB,
            striping_size: MB,
            max_key_count: 1_000_000,
            max_value_size: 256 * KB as u32,
            recycle_key_once: 0,
            va_policy: ValueAllocatorPolicy::default(),
            lock_policy: LockPolicy::default(),
        }
    }
}

impl Config {
    /// Check the configuration describes a usable region.
    pub fn validate(&self) -> Result<()> {
        if self.max_key_count == 0 {
            return Err(CacheError::InvalidConfig(
                "max_key_count must be greater than 0".into(),
            ));
        }
        let striping_size = mem_align(self.striping_size as usize) as u64;
        if striping_size == 0 {
            return Err(CacheError::InvalidConfig(
                "striping_size must be greater than 0".into(),
            ));
        }
        if self.segment_size < VALUE_SEGMENT_HEADER_SIZE as u64 + striping_size {
            return Err(CacheError::InvalidConfig(format!(
                "segment_size {} can not hold one striping of {} bytes",
                self.segment_size, striping_size
            )));
        }
        if self.max_memory < self.segment_size {
            return Err(CacheError::InvalidConfig(format!(
                "max_memory {} is smaller than segment_size {}",
                self.max_memory, self.segment_size
            )));
        }
        if self.max_memory / self.segment_size > MAX_SEGMENT_COUNT {
            return Err(CacheError::InvalidConfig(format!(
                "max_memory {} needs more than {} segments",
                self.max_memory, MAX_SEGMENT_COUNT
            )));
        }
        if self.segment_size >> 48 != 0 {
            return Err(CacheError::InvalidConfig(format!(
                "segment_size {} exceeds the offset range",
                self.segment_size
            )));
        }
        let largest_entry = ENTRY_HEADER_SIZE
            + mem_align(MAX_KEY_SIZE)
            + mem_align(self.max_value_size as usize);
        if largest_entry as u64 > striping_size {
            return Err(CacheError::InvalidConfig(format!(
                "max_value_size {} does not fit in a striping of {} bytes",
                self.max_value_size, striping_size
            )));
        }
        if self.lock_policy.detect_deadlock_interval_ms == 0 {
            return Err(CacheError::InvalidConfig(
                "detect_deadlock_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
