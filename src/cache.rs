//! ShmCache - a key value cache shared between processes.
//!
//! Every handle attached to the same region sees the same entries. Reads take
//! no lock at all: they walk the hash chain with acquire loads and copy the
//! value out. Writes are serialised across all processes by the lock word in
//! the region header, which a [WriteTxn] holds for its whole lifetime.
//!
//! ```
//! use shmcache::{Config, HeapSegments, ShmCacheBuilder, OPTIONS_STRING};
//!
//! let cache = ShmCacheBuilder::new(Config::default())
//!     .build(HeapSegments::new())
//!     .expect("unable to attach");
//! cache.set(b"greeting", b"hello", OPTIONS_STRING, 0).unwrap();
//! assert_eq!(cache.get(b"greeting").unwrap().data, b"hello");
//! ```

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::hash::{DefaultKeyHasher, KeyHasher};
use crate::hashtable::is_live;
use crate::layout::{NEVER_EXPIRED, OPTIONS_INTEGER, OPTIONS_STRING};
use crate::lock::{self, LockGuard};
use crate::pool::PoolCursor;
use crate::region::{Region, RegionWriter};
use crate::segment::SegmentProvider;
use crate::stats::CacheStats;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A value copied out of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CacheValue {
    /// The value bytes.
    pub data: Vec<u8>,
    /// The application tag stored with the value.
    pub options: u32,
    /// Unix time the entry expires at, 0 for never.
    pub expires: i64,
}

/// Configure and attach a [ShmCache].
pub struct ShmCacheBuilder {
    config: Config,
    hasher: Option<Box<dyn KeyHasher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ShmCacheBuilder {
    /// Start from `config`. Only the first process to attach a region decides
    /// its geometry.
    pub fn new(config: Config) -> Self {
        ShmCacheBuilder {
            config,
            hasher: None,
            clock: None,
        }
    }

    /// Use `hasher` to place keys in buckets. Every process attached to the
    /// region must use the same hash function.
    #[must_use]
    pub fn set_hasher<H>(self, hasher: H) -> Self
    where
        H: KeyHasher + 'static,
    {
        ShmCacheBuilder {
            config: self.config,
            hasher: Some(Box::new(hasher)),
            clock: self.clock,
        }
    }

    /// Use `clock` for expiry and arena ageing.
    #[must_use]
    pub fn set_clock<C>(self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        ShmCacheBuilder {
            config: self.config,
            hasher: self.hasher,
            clock: Some(Arc::new(clock)),
        }
    }

    /// Attach to the region of `provider`, creating it if needed.
    pub fn build<P>(self, provider: P) -> Result<ShmCache>
    where
        P: SegmentProvider + 'static,
    {
        let ShmCacheBuilder {
            config,
            hasher,
            clock,
        } = self;
        let hasher = hasher.unwrap_or_else(|| Box::new(DefaultKeyHasher));
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let pid = std::process::id();

        let region = Region::attach(Arc::new(provider), &config, pid, clock.now())?;
        Ok(ShmCache {
            region,
            config,
            hasher,
            clock,
            cursor: Mutex::new(PoolCursor::default()),
            pid,
        })
    }
}

/// A handle to a shared memory cache.
pub struct ShmCache {
    region: Region,
    config: Config,
    hasher: Box<dyn KeyHasher>,
    clock: Arc<dyn Clock>,
    // Serialises writers of this handle before they compete for the region
    // lock.
    cursor: Mutex<PoolCursor>,
    pid: u32,
}

impl fmt::Debug for ShmCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmCache")
            .field("pid", &self.pid)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl ShmCache {
    /// Attach with the default hasher and clock.
    pub fn open<P>(config: Config, provider: P) -> Result<Self>
    where
        P: SegmentProvider + 'static,
    {
        ShmCacheBuilder::new(config).build(provider)
    }

    /// The configuration of this handle.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look `key` up. An expired entry is returned inside
    /// [CacheError::Expired].
    pub fn get(&self, key: &[u8]) -> Result<CacheValue> {
        self.region.lookup(&*self.hasher, key, self.clock.now())
    }

    /// Take the write lock for a batch of changes.
    pub fn write(&self) -> Result<WriteTxn<'_>> {
        let cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let info = self.region.info();
        let lock = lock::acquire(
            &info.lock,
            &info.stats.lock,
            &self.config.lock_policy,
            self.pid,
        )?;
        Ok(WriteTxn {
            cache: self,
            _lock: lock,
            cursor,
        })
    }

    /// Insert or replace `key`. `expires` is a unix time, 0 never expires.
    pub fn set(&self, key: &[u8], value: &[u8], options: u32, expires: i64) -> Result<()> {
        self.write()?.set(key, value, options, expires)
    }

    /// Insert or replace `key` as a string value living `ttl` seconds. A
    /// `ttl` of 0 never expires.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: i64) -> Result<()> {
        self.write()?.set_with_ttl(key, value, ttl)
    }

    /// Remove `key`.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write()?.delete(key)
    }

    /// Remove every entry, returning how many there were.
    pub fn clear(&self) -> Result<usize> {
        Ok(self.write()?.clear())
    }

    /// Add `delta` to the integer stored at `key` and return the result. A
    /// missing or expired key counts as 0.
    pub fn incr(&self, key: &[u8], delta: i64, expires: i64) -> Result<i64> {
        self.write()?.incr(key, delta, expires)
    }

    /// Change the expiry of a live key.
    pub fn set_expires(&self, key: &[u8], expires: i64) -> Result<()> {
        self.write()?.set_expires(key, expires)
    }

    /// A snapshot of the statistics. With `calc_hit_ratio` the hit ratio and
    /// get rate since the previous calculation are filled in.
    pub fn stats(&self, calc_hit_ratio: bool) -> CacheStats {
        self.region.snapshot(calc_hit_ratio, self.clock.now())
    }

    /// Zero the operation and recycling statistics.
    pub fn clear_stats(&self) -> Result<()> {
        let _txn = self.write()?;
        self.region.info().stats.reset(self.clock.now());
        tracing::debug!("cleared statistics");
        Ok(())
    }

    /// Number of live keys, expired ones included.
    pub fn len(&self) -> usize {
        self.region.info().hashtable.count.load(Ordering::Acquire) as usize
    }

    /// True if there are no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of hash table buckets.
    pub fn capacity(&self) -> usize {
        self.region.geometry().capacity as usize
    }

    /// The live key limit of the region.
    pub fn max_key_count(&self) -> usize {
        self.region.geometry().max_key_count as usize
    }

    /// Check the hash table, recycle list and arena bookkeeping agree.
    pub fn check_invariants(&self) -> Result<()> {
        self.write()?.check_invariants()
    }
}

/// Exclusive write access to the cache across all processes. The lock is
/// released when this is dropped.
pub struct WriteTxn<'a> {
    cache: &'a ShmCache,
    _lock: LockGuard<'a>,
    cursor: MutexGuard<'a, PoolCursor>,
}

impl fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTxn")
            .field("pid", &self.cache.pid)
            .finish_non_exhaustive()
    }
}

impl WriteTxn<'_> {
    fn writer(&mut self) -> RegionWriter<'_> {
        RegionWriter {
            region: &self.cache.region,
            cursor: &mut *self.cursor,
            config: &self.cache.config,
            hasher: &*self.cache.hasher,
            now: self.cache.clock.now(),
        }
    }

    /// See [ShmCache::get].
    pub fn get(&self, key: &[u8]) -> Result<CacheValue> {
        self.cache.get(key)
    }

    /// See [ShmCache::set].
    pub fn set(&mut self, key: &[u8], value: &[u8], options: u32, expires: i64) -> Result<()> {
        self.writer().set(key, value, options, expires)
    }

    /// See [ShmCache::set_with_ttl].
    pub fn set_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: i64) -> Result<()> {
        let expires = if ttl == 0 {
            NEVER_EXPIRED
        } else {
            self.cache.clock.now() + ttl
        };
        self.set(key, value, OPTIONS_STRING, expires)
    }

    /// See [ShmCache::delete].
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let cache = self.cache;
        let stats = &cache.region.info().stats.del;
        stats.total.fetch_add(1, Ordering::Relaxed);
        self.writer().delete(key)?;
        stats.success.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// See [ShmCache::clear].
    pub fn clear(&mut self) -> usize {
        self.writer().clear()
    }

    /// See [ShmCache::incr].
    pub fn incr(&mut self, key: &[u8], delta: i64, expires: i64) -> Result<i64> {
        let cache = self.cache;
        let stats = &cache.region.info().stats.incr;
        stats.total.fetch_add(1, Ordering::Relaxed);
        let value = self.current_integer(key)?.wrapping_add(delta);
        self.set(key, value.to_string().as_bytes(), OPTIONS_INTEGER, expires)?;
        stats.success.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    fn current_integer(&self, key: &[u8]) -> Result<i64> {
        let cache = self.cache;
        let Some(entry) = cache.region.find(&*cache.hasher, key) else {
            return Ok(0);
        };
        if !is_live(
            entry.header().expires.load(Ordering::Acquire),
            cache.clock.now(),
        ) {
            return Ok(0);
        }
        let data = entry.read_value().ok_or(CacheError::NotFound)?;
        std::str::from_utf8(&data)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or(CacheError::NotAnInteger)
    }

    /// See [ShmCache::set_expires].
    pub fn set_expires(&mut self, key: &[u8], expires: i64) -> Result<()> {
        self.writer().set_expires(key, expires)
    }

    /// See [ShmCache::check_invariants].
    pub fn check_invariants(&mut self) -> Result<()> {
        self.writer().verify()
    }
}

#[cfg(test)]
mod tests {
    use super::ShmCacheBuilder;
    use crate::clock::ManualClock;
    use crate::config::{Config, ValueAllocatorPolicy};
    use crate::error::CacheError;
    use crate::layout::{OPTIONS_INTEGER, OPTIONS_STRING};
    use crate::segment::HeapSegments;

    fn config() -> Config {
        Config {
            max_memory: 4 * 4096,
            segment_size: 4096,
            striping_size: 1024,
            max_key_count: 100,
            max_value_size: 512,
            va_policy: ValueAllocatorPolicy {
                sleep_us_when_recycle_valid_entries: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_cache_basic() {
        let _ = tracing_subscriber::fmt::try_init();
        let cache = ShmCacheBuilder::new(config())
            .set_clock(ManualClock::new(1000))
            .build(HeapSegments::new())
            .unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 101);

        cache.set(b"a", b"1", OPTIONS_STRING, 0).unwrap();
        let v = cache.get(b"a").unwrap();
        assert_eq!(v.data, b"1");
        assert_eq!(v.options, OPTIONS_STRING);
        assert_eq!(cache.len(), 1);

        cache.delete(b"a").unwrap();
        assert!(matches!(cache.get(b"a"), Err(CacheError::NotFound)));
        assert!(matches!(cache.delete(b"a"), Err(CacheError::NotFound)));
        cache.check_invariants().unwrap();

        let stats = cache.stats(false);
        assert_eq!(stats.set.total, 1);
        assert_eq!(stats.get.total, 2);
        assert_eq!(stats.get.success, 1);
        assert_eq!(stats.del.total, 2);
        assert_eq!(stats.del.success, 1);
    }

    #[test]
    fn test_cache_ttl_and_incr() {
        let clock = ManualClock::new(1000);
        let cache = ShmCacheBuilder::new(config())
            .set_clock(clock.clone())
            .build(HeapSegments::new())
            .unwrap();

        cache.set_with_ttl(b"t", b"v", 10).unwrap();
        assert_eq!(cache.get(b"t").unwrap().expires, 1010);
        clock.advance(10);
        assert!(matches!(cache.get(b"t"), Err(CacheError::Expired(_))));
        assert_eq!(cache.len(), 1);

        // Expired counts as missing.
        assert_eq!(cache.incr(b"t", 5, 0).unwrap(), 5);
        assert_eq!(cache.incr(b"t", -7, 0).unwrap(), -2);
        let v = cache.get(b"t").unwrap();
        assert_eq!(v.data, b"-2");
        assert_eq!(v.options, OPTIONS_INTEGER);

        cache.set(b"s", b"text", OPTIONS_STRING, 0).unwrap();
        assert!(matches!(cache.incr(b"s", 1, 0), Err(CacheError::NotAnInteger)));
        assert_eq!(cache.stats(false).incr.total, 3);
        assert_eq!(cache.stats(false).incr.success, 2);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_cache_write_txn_batches() {
        let cache = ShmCacheBuilder::new(config())
            .set_clock(ManualClock::new(1))
            .build(HeapSegments::new())
            .unwrap();
        {
            let mut txn = cache.write().unwrap();
            for i in 0..10u8 {
                txn.set(&[i], &[i; 8], 0, 0).unwrap();
            }
            txn.delete(&[3]).unwrap();
            assert_eq!(txn.get(&[4]).unwrap().data, vec![4; 8]);
            txn.check_invariants().unwrap();
        }
        assert_eq!(cache.len(), 9);
        assert_eq!(cache.clear().unwrap(), 9);
        assert!(cache.is_empty());
        cache.clear_stats().unwrap();
        assert_eq!(cache.stats(false).set.total, 0);
    }
}
