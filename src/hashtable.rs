//! The chained hash table in the metadata segment.
//!
//! Buckets hold the offset of the first entry of their chain, entries link to
//! their successor through `ht_next`. Readers walk chains without the lock,
//! so the writer only ever changes a chain with a single release store: a new
//! entry is fully built and given its successor before the store that makes it
//! reachable, and a removed entry keeps its successor so a reader standing on
//! it can still walk on. Retired entries are not overwritten until their whole
//! arena is reset.

use crate::cache::CacheValue;
use crate::error::{CacheError, Result};
use crate::hash::KeyHasher;
use crate::layout::{EntryOffset, MAX_KEY_SIZE, NEVER_EXPIRED, POOL_DOING, POOL_DONE};
use crate::list::RecycleList;
use crate::region::{EntryRef, Region, RegionWriter};
use crate::value_allocator::BuiltEntry;
use std::sync::atomic::{AtomicI64, Ordering};

#[inline]
pub(crate) fn is_live(expires: i64, now: i64) -> bool {
    expires == NEVER_EXPIRED || expires > now
}

impl Region {
    // A chain can never be longer than the live key limit. A reader that
    // walks further is following links of recycled entries.
    #[inline]
    fn max_hops(&self) -> usize {
        self.geometry().max_key_count as usize + 1
    }

    /// Find the entry for `key` without the lock.
    pub(crate) fn find(&self, hasher: &dyn KeyHasher, key: &[u8]) -> Option<EntryRef<'_>> {
        let bucket = self.bucket(hasher, key);
        let mut off = EntryOffset::from_raw(bucket.load(Ordering::Acquire));
        let mut hops = 0;
        while !off.is_null() && hops < self.max_hops() {
            let entry = self.entry(off)?;
            if entry.key_eq(key) {
                return Some(entry);
            }
            off = EntryOffset::from_raw(entry.header().ht_next.load(Ordering::Acquire));
            hops += 1;
        }
        None
    }

    /// Look `key` up and copy its value out.
    pub(crate) fn lookup(&self, hasher: &dyn KeyHasher, key: &[u8], now: i64) -> Result<CacheValue> {
        let stats = &self.info().stats.get;
        stats.total.fetch_add(1, Ordering::Relaxed);
        if key.len() > MAX_KEY_SIZE {
            return Err(CacheError::NotFound);
        }

        let entry = self.find(hasher, key).ok_or(CacheError::NotFound)?;
        let header = entry.header();
        let options = header.options.load(Ordering::Relaxed);
        let expires = header.expires.load(Ordering::Acquire);
        let data = entry.read_value().ok_or(CacheError::NotFound)?;
        let value = CacheValue {
            data,
            options,
            expires,
        };
        if is_live(expires, now) {
            stats.success.fetch_add(1, Ordering::Relaxed);
            Ok(value)
        } else {
            Err(CacheError::Expired(value))
        }
    }
}

/// Where a key sits in its chain.
struct ChainPos<'r> {
    bucket: &'r AtomicI64,
    prev: Option<EntryRef<'r>>,
    found: Option<EntryRef<'r>>,
}

impl ChainPos<'_> {
    /// Point the predecessor (or the bucket) at `off`.
    #[inline]
    fn publish(&self, off: EntryOffset) {
        match self.prev {
            Some(prev) => prev.header().ht_next.store(off.raw(), Ordering::Release),
            None => self.bucket.store(off.raw(), Ordering::Release),
        }
    }
}

impl<'a> RegionWriter<'a> {
    /// Walk the chain of `key` to the first entry `matches` accepts, or to
    /// the tail.
    fn locate<F>(&self, key: &[u8], matches: F) -> Result<ChainPos<'a>>
    where
        F: Fn(&EntryRef<'a>) -> bool,
    {
        let region = self.region;
        let bucket = region.bucket(self.hasher, key);
        let mut prev = None;
        let mut off = EntryOffset::from_raw(bucket.load(Ordering::Relaxed));
        let mut hops = 0;
        while !off.is_null() {
            if hops > region.geometry().max_key_count as usize {
                tracing::error!("hash chain is longer than the key limit");
                return Err(CacheError::Corrupted("hash chain loops".into()));
            }
            let entry = region.entry_linked(off)?;
            if matches(&entry) {
                return Ok(ChainPos {
                    bucket,
                    prev,
                    found: Some(entry),
                });
            }
            prev = Some(entry);
            off = EntryOffset::from_raw(entry.header().ht_next.load(Ordering::Relaxed));
            hops += 1;
        }
        Ok(ChainPos {
            bucket,
            prev,
            found: None,
        })
    }

    /// Insert or replace `key`.
    pub(crate) fn set(&mut self, key: &[u8], value: &[u8], options: u32, expires: i64) -> Result<()> {
        let info = self.region.info();
        info.stats.set.total.fetch_add(1, Ordering::Relaxed);
        if key.len() > MAX_KEY_SIZE {
            return Err(CacheError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        let max_value = self.config.max_value_size as usize;
        if value.len() > max_value {
            return Err(CacheError::ValueTooLong {
                len: value.len(),
                max: max_value,
            });
        }

        if info.hashtable.count.load(Ordering::Relaxed) >= self.region.geometry().max_key_count
            && self.locate(key, |e| e.key_eq(key))?.found.is_none()
        {
            self.recycle(self.config.recycle_key_once, &info.stats.recycle_key)?;
        }

        let built = self
            .alloc_entry(key.len(), value.len())?
            .fill(key, value, options, expires);
        self.publish(key, built)?;
        info.stats.set.success.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Link a built entry into its chain, in place of an entry with the same
    /// key or at the tail.
    fn publish(&mut self, key: &[u8], built: BuiltEntry<'a>) -> Result<()> {
        let pos = match self.locate(key, |e| e.key_eq(key)) {
            Ok(pos) => pos,
            Err(e) => {
                self.discard(built);
                return Err(e);
            }
        };
        let new = built.entry();
        let successor = pos
            .found
            .map(|old| old.header().ht_next.load(Ordering::Relaxed))
            .unwrap_or(0);
        new.header().ht_next.store(successor, Ordering::Relaxed);
        pos.publish(new.offset());

        if let Some(old) = pos.found {
            self.retire(old)?;
        }
        self.link(new)
    }

    /// Count a newly reachable entry and append it to the recycle list.
    fn link(&mut self, entry: EntryRef<'_>) -> Result<()> {
        let info = self.region.info();
        let header = entry.header();
        info.hashtable.count.fetch_add(1, Ordering::Release);
        info.usage.used_key.fetch_add(
            header.key_len.load(Ordering::Relaxed) as i64,
            Ordering::Relaxed,
        );
        info.usage.used_value.fetch_add(
            header.value_len.load(Ordering::Relaxed) as i64,
            Ordering::Relaxed,
        );
        RecycleList::new(self.region).push_back(entry)
    }

    /// Account for an entry no longer reachable from its chain and free its
    /// storage. True when that emptied its arena.
    pub(crate) fn retire(&mut self, entry: EntryRef<'_>) -> Result<bool> {
        let info = self.region.info();
        let header = entry.header();
        info.hashtable.count.fetch_sub(1, Ordering::Release);
        info.usage.used_key.fetch_sub(
            header.key_len.load(Ordering::Relaxed) as i64,
            Ordering::Relaxed,
        );
        info.usage.used_value.fetch_sub(
            header.value_len.load(Ordering::Relaxed) as i64,
            Ordering::Relaxed,
        );
        RecycleList::new(self.region).remove(entry)?;
        self.free_entry(entry)
    }

    fn unlink(&mut self, pos: ChainPos<'a>) -> Result<Option<bool>> {
        match pos.found {
            Some(entry) => {
                pos.publish(EntryOffset::from_raw(
                    entry.header().ht_next.load(Ordering::Relaxed),
                ));
                self.retire(entry).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Remove `key`. `Ok(true)` when the removal emptied an arena.
    pub(crate) fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if key.len() > MAX_KEY_SIZE {
            return Err(CacheError::NotFound);
        }
        let pos = self.locate(key, |e| e.key_eq(key))?;
        self.unlink(pos)?.ok_or(CacheError::NotFound)
    }

    /// Remove exactly `entry`, whose key is `key`.
    pub(crate) fn delete_entry(&mut self, key: &[u8], entry: EntryRef<'_>) -> Result<bool> {
        let target = entry.offset();
        let pos = self.locate(key, |e| e.offset() == target)?;
        self.unlink(pos)?.ok_or(CacheError::NotFound)
    }

    /// Change the expiry of a live key in place.
    pub(crate) fn set_expires(&mut self, key: &[u8], expires: i64) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(CacheError::NotFound);
        }
        let entry = self
            .locate(key, |e| e.key_eq(key))?
            .found
            .ok_or(CacheError::NotFound)?;
        let header = entry.header();
        if !is_live(header.expires.load(Ordering::Relaxed), self.now) {
            return Err(CacheError::NotFound);
        }
        header.expires.store(expires, Ordering::Release);
        Ok(())
    }

    /// Drop every entry and reset every arena. Returns the previous count.
    pub(crate) fn clear(&mut self) -> usize {
        let region = self.region;
        let info = region.info();
        let count = info.hashtable.count.load(Ordering::Relaxed) as usize;

        for bucket in region.buckets() {
            bucket.store(0, Ordering::Release);
        }
        info.hashtable.count.store(0, Ordering::Release);
        RecycleList::new(region).reset();

        let doing = region.doing_pool();
        let done = region.done_pool();
        doing.clear();
        done.clear();
        let stripings = info.striping_count.load(Ordering::Relaxed) as usize;
        for (index, allocator) in region.allocators()[..stripings].iter().enumerate() {
            allocator.reset();
            allocator.in_which_pool.store(POOL_DOING, Ordering::Relaxed);
            // Capacity is one more than the striping count, so this fits.
            doing.push(region.allocator_ref(index));
        }

        info.usage.used_entry.store(0, Ordering::Relaxed);
        info.usage.used_key.store(0, Ordering::Relaxed);
        info.usage.used_value.store(0, Ordering::Relaxed);
        info.stats.last_clear_time.store(self.now, Ordering::Relaxed);
        info.stats.last_calc_time.store(self.now, Ordering::Relaxed);
        tracing::info!(count, stripings, "cleared all entries");
        count
    }

    /// Check the table, the recycle list and the pools agree.
    pub(crate) fn verify(&self) -> Result<()> {
        let region = self.region;
        let info = region.info();
        let count = info.hashtable.count.load(Ordering::Relaxed) as usize;
        let limit = region.geometry().max_key_count as usize + 1;

        let mut chained = Vec::with_capacity(count);
        for bucket in region.buckets() {
            let mut off = EntryOffset::from_raw(bucket.load(Ordering::Relaxed));
            while !off.is_null() {
                if chained.len() > limit {
                    return Err(CacheError::Corrupted("hash chains loop".into()));
                }
                let entry = region.entry_linked(off)?;
                chained.push(off);
                off = EntryOffset::from_raw(entry.header().ht_next.load(Ordering::Relaxed));
            }
        }
        let mut listed = RecycleList::new(region).verify(limit)?;
        if chained.len() != count || listed.len() != count {
            return Err(CacheError::InternalInconsistency(format!(
                "count {} but {} chained and {} listed entries",
                count,
                chained.len(),
                listed.len()
            )));
        }
        chained.sort_unstable();
        listed.sort_unstable();
        if chained != listed {
            return Err(CacheError::InternalInconsistency(
                "hash chains and recycle list hold different entries".into(),
            ));
        }

        let stripings = info.striping_count.load(Ordering::Relaxed) as usize;
        let pooled = region.doing_pool().len() + region.done_pool().len();
        if pooled != stripings {
            return Err(CacheError::InternalInconsistency(format!(
                "{} stripings but {} pooled",
                stripings, pooled
            )));
        }
        for (pool, which) in [(region.doing_pool(), POOL_DOING), (region.done_pool(), POOL_DONE)] {
            for value in pool.iter() {
                let in_pool = region
                    .allocator_by_ref(value)
                    .map(|a| a.in_which_pool.load(Ordering::Relaxed));
                if in_pool != Some(which) {
                    return Err(CacheError::InternalInconsistency(format!(
                        "pool {} holds striping {:#x} marked {:?}",
                        which, value, in_pool
                    )));
                }
            }
        }
        let used: i64 = region.allocators()[..stripings]
            .iter()
            .map(|a| a.used.load(Ordering::Relaxed))
            .sum();
        if used != info.usage.used_entry.load(Ordering::Relaxed) {
            return Err(CacheError::InternalInconsistency(format!(
                "stripings use {} bytes, usage says {}",
                used,
                info.usage.used_entry.load(Ordering::Relaxed)
            )));
        }
        Ok(())
    }
}
