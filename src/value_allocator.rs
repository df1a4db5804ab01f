//! Entry storage across all arenas.
//!
//! Arenas that may still satisfy an allocation sit in the doing pool, those
//! that failed too often or have too little room left sit in the done pool.
//! Allocation scans the doing pool from its head. When nothing fits the
//! allocator either creates another value segment or recycles the oldest
//! entries until a whole arena is empty again.
//!
//! Storage comes back as a [PendingEntry]. Filling it in yields a
//! [BuiltEntry], the only thing the hash table will publish.

use crate::error::{CacheError, Result};
use crate::layout::{
    mem_align, EntryOffset, StripingAllocator, ENTRY_HEADER_SIZE, POOL_DOING, POOL_DONE,
};
use crate::region::{EntryRef, RegionWriter};
use std::sync::atomic::Ordering;

/// Freshly allocated storage. Nothing but the allocation metadata is written.
#[must_use]
pub(crate) struct PendingEntry<'r> {
    entry: EntryRef<'r>,
}

impl<'r> PendingEntry<'r> {
    /// Write key, value and attributes.
    pub(crate) fn fill(
        self,
        key: &[u8],
        value: &[u8],
        options: u32,
        expires: i64,
    ) -> BuiltEntry<'r> {
        let header = self.entry.header();
        header.key_len.store(key.len() as u32, Ordering::Relaxed);
        header.value_len.store(value.len() as u32, Ordering::Relaxed);
        header.options.store(options, Ordering::Relaxed);
        header.expires.store(expires, Ordering::Relaxed);
        header.prev.store(0, Ordering::Relaxed);
        header.next.store(0, Ordering::Relaxed);
        header.ht_next.store(0, Ordering::Relaxed);
        // SAFETY: Storage this writer allocated for exactly these lengths and
        // that no chain links to yet.
        unsafe { self.entry.write_payload(key, value) };
        BuiltEntry { entry: self.entry }
    }
}

/// A completely written entry, ready to be linked into a bucket chain.
#[must_use]
pub(crate) struct BuiltEntry<'r> {
    entry: EntryRef<'r>,
}

impl<'r> BuiltEntry<'r> {
    #[inline]
    pub(crate) fn entry(&self) -> EntryRef<'r> {
        self.entry
    }
}

/// Bytes an entry with these lengths takes in an arena.
#[inline]
pub(crate) fn entry_size(key_len: usize, value_len: usize) -> usize {
    ENTRY_HEADER_SIZE + mem_align(key_len) + mem_align(value_len)
}

impl<'a> RegionWriter<'a> {
    /// Allocate storage for an entry, recycling or growing when the doing
    /// pool is exhausted.
    pub(crate) fn alloc_entry(&mut self, key_len: usize, value_len: usize) -> Result<PendingEntry<'a>> {
        let size = entry_size(key_len, value_len);
        if let Some(pending) = self.try_alloc(size)? {
            return Ok(pending);
        }

        self.reclaim_or_grow().map_err(|e| match e {
            CacheError::OutOfMemory { .. } => CacheError::OutOfMemory { size },
            e => e,
        })?;

        if let Some(pending) = self.try_alloc(size)? {
            return Ok(pending);
        }
        tracing::error!(size, "unable to allocate entry after recycling");
        Err(CacheError::OutOfMemory { size })
    }

    fn try_alloc(&mut self, size: usize) -> Result<Option<PendingEntry<'a>>> {
        let region = self.region;
        let policy = &self.config.va_policy;
        let doing = region.doing_pool();

        let mut cur = doing.first(self.cursor);
        while let Some(value) = cur {
            let allocator = region.allocator_by_ref(value).ok_or_else(|| {
                tracing::error!(value, "doing pool holds an unknown striping");
                CacheError::InternalInconsistency(format!(
                    "doing pool holds unknown striping {:#x}",
                    value
                ))
            })?;

            if let Some(offset) = allocator.alloc(size, self.now) {
                return self.pending(allocator, offset, size).map(Some);
            }

            if allocator.free_size() <= policy.discard_memory_size as i64
                || allocator.fail_times.load(Ordering::Relaxed) > policy.max_fail_times
            {
                let removed = if doing.peek_first() == Some(value) {
                    doing.remove_first().is_some()
                } else {
                    doing.remove_by(value)
                };
                if !removed {
                    tracing::error!(value, "striping missing from the doing pool");
                    return Err(CacheError::InternalInconsistency(
                        "striping missing from the doing pool".into(),
                    ));
                }
                allocator.in_which_pool.store(POOL_DONE, Ordering::Relaxed);
                if !region.done_pool().push(value) {
                    tracing::error!(value, "done pool is full");
                    return Err(CacheError::InternalInconsistency(
                        "done pool is full".into(),
                    ));
                }
                tracing::debug!(
                    segment = allocator.segment.load(Ordering::Relaxed),
                    striping = allocator.striping.load(Ordering::Relaxed),
                    free = allocator.free_size(),
                    "striping moved to the done pool"
                );
            }
            cur = doing.next(self.cursor);
        }
        Ok(None)
    }

    fn pending(
        &self,
        allocator: &StripingAllocator,
        offset: i64,
        size: usize,
    ) -> Result<PendingEntry<'a>> {
        let segment = allocator.segment.load(Ordering::Relaxed);
        let off = EntryOffset::new(segment as u16, offset as usize);
        let entry = self.region.entry_linked(off)?;
        let header = entry.header();
        header.alloc_size.store(size as u32, Ordering::Relaxed);
        header.segment.store(segment, Ordering::Relaxed);
        header
            .striping
            .store(allocator.striping.load(Ordering::Relaxed), Ordering::Relaxed);
        header.generation.store(
            allocator.generation.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        header.offset.store(offset, Ordering::Relaxed);
        self.region
            .info()
            .usage
            .used_entry
            .fetch_add(size as i64, Ordering::Relaxed);
        Ok(PendingEntry { entry })
    }

    /// Make room: recycle an arena or map another segment.
    fn reclaim_or_grow(&mut self) -> Result<()> {
        let region = self.region;
        let info = region.info();
        let policy = &self.config.va_policy;

        if info.segment_count.load(Ordering::Relaxed) >= region.geometry().max_segments {
            return self.recycle(-1, &info.stats.recycle_striping);
        }

        if policy.avg_key_ttl > 0 {
            let stale = region
                .done_pool()
                .peek_first()
                .and_then(|value| region.allocator_by_ref(value))
                .map(|a| self.now - a.last_alloc_time.load(Ordering::Relaxed) >= policy.avg_key_ttl)
                .unwrap_or(false);
            if stale {
                tracing::debug!("oldest done striping outlived avg_key_ttl, recycling");
                return self.recycle(-1, &info.stats.recycle_striping);
            }
        }

        match region.create_value_segment() {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(?e, "unable to create value segment, recycling");
                self.recycle(-1, &info.stats.recycle_striping)
            }
        }
    }

    /// Return an entry's storage. True when its arena became empty and was
    /// reset.
    pub(crate) fn free_entry(&mut self, entry: EntryRef<'_>) -> Result<bool> {
        let region = self.region;
        let header = entry.header();
        let segment = header.segment.load(Ordering::Relaxed);
        let striping = header.striping.load(Ordering::Relaxed);
        let index = region.geometry().striping_index(segment, striping);
        let allocator = region.allocators().get(index).ok_or_else(|| {
            tracing::error!(segment, striping, "entry names an unknown striping");
            CacheError::InternalInconsistency(format!(
                "entry names unknown striping {}/{}",
                segment, striping
            ))
        })?;

        let generation = header.generation.load(Ordering::Relaxed);
        if generation != allocator.generation.load(Ordering::Relaxed) {
            tracing::error!(
                segment,
                striping,
                generation,
                "entry outlived a reset of its striping"
            );
            return Err(CacheError::InternalInconsistency(
                "entry outlived a reset of its striping".into(),
            ));
        }

        let size = header.alloc_size.load(Ordering::Relaxed) as usize;
        region
            .info()
            .usage
            .used_entry
            .fetch_sub(size as i64, Ordering::Relaxed);
        if !allocator.release(size) {
            return Ok(false);
        }

        allocator.reset();
        if allocator.in_which_pool.load(Ordering::Relaxed) == POOL_DONE {
            let value = region.allocator_ref(index);
            if !region.done_pool().remove_by(value) {
                tracing::error!(segment, striping, "striping missing from the done pool");
                return Err(CacheError::InternalInconsistency(
                    "striping missing from the done pool".into(),
                ));
            }
            allocator.in_which_pool.store(POOL_DOING, Ordering::Relaxed);
            if !region.doing_pool().push(value) {
                tracing::error!(segment, striping, "doing pool is full");
                return Err(CacheError::InternalInconsistency(
                    "doing pool is full".into(),
                ));
            }
        }
        tracing::debug!(segment, striping, "striping emptied and reset");
        Ok(true)
    }

    /// Free a built entry that will not be published.
    pub(crate) fn discard(&mut self, built: BuiltEntry<'_>) {
        if let Err(e) = self.free_entry(built.entry()) {
            tracing::error!(?e, "unable to free an unpublished entry");
        }
    }
}
