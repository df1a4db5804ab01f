//! The recycle list, an intrusive FIFO over every live entry.
//!
//! Entries are appended when they are published and unlinked when they are
//! retired, so the head is always the oldest live entry. The links are the
//! `prev`/`next` offsets at the start of each entry header. Only the lock
//! holder touches the list, readers never follow it.

use crate::error::{CacheError, Result};
use crate::layout::{EntryOffset, HashTableHeader};
use crate::region::{EntryRef, Region};
use std::sync::atomic::Ordering;

pub(crate) struct RecycleList<'r> {
    region: &'r Region,
    header: &'r HashTableHeader,
}

impl<'r> RecycleList<'r> {
    pub(crate) fn new(region: &'r Region) -> Self {
        RecycleList {
            region,
            header: &region.info().hashtable,
        }
    }

    #[inline]
    fn head(&self) -> EntryOffset {
        EntryOffset::from_raw(self.header.list_head.load(Ordering::Relaxed))
    }

    #[inline]
    fn tail(&self) -> EntryOffset {
        EntryOffset::from_raw(self.header.list_tail.load(Ordering::Relaxed))
    }

    /// The oldest entry.
    pub(crate) fn front(&self) -> Result<Option<EntryRef<'r>>> {
        let head = self.head();
        if head.is_null() {
            Ok(None)
        } else {
            self.region.entry_linked(head).map(Some)
        }
    }

    pub(crate) fn push_back(&self, entry: EntryRef<'_>) -> Result<()> {
        let off = entry.offset();
        let header = entry.header();
        let tail = self.tail();
        header.prev.store(tail.raw(), Ordering::Relaxed);
        header.next.store(0, Ordering::Relaxed);
        if tail.is_null() {
            self.header.list_head.store(off.raw(), Ordering::Relaxed);
        } else {
            self.region
                .entry_linked(tail)?
                .header()
                .next
                .store(off.raw(), Ordering::Relaxed);
        }
        self.header.list_tail.store(off.raw(), Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn remove(&self, entry: EntryRef<'_>) -> Result<()> {
        let header = entry.header();
        let prev = EntryOffset::from_raw(header.prev.load(Ordering::Relaxed));
        let next = EntryOffset::from_raw(header.next.load(Ordering::Relaxed));

        if prev.is_null() {
            if self.head() != entry.offset() {
                tracing::error!(offset = entry.offset().raw(), "unlinking an entry not on the recycle list");
                return Err(CacheError::InternalInconsistency(
                    "entry is not on the recycle list".into(),
                ));
            }
            self.header.list_head.store(next.raw(), Ordering::Relaxed);
        } else {
            self.region
                .entry_linked(prev)?
                .header()
                .next
                .store(next.raw(), Ordering::Relaxed);
        }

        if next.is_null() {
            self.header.list_tail.store(prev.raw(), Ordering::Relaxed);
        } else {
            self.region
                .entry_linked(next)?
                .header()
                .prev
                .store(prev.raw(), Ordering::Relaxed);
        }
        header.prev.store(0, Ordering::Relaxed);
        header.next.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn reset(&self) {
        self.header.list_head.store(0, Ordering::Relaxed);
        self.header.list_tail.store(0, Ordering::Relaxed);
    }

    /// Walk the list from the head, checking back links. At most `limit`
    /// entries are visited.
    pub(crate) fn verify(&self, limit: usize) -> Result<Vec<EntryOffset>> {
        let mut seen = Vec::new();
        let mut prev = EntryOffset::NULL;
        let mut cur = self.head();
        while !cur.is_null() {
            if seen.len() >= limit {
                return Err(CacheError::Corrupted("recycle list is too long".into()));
            }
            let entry = self.region.entry_linked(cur)?;
            let back = EntryOffset::from_raw(entry.header().prev.load(Ordering::Relaxed));
            if back != prev {
                return Err(CacheError::Corrupted(format!(
                    "recycle list back link of {:#x} is broken",
                    cur.raw()
                )));
            }
            seen.push(cur);
            prev = cur;
            cur = EntryOffset::from_raw(entry.header().next.load(Ordering::Relaxed));
        }
        if prev != self.tail() {
            return Err(CacheError::Corrupted("recycle list tail is wrong".into()));
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::RecycleList;
    use crate::hash::DefaultKeyHasher;
    use crate::pool::PoolCursor;
    use crate::region::tests::small_config;
    use crate::region::{Region, RegionWriter};
    use crate::segment::{HeapSegments, SegmentProvider};
    use std::sync::Arc;

    #[test]
    fn test_recycle_list_order() {
        let config = small_config();
        let provider: Arc<dyn SegmentProvider> = Arc::new(HeapSegments::new());
        let region = Region::attach(provider, &config, std::process::id(), 0).unwrap();
        let mut cursor = PoolCursor::default();
        let mut w = RegionWriter {
            region: &region,
            cursor: &mut cursor,
            config: &config,
            hasher: &DefaultKeyHasher,
            now: 0,
        };
        let entries: Vec<_> = (0..4u8)
            .map(|i| w.alloc_entry(1, 1).unwrap().fill(&[i], &[i], 0, 0).entry())
            .collect();

        let list = RecycleList::new(&region);
        assert!(list.front().unwrap().is_none());
        for e in &entries {
            list.push_back(*e).unwrap();
        }
        let order: Vec<_> = entries.iter().map(|e| e.offset()).collect();
        assert_eq!(list.verify(10).unwrap(), order);
        assert!(list.verify(2).is_err());

        // Middle, head and tail.
        list.remove(entries[1]).unwrap();
        list.remove(entries[0]).unwrap();
        list.remove(entries[3]).unwrap();
        assert_eq!(list.verify(10).unwrap(), vec![entries[2].offset()]);
        assert_eq!(list.front().unwrap().unwrap().offset(), entries[2].offset());
        assert!(list.remove(entries[0]).is_err());

        list.remove(entries[2]).unwrap();
        assert!(list.verify(10).unwrap().is_empty());
    }
}
