//! FIFO eviction.
//!
//! Recycling removes the oldest entries from the head of the recycle list,
//! expired or not. With a positive count it stops after that many entries,
//! otherwise it stops as soon as one arena has become empty, since entries
//! allocated together tend to be evicted together.

use crate::error::{CacheError, Result};
use crate::hashtable::is_live;
use crate::layout::{RecycleCounter, MAX_KEY_SIZE};
use crate::list::RecycleList;
use crate::region::RegionWriter;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

impl RegionWriter<'_> {
    /// Evict `once` entries, or until an arena is empty when `once <= 0`.
    pub(crate) fn recycle(&mut self, once: i32, counter: &RecycleCounter) -> Result<()> {
        let region = self.region;
        let started = Instant::now();
        let mut cleared: i64 = 0;
        let mut valid: i64 = 0;
        let mut emptied = false;

        let result = loop {
            if once > 0 && cleared >= once as i64 {
                break Ok(());
            }
            if once <= 0 && emptied {
                break Ok(());
            }

            let entry = match RecycleList::new(region).front() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    tracing::error!(cleared, once, "recycle list exhausted");
                    break Err(CacheError::OutOfMemory { size: 0 });
                }
                Err(e) => break Err(e),
            };
            let mut buf = [0u8; MAX_KEY_SIZE];
            let Some(key) = entry.read_key(&mut buf) else {
                tracing::error!(offset = entry.offset().raw(), "recycled entry has a bad key");
                break Err(CacheError::Corrupted("recycled entry has a bad key".into()));
            };
            if is_live(entry.header().expires.load(Ordering::Relaxed), self.now) {
                valid += 1;
            }

            emptied |= match self.delete_entry(key, entry) {
                Ok(emptied) => emptied,
                Err(CacheError::NotFound) => {
                    tracing::error!(
                        offset = entry.offset().raw(),
                        key = ?String::from_utf8_lossy(key),
                        "recycled entry is not in the hash table"
                    );
                    match self.retire(entry) {
                        Ok(emptied) => emptied,
                        Err(e) => break Err(e),
                    }
                }
                Err(e) => break Err(e),
            };
            cleared += 1;
        };

        let stats = &region.info().stats;
        stats
            .clear_ht_entry_total
            .fetch_add(cleared, Ordering::Relaxed);
        stats
            .clear_ht_entry_valid
            .fetch_add(valid, Ordering::Relaxed);
        counter.total.fetch_add(1, Ordering::Relaxed);
        counter.last_recycle_time.store(self.now, Ordering::Relaxed);
        result?;

        counter.success.fetch_add(1, Ordering::Relaxed);
        if once <= 0 {
            tracing::info!(
                cleared,
                valid,
                elapsed_us = started.elapsed().as_micros() as u64,
                "recycled a striping"
            );
        } else {
            tracing::debug!(cleared, valid, "recycled keys");
        }
        if valid > 0 {
            counter.force.fetch_add(1, Ordering::Relaxed);
            let pause = self.config.va_policy.sleep_us_when_recycle_valid_entries;
            if pause > 0 {
                std::thread::sleep(Duration::from_micros(pause));
            }
        }
        Ok(())
    }
}
