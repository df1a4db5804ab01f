//! Ring object pool - a fixed capacity circular queue of arena offsets.
//!
//! The value allocator keeps two of these in the region: arenas that can still
//! allocate ("doing") and arenas that are exhausted ("done"). The queue head
//! and tail live in the region header, the slots in the metadata segment. A
//! scan cursor is process local, so each attached process walks the pool
//! independently.

use crate::layout::RingQueue;
use std::sync::atomic::{AtomicI64, Ordering};

/// A process-local scan position into a [RingPool].
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PoolCursor(u32);

// Cursor position once a scan ran past the tail. Never a slot index since
// capacity stays below u32::MAX.
const SCAN_DONE: u32 = u32::MAX;

/// A view of one pool in the region. Only the lock holder mutates it.
pub(crate) struct RingPool<'r> {
    queue: &'r RingQueue,
    slots: &'r [AtomicI64],
}

impl<'r> RingPool<'r> {
    pub(crate) fn new(queue: &'r RingQueue, slots: &'r [AtomicI64]) -> Self {
        RingPool { queue, slots }
    }

    /// Set the capacity and empty the pool. Capacity must be the slot count.
    pub(crate) fn init(&self) {
        debug_assert!(self.slots.len() >= 2);
        self.queue
            .capacity
            .store(self.slots.len() as u32, Ordering::Relaxed);
        self.clear();
    }

    pub(crate) fn clear(&self) {
        self.queue.head.store(0, Ordering::Relaxed);
        self.queue.tail.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn cap(&self) -> u32 {
        // One slot is always left open to tell full from empty.
        self.queue.capacity.load(Ordering::Relaxed)
    }

    #[inline]
    fn head(&self) -> u32 {
        self.queue.head.load(Ordering::Relaxed)
    }

    #[inline]
    fn tail(&self) -> u32 {
        self.queue.tail.load(Ordering::Relaxed)
    }

    #[inline]
    fn slot(&self, idx: u32) -> &AtomicI64 {
        &self.slots[idx as usize]
    }

    pub(crate) fn len(&self) -> usize {
        let cap = self.cap();
        if cap == 0 {
            return 0;
        }
        ((self.tail() + cap - self.head()) % cap) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    /// Append to the tail. False if the pool is full.
    pub(crate) fn push(&self, value: i64) -> bool {
        let cap = self.cap();
        let tail = self.tail();
        let next = (tail + 1) % cap;
        if next == self.head() {
            return false;
        }
        self.slot(tail).store(value, Ordering::Relaxed);
        self.queue.tail.store(next, Ordering::Relaxed);
        true
    }

    /// The head element, without removing it.
    pub(crate) fn peek_first(&self) -> Option<i64> {
        if self.is_empty() {
            None
        } else {
            Some(self.slot(self.head()).load(Ordering::Relaxed))
        }
    }

    /// Start a scan: position `cursor` on the head and return it.
    pub(crate) fn first(&self, cursor: &mut PoolCursor) -> Option<i64> {
        cursor.0 = self.head();
        self.peek_first()
    }

    /// Advance `cursor` and return the element there.
    pub(crate) fn next(&self, cursor: &mut PoolCursor) -> Option<i64> {
        if cursor.0 == SCAN_DONE {
            return None;
        }
        let cap = self.cap();
        let head = self.head();
        let len = self.len() as u32;
        let rel = (cursor.0 + cap - head) % cap;
        // A cursor left on a slot just released from the head sits one
        // position before it.
        let next_rel = if rel == cap - 1 { 0 } else { rel + 1 };
        if next_rel >= len {
            cursor.0 = SCAN_DONE;
            None
        } else {
            cursor.0 = (head + next_rel) % cap;
            Some(self.slot(cursor.0).load(Ordering::Relaxed))
        }
    }

    /// Remove and return the head element.
    pub(crate) fn remove_first(&self) -> Option<i64> {
        let value = self.peek_first()?;
        let head = self.head();
        self.queue
            .head
            .store((head + 1) % self.cap(), Ordering::Relaxed);
        Some(value)
    }

    /// Remove `value` wherever it is. Elements before it move one slot toward
    /// the tail, so a scan cursor on the removed slot continues with the
    /// element that followed it.
    pub(crate) fn remove_by(&self, value: i64) -> bool {
        let cap = self.cap();
        let head = self.head();
        let len = self.len() as u32;
        let found = (0..len).find(|rel| self.slot((head + rel) % cap).load(Ordering::Relaxed) == value);
        let Some(rel) = found else {
            return false;
        };
        for k in (1..=rel).rev() {
            let prev = self.slot((head + k - 1) % cap).load(Ordering::Relaxed);
            self.slot((head + k) % cap).store(prev, Ordering::Relaxed);
        }
        self.queue.head.store((head + 1) % cap, Ordering::Relaxed);
        true
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        let cap = self.cap();
        let head = self.head();
        (0..self.len() as u32).map(move |rel| self.slot((head + rel) % cap).load(Ordering::Relaxed))
    }
}
