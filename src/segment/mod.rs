//! Segment providers create and attach the memory a region lives in.
//!
//! A region is one metadata segment plus up to `max_segments` value segments.
//! The provider decides what backs them (process heap, files, System V shared
//! memory ...); the cache only ever sees base addresses and lengths, and
//! stores offsets relative to them.

mod heap;
#[cfg(feature = "mmap")]
mod mmap;

pub use self::heap::HeapSegments;
#[cfg(feature = "mmap")]
pub use self::mmap::MmapSegments;

use crate::error::Result;
use std::ptr::NonNull;
use std::sync::Arc;

/// The base address and length of one mapped segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentMapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: A mapping is an address range shared by design, all access to it
// goes through atomics or the single writer.
unsafe impl Send for SegmentMapping {}
unsafe impl Sync for SegmentMapping {}

impl SegmentMapping {
    /// Describe a mapped segment.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to at least 8 bytes and valid for reads and
    /// writes of `len` bytes for as long as the provider that returned it is
    /// alive. A freshly created segment must be zero filled.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        debug_assert!(base.as_ptr() as usize % 8 == 0);
        SegmentMapping { base, len }
    }

    /// Base address in this process.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Creates and attaches the segments of a region.
pub trait SegmentProvider: Send + Sync {
    /// Map the metadata segment, creating it zero filled with `size` bytes if
    /// it does not exist. An existing segment is returned at its own length,
    /// which may differ from `size`.
    fn metadata(&self, size: usize) -> Result<SegmentMapping>;

    /// Create value segment `index`, zero filled with `size` bytes.
    fn create_value_segment(&self, index: u16, size: usize) -> Result<SegmentMapping>;

    /// Attach value segment `index`, which some process created earlier.
    fn attach_value_segment(&self, index: u16) -> Result<SegmentMapping>;
}

impl<P> SegmentProvider for Arc<P>
where
    P: SegmentProvider + ?Sized,
{
    fn metadata(&self, size: usize) -> Result<SegmentMapping> {
        (**self).metadata(size)
    }

    fn create_value_segment(&self, index: u16, size: usize) -> Result<SegmentMapping> {
        (**self).create_value_segment(index, size)
    }

    fn attach_value_segment(&self, index: u16) -> Result<SegmentMapping> {
        (**self).attach_value_segment(index)
    }
}
