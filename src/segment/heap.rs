//! Segments on the process heap.
//!
//! Only one process can see these, but any number of [ShmCache](crate::ShmCache)
//! handles in that process can attach to the same `Arc<HeapSegments>`, each
//! with its own view, exactly as separate processes would.

use super::{SegmentMapping, SegmentProvider};
use crate::error::{CacheError, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

// Page aligned, like a real mapping.
const SEGMENT_ALIGN: usize = 4096;

struct HeapBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The block is only freed on drop, and is otherwise a plain address
// range handed out through SegmentMapping.
unsafe impl Send for HeapBlock {}

impl HeapBlock {
    fn new(index: Option<u16>, size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), SEGMENT_ALIGN).map_err(|e| {
            CacheError::Segment {
                index,
                cause: e.to_string(),
            }
        })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| CacheError::Segment {
            index,
            cause: format!("unable to allocate {} bytes", size),
        })?;
        Ok(HeapBlock { ptr, layout })
    }

    fn mapping(&self) -> SegmentMapping {
        unsafe { SegmentMapping::new(self.ptr, self.layout.size()) }
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Default)]
struct HeapInner {
    metadata: Option<HeapBlock>,
    values: Vec<Option<HeapBlock>>,
}

/// A region backed by zeroed heap allocations.
#[derive(Default)]
pub struct HeapSegments {
    inner: Mutex<HeapInner>,
}

impl HeapSegments {
    /// Create an empty provider. Segments are allocated on demand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of value segments allocated so far.
    pub fn value_segment_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.values.iter().filter(|b| b.is_some()).count()
    }
}

impl SegmentProvider for HeapSegments {
    fn metadata(&self, size: usize) -> Result<SegmentMapping> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.metadata.is_none() {
            inner.metadata = Some(HeapBlock::new(None, size)?);
        }
        match &inner.metadata {
            Some(block) => Ok(block.mapping()),
            None => Err(CacheError::Segment {
                index: None,
                cause: "metadata segment missing".into(),
            }),
        }
    }

    fn create_value_segment(&self, index: u16, size: usize) -> Result<SegmentMapping> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = index as usize;
        if inner.values.len() <= slot {
            inner.values.resize_with(slot + 1, || None);
        }
        let block = HeapBlock::new(Some(index), size)?;
        let mapping = block.mapping();
        // A block left by a writer that died before publishing the segment is
        // replaced.
        inner.values[slot] = Some(block);
        Ok(mapping)
    }

    fn attach_value_segment(&self, index: u16) -> Result<SegmentMapping> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .values
            .get(index as usize)
            .and_then(|b| b.as_ref())
            .map(|b| b.mapping())
            .ok_or(CacheError::Segment {
                index: Some(index),
                cause: "segment does not exist".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::HeapSegments;
    use crate::segment::SegmentProvider;

    #[test]
    fn test_heap_segments_zeroed_and_stable() {
        let heap = HeapSegments::new();
        let meta = heap.metadata(4096).unwrap();
        assert_eq!(meta.len(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts(meta.base().as_ptr(), meta.len()) };
        assert!(bytes.iter().all(|b| *b == 0));

        // A second request returns the same segment.
        let again = heap.metadata(8192).unwrap();
        assert_eq!(again.base(), meta.base());
        assert_eq!(again.len(), 4096);

        assert!(heap.attach_value_segment(0).is_err());
        let seg = heap.create_value_segment(0, 1024).unwrap();
        let attached = heap.attach_value_segment(0).unwrap();
        assert_eq!(seg.base(), attached.base());
        assert_eq!(heap.value_segment_count(), 1);
    }
}
