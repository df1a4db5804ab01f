//! The handle to one attached shared region.
//!
//! A [Region] resolves offsets stored in the region against the base
//! addresses this process mapped the segments at. It is created once per
//! cache handle and passed by reference into every operation. The first
//! process to attach formats the region under the write lock and publishes
//! the status flag last; every later process validates the header and adopts
//! the geometry its creator persisted.

use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::hash::KeyHasher;
use crate::layout::{
    mem_align, EntryHeader, EntryOffset, Geometry, MemoryInfo, StripingAllocator,
    ValueSegmentHeader, ENTRY_HEADER_SIZE, LAYOUT_VERSION, MAX_KEY_SIZE, MEMORY_INFO_SIZE,
    MEM_ALIGN, STATUS_NORMAL, STRIPING_ALLOCATOR_SIZE, VALUE_SEGMENT_HEADER_SIZE,
    VALUE_SEGMENT_MAGIC,
};
use crate::lock;
use crate::pool::{PoolCursor, RingPool};
use crate::segment::{SegmentMapping, SegmentProvider};
use std::marker::PhantomData;
use std::mem::align_of;
use std::ptr::{self, addr_of, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut i = 3;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// The smallest prime `>= n`.
pub(crate) fn next_prime(n: u64) -> u64 {
    let mut n = n.max(2);
    while !is_prime(n) {
        n += 1;
    }
    n
}

impl Geometry {
    /// Derive the layout of a new region.
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let segment_size = config.segment_size;
        let striping_size = mem_align(config.striping_size as usize) as u64;
        let stripings_per_segment =
            (segment_size - VALUE_SEGMENT_HEADER_SIZE as u64) / striping_size;
        let max_segments = config.max_memory / segment_size;
        let initial_segments = config
            .min_memory
            .div_ceil(segment_size)
            .clamp(1, max_segments);
        let max_stripings = max_segments * stripings_per_segment;
        if max_stripings >= u32::MAX as u64 {
            return Err(CacheError::InvalidConfig(format!(
                "{} stripings exceed the pool range",
                max_stripings
            )));
        }
        let capacity = next_prime(config.max_key_count as u64);
        if capacity > u32::MAX as u64 {
            return Err(CacheError::InvalidConfig(format!(
                "max_key_count {} is too large",
                config.max_key_count
            )));
        }

        let buckets_offset = mem_align(MEMORY_INFO_SIZE) as u64;
        let allocators_offset = buckets_offset + capacity * 8;
        let doing_offset = allocators_offset + max_stripings * STRIPING_ALLOCATOR_SIZE as u64;
        let pool_bytes = (max_stripings + 1) * 8;
        let done_offset = doing_offset + pool_bytes;
        let metadata_size = done_offset + pool_bytes;

        Ok(Geometry {
            segment_size,
            striping_size,
            max_key_count: config.max_key_count,
            capacity: capacity as u32,
            max_segments: max_segments as u32,
            initial_segments: initial_segments as u32,
            stripings_per_segment: stripings_per_segment as u32,
            max_stripings: max_stripings as u32,
            buckets_offset,
            allocators_offset,
            doing_offset,
            done_offset,
            metadata_size,
        })
    }

    /// Global index of striping `striping` of value segment `segment`.
    #[inline]
    pub(crate) fn striping_index(&self, segment: u32, striping: u32) -> usize {
        segment as usize * self.stripings_per_segment as usize + striping as usize
    }
}

/// An entry in a value segment, resolved for this process. Only valid until
/// its arena is reset; the reader must tolerate the bytes changing under it.
#[derive(Clone, Copy)]
pub(crate) struct EntryRef<'r> {
    offset: EntryOffset,
    ptr: NonNull<u8>,
    // Bytes from the entry start to the end of its segment.
    room: usize,
    _region: PhantomData<&'r Region>,
}

impl<'r> EntryRef<'r> {
    #[inline]
    pub(crate) fn offset(&self) -> EntryOffset {
        self.offset
    }

    #[inline]
    pub(crate) fn header(&self) -> &'r EntryHeader {
        // SAFETY: Region::entry checked the header is inside the segment and
        // aligned, and every bit pattern is a valid EntryHeader.
        unsafe { &*(self.ptr.as_ptr() as *const EntryHeader) }
    }

    /// Copy the key out. None if the stored length is out of bounds.
    pub(crate) fn read_key<'b>(&self, buf: &'b mut [u8; MAX_KEY_SIZE]) -> Option<&'b [u8]> {
        let len = self.header().key_len.load(Ordering::Relaxed) as usize;
        if len > MAX_KEY_SIZE || ENTRY_HEADER_SIZE + mem_align(len) > self.room {
            return None;
        }
        // SAFETY: In bounds as checked above, and 8 byte aligned like the
        // entry itself.
        unsafe { load_bytes(self.ptr.as_ptr().add(ENTRY_HEADER_SIZE), &mut buf[..len]) };
        Some(&buf[..len])
    }

    pub(crate) fn key_eq(&self, key: &[u8]) -> bool {
        let mut buf = [0u8; MAX_KEY_SIZE];
        self.read_key(&mut buf) == Some(key)
    }

    /// Copy the value out. None if the stored lengths are out of bounds.
    pub(crate) fn read_value(&self) -> Option<Vec<u8>> {
        let header = self.header();
        let key_len = header.key_len.load(Ordering::Relaxed) as usize;
        let value_len = header.value_len.load(Ordering::Relaxed) as usize;
        if key_len > MAX_KEY_SIZE {
            return None;
        }
        let start = ENTRY_HEADER_SIZE + mem_align(key_len);
        if start.checked_add(mem_align(value_len))? > self.room {
            return None;
        }
        let mut value = vec![0u8; value_len];
        // SAFETY: As in read_key.
        unsafe { load_bytes(self.ptr.as_ptr().add(start), &mut value) };
        Some(value)
    }

    /// Store key and value bytes after the header.
    ///
    /// # Safety
    ///
    /// Only the lock holder may call this, on storage it just allocated and
    /// sized for these lengths, before the entry is published.
    pub(crate) unsafe fn write_payload(&self, key: &[u8], value: &[u8]) {
        let payload = self.ptr.as_ptr().add(ENTRY_HEADER_SIZE);
        debug_assert!(
            ENTRY_HEADER_SIZE + mem_align(key.len()) + mem_align(value.len()) <= self.room
        );
        store_bytes(payload, key);
        store_bytes(payload.add(mem_align(key.len())), value);
    }
}

/// Fill `out` from shared memory with relaxed word loads.
///
/// # Safety
///
/// `src` must be 8 byte aligned and valid for `mem_align(out.len())` bytes.
unsafe fn load_bytes(src: *const u8, out: &mut [u8]) {
    let words = src as *const AtomicU64;
    for (i, chunk) in out.chunks_mut(MEM_ALIGN).enumerate() {
        let word = (*words.add(i)).load(Ordering::Relaxed).to_ne_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

/// Write `bytes` to shared memory with relaxed word stores, zero padding the
/// last word.
///
/// # Safety
///
/// `dst` must be 8 byte aligned and valid for `mem_align(bytes.len())` bytes.
unsafe fn store_bytes(dst: *mut u8, bytes: &[u8]) {
    let words = dst as *const AtomicU64;
    for (i, chunk) in bytes.chunks(MEM_ALIGN).enumerate() {
        let mut word = [0u8; MEM_ALIGN];
        word[..chunk.len()].copy_from_slice(chunk);
        (*words.add(i)).store(u64::from_ne_bytes(word), Ordering::Relaxed);
    }
}

/// A process-local view of an attached region.
pub(crate) struct Region {
    provider: Arc<dyn SegmentProvider>,
    meta: SegmentMapping,
    geometry: Geometry,
    // Base address of each value segment in this process, null until attached.
    values: Box<[AtomicPtr<u8>]>,
}

impl Region {
    /// Attach to the region `provider` holds, formatting it if this is the
    /// first attach.
    pub(crate) fn attach(
        provider: Arc<dyn SegmentProvider>,
        config: &Config,
        pid: u32,
        now: i64,
    ) -> Result<Region> {
        let wanted = Geometry::from_config(config)?;
        let meta = provider.metadata(wanted.metadata_size as usize)?;
        if meta.len() < MEMORY_INFO_SIZE {
            return Err(CacheError::Corrupted(format!(
                "metadata segment of {} bytes can not hold the header",
                meta.len()
            )));
        }
        if meta.base().as_ptr() as usize % align_of::<MemoryInfo>() != 0 {
            return Err(CacheError::Segment {
                index: None,
                cause: "metadata segment is misaligned".into(),
            });
        }

        let info = meta.base().as_ptr() as *mut MemoryInfo;
        // SAFETY: The header is in bounds and aligned. Only the atomics are
        // borrowed until the status flag says the header is formatted.
        let (status, word, lock_stats) = unsafe {
            (
                &*addr_of!((*info).status),
                &**addr_of!((*info).lock),
                &*addr_of!((*info).stats.lock),
            )
        };

        if status.load(Ordering::Acquire) != STATUS_NORMAL {
            let _guard = lock::acquire(word, lock_stats, &config.lock_policy, pid)?;
            if status.load(Ordering::Acquire) != STATUS_NORMAL {
                if meta.len() < wanted.metadata_size as usize {
                    return Err(CacheError::Segment {
                        index: None,
                        cause: format!(
                            "metadata segment is {} bytes, {} needed",
                            meta.len(),
                            wanted.metadata_size
                        ),
                    });
                }
                // SAFETY: We hold the lock and the region is unpublished, so
                // nothing else reads the plain header fields.
                unsafe { Self::format(info, &wanted, now) };
                let region = Region::new(provider, meta, wanted);
                region.format_atomics(now);
                for _ in 0..wanted.initial_segments {
                    region.create_value_segment()?;
                }
                status.store(STATUS_NORMAL, Ordering::Release);
                tracing::info!(
                    capacity = wanted.capacity,
                    max_segments = wanted.max_segments,
                    initial_segments = wanted.initial_segments,
                    stripings_per_segment = wanted.stripings_per_segment,
                    metadata_size = wanted.metadata_size,
                    "initialised shared region"
                );
                return Ok(region);
            }
        }

        // SAFETY: Formatted and published, the plain fields are now immutable.
        let info = unsafe { &*info };
        if info.size as usize != MEMORY_INFO_SIZE {
            return Err(CacheError::Corrupted(format!(
                "header size {} does not match {}",
                info.size, MEMORY_INFO_SIZE
            )));
        }
        if info.version != LAYOUT_VERSION {
            return Err(CacheError::Corrupted(format!(
                "layout version {} is not supported",
                info.version
            )));
        }
        let geometry = info.geometry;
        if geometry.metadata_size as usize > meta.len()
            || geometry.capacity == 0
            || geometry.max_segments == 0
            || geometry.stripings_per_segment == 0
        {
            return Err(CacheError::Corrupted("persisted geometry is invalid".into()));
        }
        let largest_entry =
            ENTRY_HEADER_SIZE + mem_align(MAX_KEY_SIZE) + mem_align(config.max_value_size as usize);
        if largest_entry as u64 > geometry.striping_size {
            return Err(CacheError::InvalidConfig(format!(
                "max_value_size {} does not fit the region's stripings of {} bytes",
                config.max_value_size, geometry.striping_size
            )));
        }
        if geometry != wanted {
            tracing::debug!(?geometry, "adopting the persisted region geometry");
        }
        tracing::debug!(
            segments = info.segment_count.load(Ordering::Acquire),
            count = info.hashtable.count.load(Ordering::Acquire),
            "attached to shared region"
        );
        Ok(Region::new(provider, meta, geometry))
    }

    fn new(provider: Arc<dyn SegmentProvider>, meta: SegmentMapping, geometry: Geometry) -> Self {
        let values = (0..geometry.max_segments)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Region {
            provider,
            meta,
            geometry,
            values,
        }
    }

    /// Write the plain header fields and zero the tables.
    unsafe fn format(info: *mut MemoryInfo, geometry: &Geometry, now: i64) {
        addr_of_mut!((*info).size).write(MEMORY_INFO_SIZE as u32);
        addr_of_mut!((*info).version).write(LAYOUT_VERSION);
        addr_of_mut!((*info).init_time).write(now);
        addr_of_mut!((*info).geometry).write(*geometry);
        let base = info as *mut u8;
        ptr::write_bytes(
            base.add(geometry.buckets_offset as usize),
            0,
            (geometry.metadata_size - geometry.buckets_offset) as usize,
        );
    }

    /// Reset the header atomics a failed earlier format may have left behind.
    fn format_atomics(&self, now: i64) {
        let info = self.info();
        info.segment_count.store(0, Ordering::Relaxed);
        info.striping_count.store(0, Ordering::Relaxed);
        info.hashtable.list_head.store(0, Ordering::Relaxed);
        info.hashtable.list_tail.store(0, Ordering::Relaxed);
        info.hashtable.count.store(0, Ordering::Relaxed);
        info.usage.reset();
        info.usage
            .used_common
            .store(self.geometry.metadata_size as i64, Ordering::Relaxed);
        info.stats.reset(now);
        self.doing_pool().init();
        self.done_pool().init();
    }

    #[inline]
    pub(crate) fn info(&self) -> &MemoryInfo {
        // SAFETY: Checked in attach: in bounds, aligned and formatted.
        unsafe { &*(self.meta.base().as_ptr() as *const MemoryInfo) }
    }

    #[inline]
    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// A slice of `len` items of `T` at `offset` in the metadata segment.
    #[inline]
    fn meta_slice<T>(&self, offset: u64, len: usize) -> &[T] {
        debug_assert!(offset as usize + len * std::mem::size_of::<T>() <= self.meta.len());
        // SAFETY: The geometry keeps every table inside the metadata segment,
        // 8 byte aligned, and all tables hold only atomics.
        unsafe {
            std::slice::from_raw_parts(
                self.meta.base().as_ptr().add(offset as usize) as *const T,
                len,
            )
        }
    }

    #[inline]
    pub(crate) fn buckets(&self) -> &[AtomicI64] {
        self.meta_slice(self.geometry.buckets_offset, self.geometry.capacity as usize)
    }

    #[inline]
    pub(crate) fn bucket(&self, hasher: &dyn KeyHasher, key: &[u8]) -> &AtomicI64 {
        let buckets = self.buckets();
        &buckets[hasher.hash(key) as usize % buckets.len()]
    }

    #[inline]
    pub(crate) fn allocators(&self) -> &[StripingAllocator] {
        self.meta_slice(
            self.geometry.allocators_offset,
            self.geometry.max_stripings as usize,
        )
    }

    pub(crate) fn doing_pool(&self) -> RingPool<'_> {
        let n = self.geometry.max_stripings as usize + 1;
        RingPool::new(
            &self.info().value_allocator.doing,
            self.meta_slice(self.geometry.doing_offset, n),
        )
    }

    pub(crate) fn done_pool(&self) -> RingPool<'_> {
        let n = self.geometry.max_stripings as usize + 1;
        RingPool::new(
            &self.info().value_allocator.done,
            self.meta_slice(self.geometry.done_offset, n),
        )
    }

    /// The pool value naming allocator `index`: its offset in the metadata
    /// segment.
    #[inline]
    pub(crate) fn allocator_ref(&self, index: usize) -> i64 {
        (self.geometry.allocators_offset + (index * STRIPING_ALLOCATOR_SIZE) as u64) as i64
    }

    /// Resolve a pool value to its allocator.
    pub(crate) fn allocator_by_ref(&self, value: i64) -> Option<&StripingAllocator> {
        let rel = value.checked_sub(self.geometry.allocators_offset as i64)?;
        if rel < 0 || rel as usize % STRIPING_ALLOCATOR_SIZE != 0 {
            return None;
        }
        self.allocators().get(rel as usize / STRIPING_ALLOCATOR_SIZE)
    }

    /// Base address of value segment `index`, attaching it on first use.
    pub(crate) fn segment_base(&self, index: u16) -> Result<NonNull<u8>> {
        let slot = self
            .values
            .get(index as usize)
            .ok_or_else(|| CacheError::Segment {
                index: Some(index),
                cause: "segment index out of range".into(),
            })?;
        if let Some(base) = NonNull::new(slot.load(Ordering::Acquire)) {
            return Ok(base);
        }
        if index as u32 >= self.info().segment_count.load(Ordering::Acquire) {
            return Err(CacheError::Segment {
                index: Some(index),
                cause: "segment was not created".into(),
            });
        }

        let mapping = self.provider.attach_value_segment(index)?;
        if (mapping.len() as u64) < self.geometry.segment_size {
            return Err(CacheError::Segment {
                index: Some(index),
                cause: format!("mapped {} bytes, expected {}", mapping.len(), self.geometry.segment_size),
            });
        }
        // SAFETY: The header was written before segment_count was published.
        let header = unsafe { &*(mapping.base().as_ptr() as *const ValueSegmentHeader) };
        if header.magic != VALUE_SEGMENT_MAGIC || header.index != index as u32 {
            return Err(CacheError::Corrupted(format!(
                "value segment {} has a bad header",
                index
            )));
        }
        slot.store(mapping.base().as_ptr(), Ordering::Release);
        tracing::debug!(index, "attached value segment");
        Ok(mapping.base())
    }

    /// Create the next value segment and put all its stripings in the doing
    /// pool. Lock holder only.
    pub(crate) fn create_value_segment(&self) -> Result<u16> {
        let info = self.info();
        let g = &self.geometry;
        let index = info.segment_count.load(Ordering::Relaxed);
        if index >= g.max_segments {
            return Err(CacheError::Segment {
                index: None,
                cause: format!("segment limit {} reached", g.max_segments),
            });
        }
        let index16 = index as u16;
        let mapping = self
            .provider
            .create_value_segment(index16, g.segment_size as usize)?;
        if (mapping.len() as u64) < g.segment_size {
            return Err(CacheError::Segment {
                index: Some(index16),
                cause: format!("mapped {} bytes, expected {}", mapping.len(), g.segment_size),
            });
        }
        // SAFETY: A new segment nobody else has seen yet.
        unsafe {
            ptr::write(
                mapping.base().as_ptr() as *mut ValueSegmentHeader,
                ValueSegmentHeader {
                    magic: VALUE_SEGMENT_MAGIC,
                    index,
                    stripings: g.stripings_per_segment,
                    _pad: [0; 48],
                },
            );
        }
        self.values[index as usize].store(mapping.base().as_ptr(), Ordering::Release);

        let doing = self.doing_pool();
        for striping in 0..g.stripings_per_segment {
            let gi = g.striping_index(index, striping);
            let base = VALUE_SEGMENT_HEADER_SIZE as u64 + striping as u64 * g.striping_size;
            self.allocators()[gi].init(index, striping, base as i64, g.striping_size as i64);
            if !doing.push(self.allocator_ref(gi)) {
                tracing::error!(index, striping, "doing pool is full");
                return Err(CacheError::InternalInconsistency(
                    "doing pool is full".into(),
                ));
            }
        }
        info.striping_count
            .fetch_add(g.stripings_per_segment, Ordering::Relaxed);
        info.usage
            .alloced
            .fetch_add(g.segment_size as i64, Ordering::Relaxed);
        info.segment_count.store(index + 1, Ordering::Release);
        tracing::info!(
            index,
            stripings = g.stripings_per_segment,
            size = g.segment_size,
            "created value segment"
        );
        Ok(index16)
    }

    /// Resolve an entry offset. None when the offset is null, outside its
    /// segment or the segment can not be attached.
    pub(crate) fn entry(&self, off: EntryOffset) -> Option<EntryRef<'_>> {
        if off.is_null() {
            return None;
        }
        let offset = off.offset();
        let size = self.geometry.segment_size as usize;
        if offset < VALUE_SEGMENT_HEADER_SIZE
            || offset % MEM_ALIGN != 0
            || offset + ENTRY_HEADER_SIZE > size
        {
            return None;
        }
        let base = self.segment_base(off.segment()).ok()?;
        // SAFETY: In bounds of the segment mapping checked above.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
        Some(EntryRef {
            offset: off,
            ptr,
            room: size - offset,
            _region: PhantomData,
        })
    }

    /// Resolve an offset the writer followed from the region's own links.
    pub(crate) fn entry_linked(&self, off: EntryOffset) -> Result<EntryRef<'_>> {
        self.entry(off).ok_or_else(|| {
            tracing::error!(offset = off.raw(), "broken link in shared region");
            CacheError::Corrupted(format!("broken link to offset {:#x}", off.raw()))
        })
    }
}

/// Everything a structural write needs. Only a write transaction, which holds
/// the region lock, can build one.
pub(crate) struct RegionWriter<'a> {
    pub(crate) region: &'a Region,
    pub(crate) cursor: &'a mut PoolCursor,
    pub(crate) config: &'a Config,
    pub(crate) hasher: &'a dyn KeyHasher,
    pub(crate) now: i64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{next_prime, Region, RegionWriter};
    use crate::config::Config;
    use crate::error::CacheError;
    use crate::hash::DefaultKeyHasher;
    use crate::layout::{Geometry, LAYOUT_VERSION, MAX_KEY_SIZE, POOL_DOING};
    use crate::pool::PoolCursor;
    use crate::segment::{HeapSegments, SegmentProvider};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    pub(crate) fn small_config() -> Config {
        Config {
            min_memory: 0,
            max_memory: 4 * 4096,
            segment_size: 4096,
            striping_size: 1024,
            max_key_count: 100,
            max_value_size: 512,
            ..Default::default()
        }
    }

    #[test]
    fn test_next_prime() {
        assert_eq!(next_prime(0), 2);
        assert_eq!(next_prime(2), 2);
        assert_eq!(next_prime(4), 5);
        assert_eq!(next_prime(100), 101);
        assert_eq!(next_prime(1_000_000), 1_000_003);
    }

    #[test]
    fn test_geometry_from_config() {
        let g = Geometry::from_config(&small_config()).unwrap();
        assert_eq!(g.capacity, 101);
        assert_eq!(g.max_segments, 4);
        assert_eq!(g.initial_segments, 1);
        // The segment header takes the room of the last striping.
        assert_eq!(g.stripings_per_segment, 3);
        assert_eq!(g.max_stripings, 12);
        assert!(g.buckets_offset < g.allocators_offset);
        assert!(g.allocators_offset < g.doing_offset);
        assert!(g.doing_offset < g.done_offset);
        assert_eq!(g.metadata_size - g.done_offset, 13 * 8);

        let config = Config {
            min_memory: 3 * 4096 + 1,
            ..small_config()
        };
        assert_eq!(Geometry::from_config(&config).unwrap().initial_segments, 4);
    }

    #[test]
    fn test_region_format_and_attach() {
        let _ = tracing_subscriber::fmt::try_init();
        let heap = Arc::new(HeapSegments::new());
        let provider: Arc<dyn SegmentProvider> = heap.clone();
        let config = small_config();

        let a = Region::attach(provider.clone(), &config, 1, 100).unwrap();
        assert_eq!(a.info().version, LAYOUT_VERSION);
        assert_eq!(a.info().init_time, 100);
        assert_eq!(a.info().segment_count.load(Ordering::Acquire), 1);
        assert_eq!(a.info().striping_count.load(Ordering::Acquire), 3);
        assert_eq!(a.doing_pool().len(), 3);
        assert!(a.done_pool().is_empty());
        for v in a.doing_pool().iter() {
            let alloc = a.allocator_by_ref(v).unwrap();
            assert_eq!(alloc.in_which_pool.load(Ordering::Relaxed), POOL_DOING);
        }

        // A second attach adopts the persisted geometry, whatever it asks for.
        let other = Config {
            max_key_count: 5000,
            ..small_config()
        };
        let b = Region::attach(provider.clone(), &other, 1, 200).unwrap();
        assert_eq!(b.geometry(), a.geometry());
        assert_eq!(b.info().init_time, 100);

        // Segments created through one handle resolve through the other.
        a.create_value_segment().unwrap();
        assert!(b.segment_base(1).is_ok());
        assert_eq!(b.doing_pool().len(), 6);
        assert!(b.segment_base(2).is_err());
        assert_eq!(heap.value_segment_count(), 2);
    }

    #[test]
    fn test_region_rejects_bad_header() {
        let heap = Arc::new(HeapSegments::new());
        let provider: Arc<dyn SegmentProvider> = heap;
        let region = Region::attach(provider.clone(), &small_config(), 1, 0).unwrap();
        let info = region.meta.base().as_ptr() as *mut crate::layout::MemoryInfo;
        unsafe { std::ptr::addr_of_mut!((*info).version).write(LAYOUT_VERSION + 1) };
        assert!(matches!(
            Region::attach(provider, &small_config(), 1, 0),
            Err(CacheError::Corrupted(_))
        ));
    }

    #[test]
    fn test_region_segment_limit() {
        let provider: Arc<dyn SegmentProvider> = Arc::new(HeapSegments::new());
        let region = Region::attach(provider, &small_config(), 1, 0).unwrap();
        for _ in 1..4 {
            region.create_value_segment().unwrap();
        }
        assert!(matches!(
            region.create_value_segment(),
            Err(CacheError::Segment { .. })
        ));
        assert_eq!(region.doing_pool().len(), 12);
    }

    #[test]
    fn test_entry_payload_odd_lengths() {
        let config = small_config();
        let provider: Arc<dyn SegmentProvider> = Arc::new(HeapSegments::new());
        let region = Region::attach(provider, &config, 1, 0).unwrap();
        let mut cursor = PoolCursor::default();
        let mut w = RegionWriter {
            region: &region,
            cursor: &mut cursor,
            config: &config,
            hasher: &DefaultKeyHasher,
            now: 0,
        };

        let key = b"thirteen-byte";
        let built = w.alloc_entry(key.len(), 1).unwrap().fill(key, b"z", 0, 0);
        let entry = built.entry();
        let mut buf = [0u8; MAX_KEY_SIZE];
        assert_eq!(entry.read_key(&mut buf), Some(&key[..]));
        assert!(entry.key_eq(key));
        assert!(!entry.key_eq(b"thirteen-byt"));
        assert_eq!(entry.read_value().unwrap(), b"z".to_vec());

        // A length that runs past the segment is refused, not read.
        entry.header().value_len.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(entry.read_value(), None);
        entry.header().key_len.store(MAX_KEY_SIZE as u32 + 1, Ordering::Relaxed);
        assert_eq!(entry.read_key(&mut buf), None);
    }
}
