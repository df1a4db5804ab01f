//! `#[repr(C)]` structures that live in the shared region.
//!
//! Nothing here holds a native pointer. Every link is a byte offset resolved
//! against the base address the current process mapped the segment at.
//! Mutable fields are atomics so a reader in another process (or thread) and
//! the single writer never race on a plain memory location; fields only the
//! lock holder touches use `Relaxed`, links that publish data to readers use
//! `Release`/`Acquire`. Key and value bytes are copied in and out with relaxed
//! 8 byte atomic accesses for the same reason: a reader still walking a
//! recycled entry may see a torn payload, which it reports as a miss or stale
//! bytes, but never races.
//!
//! ```text
//! metadata segment
//! +------------+----------+-------------------+------------+-----------+
//! | MemoryInfo | buckets  | StripingAllocator | doing pool | done pool |
//! |            | [i64; c] | [_; max_stripings]| [i64; n+1] | [i64; n+1]|
//! +------------+----------+-------------------+------------+-----------+
//!
//! value segment
//! +--------------------+-----------+-----------+-----+
//! | ValueSegmentHeader | striping0 | striping1 | ... |
//! +--------------------+-----------+-----------+-----+
//! ```

use crossbeam_utils::CachePadded;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64};

/// The maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 64;

/// The expiry of an entry that never expires.
pub const NEVER_EXPIRED: i64 = 0;

/// Value options tag for plain string values.
pub const OPTIONS_STRING: u32 = 0;
/// Value options tag for decimal integers, as written by `incr`.
pub const OPTIONS_INTEGER: u32 = 1;
/// Value options tag for values the application did not serialise.
pub const OPTIONS_NONE: u32 = 0x100;

pub(crate) const STATUS_NORMAL: u32 = 0x1234_5678;
pub(crate) const LAYOUT_VERSION: u32 = 1;

pub(crate) const MEM_ALIGN: usize = 8;

pub(crate) const VALUE_SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"SHMCVSEG");
pub(crate) const VALUE_SEGMENT_HEADER_SIZE: usize = 64;

pub(crate) const ENTRY_HEADER_SIZE: usize = size_of::<EntryHeader>();

pub(crate) const POOL_DOING: u32 = 0;
pub(crate) const POOL_DONE: u32 = 1;

const OFFSET_BITS: u32 = 48;
const OFFSET_MASK: i64 = (1 << OFFSET_BITS) - 1;

#[inline]
pub(crate) const fn mem_align(n: usize) -> usize {
    (n + MEM_ALIGN - 1) & !(MEM_ALIGN - 1)
}

/// The location of an entry: value segment index in the high bits, byte
/// offset inside that segment in the low 48 bits. A non-owning handle, only
/// meaningful until the arena holding it is reset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub(crate) struct EntryOffset(i64);

impl EntryOffset {
    pub(crate) const NULL: EntryOffset = EntryOffset(0);

    #[inline]
    pub(crate) fn new(segment: u16, offset: usize) -> Self {
        debug_assert!(segment <= 0x7FFF);
        debug_assert!(offset as i64 & !OFFSET_MASK == 0);
        EntryOffset(((segment as i64) << OFFSET_BITS) | offset as i64)
    }

    #[inline]
    pub(crate) fn from_raw(raw: i64) -> Self {
        EntryOffset(raw)
    }

    #[inline]
    pub(crate) fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub(crate) fn is_null(self) -> bool {
        self.0 <= 0
    }

    #[inline]
    pub(crate) fn segment(self) -> u16 {
        (self.0 >> OFFSET_BITS) as u16
    }

    #[inline]
    pub(crate) fn offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }
}

/// Header of every entry. Followed by the key bytes and then the value bytes,
/// each padded to [MEM_ALIGN].
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct EntryHeader {
    // Recycle list, writer only. Must be first.
    pub prev: AtomicI64,
    pub next: AtomicI64,

    pub key_len: AtomicU32,
    pub value_len: AtomicU32,
    pub expires: AtomicI64,
    pub options: AtomicU32,

    // Allocation metadata.
    pub alloc_size: AtomicU32,
    pub segment: AtomicU32,
    pub striping: AtomicU32,
    pub generation: AtomicU32,
    pub _pad: u32,
    pub offset: AtomicI64,

    // Hash chain successor.
    pub ht_next: AtomicI64,
}

const _: () = assert!(ENTRY_HEADER_SIZE % MEM_ALIGN == 0);
const _: () = assert!(align_of::<EntryHeader>() <= MEM_ALIGN);

/// One arena of a value segment.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct StripingAllocator {
    pub last_alloc_time: AtomicI64,
    pub fail_times: AtomicU32,
    pub in_which_pool: AtomicU32,
    pub segment: AtomicU32,
    pub striping: AtomicU32,
    pub generation: AtomicU32,
    pub _pad: u32,
    pub total: AtomicI64,
    pub used: AtomicI64,
    pub base: AtomicI64,
    pub free: AtomicI64,
    pub end: AtomicI64,
}

pub(crate) const STRIPING_ALLOCATOR_SIZE: usize = size_of::<StripingAllocator>();

/// Head and tail of a ring of arena offsets. The slots live in the metadata
/// segment at the offset recorded in [Geometry].
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct RingQueue {
    pub capacity: AtomicU32,
    pub head: AtomicU32,
    pub tail: AtomicU32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct ValueAllocatorInfo {
    pub doing: RingQueue,
    pub done: RingQueue,
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Counter {
    pub total: AtomicI64,
    pub success: AtomicI64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct RecycleCounter {
    pub total: AtomicI64,
    pub success: AtomicI64,
    pub force: AtomicI64,
    pub last_recycle_time: AtomicI64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct LockCounter {
    pub total: AtomicI64,
    pub retry: AtomicI64,
    pub detect_deadlock: AtomicI64,
    pub unlock_deadlock: AtomicI64,
    pub last_detect_deadlock_time: AtomicI64,
    pub last_unlock_deadlock_time: AtomicI64,
}

/// Running statistics. Readers bump the `get` counters without the lock.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct ShmStats {
    pub set: Counter,
    pub get: Counter,
    pub del: Counter,
    pub incr: Counter,
    pub last_clear_time: AtomicI64,

    pub clear_ht_entry_total: AtomicI64,
    pub clear_ht_entry_valid: AtomicI64,
    pub recycle_key: RecycleCounter,
    pub recycle_striping: RecycleCounter,

    pub lock: LockCounter,

    // Snapshot for hit ratio calculation.
    pub last_get: Counter,
    pub last_calc_time: AtomicI64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct MemoryUsage {
    pub alloced: AtomicI64,
    pub used_common: AtomicI64,
    pub used_entry: AtomicI64,
    pub used_key: AtomicI64,
    pub used_value: AtomicI64,
}

/// The cross-process lock word.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct LockWord {
    /// Holder pid in the high half, acquisition ticket in the low half. 0
    /// when free.
    pub owner: AtomicU64,
    /// Ticket of the stamping holder in the high half, low 32 bits of its
    /// acquisition time in unix milliseconds in the low half.
    pub stamp: AtomicU64,
    pub next_ticket: AtomicU32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct HashTableHeader {
    /// Oldest entry of the recycle list.
    pub list_head: AtomicI64,
    /// Newest entry of the recycle list.
    pub list_tail: AtomicI64,
    pub count: AtomicU32,
    pub _pad: u32,
}

/// Sizes and offsets fixed when the region is created. Written once before
/// the status flag is published and never modified afterwards.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub segment_size: u64,
    pub striping_size: u64,
    pub max_key_count: u32,
    pub capacity: u32,
    pub max_segments: u32,
    pub initial_segments: u32,
    pub stripings_per_segment: u32,
    pub max_stripings: u32,
    pub buckets_offset: u64,
    pub allocators_offset: u64,
    pub doing_offset: u64,
    pub done_offset: u64,
    pub metadata_size: u64,
}

/// The header at offset 0 of the metadata segment.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct MemoryInfo {
    pub size: u32,
    pub status: AtomicU32,
    pub version: u32,
    pub _pad: u32,
    pub init_time: i64,
    pub geometry: Geometry,
    pub lock: CachePadded<LockWord>,
    pub segment_count: AtomicU32,
    pub striping_count: AtomicU32,
    pub value_allocator: ValueAllocatorInfo,
    pub stats: ShmStats,
    pub usage: MemoryUsage,
    pub hashtable: HashTableHeader,
}

pub(crate) const MEMORY_INFO_SIZE: usize = size_of::<MemoryInfo>();

/// Header at offset 0 of every value segment.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct ValueSegmentHeader {
    pub magic: u64,
    pub index: u32,
    pub stripings: u32,
    pub _pad: [u8; 48],
}

const _: () = assert!(size_of::<ValueSegmentHeader>() == VALUE_SEGMENT_HEADER_SIZE);
