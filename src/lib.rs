//! Shmcache - a key value cache shared between processes
//!
//! All state lives in a region of shared memory: one metadata segment holding
//! the hash table, the arena table and the statistics, plus up to
//! `max_segments` value segments holding the entries themselves. Any number of
//! processes can attach to the same region.
//!
//! Readers never take a lock. Each entry is built completely before a single
//! release store links it into its hash chain, and removed entries keep their
//! storage and links until their whole arena is reset, so a reader walking a
//! chain always sees either the old or the new state.
//!
//! Writers are serialised by a process id lock word in the region. A writer
//! that dies or stalls while holding it is detected and the lock taken over.
//!
//! When the key limit or the value memory is exhausted, the oldest entries are
//! evicted in insertion order.
//!
//! # Features
//!
//! * `mmap` - file backed regions through [MmapSegments]
//! * `foldhash` - the default key hash
//! * `ahash` - use ahash for the default key hash instead
//! * `serde` - serialise configuration and statistics
//!
//! `mmap` and `foldhash` are enabled by default.

#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod segment;
pub mod stats;

// The region layout and the algorithms over it.
mod hashtable;
mod layout;
mod list;
mod lock;
mod pool;
mod recycle;
mod region;
mod striping;
mod value_allocator;

pub use crate::cache::{CacheValue, ShmCache, ShmCacheBuilder, WriteTxn};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{Config, LockPolicy, ValueAllocatorPolicy};
pub use crate::error::{CacheError, Result};
pub use crate::hash::{fnv1a, DefaultKeyHasher, KeyHasher};
pub use crate::layout::{
    MAX_KEY_SIZE, NEVER_EXPIRED, OPTIONS_INTEGER, OPTIONS_NONE, OPTIONS_STRING,
};
#[cfg(feature = "mmap")]
pub use crate::segment::MmapSegments;
pub use crate::segment::{HeapSegments, SegmentMapping, SegmentProvider};
pub use crate::stats::{CacheStats, LockStats, MemoryStats, OpStats, RecycleStats};
