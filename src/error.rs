//! Error types returned by the cache.

use crate::cache::CacheValue;

/// The result type of every fallible cache operation.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors returned by [ShmCache](crate::ShmCache) and its write transactions.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key is longer than [MAX_KEY_SIZE](crate::MAX_KEY_SIZE).
    #[error("key length {len} exceeds {max}")]
    KeyTooLong {
        /// Length of the rejected key.
        len: usize,
        /// Maximum key length.
        max: usize,
    },

    /// The value is longer than the configured maximum value size.
    #[error("value length {len} exceeds {max}")]
    ValueTooLong {
        /// Length of the rejected value.
        len: usize,
        /// Configured maximum value length.
        max: usize,
    },

    /// No entry exists for the key.
    #[error("key not found")]
    NotFound,

    /// The entry exists but is past its expiry. The stale value is carried so
    /// callers may still use it.
    #[error("key expired")]
    Expired(CacheValue),

    /// Allocation failed after recycling and segment growth were attempted.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Bytes requested for the entry, header included.
        size: usize,
    },

    /// Pool or arena bookkeeping does not match what the operation expected.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// The cross-process lock could not be acquired in time.
    #[error("timed out after {waited_ms} ms waiting for the cache lock")]
    LockTimeout {
        /// Milliseconds spent waiting.
        waited_ms: u64,
    },

    /// The configuration can not describe a usable region.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An attached region failed validation.
    #[error("corrupted shared region: {0}")]
    Corrupted(String),

    /// The segment provider failed to create or attach a segment.
    #[error("segment {index:?}: {cause}")]
    Segment {
        /// Value segment index, or `None` for the metadata segment.
        index: Option<u16>,
        /// Description of the failure.
        cause: String,
    },

    /// An I/O error from a file backed provider.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `incr` found a value that is not a decimal integer.
    #[error("value is not an integer")]
    NotAnInteger,
}

impl CacheError {
    /// True for [CacheError::NotFound] and [CacheError::Expired], the two
    /// "miss" outcomes of a read.
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::NotFound | CacheError::Expired(_))
    }
}
