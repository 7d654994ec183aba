//! Error types for log device operations.

use crate::framing::FramingError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LogDevError>;

/// Errors returned by log device operations.
///
/// Magic or CRC mismatches on a pinpointed positional read indicate either
/// a caller handing in a bogus key or on-device corruption; callers should
/// treat them as fatal for the device instance. A mismatch encountered by
/// the sequential recovery scan is not reported through this type at all:
/// the scan treats it as a provisional end-of-log and only escalates to
/// [`LogDevError::CorruptedTail`] when the post-scan probe proves that
/// valid data exists past the apparent end.
#[derive(Debug, thiserror::Error)]
pub enum LogDevError {
    /// I/O error from the underlying device.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Group header or record descriptor failed structural validation.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Group header magic did not match on a positional read.
    #[error("log group magic mismatch at dev_offset={dev_offset}")]
    MagicMismatch {
        /// Device offset of the group that was read.
        dev_offset: u64,
    },

    /// Group payload CRC did not match on a positional read.
    #[error("log group crc mismatch at dev_offset={dev_offset}: stored={stored:#010x} computed={computed:#010x}")]
    CrcMismatch {
        /// Device offset of the group that was read.
        dev_offset: u64,
        /// CRC recorded in the group header.
        stored: u32,
        /// CRC computed over the group bytes.
        computed: u32,
    },

    /// The requested log index does not fall inside the group at the
    /// key's device offset.
    #[error("log_idx {idx} outside group range [{start_idx}, {end_idx}) at dev_offset={dev_offset}")]
    KeyOutOfRange {
        /// Requested log index.
        idx: i64,
        /// First index recorded in the group.
        start_idx: i64,
        /// One past the last index recorded in the group.
        end_idx: i64,
        /// Device offset of the group.
        dev_offset: u64,
    },

    /// A structurally inconsistent group was read back.
    #[error("inconsistent log group at dev_offset={dev_offset}: {reason}")]
    InconsistentGroup {
        /// Device offset of the group.
        dev_offset: u64,
        /// What failed validation.
        reason: &'static str,
    },

    /// Recovery found a group with a future log index past the apparent
    /// end of the log, meaning the tail was corrupted rather than empty.
    #[error("corrupted tail: group with start_idx={found_idx} found past end of log (loaded up to idx={loaded_upto})")]
    CorruptedTail {
        /// Start index of the group found past the apparent end.
        found_idx: i64,
        /// Highest index loaded by the scan.
        loaded_upto: i64,
    },

    /// Operation attempted on a stopped log device.
    #[error("log device is stopped")]
    Stopped,

    /// The record payload can never fit inside a single log group.
    #[error("record of {size} bytes exceeds the log group capacity ({max} bytes)")]
    RecordTooLarge {
        /// Payload size requested.
        size: usize,
        /// Maximum payload a group can carry.
        max: usize,
    },

    /// No more store ids can be reserved.
    #[error("store id space exhausted (capacity {capacity})")]
    StoreIdsExhausted {
        /// Total number of reservable ids.
        capacity: u32,
    },

    /// Superblock contents failed validation.
    #[error("superblock error: {0}")]
    Superblock(&'static str),

    /// An aligned buffer allocation failed.
    #[error("aligned buffer allocation failed ({size} bytes)")]
    BufferAlloc {
        /// Requested allocation size.
        size: usize,
    },
}
