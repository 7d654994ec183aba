//! oxilog - A multiplexed, batched write-ahead log device
//!
//! oxilog multiplexes many logical log streams onto a single append-only
//! block device, providing:
//! - **Ordered, durable, batched append**: records from independent
//!   producers are indexed by a monotonic `log_idx` and flushed in
//!   device-aligned log groups, with at most one group write in flight
//! - **Random read by position**: any record can be read back by its
//!   `{log_idx, dev_offset}` key, across restarts
//! - **Crash recovery**: a CRC-chained sequential scan replays the log
//!   tail and tells a legitimate end-of-log from a torn write
//! - **Cooperative truncation**: space reclaim that also garbage-collects
//!   released store ids through the persisted superblock
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxilog::{FileLogDevice, LogDev, LogDevCallbacks, LogDevConfig, MemMetaStore};
//!
//! let device = Arc::new(FileLogDevice::open("wal.dat", true)?);
//! let meta = Arc::new(MemMetaStore::new());
//! let logdev = LogDev::new(device, meta, LogDevConfig::default(), callbacks);
//!
//! logdev.start(true)?;
//! let idx = logdev.append_async(store_id, seq, payload, context)?;
//! // durability is signalled through the append completion callback
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod framing;
mod group;
mod id_reserver;
pub mod logdev;
pub mod meta;
pub mod stats;
mod stream;
mod tracker;

// Re-exports for convenience
pub use config::{LogDevConfig, OxilogConfig};
pub use device::{FileLogDevice, LogDevice, NullLogDevice, SyncLogDevice};
pub use error::{LogDevError, Result};
pub use logdev::{FlushSlotState, LogDev, LogDevCallbacks, LogDevKey};
pub use meta::{MemMetaStore, MetaCookie, MetaStore, StoreMeta};
pub use stats::LogDevStatsSnapshot;

/// Utility for size literals (e.g. 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::LogDevConfig;
    pub use crate::device::{FileLogDevice, LogDevice, NullLogDevice};
    pub use crate::error::{LogDevError, Result};
    pub use crate::logdev::{LogDev, LogDevCallbacks, LogDevKey};
    pub use crate::meta::{MemMetaStore, MetaStore, StoreMeta};
}
