//! Append-only block device abstraction.
//!
//! The log device core talks to storage through the [`LogDevice`] trait,
//! which combines asynchronous data-path I/O (vectored append, positional
//! read, truncate) with the append-cursor bookkeeping the log relies on:
//! a data start offset, a tail reservation cursor, and a scan position.
//!
//! # Available Devices
//!
//! - [`FileLogDevice`]: single-file backed storage
//! - [`NullLogDevice`]: discards writes, reads zeros; for tests
//!
//! To implement a custom device, implement either [`LogDevice`] (async) or
//! [`SyncLogDevice`] (synchronous, which automatically gets an async
//! wrapper).

mod file_device;
mod null_device;
mod traits;

use std::future::Future;
use std::sync::OnceLock;

pub use file_device::FileLogDevice;
pub use null_device::NullLogDevice;
pub use traits::{AppendCursor, IoFuture, LogDevice, SyncLogDevice};

/// Drive a device future to completion from synchronous code.
///
/// Must not be called from inside an async context; the log device entry
/// points are synchronous by contract.
pub(crate) fn block_on_io<F: Future>(fut: F) -> F::Output {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("failed to build device I/O runtime")
        })
        .block_on(fut)
}
