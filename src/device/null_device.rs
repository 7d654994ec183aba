//! Null log device for testing.
//!
//! Discards all writes and returns zeros for all reads. Useful for
//! exercising the flush machinery without touching storage.

use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::traits::{AppendCursor, SyncLogDevice};

/// Device that discards writes and reads back zeros.
pub struct NullLogDevice {
    cursor: AppendCursor,
    bytes_written: AtomicU64,
}

impl NullLogDevice {
    /// Create a new null device.
    pub fn new() -> Self {
        Self {
            cursor: AppendCursor::new(),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Total bytes accepted by writes.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }
}

impl Default for NullLogDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncLogDevice for NullLogDevice {
    fn read_sync(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn writev_sync(&self, _offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        self.bytes_written.fetch_add(total as u64, Ordering::AcqRel);
        Ok(total)
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_sync(&self, offset: u64) -> io::Result<()> {
        self.cursor.set_data_start(offset);
        Ok(())
    }

    fn cursor(&self) -> &AppendCursor {
        &self.cursor
    }
}
