//! Device traits for the append-only log.

use std::future::Future;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

/// Boxed future returned by async device operations.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Append-only block device consumed by the log core.
///
/// Data-path operations are asynchronous. Cursor bookkeeping is plain
/// synchronous state: the device tracks where valid data starts (advanced
/// by truncation), where the next append region will be reserved, and the
/// position a sequential scan has reached.
pub trait LogDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`. Short reads past the end of
    /// written data are allowed; the remainder of `buf` is left untouched.
    fn read<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> IoFuture<'a, usize>;

    /// Write the I/O vector contiguously at `offset`.
    fn writev<'a>(&'a self, offset: u64, bufs: &'a [IoSlice<'a>]) -> IoFuture<'a, usize>;

    /// Flush buffered writes to stable storage.
    fn flush(&self) -> IoFuture<'_, ()>;

    /// Mark space below `offset` reclaimable and advance the data start.
    fn truncate(&self, offset: u64) -> IoFuture<'_, ()>;

    /// Reserve a contiguous region of `size` bytes at the tail and return
    /// its device offset.
    fn alloc_next_append_blk(&self, size: u32) -> u64;

    /// Offset where valid data starts.
    fn data_start_offset(&self) -> u64;

    /// Set the offset where valid data starts.
    fn update_data_start_offset(&self, offset: u64);

    /// Offset where the next append region will be reserved.
    fn tail_offset(&self) -> u64;

    /// Move the tail reservation cursor.
    fn update_tail_offset(&self, offset: u64);

    /// Position reached by the most recent sequential scan.
    fn seeked_pos(&self) -> u64;

    /// Set the sequential scan position.
    fn lseek(&self, offset: u64);

    /// Alignment required for device offsets and transfer sizes.
    fn align(&self) -> usize {
        512
    }
}

/// Synchronous device trait for simpler implementations.
pub trait SyncLogDevice: Send + Sync + 'static {
    /// Read data synchronously. Short reads past the end are allowed.
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write an I/O vector synchronously.
    fn writev_sync(&self, offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Flush synchronously.
    fn flush_sync(&self) -> io::Result<()>;

    /// Truncate synchronously.
    fn truncate_sync(&self, offset: u64) -> io::Result<()>;

    /// Append-cursor state shared with the async wrapper.
    fn cursor(&self) -> &AppendCursor;

    /// Alignment requirement.
    fn align(&self) -> usize {
        512
    }
}

/// Implement the async trait for sync devices.
impl<T: SyncLogDevice> LogDevice for T {
    fn read<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        let result = self.read_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn writev<'a>(&'a self, offset: u64, bufs: &'a [IoSlice<'a>]) -> IoFuture<'a, usize> {
        let result = self.writev_sync(offset, bufs);
        Box::pin(async move { result })
    }

    fn flush(&self) -> IoFuture<'_, ()> {
        let result = self.flush_sync();
        Box::pin(async move { result })
    }

    fn truncate(&self, offset: u64) -> IoFuture<'_, ()> {
        let result = self.truncate_sync(offset);
        Box::pin(async move { result })
    }

    fn alloc_next_append_blk(&self, size: u32) -> u64 {
        self.cursor().alloc(size)
    }

    fn data_start_offset(&self) -> u64 {
        self.cursor().data_start()
    }

    fn update_data_start_offset(&self, offset: u64) {
        self.cursor().set_data_start(offset)
    }

    fn tail_offset(&self) -> u64 {
        self.cursor().tail()
    }

    fn update_tail_offset(&self, offset: u64) {
        self.cursor().set_tail(offset)
    }

    fn seeked_pos(&self) -> u64 {
        self.cursor().seek_pos()
    }

    fn lseek(&self, offset: u64) {
        self.cursor().set_seek_pos(offset)
    }

    fn align(&self) -> usize {
        SyncLogDevice::align(self)
    }
}

/// Append-cursor bookkeeping shared by device implementations.
#[derive(Debug, Default)]
pub struct AppendCursor {
    data_start: AtomicU64,
    tail: AtomicU64,
    seek: AtomicU64,
}

impl AppendCursor {
    /// Create a cursor with all positions at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `size` bytes at the tail, returning the region's offset.
    pub fn alloc(&self, size: u32) -> u64 {
        self.tail.fetch_add(size as u64, Ordering::AcqRel)
    }

    /// Offset where valid data starts.
    pub fn data_start(&self) -> u64 {
        self.data_start.load(Ordering::Acquire)
    }

    /// Set the offset where valid data starts.
    pub fn set_data_start(&self, offset: u64) {
        self.data_start.store(offset, Ordering::Release)
    }

    /// Current tail reservation cursor.
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Move the tail reservation cursor.
    pub fn set_tail(&self, offset: u64) {
        self.tail.store(offset, Ordering::Release)
    }

    /// Current sequential scan position.
    pub fn seek_pos(&self) -> u64 {
        self.seek.load(Ordering::Acquire)
    }

    /// Set the sequential scan position.
    pub fn set_seek_pos(&self, offset: u64) {
        self.seek.store(offset, Ordering::Release)
    }
}
