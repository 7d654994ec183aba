//! Multiplexed write-ahead log device.
//!
//! `LogDev` multiplexes many logical log streams onto one append-only
//! block device. Appends from any thread are indexed by a monotonically
//! increasing `log_idx`, batched into device-aligned log groups and
//! flushed by a single in-flight group write at a time. Flushes are
//! triggered by accumulated size, by a recurring timer, or chained from
//! the previous flush's completion.
//!
//! Work that must not overlap a group write (stopping the device,
//! truncation) runs under the same exclusive flush slot: it either wins
//! the slot immediately or is queued and executed when the in-flight
//! flush completes.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{round_down, round_up, AlignedBuffer};
use crate::config::LogDevConfig;
use crate::device::{block_on_io, LogDevice};
use crate::error::{LogDevError, Result};
use crate::framing::{
    payload_offset, FramingError, GroupView, LogGroupHeader, SerializedLogRecord, INVALID_CRC32,
};
use crate::group::LogGroup;
use crate::meta::{LogDevMetadata, MetaCookie, MetaStore, StoreMeta};
use crate::stats::{LogDevStats, LogDevStatsSnapshot};
use crate::stream::LogStreamReader;
use crate::tracker::{LogRecord, RecordState, RecordTracker};

/// Stable position of one record: its log index and the device offset of
/// the group that holds it. Keys remain valid across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogDevKey {
    /// Monotonic log index of the record.
    pub idx: i64,
    /// Device offset of the record's group.
    pub dev_offset: u64,
}

impl fmt::Display for LogDevKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[idx={} dev_offset={}]", self.idx, self.dev_offset)
    }
}

/// Called once per record when its group write completes. Arguments:
/// store id, the record's key, the key of the group flush, distance from
/// the record to the last record of the group, and the caller's context.
pub type AppendCompCallback = Box<dyn Fn(u32, LogDevKey, LogDevKey, i64, u64) + Send + Sync>;

/// Called once per reserved store during startup from persisted metadata.
pub type StoreFoundCallback = Box<dyn Fn(u32, &StoreMeta) + Send + Sync>;

/// Called once per record replayed by the recovery scan.
pub type LogFoundCallback = Box<dyn Fn(u32, i64, LogDevKey, &[u8]) + Send + Sync>;

/// Deferred work executed under the exclusive flush slot.
pub type FlushBlockedCallback = Box<dyn FnOnce() + Send>;

/// Host callbacks. All must be provided before the device starts.
pub struct LogDevCallbacks {
    /// Flush acknowledgement, per record.
    pub append_comp: AppendCompCallback,
    /// Reserved store notification during load.
    pub store_found: StoreFoundCallback,
    /// Replayed record notification during recovery.
    pub log_found: LogFoundCallback,
}

impl LogDevCallbacks {
    /// Bundle the three host callbacks.
    pub fn new(
        append_comp: AppendCompCallback,
        store_found: StoreFoundCallback,
        log_found: LogFoundCallback,
    ) -> Self {
        Self {
            append_comp,
            store_found,
            log_found,
        }
    }
}

enum FlushMsg {
    Group(LogGroup),
    Shutdown,
}

/// State of the flush coordination machine.
///
/// Transitions: `Idle -> Flushing` when a caller wins the slot;
/// `Flushing -> FlushingWithQueuedWork` when slot-bound work is deferred
/// behind an in-flight flush; back to `Idle` when the slot is released
/// after draining; any state to `Stopped` once the device stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSlotState {
    /// No flush in flight; the slot is free.
    Idle,
    /// Exactly one flush (or slot-bound task) owns the slot.
    Flushing,
    /// The slot is owned and further work is queued behind it.
    FlushingWithQueuedWork,
    /// The device has stopped; the slot can no longer be taken.
    Stopped,
}

struct MetaState<M: MetaStore> {
    meta: LogDevMetadata<M>,
    /// Store ids released by their owners, keyed by the log index current
    /// at release time. Reclaimed once truncation passes that index.
    garbage: BTreeMap<i64, Vec<u32>>,
}

struct LogDevShared<D: LogDevice, M: MetaStore> {
    config: LogDevConfig,
    device: Arc<D>,
    callbacks: LogDevCallbacks,
    stats: LogDevStats,

    tracker: Mutex<RecordTracker>,
    meta_state: Mutex<MetaState<M>>,

    log_idx: AtomicI64,
    pending_flush_size: AtomicI64,
    last_flush_idx: AtomicI64,
    last_truncate_idx: AtomicI64,
    last_crc: AtomicU32,

    is_flushing: AtomicBool,
    stopped: AtomicBool,
    blocked_q: Mutex<VecDeque<FlushBlockedCallback>>,
    stop_cv: Condvar,

    flush_tx: Mutex<Option<Sender<FlushMsg>>>,
    start_time: Instant,
    last_flush_time_us: AtomicU64,
}

/// Multiplexed write-ahead log device over an append-only block device.
pub struct LogDev<D: LogDevice, M: MetaStore> {
    shared: Arc<LogDevShared<D, M>>,
    flush_worker: Mutex<Option<thread::JoinHandle<()>>>,
    flush_timer: Mutex<Option<thread::JoinHandle<()>>>,
    timer_tx: Mutex<Option<Sender<()>>>,
}

impl<D: LogDevice, M: MetaStore> LogDev<D, M> {
    /// Create a stopped log device over `device`, persisting metadata
    /// through `meta_store`.
    pub fn new(
        device: Arc<D>,
        meta_store: Arc<M>,
        config: LogDevConfig,
        callbacks: LogDevCallbacks,
    ) -> Self {
        let meta = LogDevMetadata::new(meta_store, config.max_stores);
        let shared = Arc::new(LogDevShared {
            config,
            device,
            callbacks,
            stats: LogDevStats::default(),
            tracker: Mutex::new(RecordTracker::new(0)),
            meta_state: Mutex::new(MetaState {
                meta,
                garbage: BTreeMap::new(),
            }),
            log_idx: AtomicI64::new(0),
            pending_flush_size: AtomicI64::new(0),
            last_flush_idx: AtomicI64::new(-1),
            last_truncate_idx: AtomicI64::new(-1),
            last_crc: AtomicU32::new(INVALID_CRC32),
            is_flushing: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            blocked_q: Mutex::new(VecDeque::new()),
            stop_cv: Condvar::new(),
            flush_tx: Mutex::new(None),
            start_time: Instant::now(),
            last_flush_time_us: AtomicU64::new(0),
        });

        Self {
            shared,
            flush_worker: Mutex::new(None),
            flush_timer: Mutex::new(None),
            timer_tx: Mutex::new(None),
        }
    }

    /// Deliver a previously persisted superblock found by the host at its
    /// metadata service. Must happen before `start(false)`.
    pub fn meta_blk_found(&self, buf: Vec<u8>, cookie: MetaCookie) {
        self.shared.meta_state.lock().meta.meta_buf_found(buf, cookie);
    }

    /// Bring the device online. With `format` a fresh superblock is
    /// created; otherwise the persisted superblock is loaded, reserved
    /// stores are announced through `store_found` and the log tail is
    /// replayed through `log_found`.
    pub fn start(&self, format: bool) -> Result<()> {
        let shared = &self.shared;
        shared.stopped.store(false, Ordering::Release);

        if format {
            let mut ms = shared.meta_state.lock();
            if !ms.meta.is_empty() {
                return Err(LogDevError::Superblock(
                    "format requested but metadata is already present",
                ));
            }
            ms.meta.create()?;
            shared.device.update_data_start_offset(0);
            shared.device.update_tail_offset(0);
            shared.device.lseek(0);
            *shared.tracker.lock() = RecordTracker::new(0);
        } else {
            let (stores, start_offset) = {
                let mut ms = shared.meta_state.lock();
                if ms.meta.is_empty() {
                    return Err(LogDevError::Superblock(
                        "metadata must be delivered before a non-format start",
                    ));
                }
                (ms.meta.load()?, ms.meta.start_dev_offset())
            };
            for (id, meta) in &stores {
                (shared.callbacks.store_found)(*id, meta);
            }
            shared.device.update_data_start_offset(start_offset);
            shared.do_load(start_offset)?;
            let next_idx = shared.log_idx.load(Ordering::Acquire);
            *shared.tracker.lock() = RecordTracker::new(next_idx);
            shared.last_flush_idx.store(next_idx - 1, Ordering::Release);
        }

        shared
            .last_flush_time_us
            .store(shared.now_us(), Ordering::Release);

        let (flush_tx, flush_rx) = crossbeam::channel::unbounded();
        *shared.flush_tx.lock() = Some(flush_tx);
        let worker_shared = Arc::clone(shared);
        *self.flush_worker.lock() = Some(
            thread::Builder::new()
                .name("oxilog-flush".into())
                .spawn(move || flush_worker_loop(worker_shared, flush_rx))?,
        );

        let (timer_tx, timer_rx) = crossbeam::channel::bounded(1);
        *self.timer_tx.lock() = Some(timer_tx);
        let timer_shared = Arc::clone(shared);
        let freq = Duration::from_micros(shared.config.flush_timer_frequency_us);
        *self.flush_timer.lock() = Some(
            thread::Builder::new()
                .name("oxilog-flush-timer".into())
                .spawn(move || flush_timer_loop(timer_shared, timer_rx, freq))?,
        );

        Ok(())
    }

    /// Take the device offline. Waits for an in-flight flush to drain,
    /// then tears down the flush threads and resets in-memory state.
    ///
    /// Callers must have stopped appending and seen completions for all
    /// pending records first.
    pub fn stop(&self) {
        let shared = &self.shared;
        assert_eq!(
            shared.pending_flush_size.load(Ordering::Acquire),
            0,
            "stop attempted while appends are pending flush"
        );

        let stop_shared = Arc::clone(shared);
        let locked_now = self.try_lock_flush(Box::new(move || {
            stop_shared.stopped.store(true, Ordering::Release);
            // notify under the queue mutex so the waiter cannot miss it
            let _q = stop_shared.blocked_q.lock();
            stop_shared.stop_cv.notify_all();
        }));
        if !locked_now {
            info!("stop queued behind an in-flight flush");
        }

        {
            let mut q = shared.blocked_q.lock();
            while !shared.stopped.load(Ordering::Acquire) {
                shared.stop_cv.wait(&mut q);
            }
        }

        self.shutdown_threads();

        shared.tracker.lock().reinit(0);
        {
            let mut ms = shared.meta_state.lock();
            ms.meta.reset();
            ms.garbage.clear();
        }
        shared.log_idx.store(0, Ordering::Release);
        shared.pending_flush_size.store(0, Ordering::Release);
        shared.is_flushing.store(false, Ordering::Release);
        shared.last_flush_idx.store(-1, Ordering::Release);
        shared.last_truncate_idx.store(-1, Ordering::Release);
        shared.last_crc.store(INVALID_CRC32, Ordering::Release);
        shared.blocked_q.lock().clear();

        info!("log device stopped");
    }

    /// Append a record for `store_id`. Returns the record's log index
    /// immediately; durability is signalled later through the append
    /// completion callback.
    pub fn append_async(
        &self,
        store_id: u32,
        seq_num: i64,
        data: Arc<[u8]>,
        context: u64,
    ) -> Result<i64> {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::Acquire) {
            return Err(LogDevError::Stopped);
        }

        // a record that can never fit a group would wedge the flush path
        let max_payload = shared.config.max_group_size as usize
            - LogGroupHeader::ENCODED_SIZE
            - SerializedLogRecord::ENCODED_SIZE
            - 2 * shared.device.align();
        if data.len() > max_payload {
            return Err(LogDevError::RecordTooLarge {
                size: data.len(),
                max: max_payload,
            });
        }

        let size = data.len() as u32;
        let idx = shared.log_idx.fetch_add(1, Ordering::AcqRel);
        shared.tracker.lock().create(
            idx,
            LogRecord {
                store_id,
                store_seq_num: seq_num,
                payload: data,
                context,
                state: RecordState::Active,
            },
        );
        shared.flush_if_needed(size, Some(idx));
        Ok(idx)
    }

    /// Read back the payload of one record by its key.
    pub fn read(&self, key: &LogDevKey) -> Result<Vec<u8>> {
        self.shared.read(key)
    }

    /// Cut the log at `key`: drop tracked records at or below it, release
    /// the device space, reclaim garbage store ids whose marker the cut
    /// passed, and persist the superblock once.
    ///
    /// Runs under the exclusive flush slot so it cannot overlap a group
    /// write; if a flush is in flight the truncation executes when that
    /// flush completes, and this call waits for it.
    pub fn truncate(&self, key: &LogDevKey) -> Result<()> {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::Acquire) {
            return Err(LogDevError::Stopped);
        }

        let done = Arc::new((Mutex::new(None::<Result<()>>), Condvar::new()));
        let cb_done = Arc::clone(&done);
        let cb_shared = Arc::clone(shared);
        let key = *key;

        let locked_now = self.try_lock_flush(Box::new(move || {
            let result = cb_shared.do_truncate(&key);
            let (lock, cv) = &*cb_done;
            *lock.lock() = Some(result);
            cv.notify_all();
        }));
        if locked_now {
            self.unlock_flush();
        }

        let (lock, cv) = &*done;
        let mut slot = lock.lock();
        while slot.is_none() {
            cv.wait(&mut slot);
        }
        slot.take().unwrap()
    }

    /// Reserve a new store id and persist the superblock.
    pub fn reserve_store_id(&self) -> Result<u32> {
        let mut ms = self.shared.meta_state.lock();
        ms.meta.reserve_store(true)
    }

    /// Release a store id. The id is only garbage-marked here; it becomes
    /// reusable once truncation passes the log index current at release
    /// time.
    pub fn unreserve_store_id(&self, store_id: u32) {
        let mut ms = self.shared.meta_state.lock();
        let marker = self.shared.log_idx.load(Ordering::Acquire) - 1;
        ms.garbage.entry(marker).or_default().push(store_id);
    }

    /// Snapshot the reserved store ids and the garbage-marked ids still
    /// awaiting reclaim.
    pub fn get_registered_store_ids(&self) -> (Vec<u32>, Vec<u32>) {
        let ms = self.shared.meta_state.lock();
        let registered = ms.meta.reserved_store_ids();
        let garbage = ms
            .garbage
            .values()
            .flat_map(|ids| ids.iter().copied())
            .collect();
        (registered, garbage)
    }

    /// Overwrite a store's opaque metadata slot.
    pub fn update_store_meta(&self, store_id: u32, meta: StoreMeta, persist_now: bool) -> Result<()> {
        let mut ms = self.shared.meta_state.lock();
        ms.meta.update_store_meta(store_id, meta, persist_now)
    }

    /// Run `cb` under the exclusive flush slot. If the slot is free the
    /// callback runs synchronously and the caller owns the slot (release
    /// it with [`Self::unlock_flush`]); otherwise the callback is queued
    /// and will run when the in-flight flush completes. Returns whether
    /// the slot was taken synchronously.
    pub fn try_lock_flush(&self, cb: FlushBlockedCallback) -> bool {
        self.shared.try_lock_flush(cb)
    }

    /// Release the flush slot: run queued callbacks in order (stopping if
    /// the device stops), free the slot, then chain another flush if
    /// enough appends accumulated meanwhile.
    pub fn unlock_flush(&self) {
        self.shared.unlock_flush()
    }

    /// Next log index to be assigned.
    pub fn log_idx(&self) -> i64 {
        self.shared.log_idx.load(Ordering::Acquire)
    }

    /// Highest log index acknowledged by a flush completion.
    pub fn last_flush_idx(&self) -> i64 {
        self.shared.last_flush_idx.load(Ordering::Acquire)
    }

    /// Highest log index removed by truncation.
    pub fn last_truncate_idx(&self) -> i64 {
        self.shared.last_truncate_idx.load(Ordering::Acquire)
    }

    /// Number of reserved stores recorded in the superblock.
    pub fn num_stores(&self) -> u32 {
        self.shared.meta_state.lock().meta.num_stores()
    }

    /// Current state of the flush coordination machine.
    pub fn flush_state(&self) -> FlushSlotState {
        let shared = &self.shared;
        let q = shared.blocked_q.lock();
        if shared.stopped.load(Ordering::Acquire) {
            FlushSlotState::Stopped
        } else if !shared.is_flushing.load(Ordering::Acquire) {
            FlushSlotState::Idle
        } else if q.is_empty() {
            FlushSlotState::Flushing
        } else {
            FlushSlotState::FlushingWithQueuedWork
        }
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> LogDevStatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn shutdown_threads(&self) {
        if let Some(tx) = self.shared.flush_tx.lock().take() {
            let _ = tx.send(FlushMsg::Shutdown);
        }
        if let Some(handle) = self.flush_worker.lock().take() {
            let _ = handle.join();
        }
        // dropping the sender disconnects the timer loop
        self.timer_tx.lock().take();
        if let Some(handle) = self.flush_timer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<D: LogDevice, M: MetaStore> Drop for LogDev<D, M> {
    fn drop(&mut self) {
        if self.flush_worker.lock().is_some() {
            warn!("log device dropped without stop; shutting down flush threads");
            self.shutdown_threads();
        }
    }
}

impl<D: LogDevice, M: MetaStore> LogDevShared<D, M> {
    fn now_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Account `new_size` pending bytes and flush when either trigger
    /// fires: enough bytes accumulated, or too long since the last flush
    /// with anything pending. Exactly one caller wins the flush slot;
    /// losers rely on the winner's completion to chain.
    fn flush_if_needed(&self, new_size: u32, new_idx: Option<i64>) {
        let pending = self
            .pending_flush_size
            .fetch_add(new_size as i64, Ordering::Relaxed)
            + new_size as i64;
        let flush_by_size = pending >= self.config.flush_data_threshold_size as i64;
        let flush_by_time = !flush_by_size
            && pending > 0
            && self.now_us().saturating_sub(self.last_flush_time_us.load(Ordering::Relaxed))
                > self.config.max_time_between_flush_us;
        if !(flush_by_size || flush_by_time) {
            return;
        }

        if self
            .is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("flush already in flight; the current flush will chain");
            self.stats
                .back_to_back_flushes
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        trace!(
            pending,
            flush_by_size,
            "won the flush slot, preparing a group"
        );
        let new_idx = new_idx.unwrap_or_else(|| self.log_idx.load(Ordering::Relaxed) - 1);
        let last_flush_idx = self.last_flush_idx.load(Ordering::Acquire);
        if last_flush_idx >= new_idx {
            trace!(new_idx, "log index already flushed");
            self.release_flush_slot();
            return;
        }

        // a few extra slots cover appends racing this prepare
        let estimate = (new_idx - last_flush_idx + 4) as u32;
        match self.prepare_flush(estimate) {
            Some(group) => {
                self.pending_flush_size
                    .fetch_sub(group.actual_data_size() as i64, Ordering::Relaxed);
                if flush_by_size {
                    self.stats.flush_by_size.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.flush_by_timer.fetch_add(1, Ordering::Relaxed);
                }
                self.last_flush_time_us.store(self.now_us(), Ordering::Relaxed);
                trace!(data_size = group.actual_data_size(), "flush prepared");
                self.do_flush(group);
            }
            None => {
                trace!(new_idx, last_flush_idx, "nothing to flush after prepare");
                self.release_flush_slot();
            }
        }
    }

    /// Gather active records from the tracker into a sealed group and
    /// reserve its device region. Returns `None` when no record was
    /// accepted.
    fn prepare_flush(&self, estimated_records: u32) -> Option<LogGroup> {
        debug_assert!(estimated_records > 0);
        let mut group = LogGroup::new(estimated_records, self.device.align(), &self.config)?;

        let from = self.last_flush_idx.load(Ordering::Acquire) + 1;
        {
            let tracker = self.tracker.lock();
            tracker.foreach_active(from, |idx, record| group.add_record(idx, record));
        }

        if !group.finish(self.last_crc.load(Ordering::Acquire)) {
            return None;
        }
        debug_assert!(group.flush_log_idx_upto >= group.flush_log_idx_from);
        group.log_dev_offset = self.device.alloc_next_append_blk(group.group_size());

        debug!(upto = group.flush_log_idx_upto, "flushing up to log index");
        debug!("{group}");
        Some(group)
    }

    /// Hand the sealed group to the flush worker. Ordering across groups
    /// follows from the exclusive slot: the next group cannot be prepared
    /// until this one completes.
    fn do_flush(&self, group: LogGroup) {
        self.stats.inflight_inc();
        let sent = {
            let tx = self.flush_tx.lock();
            match tx.as_ref() {
                Some(tx) => tx.send(FlushMsg::Group(group)).is_ok(),
                None => false,
            }
        };
        if !sent {
            // no worker to own the write; give the slot back
            warn!("flush worker unavailable, dropping prepared group");
            self.stats.inflight_dec();
            self.is_flushing.store(false, Ordering::Release);
        }
    }

    /// Completion of a group write. Marks the range flushed, notifies the
    /// producer per record in ascending index order, advances the CRC
    /// chain and releases the flush slot. Runs regardless of the write's
    /// outcome; the slot is tied to the lifetime of the I/O, not to its
    /// success.
    fn on_flush_completion(&self, group: LogGroup) {
        let from = group.flush_log_idx_from;
        let upto = group.flush_log_idx_upto;
        trace!(from, upto, "flush completed");

        let mut completions = Vec::with_capacity((upto - from + 1) as usize);
        {
            let mut tracker = self.tracker.lock();
            tracker.complete(from, upto);
            for idx in from..=upto {
                if let Some(record) = tracker.at(idx) {
                    completions.push((record.store_id, idx, record.context));
                }
            }
        }
        self.last_flush_idx.store(upto, Ordering::Release);

        let flush_key = LogDevKey {
            idx: upto,
            dev_offset: group.log_dev_offset,
        };
        for (store_id, idx, context) in completions {
            let record_key = LogDevKey {
                idx,
                dev_offset: group.log_dev_offset,
            };
            (self.callbacks.append_comp)(store_id, record_key, flush_key, upto - idx, context);
        }

        self.last_crc
            .store(group.header().cur_grp_crc, Ordering::Release);
        self.stats.groups_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_flushed
            .fetch_add(group.nrecords() as u64, Ordering::Relaxed);
        self.stats.inflight_dec();
        self.unlock_flush();
    }

    fn try_lock_flush(&self, cb: FlushBlockedCallback) -> bool {
        {
            let mut q = self.blocked_q.lock();
            if self.stopped.load(Ordering::Acquire) {
                warn!("flush lock refused on a stopped log device");
                return false;
            }

            if self
                .is_flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                q.push_back(cb);
                return false;
            }
        }
        cb();
        true
    }

    fn unlock_flush(&self) {
        if !self.release_flush_slot() {
            return;
        }
        trace!("flush slot released, chaining if needed");
        self.flush_if_needed(0, None);
    }

    /// Drain the blocked queue and free the slot, without chaining.
    /// Returns `false` when draining was cut short by a stop, in which
    /// case the slot stays held.
    fn release_flush_slot(&self) -> bool {
        loop {
            let pending_cbs: Vec<FlushBlockedCallback> = {
                let mut q = self.blocked_q.lock();
                if q.is_empty() {
                    // Released under the queue lock: a racing
                    // try_lock_flush either sees the slot free here or
                    // already enqueued and was drained above.
                    self.is_flushing.store(false, Ordering::Release);
                    return true;
                }
                q.drain(..).collect()
            };
            for cb in pending_cbs {
                if self.stopped.load(Ordering::Acquire) {
                    info!("log device stopped, leaving remaining blocked flush work");
                    return false;
                }
                cb();
            }
        }
    }

    fn read(&self, key: &LogDevKey) -> Result<Vec<u8>> {
        let align = self.device.align();
        let initial = round_up(
            self.config.initial_read_size.max(LogGroupHeader::ENCODED_SIZE),
            align,
        );
        let mut head_buf = AlignedBuffer::zeroed(align, initial)
            .ok_or(LogDevError::BufferAlloc { size: initial })?;
        block_on_io(self.device.read(key.dev_offset, head_buf.as_mut_slice()))?;

        let header = LogGroupHeader::decode(head_buf.as_slice()).map_err(|err| match err {
            FramingError::MagicMismatch => LogDevError::MagicMismatch {
                dev_offset: key.dev_offset,
            },
            other => other.into(),
        })?;
        if key.idx < header.start_idx || key.idx >= header.end_idx() {
            return Err(LogDevError::KeyOutOfRange {
                idx: key.idx,
                start_idx: header.start_idx,
                end_idx: header.end_idx(),
                dev_offset: key.dev_offset,
            });
        }
        if (header.total_size as usize) < header.inline_data_offset as usize {
            return Err(LogDevError::InconsistentGroup {
                dev_offset: key.dev_offset,
                reason: "total size below inline data offset",
            });
        }

        // CRC can only be checked when the whole group landed in the
        // initial read; reading more just to check it is recovery's job.
        if header.total_size as usize <= initial {
            let computed = crate::framing::group_crc([
                &head_buf.as_slice()[LogGroupHeader::ENCODED_SIZE..header.total_size as usize],
            ]);
            if computed != header.cur_grp_crc {
                return Err(LogDevError::CrcMismatch {
                    dev_offset: key.dev_offset,
                    stored: header.cur_grp_crc,
                    computed,
                });
            }
        }

        let rec_no = (key.idx - header.start_idx) as usize;
        let desc_at = LogGroupHeader::ENCODED_SIZE + rec_no * SerializedLogRecord::ENCODED_SIZE;
        let desc_end = desc_at + SerializedLogRecord::ENCODED_SIZE;
        let record = if desc_end <= initial {
            SerializedLogRecord::decode(&head_buf.as_slice()[desc_at..])?
        } else {
            let size = round_up(desc_end, align);
            let mut desc_buf = AlignedBuffer::zeroed(align, size)
                .ok_or(LogDevError::BufferAlloc { size })?;
            block_on_io(self.device.read(key.dev_offset, desc_buf.as_mut_slice()))?;
            SerializedLogRecord::decode(&desc_buf.as_slice()[desc_at..])?
        };

        let data_offset = payload_offset(&header, &record) as usize;
        let data_size = record.size as usize;
        let mut out = vec![0u8; data_size];
        if data_offset + data_size <= initial {
            out.copy_from_slice(&head_buf.as_slice()[data_offset..data_offset + data_size]);
        } else {
            // Re-read rounded to the device boundary and skip the rounded
            // lead-in when copying out.
            let rounded_offset = round_down(data_offset, align);
            let rounded_size = round_up(data_size + data_offset - rounded_offset, align);
            let mut data_buf = AlignedBuffer::zeroed(align, rounded_size)
                .ok_or(LogDevError::BufferAlloc { size: rounded_size })?;
            trace!(
                idx = key.idx,
                dev_offset = key.dev_offset,
                data_offset,
                rounded_offset,
                rounded_size,
                "payload outside the initial read"
            );
            block_on_io(
                self.device
                    .read(key.dev_offset + rounded_offset as u64, data_buf.as_mut_slice()),
            )?;
            let skip = data_offset - rounded_offset;
            out.copy_from_slice(&data_buf.as_slice()[skip..skip + data_size]);
        }

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    /// Replay the persisted tail of the log from `start_offset`,
    /// announcing every record through `log_found` and seeding the append
    /// state for new writes.
    fn do_load(&self, start_offset: u64) -> Result<()> {
        let mut reader = LogStreamReader::new(&*self.device, start_offset);
        let mut loaded_from: i64 = -1;

        loop {
            let Some((group_offset, buf)) = reader.next_group()? else {
                self.confirm_end_of_stream(&mut reader)?;
                info!(
                    loaded_from,
                    loaded_upto = self.log_idx.load(Ordering::Acquire) - 1,
                    "log device loaded"
                );
                break;
            };

            let view = GroupView::parse(&buf)?;
            let header = *view.header();
            if loaded_from == -1 {
                loaded_from = header.start_idx;
            }

            for n in 0..header.nrecords {
                let record = view.record(n)?;
                let payload = view.payload(n)?;
                let idx = header.start_idx + n as i64;
                if self.last_truncate_idx.load(Ordering::Acquire) == -1 {
                    self.last_truncate_idx.store(idx, Ordering::Release);
                }
                (self.callbacks.log_found)(
                    record.store_id,
                    record.store_seq_num,
                    LogDevKey {
                        idx,
                        dev_offset: group_offset,
                    },
                    payload,
                );
            }
            self.log_idx.store(header.end_idx(), Ordering::Release);
        }

        if let Some(crc) = reader.last_crc() {
            self.last_crc.store(crc, Ordering::Release);
        }

        // new appends continue from where the scan ended
        let tail = reader.group_cursor();
        self.device.lseek(tail);
        self.device.update_tail_offset(tail);
        Ok(())
    }

    /// The scan hit an unreadable group. Probe a bounded number of blocks
    /// past it: a well-formed header carrying a future log index proves
    /// the apparent end was a corrupted block, not the tail.
    fn confirm_end_of_stream(&self, reader: &mut LogStreamReader<'_, D>) -> Result<()> {
        info!("validating the apparent end of the log");
        let cursor = reader.group_cursor();
        for _ in 0..self.config.recovery_max_blks_read_for_additional_check {
            if let Some(header) = reader.group_in_next_page()? {
                let next_idx = self.log_idx.load(Ordering::Acquire);
                if header.start_idx >= next_idx {
                    return Err(LogDevError::CorruptedTail {
                        found_idx: header.start_idx,
                        loaded_upto: next_idx - 1,
                    });
                }
            }
        }
        self.device.lseek(cursor);
        Ok(())
    }

    fn do_truncate(&self, key: &LogDevKey) -> Result<()> {
        info!(
            upto_idx = key.idx,
            dev_offset = key.dev_offset,
            records = key.idx - self.last_truncate_idx.load(Ordering::Acquire),
            "truncating log device"
        );
        self.tracker.lock().truncate(key.idx);
        block_on_io(self.device.truncate(key.dev_offset))?;
        self.last_truncate_idx.store(key.idx, Ordering::Release);

        let mut ms = self.meta_state.lock();
        ms.meta.update_start_dev_offset(key.dev_offset, false)?;

        // ids garbage-marked at or below the cut are reclaimable now
        let reclaimed: Vec<i64> = ms
            .garbage
            .range(..=key.idx)
            .map(|(marker, _)| *marker)
            .collect();
        for marker in reclaimed {
            if let Some(ids) = ms.garbage.remove(&marker) {
                for id in ids {
                    info!(store_id = id, marker, "reclaiming garbage store id");
                    ms.meta.unreserve_store(id, false)?;
                }
            }
        }

        ms.meta.persist()
    }
}

fn flush_worker_loop<D: LogDevice, M: MetaStore>(
    shared: Arc<LogDevShared<D, M>>,
    rx: Receiver<FlushMsg>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to build flush I/O runtime: {err}");
            return;
        }
    };

    while let Ok(msg) = rx.recv() {
        match msg {
            FlushMsg::Group(group) => {
                let result = {
                    let iovs = group.iovecs();
                    rt.block_on(shared.device.writev(group.log_dev_offset, &iovs))
                };
                match result {
                    Ok(written) => {
                        shared
                            .stats
                            .bytes_written
                            .fetch_add(written as u64, Ordering::Relaxed);
                    }
                    Err(err) => {
                        shared
                            .stats
                            .flush_write_errors
                            .fetch_add(1, Ordering::Relaxed);
                        error!(
                            dev_offset = group.log_dev_offset,
                            "group write failed: {err}"
                        );
                    }
                }
                shared.on_flush_completion(group);
            }
            FlushMsg::Shutdown => break,
        }
    }
}

fn flush_timer_loop<D: LogDevice, M: MetaStore>(
    shared: Arc<LogDevShared<D, M>>,
    rx: Receiver<()>,
    freq: Duration,
) {
    loop {
        match rx.recv_timeout(freq) {
            Err(RecvTimeoutError::Timeout) => shared.flush_if_needed(0, None),
            _ => break,
        }
    }
}
