//! In-memory index of appended records, keyed by log index.
//!
//! The tracker is a dense sequence addressed by `log_idx`. Records enter
//! as `Active` when appended, become `Completed` once their group write is
//! acknowledged, and `Truncated` when the log is cut below them. Storage
//! grows in fixed-size chunks; a chunk is freed once every record inside
//! it has been truncated.

use std::collections::VecDeque;
use std::sync::Arc;

/// Records per allocation chunk.
const CHUNK_RECORDS: usize = 256;

/// Lifecycle of a tracked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordState {
    Active,
    Completed,
    Truncated,
}

/// One appended record awaiting flush acknowledgement.
pub(crate) struct LogRecord {
    pub store_id: u32,
    pub store_seq_num: i64,
    pub payload: Arc<[u8]>,
    pub context: u64,
    pub state: RecordState,
}

impl LogRecord {
    pub(crate) fn size(&self) -> u32 {
        self.payload.len() as u32
    }
}

struct Chunk {
    slots: Vec<Option<LogRecord>>,
    created: usize,
    truncated: usize,
}

impl Chunk {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(CHUNK_RECORDS);
        slots.resize_with(CHUNK_RECORDS, || None);
        Self {
            slots,
            created: 0,
            truncated: 0,
        }
    }
}

/// Chunked record index. Callers provide external synchronisation.
pub(crate) struct RecordTracker {
    /// Log index of slot 0 of the front chunk.
    origin: i64,
    chunks: VecDeque<Chunk>,
}

impl RecordTracker {
    pub(crate) fn new(base_idx: i64) -> Self {
        Self {
            origin: base_idx,
            chunks: VecDeque::new(),
        }
    }

    /// Drop everything and restart the index at `new_base`. Used after a
    /// recovery scan has replayed the persisted tail.
    pub(crate) fn reinit(&mut self, new_base: i64) {
        self.chunks.clear();
        self.origin = new_base;
    }

    /// Insert a record at `idx`. Indices below the current base are
    /// rejected; they were truncated away.
    pub(crate) fn create(&mut self, idx: i64, record: LogRecord) {
        debug_assert!(idx >= self.origin, "create below tracker base");
        let rel = (idx - self.origin) as usize;
        let chunk_no = rel / CHUNK_RECORDS;
        while self.chunks.len() <= chunk_no {
            self.chunks.push_back(Chunk::new());
        }
        let chunk = &mut self.chunks[chunk_no];
        let slot = &mut chunk.slots[rel % CHUNK_RECORDS];
        debug_assert!(slot.is_none(), "duplicate create for idx {idx}");
        *slot = Some(record);
        chunk.created += 1;
    }

    /// Visit records in ascending index order starting at `from`.
    ///
    /// Only a contiguous run of `Active` records is visited: the walk
    /// stops at the first missing or non-active slot, or when the visitor
    /// returns `false`.
    pub(crate) fn foreach_active<F>(&self, from: i64, mut visitor: F)
    where
        F: FnMut(i64, &LogRecord) -> bool,
    {
        let mut idx = from.max(self.origin);
        loop {
            match self.get(idx) {
                Some(rec) if rec.state == RecordState::Active => {
                    if !visitor(idx, rec) {
                        break;
                    }
                }
                _ => break,
            }
            idx += 1;
        }
    }

    /// Mark the inclusive range `[from, upto]` as flushed. Already
    /// completed indices are left untouched.
    pub(crate) fn complete(&mut self, from: i64, upto: i64) {
        for idx in from..=upto {
            if let Some(rec) = self.get_mut(idx) {
                if rec.state == RecordState::Active {
                    rec.state = RecordState::Completed;
                }
            }
        }
    }

    /// Mark every record at or below `upto` truncated and free chunks
    /// whose records are all truncated.
    pub(crate) fn truncate(&mut self, upto: i64) {
        let mut chunk_start = self.origin;
        for chunk in self.chunks.iter_mut() {
            if chunk_start > upto {
                break;
            }
            let last = (upto - chunk_start).min(CHUNK_RECORDS as i64 - 1) as usize;
            for slot in chunk.slots[..=last].iter_mut() {
                if let Some(rec) = slot {
                    if rec.state != RecordState::Truncated {
                        rec.state = RecordState::Truncated;
                        chunk.truncated += 1;
                    }
                }
            }
            chunk_start += CHUNK_RECORDS as i64;
        }

        // Reclaim fully truncated chunks from the front.
        loop {
            let reclaim = match self.chunks.front() {
                Some(front) => {
                    let chunk_end = self.origin + CHUNK_RECORDS as i64 - 1;
                    chunk_end <= upto && front.truncated == front.created
                }
                None => false,
            };
            if !reclaim {
                break;
            }
            self.chunks.pop_front();
            self.origin += CHUNK_RECORDS as i64;
        }
    }

    /// Look up the record at `idx`, if it is still tracked.
    pub(crate) fn at(&self, idx: i64) -> Option<&LogRecord> {
        self.get(idx)
    }

    fn get(&self, idx: i64) -> Option<&LogRecord> {
        if idx < self.origin {
            return None;
        }
        let rel = (idx - self.origin) as usize;
        self.chunks
            .get(rel / CHUNK_RECORDS)?
            .slots[rel % CHUNK_RECORDS]
            .as_ref()
    }

    fn get_mut(&mut self, idx: i64) -> Option<&mut LogRecord> {
        if idx < self.origin {
            return None;
        }
        let rel = (idx - self.origin) as usize;
        self.chunks
            .get_mut(rel / CHUNK_RECORDS)?
            .slots[rel % CHUNK_RECORDS]
            .as_mut()
    }

    #[cfg(test)]
    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(store_id: u32, payload: &[u8]) -> LogRecord {
        LogRecord {
            store_id,
            store_seq_num: 0,
            payload: Arc::from(payload),
            context: 0,
            state: RecordState::Active,
        }
    }

    #[test]
    fn test_create_and_at() {
        let mut tracker = RecordTracker::new(0);
        tracker.create(0, record(1, b"a"));
        tracker.create(1, record(2, b"bb"));

        assert_eq!(tracker.at(0).unwrap().store_id, 1);
        assert_eq!(tracker.at(1).unwrap().size(), 2);
        assert!(tracker.at(2).is_none());
    }

    #[test]
    fn test_foreach_stops_at_hole() {
        let mut tracker = RecordTracker::new(0);
        tracker.create(0, record(1, b"a"));
        tracker.create(1, record(1, b"b"));
        // idx 2 was allocated by another thread but not inserted yet
        tracker.create(3, record(1, b"d"));

        let mut seen = Vec::new();
        tracker.foreach_active(0, |idx, _| {
            seen.push(idx);
            true
        });
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_foreach_respects_visitor_stop() {
        let mut tracker = RecordTracker::new(0);
        for idx in 0..5 {
            tracker.create(idx, record(1, b"x"));
        }
        let mut seen = 0;
        tracker.foreach_active(0, |_, _| {
            seen += 1;
            seen < 3
        });
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_complete_is_idempotent() {
        let mut tracker = RecordTracker::new(0);
        for idx in 0..4 {
            tracker.create(idx, record(1, b"x"));
        }
        tracker.complete(0, 1);
        tracker.complete(0, 3);
        for idx in 0..4 {
            assert_eq!(tracker.at(idx).unwrap().state, RecordState::Completed);
        }

        // completed records are no longer visited
        let mut seen = Vec::new();
        tracker.foreach_active(0, |idx, _| {
            seen.push(idx);
            true
        });
        assert!(seen.is_empty());
    }

    #[test]
    fn test_truncate_reclaims_chunks() {
        let mut tracker = RecordTracker::new(0);
        let total = CHUNK_RECORDS as i64 * 2 + 10;
        for idx in 0..total {
            tracker.create(idx, record(1, b"x"));
        }
        tracker.complete(0, total - 1);
        assert_eq!(tracker.chunk_count(), 3);

        tracker.truncate(CHUNK_RECORDS as i64 * 2 - 1);
        assert_eq!(tracker.chunk_count(), 1);
        assert!(tracker.at(0).is_none());
        assert!(tracker.at(CHUNK_RECORDS as i64 * 2).is_some());
    }

    #[test]
    fn test_truncate_partial_chunk_keeps_rest() {
        let mut tracker = RecordTracker::new(0);
        for idx in 0..10 {
            tracker.create(idx, record(1, b"x"));
        }
        tracker.complete(0, 9);
        tracker.truncate(4);

        assert_eq!(tracker.at(4).unwrap().state, RecordState::Truncated);
        assert_eq!(tracker.at(5).unwrap().state, RecordState::Completed);
    }

    #[test]
    fn test_reinit() {
        let mut tracker = RecordTracker::new(0);
        tracker.create(0, record(1, b"x"));
        tracker.reinit(100);
        assert!(tracker.at(0).is_none());
        tracker.create(100, record(1, b"y"));
        assert!(tracker.at(100).is_some());
    }
}
