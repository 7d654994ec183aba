//! Persistent log device metadata.
//!
//! The superblock records the set of reserved store ids, a fixed-size
//! opaque metadata blob per store, and the device offset recovery should
//! scan from. It is persisted through a [`MetaStore`], which hands back a
//! cookie on first registration; later persists update in place through
//! that cookie.
//!
//! The superblock buffer is variable length: its slot capacity tracks the
//! highest reserved id plus one, growing and shrinking as ids come and go.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::Mutex;

use crate::buffer::round_up;
use crate::error::{LogDevError, Result};
use crate::id_reserver::IdReserver;

/// Name under which the superblock registers with the metadata service.
pub const LOGDEV_META_NAME: &str = "LOG_DEV";

/// Magic word at the start of the superblock.
pub const LOGDEV_SB_MAGIC: [u8; 8] = *b"OXLGSB1\0";

/// Current superblock format version.
pub const LOGDEV_SB_VERSION: u32 = 1;

/// Opaque fixed-size metadata blob kept per reserved store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMeta {
    bytes: [u8; Self::SIZE],
}

impl StoreMeta {
    /// Encoded size of one slot.
    pub const SIZE: usize = 32;

    const SENTINEL: [u8; Self::SIZE] = [0xFF; Self::SIZE];

    /// Wrap caller-provided metadata bytes. All-ones is reserved as the
    /// empty-slot sentinel and is rejected.
    pub fn new(bytes: [u8; Self::SIZE]) -> Option<Self> {
        let meta = Self { bytes };
        meta.is_valid().then_some(meta)
    }

    /// Freshly initialised metadata for a newly reserved store.
    pub fn zeroed() -> Self {
        Self {
            bytes: [0; Self::SIZE],
        }
    }

    pub(crate) fn sentinel() -> Self {
        Self {
            bytes: Self::SENTINEL,
        }
    }

    /// Whether the slot holds a reserved store.
    pub fn is_valid(&self) -> bool {
        self.bytes != Self::SENTINEL
    }

    /// Raw slot bytes.
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.bytes
    }

    fn from_slice(slice: &[u8]) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        bytes.copy_from_slice(slice);
        Self { bytes }
    }
}

/// Opaque handle identifying a registered superblock at the metadata
/// service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetaCookie(u64);

impl MetaCookie {
    /// Build a cookie from a raw service handle.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw service handle.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MetaCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "meta-cookie#{}", self.0)
    }
}

/// Metadata blob persistence service.
pub trait MetaStore: Send + Sync + 'static {
    /// Register a named sub-superblock, returning its cookie.
    fn add_sub_sb(&self, name: &str, buf: &[u8]) -> Result<MetaCookie>;

    /// Rewrite a previously registered sub-superblock.
    fn update_sub_sb(&self, buf: &[u8], cookie: MetaCookie) -> Result<()>;

    /// Whether a buffer of `size` bytes must be alignment-padded before
    /// being handed to the service.
    fn is_aligned_buf_needed(&self, size: usize) -> bool;
}

/// In-memory metadata service for tests and hosts without a persistent
/// metadata manager.
pub struct MemMetaStore {
    inner: Mutex<MemMetaInner>,
}

struct MemMetaInner {
    next_cookie: u64,
    blobs: HashMap<u64, (String, Vec<u8>)>,
    persist_count: u64,
}

impl MemMetaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemMetaInner {
                next_cookie: 1,
                blobs: HashMap::new(),
                persist_count: 0,
            }),
        }
    }

    /// Fetch a registered blob by name, as a host would on restart before
    /// handing it back via `meta_blk_found`.
    pub fn find(&self, name: &str) -> Option<(MetaCookie, Vec<u8>)> {
        let inner = self.inner.lock();
        inner
            .blobs
            .iter()
            .find(|(_, (n, _))| n == name)
            .map(|(cookie, (_, buf))| (MetaCookie(*cookie), buf.clone()))
    }

    /// Number of persist operations performed.
    pub fn persist_count(&self) -> u64 {
        self.inner.lock().persist_count
    }
}

impl Default for MemMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore for MemMetaStore {
    fn add_sub_sb(&self, name: &str, buf: &[u8]) -> Result<MetaCookie> {
        let mut inner = self.inner.lock();
        let cookie = inner.next_cookie;
        inner.next_cookie += 1;
        inner.blobs.insert(cookie, (name.to_string(), buf.to_vec()));
        inner.persist_count += 1;
        Ok(MetaCookie(cookie))
    }

    fn update_sub_sb(&self, buf: &[u8], cookie: MetaCookie) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.blobs.get_mut(&cookie.0) {
            Some((_, stored)) => {
                *stored = buf.to_vec();
            }
            None => return Err(LogDevError::Superblock("unknown meta cookie")),
        }
        inner.persist_count += 1;
        Ok(())
    }

    fn is_aligned_buf_needed(&self, size: usize) -> bool {
        size >= 4096
    }
}

/// Superblock header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SuperblkHeader {
    version: u32,
    num_stores: u32,
    start_dev_offset: u64,
}

impl SuperblkHeader {
    const ENCODED_SIZE: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        buf[..Self::ENCODED_SIZE].fill(0);
        buf[..8].copy_from_slice(&LOGDEV_SB_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.num_stores.to_le_bytes());
        buf[16..24].copy_from_slice(&self.start_dev_offset.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(LogDevError::Superblock("superblock too small"));
        }
        if buf[..8] != LOGDEV_SB_MAGIC {
            return Err(LogDevError::Superblock("superblock magic mismatch"));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version > LOGDEV_SB_VERSION {
            return Err(LogDevError::Superblock("superblock version mismatch"));
        }
        Ok(Self {
            version,
            num_stores: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            start_dev_offset: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

/// Owned superblock state plus the id reserver it feeds.
pub(crate) struct LogDevMetadata<M: MetaStore> {
    meta_store: std::sync::Arc<M>,
    raw: Vec<u8>,
    cookie: Option<MetaCookie>,
    id_reserver: Option<IdReserver>,
    store_info: BTreeSet<u32>,
    max_stores: u32,
}

impl<M: MetaStore> LogDevMetadata<M> {
    pub(crate) fn new(meta_store: std::sync::Arc<M>, max_stores: u32) -> Self {
        Self {
            meta_store,
            raw: Vec::new(),
            cookie: None,
            id_reserver: None,
            store_info: BTreeSet::new(),
            max_stores,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Accept a previously persisted superblock handed back by the host.
    pub(crate) fn meta_buf_found(&mut self, buf: Vec<u8>, cookie: MetaCookie) {
        self.raw = buf;
        self.cookie = Some(cookie);
    }

    /// Initialise a fresh superblock with no stores and persist it.
    pub(crate) fn create(&mut self) -> Result<()> {
        self.raw = vec![0u8; self.required_sb_size(0)];
        let header = SuperblkHeader {
            version: LOGDEV_SB_VERSION,
            num_stores: 0,
            start_dev_offset: 0,
        };
        header.encode(&mut self.raw);
        self.id_reserver = Some(IdReserver::new(self.max_stores));
        self.persist()
    }

    /// Rebuild in-memory state from a superblock delivered via
    /// [`Self::meta_buf_found`], returning the reserved `(id, meta)` pairs.
    pub(crate) fn load(&mut self) -> Result<Vec<(u32, StoreMeta)>> {
        if self.raw.is_empty() {
            return Err(LogDevError::Superblock("load called without metadata"));
        }
        let header = SuperblkHeader::decode(&self.raw)?;
        let mut reserver = IdReserver::new(self.max_stores);
        self.store_info.clear();

        let capacity = self.capacity();
        let mut found = Vec::with_capacity(header.num_stores as usize);
        let mut id = 0u32;
        while (found.len() as u32) < header.num_stores && id < capacity {
            let meta = self.slot(id);
            if meta.is_valid() {
                reserver.reserve_id(id)?;
                self.store_info.insert(id);
                found.push((id, meta));
            }
            id += 1;
        }
        if (found.len() as u32) < header.num_stores {
            return Err(LogDevError::Superblock("store count exceeds valid slots"));
        }

        self.id_reserver = Some(reserver);
        Ok(found)
    }

    /// Reserve the lowest free store id and initialise its slot.
    pub(crate) fn reserve_store(&mut self, persist_now: bool) -> Result<u32> {
        let id = self.reserver()?.reserve()?;
        self.store_info.insert(id);

        self.resize_if_needed();
        self.set_slot(id, StoreMeta::zeroed());
        self.bump_num_stores(1);
        if persist_now {
            self.persist()?;
        }
        Ok(id)
    }

    /// Release a store id. If the buffer shrinks the slot disappears with
    /// it, otherwise the slot is cleared back to the sentinel.
    pub(crate) fn unreserve_store(&mut self, id: u32, persist_now: bool) -> Result<()> {
        self.reserver()?.unreserve(id);
        self.store_info.remove(&id);

        let shrunk = self.resize_if_needed();
        if !shrunk {
            self.set_slot(id, StoreMeta::sentinel());
        }
        self.bump_num_stores(-1);
        if persist_now {
            self.persist()?;
        }
        Ok(())
    }

    /// Overwrite the metadata slot of a store.
    pub(crate) fn update_store_meta(
        &mut self,
        id: u32,
        meta: StoreMeta,
        persist_now: bool,
    ) -> Result<()> {
        self.store_info.insert(id);
        self.resize_if_needed();
        self.set_slot(id, meta);
        if persist_now {
            self.persist()?;
        }
        Ok(())
    }

    /// Record the device offset recovery should scan from.
    pub(crate) fn update_start_dev_offset(&mut self, offset: u64, persist_now: bool) -> Result<()> {
        let mut header = SuperblkHeader::decode(&self.raw)?;
        header.start_dev_offset = offset;
        header.encode(&mut self.raw);
        if persist_now {
            self.persist()?;
        }
        Ok(())
    }

    pub(crate) fn start_dev_offset(&self) -> u64 {
        SuperblkHeader::decode(&self.raw)
            .map(|h| h.start_dev_offset)
            .unwrap_or(0)
    }

    pub(crate) fn num_stores(&self) -> u32 {
        SuperblkHeader::decode(&self.raw)
            .map(|h| h.num_stores)
            .unwrap_or(0)
    }

    pub(crate) fn reserved_store_ids(&self) -> Vec<u32> {
        self.store_info.iter().copied().collect()
    }

    pub(crate) fn store_meta(&self, id: u32) -> Option<StoreMeta> {
        (id < self.capacity()).then(|| self.slot(id))
    }

    /// Write the superblock through the metadata service. The first call
    /// registers it and keeps the returned cookie; later calls update in
    /// place.
    pub(crate) fn persist(&mut self) -> Result<()> {
        match self.cookie {
            Some(cookie) => self.meta_store.update_sub_sb(&self.raw, cookie)?,
            None => {
                self.cookie = Some(self.meta_store.add_sub_sb(LOGDEV_META_NAME, &self.raw)?);
            }
        }
        Ok(())
    }

    /// Drop all in-memory state.
    pub(crate) fn reset(&mut self) {
        self.raw.clear();
        self.cookie = None;
        self.id_reserver = None;
        self.store_info.clear();
    }

    /// Grow or shrink the buffer so its slot capacity tracks the highest
    /// reserved id plus one. Preserved slots are copied over; fresh slots
    /// start at the sentinel. Returns whether the buffer shrank.
    fn resize_if_needed(&mut self) -> bool {
        let needed_slots = self
            .store_info
            .iter()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(0);
        let required = self.required_sb_size(needed_slots);
        if required == self.raw.len() {
            return false;
        }

        let shrinking = required < self.raw.len();
        let mut fresh = vec![0u8; required];
        for chunk in fresh[SuperblkHeader::ENCODED_SIZE..].chunks_exact_mut(StoreMeta::SIZE) {
            chunk.copy_from_slice(StoreMeta::sentinel().as_bytes());
        }
        let copy = self.raw.len().min(required);
        fresh[..copy].copy_from_slice(&self.raw[..copy]);
        self.raw = fresh;
        shrinking
    }

    fn required_sb_size(&self, slots: u32) -> usize {
        let size = SuperblkHeader::ENCODED_SIZE + slots as usize * StoreMeta::SIZE;
        if self.meta_store.is_aligned_buf_needed(size) {
            round_up(size, 512)
        } else {
            size
        }
    }

    fn capacity(&self) -> u32 {
        (self.raw.len().saturating_sub(SuperblkHeader::ENCODED_SIZE) / StoreMeta::SIZE) as u32
    }

    fn slot(&self, id: u32) -> StoreMeta {
        let at = SuperblkHeader::ENCODED_SIZE + id as usize * StoreMeta::SIZE;
        StoreMeta::from_slice(&self.raw[at..at + StoreMeta::SIZE])
    }

    fn set_slot(&mut self, id: u32, meta: StoreMeta) {
        let at = SuperblkHeader::ENCODED_SIZE + id as usize * StoreMeta::SIZE;
        self.raw[at..at + StoreMeta::SIZE].copy_from_slice(meta.as_bytes());
    }

    fn bump_num_stores(&mut self, delta: i64) {
        let mut header = SuperblkHeader::decode(&self.raw).expect("superblock header intact");
        header.num_stores = (header.num_stores as i64 + delta) as u32;
        header.encode(&mut self.raw);
    }

    fn reserver(&mut self) -> Result<&mut IdReserver> {
        self.id_reserver
            .as_mut()
            .ok_or(LogDevError::Superblock("metadata not created or loaded"))
    }
}
