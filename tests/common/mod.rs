//! Shared harness for log device integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};
use tempfile::TempDir;

use oxilog::meta::LOGDEV_META_NAME;
use oxilog::{
    FileLogDevice, LogDev, LogDevCallbacks, LogDevConfig, LogDevKey, MemMetaStore, StoreMeta,
};

/// One append acknowledgement as delivered to the completion callback.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub store_id: u32,
    pub key: LogDevKey,
    pub flush_key: LogDevKey,
    pub distance: i64,
    pub context: u64,
}

/// One record replayed by the recovery scan.
#[derive(Debug, Clone)]
pub struct Replayed {
    pub store_id: u32,
    pub seq_num: i64,
    pub key: LogDevKey,
    pub payload: Vec<u8>,
}

/// Backing state that survives simulated restarts: the device file and
/// the metadata service.
pub struct TestEnv {
    pub dir: TempDir,
    pub meta_store: Arc<MemMetaStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            meta_store: Arc::new(MemMetaStore::new()),
        }
    }

    pub fn device_path(&self) -> PathBuf {
        self.dir.path().join("wal.dat")
    }
}

/// A log device instance wired to channel-backed callbacks.
pub struct TestLogDev {
    pub logdev: LogDev<FileLogDevice, MemMetaStore>,
    pub completions: Receiver<Completion>,
    pub replayed: Arc<Mutex<Vec<Replayed>>>,
    pub stores_found: Arc<Mutex<Vec<(u32, StoreMeta)>>>,
}

impl TestLogDev {
    /// Build a log device over the environment's file. `start` is left to
    /// the caller so restart flows can deliver metadata first.
    pub fn open(env: &TestEnv, config: LogDevConfig) -> Self {
        let device = Arc::new(
            FileLogDevice::open_with_align(env.device_path(), true, config.dma_boundary)
                .expect("open device file"),
        );

        let (completion_tx, completions) = unbounded();
        let replayed = Arc::new(Mutex::new(Vec::new()));
        let stores_found = Arc::new(Mutex::new(Vec::new()));

        let replayed_sink = Arc::clone(&replayed);
        let stores_sink = Arc::clone(&stores_found);
        let callbacks = LogDevCallbacks::new(
            Box::new(move |store_id, key, flush_key, distance, context| {
                let _ = completion_tx.send(Completion {
                    store_id,
                    key,
                    flush_key,
                    distance,
                    context,
                });
            }),
            Box::new(move |store_id, meta| {
                stores_sink.lock().unwrap().push((store_id, *meta));
            }),
            Box::new(move |store_id, seq_num, key, payload| {
                replayed_sink.lock().unwrap().push(Replayed {
                    store_id,
                    seq_num,
                    key,
                    payload: payload.to_vec(),
                });
            }),
        );

        let logdev = LogDev::new(device, Arc::clone(&env.meta_store), config, callbacks);
        Self {
            logdev,
            completions,
            replayed,
            stores_found,
        }
    }

    /// Simulate the host finding the persisted superblock on restart and
    /// handing it back before `start(false)`.
    pub fn deliver_persisted_meta(&self, env: &TestEnv) {
        let (cookie, buf) = env
            .meta_store
            .find(LOGDEV_META_NAME)
            .expect("persisted superblock");
        self.logdev.meta_blk_found(buf, cookie);
    }

    /// Wait for exactly `n` completions.
    pub fn wait_completions(&self, n: usize) -> Vec<Completion> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(
                self.completions
                    .recv_timeout(Duration::from_secs(10))
                    .expect("append completion"),
            );
        }
        out
    }
}

/// A config that flushes eagerly so every test append becomes durable
/// without waiting on the timer.
pub fn eager_flush_config() -> LogDevConfig {
    LogDevConfig {
        flush_data_threshold_size: 1,
        flush_timer_frequency_us: 1_000,
        max_time_between_flush_us: 500,
        ..LogDevConfig::default()
    }
}

/// Deterministic payload for a record index.
pub fn payload_for(idx: u64, len: usize) -> Arc<[u8]> {
    let bytes: Vec<u8> = (0..len).map(|n| (idx as usize + n) as u8).collect();
    Arc::from(bytes.into_boxed_slice())
}
