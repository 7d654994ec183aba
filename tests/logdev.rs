//! Append, flush and read flows over a file-backed device.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{eager_flush_config, payload_for, TestEnv, TestLogDev};
use oxilog::{LogDevConfig, LogDevError, LogDevKey};

#[test]
fn test_format_single_append_read() {
    let env = TestEnv::new();
    let t = TestLogDev::open(&env, eager_flush_config());
    t.logdev.start(true).unwrap();

    let idx = t
        .logdev
        .append_async(7, 0, Arc::from(&b"hello"[..]), 99)
        .unwrap();
    assert_eq!(idx, 0);

    let completion = t.wait_completions(1).pop().unwrap();
    assert_eq!(completion.store_id, 7);
    assert_eq!(completion.key.idx, 0);
    assert_eq!(completion.key.dev_offset, 0);
    assert_eq!(completion.distance, 0);
    assert_eq!(completion.context, 99);

    let data = t.logdev.read(&completion.key).unwrap();
    assert_eq!(data, b"hello");
    assert_eq!(t.logdev.last_flush_idx(), 0);
    assert_eq!(t.logdev.num_stores(), 0);

    t.logdev.stop();
}

#[test]
fn test_parallel_appends_cover_contiguous_range() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 125;
    const TOTAL: u64 = THREADS * PER_THREAD;

    let env = TestEnv::new();
    let t = TestLogDev::open(&env, eager_flush_config());
    t.logdev.start(true).unwrap();

    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let logdev = &t.logdev;
            scope.spawn(move || {
                for n in 0..PER_THREAD {
                    let context = thread * PER_THREAD + n;
                    logdev
                        .append_async(thread as u32, n as i64, payload_for(context, 128), context)
                        .unwrap();
                }
            });
        }
    });

    let completions = t.wait_completions(TOTAL as usize);

    // every index in [0, TOTAL) acknowledged exactly once
    let mut indices: Vec<i64> = completions.iter().map(|c| c.key.idx).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..TOTAL as i64).collect::<Vec<_>>());

    // payloads read back by the key handed to the completion
    let by_context: HashMap<u64, LogDevKey> =
        completions.iter().map(|c| (c.context, c.key)).collect();
    for context in (0..TOTAL).step_by(53) {
        let key = by_context[&context];
        let data = t.logdev.read(&key).unwrap();
        assert_eq!(data[..], payload_for(context, 128)[..]);
    }

    let stats = t.logdev.stats();
    assert_eq!(stats.records_flushed, TOTAL);
    assert_eq!(stats.max_inflight_flushes, 1);
    assert!(stats.groups_written as usize <= TOTAL as usize);

    t.logdev.stop();
}

#[test]
fn test_large_payload_goes_out_of_band() {
    let env = TestEnv::new();
    let config = eager_flush_config();
    let t = TestLogDev::open(&env, config.clone());
    t.logdev.start(true).unwrap();

    // larger than both the inline threshold and the initial read size
    let large = payload_for(1, config.initial_read_size * 3);
    t.logdev
        .append_async(3, 0, Arc::clone(&large), 1)
        .unwrap();
    let completion = t.wait_completions(1).pop().unwrap();

    let data = t.logdev.read(&completion.key).unwrap();
    assert_eq!(data[..], large[..]);

    t.logdev.stop();
}

#[test]
fn test_mixed_sizes_in_one_batch() {
    let env = TestEnv::new();
    let config = LogDevConfig {
        // hold the batch until everything below is appended
        flush_data_threshold_size: 1 << 30,
        flush_timer_frequency_us: 5_000,
        max_time_between_flush_us: 50_000,
        ..LogDevConfig::default()
    };
    let t = TestLogDev::open(&env, config.clone());
    t.logdev.start(true).unwrap();

    let sizes = [1usize, 64, 511, 512, 513, 4096, 9000];
    for (n, size) in sizes.iter().enumerate() {
        t.logdev
            .append_async(1, n as i64, payload_for(n as u64, *size), n as u64)
            .unwrap();
    }

    let completions = t.wait_completions(sizes.len());
    // a single group carried all of them
    let flush_key = completions[0].flush_key;
    assert!(completions.iter().all(|c| c.flush_key == flush_key));

    for completion in &completions {
        let data = t.logdev.read(&completion.key).unwrap();
        let expected = payload_for(completion.context, sizes[completion.context as usize]);
        assert_eq!(data[..], expected[..]);
    }

    t.logdev.stop();
}

#[test]
fn test_read_with_bogus_offset_is_magic_mismatch() {
    let env = TestEnv::new();
    let t = TestLogDev::open(&env, eager_flush_config());
    t.logdev.start(true).unwrap();

    t.logdev
        .append_async(1, 0, payload_for(0, 64), 0)
        .unwrap();
    let completion = t.wait_completions(1).pop().unwrap();

    // an offset pointing into the middle of the group is not a header
    let bogus = LogDevKey {
        idx: 0,
        dev_offset: completion.key.dev_offset + 64,
    };
    assert!(matches!(
        t.logdev.read(&bogus),
        Err(LogDevError::MagicMismatch { .. })
    ));

    t.logdev.stop();
}

#[test]
fn test_read_index_outside_group_rejected() {
    let env = TestEnv::new();
    let t = TestLogDev::open(&env, eager_flush_config());
    t.logdev.start(true).unwrap();

    t.logdev
        .append_async(1, 0, payload_for(0, 64), 0)
        .unwrap();
    let completion = t.wait_completions(1).pop().unwrap();

    let wrong_idx = LogDevKey {
        idx: 500,
        dev_offset: completion.key.dev_offset,
    };
    assert!(matches!(
        t.logdev.read(&wrong_idx),
        Err(LogDevError::KeyOutOfRange { .. })
    ));

    t.logdev.stop();
}
