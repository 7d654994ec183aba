//! Truncation and store-id reclaim.

mod common;

use common::{eager_flush_config, payload_for, Completion, TestEnv, TestLogDev};

/// Append records for `store_id` one flush apart, returning their keys.
fn append_flushed(t: &TestLogDev, store_id: u32, from_seq: i64, count: u64) -> Vec<Completion> {
    let mut completions = Vec::with_capacity(count as usize);
    for n in 0..count {
        t.logdev
            .append_async(store_id, from_seq + n as i64, payload_for(n, 64), n)
            .unwrap();
        completions.push(t.wait_completions(1).pop().unwrap());
    }
    completions
}

#[test]
fn test_truncate_reclaims_garbage_store_ids() {
    let env = TestEnv::new();
    let t = TestLogDev::open(&env, eager_flush_config());
    t.logdev.start(true).unwrap();

    let a = t.logdev.reserve_store_id().unwrap();
    let b = t.logdev.reserve_store_id().unwrap();
    assert_ne!(a, b);

    let first_half = append_flushed(&t, a, 0, 50);
    drop(first_half);

    // the owner walks away from store A; its id is only garbage-marked
    t.logdev.unreserve_store_id(a);
    let (registered, garbage) = t.logdev.get_registered_store_ids();
    assert!(registered.contains(&a));
    assert_eq!(garbage, vec![a]);

    let second_half = append_flushed(&t, b, 0, 50);

    // cut past the garbage marker
    let persists_before = env.meta_store.persist_count();
    let cut = &second_half[10]; // idx 60
    t.logdev.truncate(&cut.key).unwrap();

    assert_eq!(t.logdev.last_truncate_idx(), cut.key.idx);
    assert_eq!(env.meta_store.persist_count(), persists_before + 1);

    let (registered, garbage) = t.logdev.get_registered_store_ids();
    assert!(!registered.contains(&a));
    assert!(garbage.is_empty());

    // A is reusable now
    assert_eq!(t.logdev.reserve_store_id().unwrap(), a);

    // records above the cut remain readable
    let above = &second_half[20];
    assert_eq!(
        t.logdev.read(&above.key).unwrap()[..],
        payload_for(20, 64)[..]
    );

    t.logdev.stop();
}

#[test]
fn test_truncate_below_marker_keeps_garbage() {
    let env = TestEnv::new();
    let t = TestLogDev::open(&env, eager_flush_config());
    t.logdev.start(true).unwrap();

    let a = t.logdev.reserve_store_id().unwrap();
    let completions = append_flushed(&t, a, 0, 20);

    t.logdev.unreserve_store_id(a); // marker at idx 19

    // cut below the marker: the id must survive
    t.logdev.truncate(&completions[10].key).unwrap();
    let (registered, garbage) = t.logdev.get_registered_store_ids();
    assert!(registered.contains(&a));
    assert_eq!(garbage, vec![a]);

    t.logdev.stop();
}

#[test]
fn test_restart_scans_from_truncation_point() {
    let env = TestEnv::new();

    let first = TestLogDev::open(&env, eager_flush_config());
    first.logdev.start(true).unwrap();
    let completions = append_flushed(&first, 1, 0, 30);
    first.logdev.truncate(&completions[19].key).unwrap();
    first.logdev.stop();
    drop(first);

    let second = TestLogDev::open(&env, eager_flush_config());
    second.deliver_persisted_meta(&env);
    second.logdev.start(false).unwrap();

    // replay starts at the truncation point, not at device offset zero
    let replayed = second.replayed.lock().unwrap();
    assert_eq!(replayed.first().unwrap().key.idx, 19);
    assert_eq!(replayed.last().unwrap().key.idx, 29);
    drop(replayed);
    assert_eq!(second.logdev.log_idx(), 30);

    second.logdev.stop();
}
