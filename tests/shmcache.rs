use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use shmcache::{
    CacheError, Config, HeapSegments, ManualClock, ShmCache, ShmCacheBuilder,
    ValueAllocatorPolicy, MAX_KEY_SIZE, OPTIONS_STRING,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// 3 stripings of 1024 bytes per segment, 4 segments at most.
fn small_config() -> Config {
    Config {
        max_memory: 4 * 4096,
        segment_size: 4096,
        striping_size: 1024,
        max_key_count: 100,
        max_value_size: 512,
        va_policy: ValueAllocatorPolicy {
            sleep_us_when_recycle_valid_entries: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn roomy_config() -> Config {
    Config {
        max_memory: 4 * 1024 * 1024,
        segment_size: 256 * 1024,
        striping_size: 16 * 1024,
        max_key_count: 1000,
        max_value_size: 1024,
        ..Default::default()
    }
}

fn open(config: Config, clock: &ManualClock) -> ShmCache {
    ShmCacheBuilder::new(config)
        .set_clock(clock.clone())
        .build(HeapSegments::new())
        .unwrap()
}

#[test]
fn test_key_limit_evicts_oldest() {
    init_tracing();
    let clock = ManualClock::new(1000);
    let cache = open(
        Config {
            max_key_count: 2,
            recycle_key_once: 1,
            ..small_config()
        },
        &clock,
    );

    cache.set(b"a", b"1", OPTIONS_STRING, 0).unwrap();
    cache.set(b"b", b"2", OPTIONS_STRING, 0).unwrap();
    // Replacing at the limit evicts nothing.
    cache.set(b"b", b"22", OPTIONS_STRING, 0).unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats(false).recycle_key.total, 0);

    cache.set(b"c", b"3", OPTIONS_STRING, 0).unwrap();
    assert_eq!(cache.len(), 2);
    assert!(matches!(cache.get(b"a"), Err(CacheError::NotFound)));
    assert_eq!(cache.get(b"b").unwrap().data, b"22");
    assert_eq!(cache.get(b"c").unwrap().data, b"3");

    let stats = cache.stats(false);
    assert_eq!(stats.recycle_key.total, 1);
    assert_eq!(stats.recycle_key.success, 1);
    assert_eq!(stats.recycle_key.force, 1);
    assert_eq!(stats.clear_ht_entry_total, 1);
    assert_eq!(stats.clear_ht_entry_valid, 1);
    cache.check_invariants().unwrap();
}

#[test]
fn test_expired_entries() {
    let clock = ManualClock::new(1000);
    let cache = open(small_config(), &clock);

    cache.set(b"soon", b"v", OPTIONS_STRING, 1005).unwrap();
    cache.set(b"never", b"v", OPTIONS_STRING, 0).unwrap();
    assert!(cache.get(b"soon").is_ok());

    clock.set(1005);
    match cache.get(b"soon") {
        Err(CacheError::Expired(v)) => {
            assert_eq!(v.data, b"v");
            assert_eq!(v.expires, 1005);
        }
        r => panic!("unexpected {:?}", r),
    }
    assert!(cache.get(b"soon").unwrap_err().is_miss());
    assert!(cache.get(b"never").is_ok());
    // Still counted until removed.
    assert_eq!(cache.len(), 2);
    assert!(matches!(
        cache.set_expires(b"soon", 0),
        Err(CacheError::NotFound)
    ));

    cache.set_expires(b"never", 2000).unwrap();
    clock.set(2000);
    assert!(matches!(cache.get(b"never"), Err(CacheError::Expired(_))));
    cache.delete(b"never").unwrap();
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_rejected_writes_change_nothing() {
    let clock = ManualClock::new(1);
    let cache = open(small_config(), &clock);
    cache.set(b"k", b"v", OPTIONS_STRING, 0).unwrap();
    let before = cache.stats(false);

    let long_key = vec![b'x'; MAX_KEY_SIZE + 1];
    assert!(matches!(
        cache.set(&long_key, b"v", OPTIONS_STRING, 0),
        Err(CacheError::KeyTooLong { len, max }) if len == MAX_KEY_SIZE + 1 && max == MAX_KEY_SIZE
    ));
    assert!(matches!(
        cache.set(b"k", &[0; 513], OPTIONS_STRING, 0),
        Err(CacheError::ValueTooLong { len: 513, max: 512 })
    ));
    // A key of exactly the limit is fine.
    let max_key = vec![b'y'; MAX_KEY_SIZE];
    cache.set(&max_key, &[1; 512], OPTIONS_STRING, 0).unwrap();
    cache.delete(&max_key).unwrap();

    let after = cache.stats(false);
    assert_eq!(after.key_count, before.key_count);
    assert_eq!(after.memory.used_entry, before.memory.used_entry);
    assert_eq!(after.set.total, before.set.total + 3);
    assert_eq!(after.set.success, before.set.success + 1);
    assert_eq!(cache.get(b"k").unwrap().data, b"v");
    assert!(matches!(cache.get(&long_key), Err(CacheError::NotFound)));
    cache.check_invariants().unwrap();
}

#[test]
fn test_replace_and_clear() {
    let clock = ManualClock::new(1);
    let cache = open(roomy_config(), &clock);
    for i in 0..50 {
        cache
            .set(format!("key-{}", i).as_bytes(), b"first", OPTIONS_STRING, 0)
            .unwrap();
    }
    for i in 0..50 {
        cache
            .set(format!("key-{}", i).as_bytes(), b"second", 7, 0)
            .unwrap();
    }
    assert_eq!(cache.len(), 50);
    let v = cache.get(b"key-17").unwrap();
    assert_eq!(v.data, b"second");
    assert_eq!(v.options, 7);
    cache.check_invariants().unwrap();

    clock.set(50);
    assert_eq!(cache.clear().unwrap(), 50);
    assert!(cache.is_empty());
    assert!(cache.get(b"key-17").is_err());
    let stats = cache.stats(false);
    assert_eq!(stats.last_clear_time, 50);
    assert_eq!(stats.memory.used_entry, 0);
    assert_eq!(stats.done_stripings, 0);
    assert_eq!(stats.doing_stripings, stats.striping_count as usize);
    cache.check_invariants().unwrap();

    assert_eq!(cache.clear().unwrap(), 0);
}

#[test]
fn test_space_recycling_keeps_writes_working() {
    init_tracing();
    let clock = ManualClock::new(1);
    let cache = open(small_config(), &clock);
    // Two entries per striping, 24 at most.
    for i in 0..100u32 {
        cache
            .set(format!("{}", i).as_bytes(), &[i as u8; 400], OPTIONS_STRING, 0)
            .unwrap();
        assert_eq!(cache.get(format!("{}", i).as_bytes()).unwrap().data, vec![i as u8; 400]);
    }
    assert!(cache.len() <= 24);
    assert!(cache.get(b"0").is_err());

    let stats = cache.stats(false);
    assert_eq!(stats.segment_count, 4);
    assert!(stats.recycle_striping.total > 0);
    assert_eq!(stats.recycle_striping.total, stats.recycle_striping.success);
    assert!(stats.clear_ht_entry_total >= 76);
    assert!(stats.memory.used_entry <= stats.memory.alloced);
    cache.check_invariants().unwrap();
}

#[test]
fn test_avg_key_ttl_recycles_before_growing() {
    let entry = [0u8; 400];
    for (ttl, segments) in [(10, 1), (0, 2)] {
        let clock = ManualClock::new(100);
        let mut config = small_config();
        config.va_policy.avg_key_ttl = ttl;
        let cache = open(config, &clock);

        // Fill the three stripings of the first segment.
        for i in 0..6u8 {
            cache.set(&[i], &entry, OPTIONS_STRING, 0).unwrap();
        }
        assert_eq!(cache.stats(false).segment_count, 1);

        clock.advance(60);
        cache.set(b"late", &entry, OPTIONS_STRING, 0).unwrap();
        let stats = cache.stats(false);
        assert_eq!(stats.segment_count, segments);
        if ttl > 0 {
            assert_eq!(stats.recycle_striping.success, 1);
            assert!(cache.get(&[0]).is_err());
            assert!(cache.get(&[1]).is_err());
            assert_eq!(cache.len(), 5);
        } else {
            assert_eq!(stats.recycle_striping.total, 0);
            assert_eq!(cache.len(), 7);
        }
        assert!(cache.get(b"late").is_ok());
        cache.check_invariants().unwrap();
    }
}

#[test]
fn test_incr() {
    let clock = ManualClock::new(1);
    let cache = open(small_config(), &clock);
    assert_eq!(cache.incr(b"n", 1, 0).unwrap(), 1);
    assert_eq!(cache.incr(b"n", 41, 0).unwrap(), 42);
    assert_eq!(cache.get(b"n").unwrap().data, b"42");

    cache.set(b"m", b" 9 ", OPTIONS_STRING, 0).unwrap();
    assert_eq!(cache.incr(b"m", 1, 0).unwrap(), 10);

    cache.set(b"bad", b"nine", OPTIONS_STRING, 0).unwrap();
    assert!(matches!(cache.incr(b"bad", 1, 0), Err(CacheError::NotAnInteger)));
    assert_eq!(cache.get(b"bad").unwrap().data, b"nine");

    cache.set(b"max", i64::MAX.to_string().as_bytes(), OPTIONS_STRING, 0).unwrap();
    assert_eq!(cache.incr(b"max", 1, 0).unwrap(), i64::MIN);
}

#[test]
fn test_stats_hit_ratio() {
    let clock = ManualClock::new(1000);
    let cache = open(small_config(), &clock);
    cache.stats(true);
    cache.set(b"k", b"v", OPTIONS_STRING, 0).unwrap();
    for _ in 0..3 {
        cache.get(b"k").unwrap();
    }
    let _ = cache.get(b"missing");

    clock.advance(2);
    let stats = cache.stats(true);
    assert_eq!(stats.get.total, 4);
    assert_eq!(stats.get.success, 3);
    assert_eq!(stats.hit_ratio, Some(0.75));
    assert_eq!(stats.get_qps, Some(2.0));
    assert_eq!(stats.max_key_count, 100);
    assert_eq!(stats.capacity, 101);
    assert_eq!(stats.init_time, 1000);
    assert!(stats.lock.total >= 1);

    // Nothing since the last window.
    assert_eq!(cache.stats(true).hit_ratio, None);

    let lock_total = cache.stats(false).lock.total;
    cache.clear_stats().unwrap();
    let stats = cache.stats(false);
    assert_eq!(stats.get.total, 0);
    assert_eq!(stats.set.total, 0);
    assert!(stats.lock.total > lock_total);
    assert_eq!(stats.key_count, 1);
}

#[cfg(feature = "serde")]
#[test]
fn test_stats_serialize() {
    let clock = ManualClock::new(1);
    let cache = open(small_config(), &clock);
    let json = serde_json::to_value(cache.stats(false)).unwrap();
    assert_eq!(json["max_key_count"], 100);
    assert!(json["memory"]["alloced"].as_i64().unwrap() > 0);
}

#[test]
fn test_handles_share_a_region() {
    let clock = ManualClock::new(1);
    let heap = Arc::new(HeapSegments::new());
    let a = ShmCacheBuilder::new(small_config())
        .set_clock(clock.clone())
        .build(heap.clone())
        .unwrap();
    // The creator's geometry wins.
    let b = ShmCacheBuilder::new(Config {
        max_key_count: 5000,
        ..small_config()
    })
    .set_clock(clock.clone())
    .build(heap.clone())
    .unwrap();
    assert_eq!(b.max_key_count(), 100);
    assert_eq!(a.capacity(), b.capacity());

    a.set(b"from-a", b"1", OPTIONS_STRING, 0).unwrap();
    assert_eq!(b.get(b"from-a").unwrap().data, b"1");

    // b creates segments a has never seen.
    for i in 0..20u8 {
        b.set(&[i], &[i; 400], OPTIONS_STRING, 0).unwrap();
    }
    assert!(heap.value_segment_count() > 1);
    assert_eq!(a.get(&[19]).unwrap().data, vec![19; 400]);
    assert_eq!(a.len(), b.len());

    b.delete(b"from-a").ok();
    assert!(a.get(b"from-a").is_err());
    assert_eq!(a.stats(false).set.total, b.stats(false).set.total);
    a.check_invariants().unwrap();
}

#[test]
fn test_readers_during_writes() {
    let cache = ShmCache::open(roomy_config(), HeapSegments::new()).unwrap();
    let keys: Vec<String> = (0..16).map(|i| format!("key-{:02}", i)).collect();
    for k in &keys {
        cache.set(k.as_bytes(), k.as_bytes(), OPTIONS_STRING, 0).unwrap();
    }
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                let mut hits = 0;
                while !done.load(Ordering::Acquire) {
                    for k in &keys {
                        let v = cache.get(k.as_bytes()).unwrap();
                        assert!(v.data.starts_with(k.as_bytes()));
                        hits += 1;
                    }
                }
                assert!(hits > 0);
            });
        }
        s.spawn(|| {
            for round in 0..2000 {
                let k = &keys[round % keys.len()];
                let v = format!("{}:{}", k, round);
                cache.set(k.as_bytes(), v.as_bytes(), OPTIONS_STRING, 0).unwrap();
            }
            done.store(true, Ordering::Release);
        });
    });

    assert_eq!(cache.len(), keys.len());
    cache.check_invariants().unwrap();
}

#[test]
fn test_writers_in_threads() {
    let cache = ShmCache::open(roomy_config(), HeapSegments::new()).unwrap();
    std::thread::scope(|s| {
        for t in 0..4u32 {
            let cache = &cache;
            s.spawn(move || {
                for i in 0..100u32 {
                    let k = format!("{}-{}", t, i);
                    cache.set(k.as_bytes(), &i.to_le_bytes(), OPTIONS_STRING, 0).unwrap();
                    cache.incr(b"counter", 1, 0).unwrap();
                }
            });
        }
    });
    assert_eq!(cache.len(), 401);
    assert_eq!(cache.get(b"counter").unwrap().data, b"400");
    assert_eq!(cache.get(b"3-99").unwrap().data, 99u32.to_le_bytes());
    cache.check_invariants().unwrap();
}

#[cfg(feature = "mmap")]
#[test]
fn test_mmap_region_survives_reopen() {
    use shmcache::MmapSegments;

    init_tracing();
    let dir = std::env::temp_dir().join(format!("shmcache-{}", uuid::Uuid::new_v4()));
    {
        let cache = ShmCache::open(small_config(), MmapSegments::new(&dir, "test").unwrap()).unwrap();
        for i in 0..10u8 {
            cache.set(&[i], &[i; 300], OPTIONS_STRING, 0).unwrap();
        }
        cache.delete(&[3]).unwrap();
    }
    {
        let cache = ShmCache::open(small_config(), MmapSegments::new(&dir, "test").unwrap()).unwrap();
        assert_eq!(cache.len(), 9);
        assert_eq!(cache.get(&[9]).unwrap().data, vec![9; 300]);
        assert!(cache.get(&[3]).is_err());
        assert!(cache.stats(false).segment_count > 1);
        cache.check_invariants().unwrap();
    }
    MmapSegments::remove_files(&dir, "test").unwrap();
    std::fs::remove_dir(&dir).unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Set(u8, Vec<u8>),
    Delete(u8),
    Get(u8),
    Incr(u8, i8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..24u8, proptest::collection::vec(any::<u8>(), 0..300)).prop_map(|(k, v)| Op::Set(k, v)),
        2 => (0..24u8).prop_map(Op::Delete),
        2 => (0..24u8).prop_map(Op::Get),
        1 => (0..24u8, any::<i8>()).prop_map(|(k, d)| Op::Incr(k, d)),
    ]
}

proptest! {
    #[test]
    fn shmcache_matches_hashmap(ops in proptest::collection::vec(op(), 1..200)) {
        let cache = ShmCache::open(roomy_config(), HeapSegments::new()).unwrap();
        let mut model: HashMap<u8, Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    cache.set(&[k], &v, OPTIONS_STRING, 0).unwrap();
                    model.insert(k, v);
                }
                Op::Delete(k) => {
                    let r = cache.delete(&[k]);
                    prop_assert_eq!(r.is_ok(), model.remove(&k).is_some());
                }
                Op::Get(k) => {
                    let got = cache.get(&[k]).ok().map(|v| v.data);
                    prop_assert_eq!(got.as_ref(), model.get(&k));
                }
                Op::Incr(k, d) => {
                    let current = match model.get(&k) {
                        None => Some(0),
                        Some(v) => std::str::from_utf8(v).ok().and_then(|s| s.trim().parse::<i64>().ok()),
                    };
                    let r = cache.incr(&[k], d as i64, 0);
                    match current {
                        Some(n) => {
                            let n = n.wrapping_add(d as i64);
                            prop_assert_eq!(r.unwrap(), n);
                            model.insert(k, n.to_string().into_bytes());
                        }
                        None => prop_assert!(matches!(r, Err(CacheError::NotAnInteger))),
                    }
                }
            }
            prop_assert_eq!(cache.len(), model.len());
        }
        cache.check_invariants().unwrap();
    }
}
