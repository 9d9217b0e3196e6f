use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use fleetcache::{Cache, ExpiringEntry, IntMixState, Op, Ttl, NO_EXPIRATION};

/// A cache without background sweeping, so tests control reaping.
fn quiet_cache<V: Clone + Send + Sync + 'static>() -> Cache<String, V> {
    Cache::builder().cleanup_interval(Duration::ZERO).build()
}

#[test]
fn set_and_get_round_trip() {
    let cache = quiet_cache();
    cache.set("string".to_string(), "s".to_string(), NO_EXPIRATION);
    assert_eq!(cache.get(&"string".to_string()), Some("s".to_string()));
    assert_eq!(cache.get(&"missing".to_string()), None);

    let ints = quiet_cache::<i64>();
    ints.set("int".to_string(), -64, NO_EXPIRATION);
    ints.set("zero".to_string(), 0, NO_EXPIRATION);
    assert_eq!(ints.get(&"int".to_string()), Some(-64));
    assert_eq!(ints.get(&"zero".to_string()), Some(0));
}

#[test]
fn integer_keys_with_the_mix_hasher() {
    let cache: Cache<u64, u64, IntMixState> = Cache::builder()
        .cleanup_interval(Duration::ZERO)
        .hasher(IntMixState::new())
        .build();
    for i in 0..1_000 {
        cache.set(i, i * 3, NO_EXPIRATION);
    }
    assert_eq!(cache.count(), 1_000);
    assert_eq!(cache.get(&999), Some(2997));
}

#[test]
fn set_forever_ignores_the_default_ttl() {
    let cache: Cache<String, u64> = Cache::builder()
        .default_ttl(Ttl::from_millis(20))
        .cleanup_interval(Duration::ZERO)
        .build();
    cache.set_forever("k".to_string(), 1);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&"k".to_string()), Some(1));
    assert_eq!(
        cache.get_with_ttl(&"k".to_string()),
        Some((1, NO_EXPIRATION))
    );
}

#[test]
fn get_with_expiration_reports_the_deadline() {
    let cache = quiet_cache::<u64>();
    cache.set_forever("forever".to_string(), 1);
    assert_eq!(
        cache.get_with_expiration(&"forever".to_string()),
        Some((1, None))
    );

    cache.set("timed".to_string(), 2, Ttl::from_secs(60));
    let (v, at) = cache.get_with_expiration(&"timed".to_string()).unwrap();
    assert_eq!(v, 2);
    let at = at.expect("timed entry must carry a deadline");
    let remaining = at.duration_since(SystemTime::now()).unwrap();
    assert!(remaining > Duration::from_secs(55));
    assert!(remaining <= Duration::from_secs(60));
}

#[test]
fn get_or_set_loads_existing_else_inserts() {
    let cache = quiet_cache::<u64>();
    let (v, loaded) = cache.get_or_set("k".to_string(), 1, NO_EXPIRATION);
    assert_eq!((v, loaded), (1, false));
    let (v, loaded) = cache.get_or_set("k".to_string(), 9, NO_EXPIRATION);
    assert_eq!((v, loaded), (1, true));
    assert_eq!(cache.get(&"k".to_string()), Some(1));
}

#[test]
fn get_and_set_swaps_and_reports_prior_freshness() {
    let cache = quiet_cache::<u64>();

    // On a miss the newly stored value comes back, flagged not-loaded.
    let (v, loaded) = cache.get_and_set("k".to_string(), 1, NO_EXPIRATION);
    assert_eq!((v, loaded), (1, false));

    let (v, loaded) = cache.get_and_set("k".to_string(), 2, NO_EXPIRATION);
    assert_eq!((v, loaded), (1, true));
    assert_eq!(cache.get(&"k".to_string()), Some(2));

    // An expired leftover does not count as a prior value.
    cache.set("gone".to_string(), 7, Ttl::from_millis(1));
    thread::sleep(Duration::from_millis(5));
    let (v, loaded) = cache.get_and_set("gone".to_string(), 8, NO_EXPIRATION);
    assert_eq!((v, loaded), (8, false));
}

#[test]
fn get_and_refresh_misses_on_absent_key() {
    let cache = quiet_cache::<u64>();
    assert_eq!(
        cache.get_and_refresh(&"missing".to_string(), Ttl::from_secs(1)),
        None
    );
}

#[test]
fn get_or_compute_runs_once_per_insertion() {
    let cache = quiet_cache::<u64>();
    let calls = AtomicUsize::new(0);

    let (v, loaded) = cache.get_or_compute(
        "k".to_string(),
        || {
            calls.fetch_add(1, Ordering::Relaxed);
            Some(7)
        },
        NO_EXPIRATION,
    );
    assert_eq!((v, loaded), (Some(7), false));

    let (v, loaded) = cache.get_or_compute(
        "k".to_string(),
        || {
            calls.fetch_add(1, Ordering::Relaxed);
            Some(8)
        },
        NO_EXPIRATION,
    );
    assert_eq!((v, loaded), (Some(7), true));
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn get_or_compute_cancel_inserts_nothing() {
    let cache = quiet_cache::<u64>();
    let (v, loaded) = cache.get_or_compute("k".to_string(), || None, NO_EXPIRATION);
    assert_eq!((v, loaded), (None, false));
    assert_eq!(cache.get(&"k".to_string()), None);
    assert_eq!(cache.count(), 0);
}

#[test]
fn thousand_get_or_computes_then_all_loaded() {
    let cache = quiet_cache::<u64>();
    for i in 0..1_000u64 {
        let (v, loaded) = cache.get_or_compute(i.to_string(), || Some(i), Ttl::from_nanos(0));
        assert_eq!((v, loaded), (Some(i), false), "first pass key {i}");
    }
    for i in 0..1_000u64 {
        let (v, loaded) = cache.get_or_compute(i.to_string(), || Some(999_999), Ttl::from_nanos(0));
        assert_eq!((v, loaded), (Some(i), true), "second pass key {i}");
    }
}

#[test]
fn contended_get_or_compute_is_single_flight() {
    let cache = Arc::new(quiet_cache::<u64>());
    let calls = Arc::new(AtomicUsize::new(0));
    let inserted = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        let inserted = Arc::clone(&inserted);
        handles.push(thread::spawn(move || {
            let (v, loaded) = cache.get_or_compute(
                "hot".to_string(),
                || {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Some(42)
                },
                NO_EXPIRATION,
            );
            assert_eq!(v, Some(42));
            if !loaded {
                inserted.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(inserted.load(Ordering::Relaxed), 1);
}

#[test]
fn compute_chain_update_update_delete() {
    let cache = quiet_cache::<u64>();

    let (v, present) = cache.compute(
        "k".to_string(),
        |_| (Op::Update, Some(42)),
        Ttl::from_nanos(0),
    );
    assert_eq!((v, present), (Some(42), true));

    let (v, present) = cache.compute(
        "k".to_string(),
        |old| (Op::Update, Some(old.copied().unwrap_or(0) + 42)),
        Ttl::from_nanos(0),
    );
    assert_eq!((v, present), (Some(84), true));

    let (v, present) = cache.compute("k".to_string(), |_| (Op::Delete, None), Ttl::from_nanos(0));
    assert_eq!((v, present), (Some(84), false));

    assert_eq!(cache.get(&"k".to_string()), None);
}

#[test]
fn compute_cancel_changes_nothing() {
    let cache = quiet_cache::<u64>();
    cache.set_forever("k".to_string(), 5);
    let (v, present) = cache.compute("k".to_string(), |_| (Op::Cancel, None), NO_EXPIRATION);
    assert_eq!((v, present), (Some(5), true));
    assert_eq!(cache.get(&"k".to_string()), Some(5));
    assert_eq!(cache.count(), 1);
}

#[test]
fn delete_and_get_and_delete() {
    let cache = quiet_cache::<u64>();
    cache.set_forever("a".to_string(), 1);
    cache.set_forever("b".to_string(), 2);

    cache.delete(&"a".to_string());
    assert_eq!(cache.get(&"a".to_string()), None);

    assert_eq!(cache.get_and_delete(&"b".to_string()), Some(2));
    assert_eq!(cache.get_and_delete(&"b".to_string()), None);
    assert_eq!(cache.count(), 0);
}

#[test]
fn eviction_callback_fires_once_per_eviction() {
    let evicted: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let sum: Arc<AtomicI64> = Arc::new(AtomicI64::new(0));
    let (evicted_cb, sum_cb) = (Arc::clone(&evicted), Arc::clone(&sum));

    let cache: Cache<String, i64> = Cache::builder()
        .cleanup_interval(Duration::ZERO)
        .evicted_callback(move |_k: &String, v: &i64| {
            evicted_cb.fetch_add(1, Ordering::Relaxed);
            sum_cb.fetch_add(*v, Ordering::Relaxed);
        })
        .build();

    cache.set_forever("a".to_string(), 10);
    cache.set_forever("b".to_string(), 20);
    cache.set_forever("c".to_string(), 30);

    cache.delete(&"a".to_string());
    assert_eq!(cache.get_and_delete(&"b".to_string()), Some(20));
    let (_, present) = cache.compute("c".to_string(), |_| (Op::Delete, None), NO_EXPIRATION);
    assert!(!present);

    assert_eq!(evicted.load(Ordering::Relaxed), 3);
    assert_eq!(sum.load(Ordering::Relaxed), 60);

    // Deleting absent keys does not fire the callback.
    cache.delete(&"a".to_string());
    assert_eq!(evicted.load(Ordering::Relaxed), 3);
}

#[test]
fn clear_does_not_fire_the_callback() {
    let evicted = Arc::new(AtomicUsize::new(0));
    let evicted_cb = Arc::clone(&evicted);
    let cache: Cache<String, u64> = Cache::builder()
        .cleanup_interval(Duration::ZERO)
        .evicted_callback(move |_, _| {
            evicted_cb.fetch_add(1, Ordering::Relaxed);
        })
        .build();

    for i in 0..10u64 {
        cache.set_forever(i.to_string(), i);
    }
    cache.clear();
    assert_eq!(cache.count(), 0);
    assert_eq!(evicted.load(Ordering::Relaxed), 0);
}

#[test]
fn callback_can_be_swapped_at_runtime() {
    let cache = quiet_cache::<u64>();
    assert!(cache.evicted_callback().is_none());

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_cb = Arc::clone(&hits);
    cache.set_evicted_callback(Some(Arc::new(move |_: &String, _: &u64| {
        hits_cb.fetch_add(1, Ordering::Relaxed);
    })));
    assert!(cache.evicted_callback().is_some());

    cache.set_forever("k".to_string(), 1);
    cache.delete(&"k".to_string());
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    cache.set_evicted_callback(None);
    cache.set_forever("k".to_string(), 2);
    cache.delete(&"k".to_string());
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn default_expiration_is_adjustable() {
    let cache: Cache<String, u64> = Cache::builder()
        .default_ttl(Ttl::from_secs(300))
        .cleanup_interval(Duration::ZERO)
        .build();
    assert_eq!(cache.default_expiration(), Ttl::from_secs(300));

    cache.set_default_expiration(Ttl::from_millis(1));
    cache.set_default("short".to_string(), 1);
    thread::sleep(Duration::from_millis(5));
    assert_eq!(cache.get(&"short".to_string()), None);
}

#[test]
fn range_visits_fresh_entries_and_stops_early() {
    let cache = quiet_cache::<u64>();
    for i in 0..20u64 {
        cache.set_forever(i.to_string(), i);
    }
    cache.set("expired".to_string(), 99, Ttl::from_millis(1));
    thread::sleep(Duration::from_millis(5));

    let mut seen = 0usize;
    cache.range(|_, v| {
        assert_ne!(*v, 99, "expired entry must be skipped");
        seen += 1;
        true
    });
    assert_eq!(seen, 20);

    let mut seen = 0usize;
    cache.range(|_, _| {
        seen += 1;
        seen < 5
    });
    assert_eq!(seen, 5);
}

#[test]
fn range_visitor_may_delete_the_visited_key() {
    let cache = quiet_cache::<u64>();
    for i in 0..32u64 {
        cache.set_forever(i.to_string(), i);
    }
    cache.range(|k, _| {
        let (_, present) = cache.compute(k.clone(), |_| (Op::Delete, None), NO_EXPIRATION);
        assert!(!present);
        true
    });
    assert_eq!(cache.count(), 0);
}

#[test]
fn count_matches_range_at_quiescence() {
    let cache = quiet_cache::<u64>();
    for i in 0..250u64 {
        cache.set_forever(i.to_string(), i);
    }
    for i in 0..50u64 {
        cache.delete(&i.to_string());
    }
    let mut visited = 0usize;
    cache.range(|_, _| {
        visited += 1;
        true
    });
    assert_eq!(cache.count(), visited);
    assert_eq!(visited, 200);
}

#[test]
fn items_snapshots_fresh_entries() {
    let cache = quiet_cache::<u64>();
    cache.set_forever("a".to_string(), 1);
    cache.set("b".to_string(), 2, Ttl::from_secs(60));
    cache.set("gone".to_string(), 3, Ttl::from_millis(1));
    thread::sleep(Duration::from_millis(5));

    let items = cache.items();
    assert_eq!(items.len(), 2);
    assert_eq!(items.get("a"), Some(&1));
    assert_eq!(items.get("b"), Some(&2));

    let detailed = cache.items_with_expiration();
    assert_eq!(detailed.len(), 2);
    assert_eq!(detailed["a"].expires_at, None);
    assert!(detailed["b"].expires_at.unwrap() > SystemTime::now());
}

#[test]
fn snapshot_reloads_through_bulk_load() {
    let source = quiet_cache::<u64>();
    source.set_forever("config".to_string(), 1);
    source.set("session".to_string(), 2, Ttl::from_secs(60));

    let copy = quiet_cache::<u64>();
    copy.load_items_with_expiration(source.items_with_expiration());
    assert_eq!(copy.count(), 2);
    assert_eq!(copy.get(&"config".to_string()), Some(1));
    let (_, ttl) = copy.get_with_ttl(&"session".to_string()).unwrap();
    assert!(ttl.as_duration().unwrap() > Duration::from_secs(55));
}

#[test]
fn load_items_applies_one_ttl_to_all() {
    let cache = quiet_cache::<u64>();
    cache.load_items((0..10u64).map(|i| (i.to_string(), i)), NO_EXPIRATION);
    assert_eq!(cache.count(), 10);
    assert_eq!(cache.get(&"7".to_string()), Some(7));

    // Empty input is fine.
    cache.load_items(std::iter::empty::<(String, u64)>(), NO_EXPIRATION);
    assert_eq!(cache.count(), 10);

    // A non-sentinel TTL <= 0 stores never-expiring entries.
    cache.load_items([("z".to_string(), 1u64)], Ttl::from_secs(-30));
    thread::sleep(Duration::from_millis(5));
    assert_eq!(cache.get(&"z".to_string()), Some(1));
}

#[test]
fn close_is_idempotent_and_leaves_data_readable() {
    let cache: Cache<String, u64> = Cache::builder()
        .cleanup_interval(Duration::from_millis(5))
        .build();
    cache.set_forever("k".to_string(), 1);

    cache.close();
    cache.close();

    cache.set_forever("after".to_string(), 2);
    assert_eq!(cache.get(&"k".to_string()), Some(1));
    assert_eq!(cache.get(&"after".to_string()), Some(2));
}

#[test]
fn concurrent_facade_traffic_is_consistent() {
    let cache = Arc::new(quiet_cache::<u64>());
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..2_500u64 {
                let key = format!("{t}:{i}");
                cache.set_forever(key.clone(), i);
                assert_eq!(cache.get(&key), Some(i));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(cache.count(), 10_000);
}

#[test]
fn bulk_records_are_plain_data() {
    // The exchanged record is an ordinary struct; encoding is caller-side.
    let entry = ExpiringEntry {
        value: 7u64,
        expires_at: Some(SystemTime::now()),
    };
    let copy = entry.clone();
    assert_eq!(entry, copy);
}
