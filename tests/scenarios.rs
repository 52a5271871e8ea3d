//! End-to-end scenarios exercising the sorted list and hash table as a
//! caller would: across threads, with sequence numbers, under a write
//! barrier, and with colliding hashes.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use rand::Rng;

use hazardmap::config::{ListConfig, TableConfig};
use hazardmap::hazard::HazardPointerRegistry;
use hazardmap::hash_table::HashTable;
use hazardmap::malloc::GlobalAllocator;
use hazardmap::sequence::SequenceCounter;
use hazardmap::sorted_list::SortedList;

fn identity_hash(k: &u64) -> u64 {
    *k
}

fn natural_cmp(a: &u64, b: &u64) -> Ordering {
    a.cmp(b)
}

/// Scenario 1: insert [1,2,3] into a 2-bucket table with no counter;
/// `find(2)` hits, `find(4)` misses, `get_count` under lock is 3.
#[test]
fn scenario_hash_table_insert_find_get_count() {
    let registry = HazardPointerRegistry::new();
    let thread = registry.register_thread();
    let table: HashTable<u64, u64, fn(&u64) -> u64, fn(&u64, &u64) -> Ordering> =
        HashTable::create(identity_hash, natural_cmp, TableConfig::new().with_initial_buckets(2))
            .unwrap();

    for k in [1u64, 2, 3] {
        table.insert(&thread, k, k * 10).unwrap();
    }

    let found = table.find(&thread, &2).unwrap();
    assert_eq!(*found.value(), 20);
    found.release(&thread, &GlobalAllocator);

    assert!(table.find(&thread, &4).is_err());

    let _barrier = table.lock_writes();
    assert_eq!(table.get_count().unwrap(), 3);
}

/// Scenario 2: a list with counter starting at 42; a duplicate insert
/// reports KeyAlreadyExists and fires the skip callback with the
/// allocated-but-unused number.
#[test]
fn scenario_sequence_counter_skip_on_duplicate_insert() {
    let registry = HazardPointerRegistry::new();
    let thread = registry.register_thread();

    let skip_calls = Arc::new(AtomicUsize::new(0));
    let last_skipped = Arc::new(AtomicU64::new(0));
    let skip_calls_cb = Arc::clone(&skip_calls);
    let last_skipped_cb = Arc::clone(&last_skipped);

    let counter = SequenceCounter::starting_at(42).with_skip_callback(move |n| {
        skip_calls_cb.fetch_add(1, AtomicOrdering::Relaxed);
        last_skipped_cb.store(n, AtomicOrdering::Relaxed);
    });

    let list = SortedList::with_config(
        natural_cmp,
        ListConfig::new().with_sequence_counter(counter),
    )
    .unwrap();

    let first = list.insert(&thread, 1, "a").unwrap();
    assert_eq!(first.seq_no, Some(43));

    let second = list.insert(&thread, 1, "b");
    assert!(second.is_err());

    assert_eq!(skip_calls.load(AtomicOrdering::Relaxed), 1);
    assert_eq!(last_skipped.load(AtomicOrdering::Relaxed), 44);
}

/// Scenario 3: insert [5,3,7,1,9], lock_writes, get_all into a
/// correctly sized buffer returns them in ascending key order.
#[test]
fn scenario_get_all_returns_ascending_key_order() {
    let registry = HazardPointerRegistry::new();
    let thread = registry.register_thread();
    let list = SortedList::new(natural_cmp);

    for k in [5u64, 3, 7, 1, 9] {
        list.insert(&thread, k, k).unwrap();
    }

    let _barrier = list.lock_writes();
    let count = list.get_count().unwrap();
    assert_eq!(count, 5);

    let mut buffer: Vec<Option<_>> = (0..count).map(|_| None).collect();
    list.get_all(&mut buffer).unwrap();

    let keys: Vec<u64> = buffer
        .into_iter()
        .map(|slot| *slot.unwrap().key())
        .collect();
    assert_eq!(keys, vec![1, 3, 5, 7, 9]);
}

/// Scenario 4: 16 threads repeatedly insert and delete keys in
/// [0..999] concurrently; at completion, the table is in a consistent
/// state (no torn reads, no panics, every present key is actually
/// findable and removable).
#[test]
fn scenario_concurrent_insert_delete_stress() {
    let registry = Arc::new(HazardPointerRegistry::new());
    let table: Arc<HashTable<u64, u64, fn(&u64) -> u64, fn(&u64, &u64) -> Ordering>> = Arc::new(
        HashTable::create(identity_hash, natural_cmp, TableConfig::new().with_initial_buckets(64))
            .unwrap(),
    );

    std::thread::scope(|scope| {
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let table = Arc::clone(&table);
            scope.spawn(move || {
                let thread = registry.register_thread();
                let mut rng = rand::thread_rng();
                let start = std::time::Instant::now();
                while start.elapsed() < std::time::Duration::from_millis(250) {
                    let key = rng.gen_range(0..1000u64);
                    if rng.gen_bool(0.5) {
                        let _ = table.insert(&thread, key, key);
                    } else {
                        let _ = table.delete_key(&thread, &key);
                    }
                }
            });
        }
    });

    let thread = registry.register_thread();
    for key in 0..1000u64 {
        if let Ok(node) = table.find(&thread, &key) {
            assert_eq!(*node.value(), key);
            node.release(&thread, &GlobalAllocator);
        }
    }
}

/// Scenario 5: in a 1-bucket table, two different keys that collide on
/// the same bucket are both independently findable and deletable.
#[test]
fn scenario_colliding_hash_different_keys_independent() {
    fn collide_all(_: &u64) -> u64 {
        0
    }

    let registry = HazardPointerRegistry::new();
    let thread = registry.register_thread();
    let table: HashTable<u64, u64, fn(&u64) -> u64, fn(&u64, &u64) -> Ordering> =
        HashTable::create(collide_all, natural_cmp, TableConfig::new().with_initial_buckets(1))
            .unwrap();

    table.insert(&thread, 1, 100).unwrap();
    table.insert(&thread, 2, 200).unwrap();

    table.delete_key(&thread, &1).unwrap();
    assert!(table.find(&thread, &1).is_err());

    let found = table.find(&thread, &2).unwrap();
    assert_eq!(*found.value(), 200);
    found.release(&thread, &GlobalAllocator);
}

/// Scenario 6: `remove_key` on a list with a concurrent reader holding
/// a find-reference keeps the payload dereferenceable until the reader
/// releases it.
#[test]
fn scenario_remove_key_keeps_concurrent_reader_alive() {
    let registry = HazardPointerRegistry::new();
    let thread_a = registry.register_thread();
    let list = SortedList::new(natural_cmp);

    list.insert(&thread_a, 1, "payload").unwrap();

    let reader_handle = list.find_key(&thread_a, &1).unwrap();

    let thread_b = registry.register_thread();
    let (removed, _seq) = list.remove_key(&thread_b, &1).unwrap();

    // The reader's handle is still valid: the node is only reclaimed
    // once every outstanding reference (including the removed handle
    // below) is released.
    assert_eq!(*reader_handle.value(), "payload");
    assert!(list.find_key(&thread_a, &1).is_err());

    reader_handle.release(&thread_a, &GlobalAllocator);
    removed.release(&thread_b, &GlobalAllocator);
}
