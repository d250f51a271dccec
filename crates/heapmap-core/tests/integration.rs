//! Integration tests: HeapMap through its public API.
//!
//! These exercise whole-map behaviour: growth and gap-filling deletes,
//! the three eviction policies, and persistence against a shared heap.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use heapmap_core::{
    header_path, shared, ByteHeap, Fifo, FifoMap, HeapMap, KeyRelation, LruMap, MapConfig, MapError,
    MemHeap, Priority, PriorityMap, SharedHeap, StoredKeys, Unbounded,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stored keys hashed by their first byte, so tests can choose buckets.
#[derive(Debug)]
struct FirstByteHash;

impl KeyRelation for FirstByteHash {
    fn compute_key(&self, _value: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn hash(&self, key: &[u8]) -> u32 {
        key.first().copied().unwrap_or(0) as u32
    }

    fn derives_keys(&self) -> bool {
        false
    }
}

fn store_map() -> HeapMap {
    HeapMap::new(MapConfig::store(), Arc::new(StoredKeys)).unwrap()
}

fn shared_map(config: MapConfig, heap: &SharedHeap<MemHeap>) -> HeapMap {
    HeapMap::with_shared_heap(config, Arc::new(StoredKeys), Unbounded, Arc::clone(heap)).unwrap()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

// ---------------------------------------------------------------------------
// Growth and Deletion
// ---------------------------------------------------------------------------

#[test]
fn test_resize_then_delete_keeps_probe_runs() {
    let mut map = store_map();
    assert_eq!(map.core().threshold(), 0);

    let keys: Vec<Vec<u8>> = (0..9).map(|i| format!("k{:03}", i).into_bytes()).collect();
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(k.len(), 4);
        map.put(k, &value(i)).unwrap();
    }
    assert_eq!(map.capacity(), 32);
    assert_eq!(map.len(), 9);
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.get(k).unwrap(), Some(value(i)));
    }

    assert_eq!(map.remove(&keys[3]).unwrap(), Some(value(3)));
    assert_eq!(map.get(&keys[3]).unwrap(), None);
    assert_eq!(map.len(), 8);
    for (i, k) in keys.iter().enumerate().filter(|(i, _)| *i != 3) {
        assert_eq!(map.get(k).unwrap(), Some(value(i)), "lost key {}", i);
    }
    assert_eq!(map.count_elements(), 8);
}

#[test]
fn test_deletes_across_table_end() {
    let mut map = HeapMap::new(MapConfig::store(), Arc::new(FirstByteHash)).unwrap();
    // buckets 14, 14, 15, 14, 0 land in slots 14, 15, 0, 1, 2 of a 16-slot table
    let keys: Vec<Vec<u8>> = vec![
        vec![14, b'a'],
        vec![14, b'b'],
        vec![15, b'c'],
        vec![14, b'd'],
        vec![0, b'e'],
    ];
    for k in &keys {
        map.put(k, k).unwrap();
    }
    assert_eq!(map.capacity(), 16);
    let placed: Vec<usize> = {
        let mut items = map.table_items().unwrap();
        items.sort_by_key(|item| item.key.clone());
        items.iter().map(|item| item.index).collect()
    };
    // sorted keys: [0,e] [14,a] [14,b] [14,d] [15,c]
    assert_eq!(placed, vec![2, 14, 15, 1, 0]);
    assert_eq!(map.longest_filled_run(), 3);

    for victim in [0usize, 2] {
        map.remove(&keys[victim]).unwrap();
        for (i, k) in keys.iter().enumerate() {
            let expected = if i == 0 || (i == 2 && victim == 2) { None } else { Some(k.clone()) };
            assert_eq!(map.get(k).unwrap(), expected, "key {} after removing {}", i, victim);
        }
    }

    // every survivor sits at or after its bucket, cyclically, with no hole between
    for item in map.table_items().unwrap() {
        let distance = (item.index + 16 - item.bucket) & 15;
        for step in 0..distance {
            assert!(map.core().offset_at((item.bucket + step) & 15).is_some());
        }
    }
}

#[test]
fn test_remove_if_rechecks_refilled_slot() {
    let mut map = HeapMap::new(MapConfig::store(), Arc::new(FirstByteHash)).unwrap();
    // buckets 13, 14, 13, 15 land in slots 13, 14, 15, 0
    map.put(&[13, b'a'], b"keep").unwrap();
    map.put(&[14, b'b'], b"x").unwrap();
    map.put(&[13, b'c'], b"x").unwrap();
    map.put(&[15, b'd'], b"keep").unwrap();
    assert_eq!(map.capacity(), 16);

    let removed = map.remove_if(|_, v| v == Some(&b"x"[..])).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&[14, b'b']).unwrap(), None);
    assert_eq!(map.get(&[13, b'c']).unwrap(), None);
    assert_eq!(map.get(&[13, b'a']).unwrap(), Some(b"keep".to_vec()));
    assert_eq!(map.get(&[15, b'd']).unwrap(), Some(b"keep".to_vec()));
}

#[test]
fn test_random_operations_match_model() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut map = store_map();
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

    for step in 0..4000 {
        let k = key(rng.gen_range(0..300));
        if rng.gen_bool(0.35) {
            assert_eq!(map.remove(&k).unwrap(), model.remove(&k), "step {}", step);
        } else {
            let v = value(step);
            assert_eq!(map.put(&k, &v).unwrap(), model.insert(k, v), "step {}", step);
        }
        assert_eq!(map.len(), model.len());
    }

    assert_eq!(map.count_elements(), model.len());
    for (k, v) in &model {
        assert_eq!(map.get(k).unwrap().as_ref(), Some(v));
    }
    let mut keys = map.keys().unwrap();
    keys.sort();
    let mut expected: Vec<Vec<u8>> = model.keys().cloned().collect();
    expected.sort();
    assert_eq!(keys, expected);
}

#[test]
fn test_remove_until_empty() {
    let mut map = store_map();
    for i in 0..100 {
        map.put(&key(i), &value(i)).unwrap();
    }
    for i in (0..100).rev() {
        assert_eq!(map.remove(&key(i)).unwrap(), Some(value(i)));
        for j in 0..i {
            assert!(map.contains_key(&key(j)).unwrap(), "lost key {} after removing {}", j, i);
        }
    }
    assert!(map.is_empty());
    assert_eq!(map.count_elements(), 0);
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[test]
fn test_fifo_keeps_newest() {
    let mut map = FifoMap::fifo(MapConfig::cache(10), Arc::new(StoredKeys)).unwrap();
    for i in 0..35 {
        map.put(&key(i), &value(i)).unwrap();
        assert!(map.len() <= 10);
    }
    assert_eq!(map.len(), 10);
    for i in 0..25 {
        assert!(!map.contains_key(&key(i)).unwrap(), "key {} should be evicted", i);
    }
    for i in 25..35 {
        assert_eq!(map.get(&key(i)).unwrap(), Some(value(i)));
    }
}

#[test]
fn test_lru_evicts_untouched() {
    let mut map = LruMap::lru(MapConfig::cache(3), Arc::new(StoredKeys)).unwrap();
    map.put(b"a", b"1").unwrap();
    map.put(b"b", b"2").unwrap();
    map.put(b"c", b"3").unwrap();
    assert_eq!(map.eldest_key().unwrap(), Some(b"a".to_vec()));

    map.get(b"a").unwrap();
    assert_eq!(map.eldest_key().unwrap(), Some(b"b".to_vec()));

    map.put(b"d", b"4").unwrap();
    assert_eq!(map.len(), 3);
    assert!(!map.contains_key(b"b").unwrap());
    for k in [&b"a"[..], b"c", b"d"] {
        assert!(map.contains_key(k).unwrap());
    }
}

#[test]
fn test_priority_map_converges_to_bound() {
    let mut map = PriorityMap::priority(MapConfig::cache(1000), Arc::new(StoredKeys)).unwrap();
    for i in 0..5000 {
        map.put(&key(i), &value(i)).unwrap();
        assert!(map.len() <= 1000, "size {} after {} inserts", map.len(), i + 1);
    }
    assert!(map.len() <= 1000, "final size {}", map.len());
    assert_eq!(map.get(&key(4999)).unwrap(), Some(value(4999)));
    assert!(!map.contains_key(&key(0)).unwrap());
}

#[test]
fn test_small_priority_map_stays_bounded() {
    let mut map = PriorityMap::priority(MapConfig::cache(16), Arc::new(StoredKeys)).unwrap();
    for i in 0..2000 {
        map.put(&key(i), &value(i)).unwrap();
        assert!(map.len() <= 16, "size {} after {} inserts", map.len(), i + 1);
    }
    assert_eq!(map.get(&key(1999)).unwrap(), Some(value(1999)));
    assert!(!map.contains_key(&key(0)).unwrap());
}

#[test]
fn test_reprioritize_rebases_to_zero() {
    let mut map = PriorityMap::priority(MapConfig::cache(1000), Arc::new(StoredKeys)).unwrap();
    for i in 0..100 {
        map.put(&key(i), &value(i)).unwrap();
    }
    for i in 0..10 {
        map.remove(&key(i)).unwrap();
    }
    assert_eq!(map.min_priority(), 10);
    let mut before = map.keys().unwrap();
    before.sort();

    map.reprioritize().unwrap();
    let mut after = map.keys().unwrap();
    after.sort();
    assert_eq!(before, after);
    assert_eq!(map.min_priority(), 0);
    assert_eq!(map.current_priority(), 90);
    assert_eq!(map.priority_of(&key(10)).unwrap(), Some(0));
    assert_eq!(map.priority_of(&key(99)).unwrap(), Some(89));
}

#[test]
fn test_priority_counter_wraps_by_rebasing() {
    let mut config = MapConfig::cache(16);
    config.max_priority = 64;
    let mut map = PriorityMap::priority(config, Arc::new(StoredKeys)).unwrap();
    for i in 0..500 {
        map.put(&key(i), &value(i)).unwrap();
        assert!(map.current_priority() <= 64);
    }
    assert!(map.len() <= 16, "size {}", map.len());
    assert_eq!(map.get(&key(499)).unwrap(), Some(value(499)));
}

// ---------------------------------------------------------------------------
// Persistence and Shared Heaps
// ---------------------------------------------------------------------------

#[test]
fn test_save_load_with_shared_heap() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prio.dat");
    let heap = shared(MemHeap::default());
    let config = MapConfig::cache(1000);

    let mut map: PriorityMap = HeapMap::with_shared_heap(
        config.clone(), Arc::new(StoredKeys), Priority::from_config(&config), Arc::clone(&heap),
    ).unwrap();
    for i in 0..50 {
        map.put(&key(i), &value(i)).unwrap();
    }
    map.set_path(&path);
    map.save().unwrap();
    assert!(header_path(&path).exists());

    let mut reopened: PriorityMap = HeapMap::with_shared_heap(
        config.clone(), Arc::new(StoredKeys), Priority::from_config(&config), Arc::clone(&heap),
    ).unwrap();
    reopened.set_path(&path);
    reopened.load().unwrap();
    assert_eq!(reopened.len(), 50);
    assert_eq!(reopened.current_priority(), map.current_priority());
    for i in 0..50 {
        assert_eq!(reopened.get(&key(i)).unwrap(), Some(value(i)));
    }
}

#[test]
fn test_fifo_order_survives_save_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fifo.dat");
    let heap = shared(MemHeap::default());

    let mut map: FifoMap = HeapMap::with_shared_heap(
        MapConfig::cache(5), Arc::new(StoredKeys), Fifo::new(5), Arc::clone(&heap),
    ).unwrap();
    for i in 0..5 {
        map.put(&key(i), &value(i)).unwrap();
    }
    map.set_path(&path);
    map.save().unwrap();

    let mut reopened: FifoMap = HeapMap::with_shared_heap(
        MapConfig::cache(5), Arc::new(StoredKeys), Fifo::new(5), Arc::clone(&heap),
    ).unwrap();
    reopened.set_path(&path);
    reopened.load().unwrap();
    assert_eq!(reopened.len(), 5);

    // the oldest entry from before the save goes first
    reopened.put(&key(5), &value(5)).unwrap();
    assert_eq!(reopened.len(), 5);
    assert!(!reopened.contains_key(&key(0)).unwrap());
    for i in 1..6 {
        assert_eq!(reopened.get(&key(i)).unwrap(), Some(value(i)));
    }
}

#[test]
fn test_legacy_table_upgraded_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.dat");
    let heap = shared(MemHeap::default());

    let mut map = shared_map(MapConfig::store(), &heap);
    for i in 0..6 {
        map.put(&key(i), &value(i)).unwrap();
    }
    map.set_path(&path);
    map.save().unwrap();

    // rebuild the old single-file form: [slots u32][size u32][threshold u32][slot array]
    let mut legacy = Vec::new();
    legacy.extend_from_slice(&(map.capacity() as u32).to_be_bytes());
    legacy.extend_from_slice(&(map.len() as u32).to_be_bytes());
    legacy.extend_from_slice(&(map.core().threshold() as u32).to_be_bytes());
    legacy.extend_from_slice(&fs::read(&path).unwrap());
    fs::write(&path, &legacy).unwrap();
    fs::remove_file(header_path(&path)).unwrap();

    let mut plain = shared_map(MapConfig::store(), &heap);
    plain.set_path(&path);
    assert!(matches!(plain.load(), Err(MapError::Io { .. })));

    let mut config = MapConfig::store();
    config.flags.auto_upgrade = true;
    let mut upgraded = shared_map(config, &heap);
    upgraded.set_path(&path);
    upgraded.load().unwrap();
    assert_eq!(upgraded.len(), 6);
    for i in 0..6 {
        assert_eq!(upgraded.get(&key(i)).unwrap(), Some(value(i)));
    }
    assert!(header_path(&path).exists());
    assert_eq!(fs::read(&path).unwrap().len(), legacy.len() - 12);
}

#[test]
fn test_shared_heap_compaction_keeps_both_maps() {
    let heap = shared(MemHeap::default());
    let mut a = shared_map(MapConfig::store(), &heap);
    let mut b = shared_map(MapConfig::store(), &heap);
    for i in 0..40 {
        a.put(&key(i), &value(i)).unwrap();
        b.put(&key(i + 1000), &value(i + 1000)).unwrap();
    }
    for i in 0..20 {
        a.remove(&key(i)).unwrap();
    }
    heap.lock().add_object(b"orphan", None).unwrap();

    // the maps never compact a heap they share
    a.compress_heap().unwrap();
    assert_eq!(heap.lock().object_count(), a.len() + b.len() + 1);

    {
        let mut guard = heap.lock();
        guard.begin_remap();
        a.mark_live_offsets(&mut guard);
        b.mark_live_offsets(&mut guard);
        guard.end_remap();
        assert_eq!(guard.object_count(), a.len() + b.len());
        assert_eq!(guard.arena_bytes(), guard.live_bytes());
    }

    for i in 20..40 {
        assert_eq!(a.get(&key(i)).unwrap(), Some(value(i)));
    }
    for i in 0..40 {
        assert_eq!(b.get(&key(i + 1000)).unwrap(), Some(value(i + 1000)));
    }
}
