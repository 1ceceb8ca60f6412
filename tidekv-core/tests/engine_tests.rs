// Engine behaviour through the public Db handle

mod common;

use bytes::Bytes;
use common::{key, open, scan_all, small_options};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tidekv_core::{IteratorOptions, Options, TideError, WriteBatch};

#[test]
fn overwrite_survives_flush_and_compaction() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());

    db.set("a", "1").unwrap();
    db.flush().unwrap();
    db.set("a", "2").unwrap();
    db.flush().unwrap();
    assert_eq!(db.get(b"a").unwrap().unwrap(), Bytes::from("2"));

    db.compact_all().unwrap();
    assert_eq!(db.get(b"a").unwrap().unwrap(), Bytes::from("2"));
    assert_eq!(scan_all(&db), vec![(b"a".to_vec(), b"2".to_vec())]);
}

#[test]
fn compact_all_removes_tombstones() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());

    for i in 0..500 {
        db.set(key(i), format!("value{}", i)).unwrap();
    }
    db.flush().unwrap();
    for i in (0..500).step_by(2) {
        db.delete(key(i)).unwrap();
    }
    db.flush().unwrap();
    db.compact_all().unwrap();

    let stats = db.stats();
    let tombstones: u64 = stats.levels.iter().map(|l| l.tombstones).sum();
    assert_eq!(tombstones, 0);
    assert_eq!(stats.levels[0].tables, 0);

    for i in 0..500 {
        let got = db.get(key(i).as_bytes()).unwrap();
        if i % 2 == 0 {
            assert!(got.is_none(), "{} should be deleted", key(i));
        } else {
            assert_eq!(got.unwrap(), Bytes::from(format!("value{}", i)));
        }
    }
}

#[test]
fn compact_all_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());

    for i in 0..300 {
        db.set(key(i), vec![b'v'; 40]).unwrap();
    }
    db.flush().unwrap();
    db.compact_all().unwrap();
    let first = scan_all(&db);
    let entries: u64 = db.stats().levels.iter().map(|l| l.entries).sum();

    db.compact_all().unwrap();
    assert_eq!(scan_all(&db), first);
    let again: u64 = db.stats().levels.iter().map(|l| l.entries).sum();
    assert_eq!(entries, again);
    assert_eq!(again, 300);
}

#[test]
fn compact_all_keeps_untouched_bottom_tables_readable() {
    let dir = TempDir::new().unwrap();
    let options = Options {
        cache_capacity_bytes: 0,
        l0_compaction_trigger: 100,
        ..small_options()
    };
    let db = open(dir.path(), options);

    // three disjoint L1 tables, the outer two carrying tombstones
    db.set("a", "1").unwrap();
    db.set("b", "2").unwrap();
    db.delete("b").unwrap();
    db.flush().unwrap();
    db.compact_level(0).unwrap();
    for (k, v) in [("d", "4"), ("e", "5"), ("f", "6")] {
        db.set(k, v).unwrap();
    }
    db.flush().unwrap();
    db.compact_level(0).unwrap();
    db.set("g", "7").unwrap();
    db.set("h", "8").unwrap();
    db.delete("h").unwrap();
    db.flush().unwrap();
    db.compact_level(0).unwrap();
    assert_eq!(db.stats().levels[1].tables, 3);

    db.compact_all().unwrap();

    assert_eq!(db.get(b"e").unwrap().unwrap(), Bytes::from("5"));
    assert!(db.get(b"b").unwrap().is_none());
    let keys: Vec<_> = scan_all(&db).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"d".to_vec(), b"e".to_vec(), b"f".to_vec(), b"g".to_vec()]);
    let tombstones: u64 = db.stats().levels.iter().map(|l| l.tombstones).sum();
    assert_eq!(tombstones, 0);
}

#[test]
fn repeated_flush_and_compaction_keeps_every_key_readable() {
    let dir = TempDir::new().unwrap();
    let options = Options {
        cache_capacity_bytes: 0,
        ..small_options()
    };
    let db = open(dir.path(), options);
    let mut expected = BTreeMap::new();

    for round in 0..6usize {
        for i in (round * 37..2000).step_by(11) {
            let value = format!("r{}-{}", round, i);
            db.set(key(i), value.clone()).unwrap();
            expected.insert(key(i).into_bytes(), value.into_bytes());
        }
        for i in (round..2000).step_by(53) {
            db.delete(key(i)).unwrap();
            expected.remove(key(i).as_bytes());
        }
        db.flush().unwrap();
        if round % 2 == 1 {
            db.compact_all().unwrap();
        }
    }
    db.compact_all().unwrap();

    for (k, v) in &expected {
        assert_eq!(db.get(k).unwrap().unwrap().as_ref(), v.as_slice());
    }
    let want: Vec<_> = expected.into_iter().collect();
    assert_eq!(scan_all(&db), want);
}

#[test]
fn iteration_is_ordered_and_unique() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());
    let mut expected = BTreeMap::new();

    // spread versions across memtables, L0 and deeper levels
    for round in 0..3 {
        for i in (0..400).rev() {
            if (i + round) % 3 == 0 {
                let value = format!("r{}-{}", round, i);
                db.set(key(i), value.clone()).unwrap();
                expected.insert(key(i).into_bytes(), value.into_bytes());
            }
        }
        if round < 2 {
            db.flush().unwrap();
        }
        if round == 0 {
            db.compact_all().unwrap();
        }
    }
    for i in (0..400).step_by(7) {
        db.delete(key(i)).unwrap();
        expected.remove(key(i).as_bytes());
    }

    let scanned = scan_all(&db);
    let want: Vec<_> = expected.into_iter().collect();
    assert_eq!(scanned, want);
}

#[test]
fn range_and_prefix_iteration() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());
    for name in ["apple", "apricot", "banana", "blueberry", "cherry"] {
        db.set(name, name.to_uppercase()).unwrap();
    }
    db.flush().unwrap();
    db.set("avocado", "AVOCADO").unwrap();

    let mut iter = db.new_iterator(IteratorOptions::prefix("a")).unwrap();
    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(String::from_utf8(iter.key().unwrap().to_vec()).unwrap());
        iter.next().unwrap();
    }
    assert_eq!(keys, vec!["apple", "apricot", "avocado"]);

    let mut iter = db
        .new_iterator(IteratorOptions::range("apricot", "blueberry"))
        .unwrap();
    assert_eq!(iter.key().unwrap(), b"apricot");
    iter.seek(b"b").unwrap();
    assert_eq!(iter.key().unwrap(), b"banana");
    assert_eq!(iter.value().unwrap(), Bytes::from("BANANA"));
    iter.next().unwrap();
    assert!(!iter.valid());
    assert!(iter.value().is_err());
}

#[test]
fn iterator_sees_snapshot() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());
    db.set("a", "1").unwrap();
    db.set("b", "2").unwrap();

    let mut iter = db.new_iterator(Default::default()).unwrap();
    db.delete("b").unwrap();
    db.set("a", "changed").unwrap();
    db.flush().unwrap();

    assert_eq!(iter.value().unwrap(), Bytes::from("1"));
    iter.next().unwrap();
    assert_eq!(iter.key().unwrap(), b"b");
    assert_eq!(iter.value().unwrap(), Bytes::from("2"));
}

#[test]
fn batch_applies_all_operations() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());
    db.set("gone", "x").unwrap();

    let mut batch = WriteBatch::new();
    batch.set("a", "1").set("b", "2").delete("gone").set("a", "3");
    db.batch_set(batch).unwrap();

    assert_eq!(db.get(b"a").unwrap().unwrap(), Bytes::from("3"));
    assert_eq!(db.get(b"b").unwrap().unwrap(), Bytes::from("2"));
    assert!(db.get(b"gone").unwrap().is_none());
    assert_eq!(db.stats().last_seq, 5);
}

#[test]
fn ttl_values_expire() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());

    db.set_with_ttl("session", "token", Duration::from_secs(1)).unwrap();
    db.set("permanent", "yes").unwrap();
    assert_eq!(db.get(b"session").unwrap().unwrap(), Bytes::from("token"));

    thread::sleep(Duration::from_millis(2100));
    assert!(db.get(b"session").unwrap().is_none());
    let keys: Vec<_> = scan_all(&db).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"permanent".to_vec()]);
}

#[test]
fn closed_engine_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());
    db.set("a", "1").unwrap();
    db.close().unwrap();

    assert!(matches!(db.get(b"a"), Err(TideError::Closed)));
    assert!(matches!(db.delete("a"), Err(TideError::Closed)));
    assert!(matches!(db.flush(), Err(TideError::Closed)));
    assert!(db.new_iterator(Default::default()).is_err());
}

#[test]
fn invalid_options_rejected_on_open() {
    let dir = TempDir::new().unwrap();
    let options = Options {
        compaction_level_size_ratio: 1,
        ..small_options()
    };
    assert!(matches!(
        tidekv_core::Db::open(dir.path(), options),
        Err(TideError::Config(_))
    ));
}

#[test]
fn concurrent_writers_and_readers() {
    let dir = TempDir::new().unwrap();
    let options = Options {
        sync_writes: false,
        ..small_options()
    };
    let db = Arc::new(open(dir.path(), options));

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..500 {
                    db.set(format!("t{}-{}", t, key(i)), vec![t as u8; 200]).unwrap();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..500 {
                    if let Some(v) = db.get(format!("t0-{}", key(i)).as_bytes()).unwrap() {
                        assert_eq!(v, Bytes::from(vec![0u8; 200]));
                    }
                }
            })
        })
        .collect();
    for h in writers.into_iter().chain(readers) {
        h.join().unwrap();
    }

    assert_eq!(db.stats().last_seq, 2000);
    for t in 0..4 {
        for i in (0..500).step_by(50) {
            let v = db.get(format!("t{}-{}", t, key(i)).as_bytes()).unwrap();
            assert_eq!(v.unwrap(), Bytes::from(vec![t as u8; 200]));
        }
    }
    assert_eq!(scan_all(&db).len(), 2000);
}

#[test]
fn hot_keys_hit_the_cache() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());
    for i in 0..100 {
        db.set(key(i), format!("v{}", i)).unwrap();
    }
    db.flush().unwrap();

    for _ in 0..20 {
        for i in 0..5 {
            db.get(key(i).as_bytes()).unwrap().unwrap();
        }
    }
    let cache = db.stats().cache;
    assert!(cache.hits > cache.misses);
    assert!(cache.hit_ratio() > 0.5);
}
