// Crash recovery: WAL replay, torn tails and restarts

mod common;

use bytes::Bytes;
use common::{key, open, scan_all, small_options, wal_segments};
use std::fs::OpenOptions;
use tempfile::TempDir;
use tidekv_core::{Options, WriteBatch};

fn unsynced() -> Options {
    Options {
        sync_writes: false,
        ..small_options()
    }
}

#[test]
fn large_values_survive_restart() {
    let dir = TempDir::new().unwrap();
    let value = |i: usize| vec![(i % 251) as u8; 1100];
    {
        let db = open(dir.path(), unsynced());
        for i in 0..10_000 {
            db.set(key(i), value(i)).unwrap();
        }
        db.close().unwrap();
    }

    let db = open(dir.path(), unsynced());
    for i in 0..10_000 {
        let got = db.get(key(i).as_bytes()).unwrap();
        assert_eq!(got, Some(Bytes::from(value(i))), "{}", key(i));
    }
    assert_eq!(scan_all(&db).len(), 10_000);
    assert!(db.stats().value_log_bytes > 10_000 * 1100);
}

#[test]
fn unflushed_writes_replayed_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(dir.path(), small_options());
        db.set("a", "1").unwrap();
        db.flush().unwrap();
        db.set("b", "2").unwrap();
        db.delete("a").unwrap();
        // dropped without close
    }

    let db = open(dir.path(), small_options());
    assert!(db.get(b"a").unwrap().is_none());
    assert_eq!(db.get(b"b").unwrap().unwrap(), Bytes::from("2"));
    assert_eq!(db.stats().last_seq, 3);
}

#[test]
fn repeated_restarts_keep_sequence_monotonic() {
    let dir = TempDir::new().unwrap();
    for round in 0..5u64 {
        let db = open(dir.path(), small_options());
        assert_eq!(db.stats().last_seq, round * 10);
        for i in 0..10 {
            db.set(key(i), format!("round{}", round)).unwrap();
        }
        if round % 2 == 0 {
            db.flush().unwrap();
        }
        db.close().unwrap();
    }

    let db = open(dir.path(), small_options());
    assert_eq!(scan_all(&db).len(), 10);
    assert_eq!(db.get(key(3).as_bytes()).unwrap().unwrap(), Bytes::from("round4"));
}

#[test]
fn torn_wal_tail_drops_only_last_record() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(dir.path(), small_options());
        for i in 0..5 {
            db.set(key(i), format!("v{}", i)).unwrap();
        }
        db.close().unwrap();
    }

    let segments = wal_segments(dir.path());
    let newest = segments.iter().rev().find(|p| p.metadata().unwrap().len() > 0).unwrap();
    let file = OpenOptions::new().write(true).open(newest).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - 3).unwrap();
    drop(file);

    let db = open(dir.path(), small_options());
    for i in 0..4 {
        assert_eq!(
            db.get(key(i).as_bytes()).unwrap().unwrap(),
            Bytes::from(format!("v{}", i))
        );
    }
    assert!(db.get(key(4).as_bytes()).unwrap().is_none());

    // the truncated segment keeps working as a base for new writes
    db.set(key(4), "again").unwrap();
    db.close().unwrap();
    let db = open(dir.path(), small_options());
    assert_eq!(db.get(key(4).as_bytes()).unwrap().unwrap(), Bytes::from("again"));
}

#[test]
fn torn_batch_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(dir.path(), small_options());
        db.set("before", "ok").unwrap();
        let mut batch = WriteBatch::new();
        for i in 0..50 {
            batch.set(key(i), "batched");
        }
        db.batch_set(batch).unwrap();
        db.close().unwrap();
    }

    let segments = wal_segments(dir.path());
    let newest = segments.iter().rev().find(|p| p.metadata().unwrap().len() > 0).unwrap();
    let file = OpenOptions::new().write(true).open(newest).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - 10).unwrap();
    drop(file);

    let db = open(dir.path(), small_options());
    assert_eq!(db.get(b"before").unwrap().unwrap(), Bytes::from("ok"));
    for i in 0..50 {
        assert!(db.get(key(i).as_bytes()).unwrap().is_none());
    }
    assert_eq!(db.stats().last_seq, 1);
}

#[test]
fn intact_batch_recovered_whole() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(dir.path(), small_options());
        let mut batch = WriteBatch::new();
        for i in 0..50 {
            batch.set(key(i), "batched");
        }
        batch.delete(key(10));
        db.batch_set(batch).unwrap();
    }

    let db = open(dir.path(), small_options());
    let live = scan_all(&db);
    assert_eq!(live.len(), 49);
    assert!(live.iter().all(|(_, v)| v == b"batched"));
}

#[test]
fn flushed_wal_segments_are_removed() {
    let dir = TempDir::new().unwrap();
    let db = open(dir.path(), small_options());
    for i in 0..100 {
        db.set(key(i), "v").unwrap();
    }
    db.flush().unwrap();
    db.set("tail", "v").unwrap();
    db.close().unwrap();

    // only the active generation is left behind
    assert_eq!(wal_segments(dir.path()).len(), 1);
}
