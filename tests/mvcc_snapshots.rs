//! # Snapshot Isolation Tests
//!
//! Cross-thread verification of the single-writer/many-reader model: a
//! snapshot sees exactly the state at its captured version, commits are
//! totally ordered, and page reuse waits for old readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use coppice::{Database, DataType, Record, ScanSpec, Store, WriteMode};

#[test]
fn snapshot_sees_exactly_its_version_across_commits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("iso.db")).unwrap();

    let mut tx = store.begin_rw();
    tx.set(b"a", b"1", WriteMode::Upsert).unwrap();
    tx.commit().unwrap();

    let snap = store.begin_ro();
    let version = snap.version();

    for i in 0..10u8 {
        let mut tx = store.begin_rw();
        tx.set(b"a", &[i], WriteMode::Upsert).unwrap();
        tx.set(format!("new_{i}").as_bytes(), b"x", WriteMode::Upsert)
            .unwrap();
        tx.commit().unwrap();
    }

    // the old snapshot is untouched by all ten commits
    assert_eq!(snap.version(), version);
    assert_eq!(snap.get(b"a").unwrap().unwrap(), b"1");
    for i in 0..10u8 {
        assert_eq!(snap.get(format!("new_{i}").as_bytes()).unwrap(), None);
    }
    drop(snap);

    let fresh = store.begin_ro();
    assert_eq!(fresh.get(b"a").unwrap().unwrap(), &[9][..]);
}

#[test]
fn concurrent_readers_never_observe_partial_commits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("torn.db")).unwrap());

    // every commit writes a consistent pair: k_a == k_b
    {
        let mut tx = store.begin_rw();
        tx.set(b"k_a", &0u64.to_be_bytes(), WriteMode::Upsert).unwrap();
        tx.set(b"k_b", &0u64.to_be_bytes(), WriteMode::Upsert).unwrap();
        tx.commit().unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut observed = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let snap = store.begin_ro();
                let a = snap.get(b"k_a").unwrap().unwrap();
                let b = snap.get(b"k_b").unwrap().unwrap();
                assert_eq!(a, b, "torn read: snapshot mixes two commits");
                observed = observed.max(u64::from_be_bytes(a.try_into().unwrap()));
            }
            observed
        }));
    }

    for i in 1..=200u64 {
        let mut tx = store.begin_rw();
        tx.set(b"k_a", &i.to_be_bytes(), WriteMode::Upsert).unwrap();
        tx.set(b"k_b", &i.to_be_bytes(), WriteMode::Upsert).unwrap();
        tx.commit().unwrap();
    }
    stop.store(true, Ordering::Relaxed);

    for handle in readers {
        let observed = handle.join().unwrap();
        assert!(observed <= 200);
    }
}

#[test]
fn version_counter_is_monotonic_across_writers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("mono.db")).unwrap());

    let mut writers = Vec::new();
    for t in 0..4u8 {
        let store = store.clone();
        writers.push(thread::spawn(move || {
            let mut versions = Vec::new();
            for i in 0..25u8 {
                let mut tx = store.begin_rw();
                versions.push(tx.version());
                tx.set(&[t, i], b"v", WriteMode::Upsert).unwrap();
                tx.commit().unwrap();
            }
            versions
        }));
    }

    let mut all: Vec<u64> = writers
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();

    // 100 commits, each from a distinct begin version: no version is shared
    assert_eq!(all.len(), 100);

    let snap = store.begin_ro();
    assert_eq!(snap.version(), 100);
}

#[test]
fn long_lived_reader_survives_heavy_page_churn() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("churn.db")).unwrap());

    let mut tx = store.begin_rw();
    for i in 0..200u32 {
        tx.set(format!("k{i:03}").as_bytes(), &[1u8; 400], WriteMode::Upsert)
            .unwrap();
    }
    tx.commit().unwrap();

    // pin a snapshot, then churn every page it can reach many times over
    let snap = store.begin_ro();
    let churn = {
        let store = store.clone();
        thread::spawn(move || {
            for round in 0..30u32 {
                let mut tx = store.begin_rw();
                for i in 0..200u32 {
                    tx.set(
                        format!("k{i:03}").as_bytes(),
                        &[round as u8; 400],
                        WriteMode::Upsert,
                    )
                    .unwrap();
                }
                tx.commit().unwrap();
            }
        })
    };

    // the pinned snapshot keeps reading its own tree while pages recycle
    for _ in 0..50 {
        for i in (0..200u32).step_by(17) {
            let got = snap.get(format!("k{i:03}").as_bytes()).unwrap().unwrap();
            assert_eq!(got, &[1u8; 400][..], "snapshot saw a recycled page");
        }
    }
    churn.join().unwrap();
    drop(snap);
}

#[test]
fn aborted_transaction_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("abort.db")).unwrap();

    let mut tx = db.begin_rw();
    tx.table_new(
        coppice::TableDef::new("t")
            .column("k", DataType::Bytes)
            .column("v", DataType::Bytes)
            .primary_keys(1),
    )
    .unwrap();
    tx.commit().unwrap();

    let mut tx = db.begin_rw();
    let mut rec = Record::new();
    rec.set_bytes("k", "doomed").set_bytes("v", "1");
    tx.insert("t", &rec).unwrap();
    tx.abort();

    let snap = db.begin_ro();
    let sc = snap.scan("t", ScanSpec::all()).unwrap();
    assert!(!sc.valid(), "aborted insert is visible");
}

#[test]
fn readers_do_not_block_writers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("rw.db")).unwrap());
    {
        let mut tx = store.begin_rw();
        tx.set(b"k", b"0", WriteMode::Upsert).unwrap();
        tx.commit().unwrap();
    }

    let snap = store.begin_ro();

    // a writer commits while the reader is live
    let mut tx = store.begin_rw();
    tx.set(b"k", b"1", WriteMode::Upsert).unwrap();
    tx.commit().unwrap();

    assert_eq!(snap.get(b"k").unwrap().unwrap(), b"0");
    drop(snap);
    let fresh = store.begin_ro();
    assert_eq!(fresh.get(b"k").unwrap().unwrap(), b"1");
}
