//! Store-level benchmarks: sequential insert throughput, point reads, and
//! ordered scans.
//!
//! ```bash
//! cargo bench --bench btree
//! cargo bench --bench btree -- "point_get"
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

use coppice::{Cmp, Store, WriteMode};

fn populated_store(rows: u32) -> (tempfile::TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("bench.db")).unwrap();
    let mut tx = store.begin_rw();
    for i in 0..rows {
        let key = format!("key_{i:08}");
        let val = format!("value_{i:08}");
        tx.set(key.as_bytes(), val.as_bytes(), WriteMode::Upsert)
            .unwrap();
    }
    tx.commit().unwrap();
    (dir, store)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    for rows in [1_000u32, 10_000] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, &rows| {
            b.iter(|| {
                let (_dir, store) = populated_store(rows);
                black_box(store);
            });
        });
    }
    group.finish();
}

fn bench_point_get(c: &mut Criterion) {
    let (_dir, store) = populated_store(10_000);
    let snap = store.begin_ro();

    c.bench_function("point_get", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let key = format!("key_{:08}", i % 10_000);
            i = i.wrapping_add(7919);
            black_box(snap.get(key.as_bytes()).unwrap())
        });
    });
}

fn bench_scan(c: &mut Criterion) {
    let (_dir, store) = populated_store(10_000);
    let snap = store.begin_ro();

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("full_forward", |b| {
        b.iter(|| {
            let mut iter = snap.seek(b"key_", Cmp::Ge).unwrap();
            let mut n = 0u32;
            while iter.valid() {
                black_box(iter.deref());
                n += 1;
                iter.next().unwrap();
            }
            assert_eq!(n, 10_000);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_point_get, bench_scan);
criterion_main!(benches);
