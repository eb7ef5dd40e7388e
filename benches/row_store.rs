//! Row Store Benchmarks
//!
//! Drives every backend through the operations of a workload run:
//! - read of a whole preloaded row
//! - single-field update
//! - insert of a fresh row
//! - a 50/50 read/update mix
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench row_store
//!
//! # One backend or operation
//! cargo bench --bench row_store -- "recoverable"
//! cargo bench --bench row_store -- "row_store/update"
//! ```
//!
//! `NVBENCH_UPDATE_PATH=weak` runs the failure-atomic backend on the weak
//! update path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nvbench::{
    open_backend, BackendKind, ByteSequence, DriverConfig, GeneratedSequence, Row, RowStore,
    UpdatePath,
};
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Constants and Configuration
// =============================================================================

/// Fixed seed for deterministic generated values.
const BENCH_SEED: u64 = 0xDEADBEEF_CAFEBABE;

const TABLE: &str = "usertable";
const RECORDS: u64 = 1_000;
const FIELDS: u64 = 10;
const FIELD_LEN: u64 = 100;

/// Iterations between reclaims of superseded blocks.
const RECLAIM_EVERY: u64 = 1024;

const BACKENDS: [BackendKind; 4] = [
    BackendKind::Volatile,
    BackendKind::Image,
    BackendKind::Recoverable,
    BackendKind::FailureAtomic,
];

// =============================================================================
// Helper Functions
// =============================================================================

fn update_path() -> UpdatePath {
    match std::env::var("NVBENCH_UPDATE_PATH").as_deref() {
        Ok("weak") => UpdatePath::Weak,
        _ => UpdatePath::Strong,
    }
}

fn config(kind: BackendKind) -> DriverConfig {
    let path = if kind == BackendKind::FailureAtomic {
        update_path()
    } else {
        UpdatePath::Strong
    };
    let mut config = DriverConfig::new(kind).with_update_path(path);
    config.pmem.size = 256 * 1024 * 1024;
    config.record_count = RECORDS;
    config
}

fn value(seed: u64) -> Vec<u8> {
    GeneratedSequence::new(FIELD_LEN, BENCH_SEED ^ seed)
        .to_array()
        .unwrap()
}

fn record(seed: u64) -> Row {
    let mut row = Row::with_capacity(FIELDS as usize);
    for f in 0..FIELDS {
        row.insert(format!("field{}", f), value(seed * FIELDS + f));
    }
    row
}

fn key(i: u64) -> String {
    format!("user{}", i)
}

fn preloaded(kind: BackendKind) -> Box<dyn RowStore> {
    let store = open_backend(&config(kind)).unwrap();
    for i in 0..RECORDS {
        store.insert(TABLE, &key(i), record(i));
    }
    store
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_store/read");
    group.throughput(Throughput::Elements(1));
    for kind in BACKENDS {
        let store = preloaded(kind);
        let next = AtomicU64::new(0);
        group.bench_function(BenchmarkId::from_parameter(kind), |b| {
            b.iter(|| {
                let i = next.fetch_add(1, Ordering::Relaxed) % RECORDS;
                black_box(store.read(TABLE, &key(i), None).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_store/update");
    group.throughput(Throughput::Elements(1));
    for kind in BACKENDS {
        let store = preloaded(kind);
        let next = AtomicU64::new(0);
        group.bench_function(BenchmarkId::from_parameter(kind), |b| {
            b.iter(|| {
                let n = next.fetch_add(1, Ordering::Relaxed);
                if n % RECLAIM_EVERY == 0 {
                    store.reclaim().unwrap();
                }
                let mut row = Row::new();
                row.insert(format!("field{}", n % FIELDS), value(n));
                black_box(store.update(TABLE, &key(n % RECORDS), row))
            })
        });
        store.close().unwrap();
    }
    group.finish();
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_store/insert");
    group.throughput(Throughput::Elements(1));
    for kind in BACKENDS {
        let store = open_backend(&config(kind)).unwrap();
        let next = AtomicU64::new(0);
        group.bench_function(BenchmarkId::from_parameter(kind), |b| {
            b.iter(|| {
                let n = next.fetch_add(1, Ordering::Relaxed);
                if n % RECLAIM_EVERY == 0 {
                    store.reclaim().unwrap();
                }
                let status = store.insert(TABLE, &key(n % (RECORDS * 10)), record(n));
                black_box(status)
            })
        });
        store.close().unwrap();
    }
    group.finish();
}

fn bench_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_store/mixed_50_50");
    group.throughput(Throughput::Elements(1));
    for kind in BACKENDS {
        let store = preloaded(kind);
        let next = AtomicU64::new(0);
        group.bench_function(BenchmarkId::from_parameter(kind), |b| {
            b.iter(|| {
                let n = next.fetch_add(1, Ordering::Relaxed);
                if n % RECLAIM_EVERY == 0 {
                    store.reclaim().unwrap();
                }
                let k = key(n % RECORDS);
                if n % 2 == 0 {
                    black_box(store.read(TABLE, &k, Some(&["field0"])).is_ok());
                } else {
                    let mut row = Row::new();
                    row.insert("field0", value(n));
                    black_box(store.update(TABLE, &k, row));
                }
            })
        });
        store.close().unwrap();
    }
    group.finish();
}

criterion_group!(benches, bench_read, bench_update, bench_insert, bench_mixed);
criterion_main!(benches);
