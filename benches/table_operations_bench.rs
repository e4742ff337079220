use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::prelude::*;
use std::time::Duration;
use tempfile::TempDir;

use quarrydb::common::types::RecordId;
use quarrydb::{StorageConfig, StorageEngine};

fn setup_test_environment() -> (StorageEngine, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        sync_on_commit: false,
        ..StorageConfig::new(dir.path()).with_buffer_pool_size(1000)
    };
    let engine = StorageEngine::open(config).unwrap();
    engine.create_table("bench").unwrap();
    (engine, dir)
}

fn generate_test_record(rng: &mut StdRng, size: usize) -> Vec<u8> {
    (0..size).map(|_| rng.r#gen::<u8>()).collect()
}

fn populate(engine: &StorageEngine, count: usize, size: usize) -> Vec<RecordId> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|_| {
            let record = generate_test_record(&mut rng, size);
            engine.insert_record("bench", &record).unwrap()
        })
        .collect()
}

fn table_operations_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("TableOperations");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    for &record_size in &[20usize, 500, 4000] {
        group.bench_with_input(BenchmarkId::new("insert_records", record_size), &record_size, |b, &record_size| {
            let (engine, _dir) = setup_test_environment();
            let mut rng = StdRng::seed_from_u64(1);
            let record = generate_test_record(&mut rng, record_size);
            b.iter(|| engine.insert_record("bench", &record).unwrap());
        });
    }

    for &record_count in &[100usize, 1000, 10_000] {
        group.bench_with_input(BenchmarkId::new("table_scan", record_count), &record_count, |b, &record_count| {
            let (engine, _dir) = setup_test_environment();
            populate(&engine, record_count, 100);
            b.iter(|| criterion::black_box(engine.scan_table("bench").unwrap().len()));
        });

        group.bench_with_input(BenchmarkId::new("record_lookup", record_count), &record_count, |b, &record_count| {
            let (engine, _dir) = setup_test_environment();
            let ids = populate(&engine, record_count, 100);
            let mut rng = StdRng::seed_from_u64(2);
            b.iter(|| {
                let id = ids[rng.gen_range(0..ids.len())];
                criterion::black_box(engine.get_record("bench", id).unwrap())
            });
        });
    }

    group.bench_function("record_update", |b| {
        let (engine, _dir) = setup_test_environment();
        let ids = populate(&engine, 1000, 100);
        let mut rng = StdRng::seed_from_u64(3);
        b.iter(|| {
            let id = ids[rng.gen_range(0..ids.len())];
            let record = generate_test_record(&mut rng, 100);
            engine.update_record("bench", id, &record).unwrap();
        });
    });

    group.bench_function("insert_delete_vacuum", |b| {
        b.iter_batched(
            || {
                let (engine, dir) = setup_test_environment();
                let ids = populate(&engine, 500, 200);
                for &id in ids.iter().step_by(2) {
                    engine.delete_record("bench", id).unwrap();
                }
                (engine, dir)
            },
            |(engine, dir)| {
                criterion::black_box(engine.vacuum().unwrap());
                (engine, dir)
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

criterion_group!(benches, table_operations_benchmark);
criterion_main!(benches);
