//! Benchmarks for HNSW index inserts, search and persistence.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hnsw_blockstore::{CreateIndexInput, HnswIndex, InMemoryBlockManager, Index, LogicalType, RowId, VectorChunk};
use rand::prelude::*;
use std::sync::Arc;

const DIMS: usize = 64;

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| (0..dim).map(|_| rng.gen::<f32>()).collect()).collect()
}

fn build_index(vectors: &[Vec<f32>]) -> HnswIndex {
    let blocks = Arc::new(InMemoryBlockManager::new(256 * 1024));
    let index = HnswIndex::create(CreateIndexInput::new(
        "bench_embedding",
        LogicalType::array(LogicalType::Float, DIMS),
        blocks,
    ))
    .unwrap();
    let chunk = VectorChunk::from_rows(DIMS, vectors).unwrap();
    let row_ids: Vec<RowId> = (0..vectors.len() as RowId).collect();
    index.append(&chunk, &row_ids).unwrap();
    index
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_insert");
    group.sample_size(10);

    for n in [1_000, 5_000] {
        let vectors = random_vectors(n, DIMS, 42);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &vectors, |b, vectors| {
            b.iter(|| black_box(build_index(vectors)))
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let vectors = random_vectors(10_000, DIMS, 42);
    let queries = random_vectors(100, DIMS, 7);
    let index = build_index(&vectors);

    let mut group = c.benchmark_group("hnsw_search");
    for k in [1, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(k), &k, |b, &k| {
            let mut i = 0;
            b.iter(|| {
                let q = &queries[i % queries.len()];
                i += 1;
                black_box(Index::search(&index, q, k).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_persist(c: &mut Criterion) {
    let vectors = random_vectors(5_000, DIMS, 42);
    let index = build_index(&vectors);
    let extra = VectorChunk::from_rows(DIMS, &random_vectors(1, DIMS, 9)).unwrap();
    let mut next_row = vectors.len() as RowId;

    c.bench_function("hnsw_persist_5k", |b| {
        b.iter(|| {
            // Keep the index dirty so every iteration rewrites the chain
            index.append(&extra, &[next_row]).unwrap();
            next_row += 1;
            black_box(index.persist_to_disk().unwrap())
        })
    });
}

criterion_group!(benches, bench_insert, bench_search, bench_persist);
criterion_main!(benches);
