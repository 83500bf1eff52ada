use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tscache::{Bucket, Cache, CacheConfig, EntryKey, SchedCpu, StorageOffset, VecCursor};

const WRITERS: usize = 4;
const ENTRIES_PER_WRITER: u64 = 100_000;
const TOTAL_ENTRIES: u64 = WRITERS as u64 * ENTRIES_PER_WRITER;

fn unpack(offset: StorageOffset) -> EntryKey {
    EntryKey::new(offset >> 16, offset & 0xffff)
}

fn bench_parallel_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_ingest");
    group.throughput(Throughput::Elements(TOTAL_ENTRIES));

    group.bench_function(format!("{}_writers", WRITERS), |b| {
        b.iter_custom(|iters| {
            let core_ids = core_affinity::get_core_ids().unwrap_or_default();
            let config = CacheConfig::new(1 << 24).with_shards(WRITERS);
            let cache = Arc::new(Cache::with_cpu_source(config, Arc::new(SchedCpu)).expect("cache"));
            let barrier = Arc::new(Barrier::new(WRITERS + 1));

            let mut handles = Vec::with_capacity(WRITERS);
            for writer in 0..WRITERS {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let core = core_ids.get(writer % core_ids.len().max(1)).copied();
                handles.push(thread::spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    barrier.wait();
                    for i in 0..ENTRIES_PER_WRITER * iters {
                        let key = EntryKey::new(i, writer as u64);
                        let offset = (i << 16) | writer as u64;
                        let _ = cache.add_entry(black_box(key), offset);
                    }
                }));
            }

            barrier.wait();
            let start = Instant::now();
            for handle in handles {
                handle.join().expect("writer join");
            }
            start.elapsed()
        })
    });
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.throughput(Throughput::Elements(TOTAL_ENTRIES));

    let bucket = Bucket::new(WRITERS, 1024, 0, Arc::new(tscache::ThreadSlot));
    thread::scope(|scope| {
        for writer in 0..WRITERS as u64 {
            let bucket = &bucket;
            scope.spawn(move || {
                for i in 0..ENTRIES_PER_WRITER {
                    bucket.add(i, writer, (i << 16) | writer);
                }
            });
        }
    });
    bucket.retire();

    group.bench_function(format!("{}_shards", WRITERS), |b| {
        b.iter(|| {
            let mut cursor = VecCursor::new();
            cursor.offsets.reserve(TOTAL_ENTRIES as usize);
            bucket.merge(&mut cursor, &unpack).expect("merge");
            black_box(cursor.offsets.len())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_parallel_ingest, bench_merge);
criterion_main!(benches);
