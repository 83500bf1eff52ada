use std::sync::{Arc, Barrier};
use std::thread;

use tscache::{
    Cache, CacheConfig, EntryKey, SearchQuery, Sequence, StorageOffset, ThreadSlot, VecCursor,
};

const WRITERS: usize = 4;
const PER_WRITER: u64 = 5_000;

fn pack(timestamp: u64, series_id: u64) -> StorageOffset {
    (timestamp << 16) | series_id
}

fn unpack(offset: StorageOffset) -> EntryKey {
    EntryKey::new(offset >> 16, offset & 0xffff)
}

#[test]
fn staged_writes_become_visible_after_writers_finish() {
    let seq = Arc::new(Sequence::new(1024));
    let barrier = Arc::new(Barrier::new(2));

    let writer = {
        let seq = Arc::clone(&seq);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for ts in 0..PER_WRITER {
                seq.add(ts, 1, ts);
            }
        })
    };
    let reader = {
        let seq = Arc::clone(&seq);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut scans = 0;
            while scans < 200 {
                let mut cursor = VecCursor::new();
                seq.search(&mut cursor, &SearchQuery::forward(1, 0, u64::MAX));
                assert!(cursor.offsets.windows(2).all(|pair| pair[0] < pair[1]));
                scans += 1;
            }
        })
    };
    writer.join().expect("writer join");
    reader.join().expect("reader join");

    let mut cursor = VecCursor::new();
    seq.search(&mut cursor, &SearchQuery::forward(1, 0, u64::MAX));
    assert_eq!(cursor.offsets, (0..PER_WRITER).collect::<Vec<_>>());
    assert_eq!(seq.staged_len(), 0);
}

#[test]
fn parallel_writers_flush_in_order() {
    let config = CacheConfig::new(1 << 20)
        .with_shards(WRITERS)
        .with_max_windows(4);
    let cache = Arc::new(Cache::with_cpu_source(config, Arc::new(ThreadSlot)).expect("cache"));
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS as u64)
        .map(|series_id| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for ts in 0..PER_WRITER {
                    cache
                        .add_entry(EntryKey::new(ts, series_id), pack(ts, series_id))
                        .expect("add entry");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer join");
    }

    assert_eq!(cache.stats().accepted, WRITERS as u64 * PER_WRITER);

    let mut search = VecCursor::new();
    cache.search(&mut search, &SearchQuery::backward(2, 0, u64::MAX >> 1));
    let expected: Vec<_> = (1..PER_WRITER).rev().map(|ts| pack(ts, 2)).collect();
    assert_eq!(search.into_result(), Ok(expected));

    assert_eq!(cache.retire(0), Ok(true));
    let mut flushed = VecCursor::new();
    let emitted = cache.remove_old(&unpack, &mut flushed).expect("remove old");
    assert_eq!(emitted, WRITERS * PER_WRITER as usize);
    let keys: Vec<_> = flushed.offsets.iter().map(|off| unpack(*off)).collect();
    assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));
}
