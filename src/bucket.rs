use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::cpu::CpuSource;
use crate::cursor::{
    Cursor, Direction, EntryKey, EntryResolver, SearchQuery, SeriesId, StorageOffset, Timestamp,
};
use crate::sequence::{Placement, Sequence};
use crate::{Error, Result};

/// One time window, split into per-CPU shards.
///
/// A bucket is live (`state == 0`) while it accepts writes. Retiring it
/// bumps the state; only then may it be merged. Every reset starts a new
/// generation.
pub struct Bucket {
    shards: Box<[Sequence]>,
    cpu: Arc<dyn CpuSource>,
    baseline: AtomicI64,
    state: AtomicU32,
    written: AtomicBool,
    generation: AtomicU64,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("shards", &self.shards.len())
            .field("baseline", &self.baseline())
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Bucket {
    pub fn new(shards: usize, capacity: usize, baseline: i64, cpu: Arc<dyn CpuSource>) -> Self {
        let shards = (0..shards.max(1)).map(|_| Sequence::new(capacity)).collect();
        Self {
            shards,
            cpu,
            baseline: AtomicI64::new(baseline),
            state: AtomicU32::new(0),
            written: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Routes the write to shard `cpu % shard_count`.
    pub fn add(
        &self,
        timestamp: Timestamp,
        series_id: SeriesId,
        offset: StorageOffset,
    ) -> Placement {
        let index = self.cpu.current_cpu() % self.shards.len();
        self.written.store(true, Ordering::Release);
        self.shards[index].add(timestamp, series_id, offset)
    }

    /// Runs `query` against every shard in shard order.
    ///
    /// Every shard streams its own ordered run and completes the cursor on
    /// its own, so results are not ordered across shards.
    pub fn search<C: Cursor + ?Sized>(&self, cursor: &mut C, query: &SearchQuery) {
        for shard in self.shards.iter() {
            shard.search(cursor, query);
        }
    }

    /// Every shard's matches for `query`, empty runs dropped.
    fn runs(&self, query: &SearchQuery) -> Vec<Vec<(EntryKey, StorageOffset)>> {
        self.shards
            .iter()
            .map(|shard| {
                let mut run = Vec::new();
                shard.scan(query, |key, offset| run.push((key, offset)));
                run
            })
            .filter(|run| !run.is_empty())
            .collect()
    }

    /// Drains every shard into `cursor` in `(timestamp, series id)` order.
    ///
    /// Offsets are compared by the key `resolver` reports for them. Equal
    /// keys come out lowest shard first. Returns the number of offsets
    /// emitted; fails with [`Error::Busy`] while the bucket is still live.
    pub fn merge<C, R>(&self, cursor: &mut C, resolver: &R) -> Result<usize>
    where
        C: Cursor + ?Sized,
        R: EntryResolver + ?Sized,
    {
        self.merge_checked(cursor, resolver, || Ok(()))
    }

    /// `check` runs before the liveness test and again once every shard
    /// index is locked.
    fn merge_checked<C, R, F>(&self, cursor: &mut C, resolver: &R, check: F) -> Result<usize>
    where
        C: Cursor + ?Sized,
        R: EntryResolver + ?Sized,
        F: Fn() -> Result<()>,
    {
        check()?;
        if self.is_live() {
            return Err(Error::Busy);
        }
        if !self.written.load(Ordering::Acquire) {
            return Ok(0);
        }

        let indexes: Vec<_> = self.shards.iter().map(Sequence::lock_index).collect();
        check()?;
        if let [only] = indexes.as_slice() {
            for (_, offset) in only.iter() {
                cursor.put(offset);
            }
            return Ok(only.len());
        }

        let mut iters: Vec<_> = indexes
            .iter()
            .map(|index| index.iter().map(|(_, offset)| offset))
            .collect();
        // Resolved key of every shard's next offset; each offset is resolved once.
        let mut heads: Vec<Option<(EntryKey, StorageOffset)>> = iters
            .iter_mut()
            .map(|iter| iter.next().map(|offset| (resolver.resolve(offset), offset)))
            .collect();

        let mut emitted = 0;
        loop {
            let mut best: Option<(usize, EntryKey)> = None;
            for (source, head) in heads.iter().enumerate() {
                if let Some((key, _)) = head {
                    if best.map_or(true, |(_, best_key)| *key < best_key) {
                        best = Some((source, *key));
                    }
                }
            }
            let Some((source, _)) = best else {
                break;
            };
            if let Some((_, offset)) = heads[source].take() {
                cursor.put(offset);
                emitted += 1;
            }
            heads[source] = iters[source]
                .next()
                .map(|offset| (resolver.resolve(offset), offset));
        }
        Ok(emitted)
    }

    /// Marks the bucket as no longer writable.
    pub fn retire(&self) {
        self.state.fetch_add(1, Ordering::AcqRel);
    }

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.state() == 0
    }

    pub fn baseline(&self) -> i64 {
        self.baseline.load(Ordering::Acquire)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> Option<&Sequence> {
        self.shards.get(index)
    }

    /// Entries held across all shards, staged ones included.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.size() + shard.staged_len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Clears all shards and makes the bucket live again for `baseline`.
    ///
    /// The generation moves before any shard is cleared, so a reader that
    /// still sees the old generation with a shard locked sees old data.
    pub(crate) fn reset(&self, baseline: i64) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        for shard in self.shards.iter() {
            shard.clear();
        }
        self.written.store(false, Ordering::Release);
        self.baseline.store(baseline, Ordering::Release);
        self.state.store(0, Ordering::Release);
    }

    pub(crate) fn rebase(&self, baseline: i64) {
        self.baseline.store(baseline, Ordering::Release);
    }
}

/// A bucket pinned to the window it held when the handle was taken.
///
/// Buckets are recycled in place. Once the bucket behind a handle is reset
/// for another window, the handle reads as empty and retired and its
/// `merge` fails with [`Error::Recycled`].
#[derive(Debug, Clone)]
pub struct BucketHandle {
    bucket: Arc<Bucket>,
    window: i64,
    generation: u64,
}

impl BucketHandle {
    pub(crate) fn new(bucket: Arc<Bucket>) -> Self {
        Self {
            window: bucket.baseline(),
            generation: bucket.generation(),
            bucket,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Whether the bucket still holds this handle's window.
    pub fn is_current(&self) -> bool {
        self.bucket.generation() == self.generation
    }

    fn check(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::Recycled {
                window: self.window,
            })
        }
    }

    pub fn is_live(&self) -> bool {
        self.is_current() && self.bucket.is_live()
    }

    pub fn len(&self) -> usize {
        if self.is_current() {
            self.bucket.len()
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// [`Bucket::merge`] for this handle's window.
    pub fn merge<C, R>(&self, cursor: &mut C, resolver: &R) -> Result<usize>
    where
        C: Cursor + ?Sized,
        R: EntryResolver + ?Sized,
    {
        self.bucket.merge_checked(cursor, resolver, || self.check())
    }

    /// Like [`Bucket::search`], but merges the shard runs by key so `emit`
    /// sees one stream ordered in the query's direction. Nothing is emitted
    /// if the bucket was recycled before its shards were scanned.
    pub fn search_ordered<F>(&self, query: &SearchQuery, mut emit: F) -> Result<()>
    where
        F: FnMut(StorageOffset),
    {
        self.check()?;
        let runs = self.bucket.runs(query);
        self.check()?;
        if runs.len() == 1 {
            runs[0].iter().for_each(|(_, offset)| emit(*offset));
            return Ok(());
        }
        let mut positions = vec![0usize; runs.len()];
        loop {
            let mut best: Option<(usize, EntryKey)> = None;
            for (source, run) in runs.iter().enumerate() {
                let Some((key, _)) = run.get(positions[source]) else {
                    continue;
                };
                let better = match (best, query.direction) {
                    (None, _) => true,
                    (Some((_, best_key)), Direction::Forward) => *key < best_key,
                    (Some((_, best_key)), Direction::Backward) => *key > best_key,
                };
                if better {
                    best = Some((source, *key));
                }
            }
            let Some((source, _)) = best else {
                break;
            };
            emit(runs[source][positions[source]].1);
            positions[source] += 1;
        }
        Ok(())
    }
}
