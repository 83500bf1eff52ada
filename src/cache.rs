//! Window lifecycle: maps timestamps to buckets, slides the window set
//! forward, retires old buckets and recycles them through a free pool.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, trace, warn};

use crate::bucket::{Bucket, BucketHandle};
use crate::config::CacheConfig;
use crate::cpu::{CpuSource, SchedCpu};
use crate::cursor::{Cursor, Direction, EntryKey, EntryResolver, SearchQuery, StorageOffset, Timestamp};
use crate::sequence::Placement;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::{Error, Result};

struct Lists {
    /// Index of the current window.
    baseline: i64,
    /// Resident buckets, newest first. Live buckets precede retired ones.
    active: VecDeque<Arc<Bucket>>,
    /// Reset buckets ready for reuse.
    free: VecDeque<Arc<Bucket>>,
    /// Every bucket ever built. Only grows.
    arena: Vec<Arc<Bucket>>,
    /// Windows whose buckets were evicted.
    evicted: Evictions,
}

impl Lists {
    fn with_capacity(population: usize) -> Self {
        Self {
            baseline: 0,
            active: VecDeque::new(),
            free: VecDeque::with_capacity(population),
            arena: Vec::with_capacity(population),
            evicted: Evictions::default(),
        }
    }

    fn find_live(&self, window: i64) -> Option<&Arc<Bucket>> {
        self.active
            .iter()
            .find(|bucket| bucket.is_live() && bucket.baseline() == window)
    }
}

/// Evicted windows as disjoint inclusive ranges, keyed by their first window.
#[derive(Debug, Default)]
struct Evictions(BTreeMap<i64, i64>);

impl Evictions {
    fn insert(&mut self, window: i64) {
        let mut start = window;
        let mut end = window;
        if let Some((&first, &last)) = self.0.range(..=window).next_back() {
            if last >= window {
                return;
            }
            if last + 1 == window {
                start = first;
            }
        }
        if let Some(last) = self.0.remove(&(window + 1)) {
            end = last;
        }
        self.0.insert(start, end);
    }

    /// Evicted ranges clipped to `low..=high`.
    fn within(&self, low: i64, high: i64) -> impl Iterator<Item = (i64, i64)> + '_ {
        let straddling = self
            .0
            .range(..low)
            .next_back()
            .filter(|&(_, &last)| last >= low)
            .map(|(_, &last)| (low, last.min(high)));
        straddling.into_iter().chain(
            self.0
                .range(low..=high)
                .map(move |(&first, &last)| (first, last.min(high))),
        )
    }
}

/// Write-back cache of `(timestamp, series id) -> offset` triples, bucketed
/// into windows of `2^shift` time units.
///
/// The current window and up to `max_windows - 1` older ones accept writes.
/// A write for a newer window moves the baseline forward and retires the
/// buckets that fall out of range; retired buckets stay searchable until
/// [`Cache::remove_old`] drains them.
pub struct Cache {
    config: CacheConfig,
    shift: u32,
    cpu: Arc<dyn CpuSource>,
    lists: RwLock<Lists>,
    stats: CacheStats,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_cpu_source(config, Arc::new(SchedCpu))
    }

    pub fn with_cpu_source(config: CacheConfig, cpu: Arc<dyn CpuSource>) -> Result<Self> {
        let shift = config.validate()?;
        let cache = Self {
            lists: RwLock::new(Lists::with_capacity(config.population)),
            config,
            shift,
            cpu,
            stats: CacheStats::new(),
        };

        {
            let mut lists = cache.write_lists()?;
            for _ in 0..cache.config.population {
                let bucket = cache.build_bucket(0);
                lists.arena.push(Arc::clone(&bucket));
                lists.free.push_back(bucket);
            }
            let seed = cache.take_free(&mut lists, 0)?;
            lists.active.push_front(seed);
        }

        info!(
            "cache ready: window width 2^{} ({} shards, {} windows, {} buckets pre-built)",
            shift, cache.config.shards, cache.config.max_windows, cache.config.population
        );
        Ok(cache)
    }

    /// Adds an entry to the bucket of its window.
    ///
    /// Returns the number of buckets this call retired while sliding the
    /// window set forward. Fails with [`Error::Overflow`] when the target
    /// window is no longer writable and with [`Error::CacheFull`] when a slide
    /// would need more buckets than `max_buckets` allows.
    pub fn add_entry(&self, entry: EntryKey, offset: StorageOffset) -> Result<usize> {
        let window = self.window_of(entry.timestamp);
        {
            let lists = self.read_lists()?;
            let age = lists.baseline - window;
            if age >= 0 {
                // The front bucket is the current window unless it was retired.
                let target = match lists.active.front() {
                    Some(front) if age == 0 && front.is_live() && front.baseline() == window => {
                        Some(front)
                    }
                    _ => lists.find_live(window),
                };
                return match target {
                    Some(bucket) => {
                        self.add_to(bucket, entry, offset);
                        Ok(0)
                    }
                    None => Err(self.overflow(window, lists.baseline)),
                };
            }
        }

        let mut lists = self.write_lists()?;
        self.add_sliding(&mut lists, window, entry, offset)
    }

    /// Write path under the exclusive lock. Another writer may have moved the
    /// baseline since the shared lock was released.
    fn add_sliding(
        &self,
        lists: &mut Lists,
        window: i64,
        entry: EntryKey,
        offset: StorageOffset,
    ) -> Result<usize> {
        let slid = lists.baseline < window;
        let retired = if slid {
            self.slide(lists, window)?
        } else {
            0
        };
        match lists.find_live(window) {
            Some(bucket) => {
                self.add_to(bucket, entry, offset);
                Ok(retired)
            }
            None if slid => Err(Error::General("bucket missing after window slide")),
            None => Err(self.overflow(window, lists.baseline)),
        }
    }

    fn add_to(&self, bucket: &Bucket, entry: EntryKey, offset: StorageOffset) {
        let placement = bucket.add(entry.timestamp, entry.series_id, offset);
        self.stats.record_accepted(placement == Placement::Staged);
    }

    fn overflow(&self, window: i64, baseline: i64) -> Error {
        trace!("write to window {window} dropped, baseline is {baseline}");
        self.stats.record_overflow();
        Error::Overflow { window, baseline }
    }

    /// Moves the baseline to `window`, retiring every live bucket that ends
    /// up `max_windows` or more windows behind it.
    fn slide(&self, lists: &mut Lists, window: i64) -> Result<usize> {
        let old = lists.baseline;
        let max = self.config.max_windows as i64;
        let first_new = (old + 1).max(window - max + 1);
        let fresh = (window - first_new + 1) as usize;
        self.reserve(lists, fresh)?;

        let mut retired = 0;
        for bucket in lists.active.iter() {
            if bucket.is_live() && window - bucket.baseline() >= max {
                bucket.retire();
                retired += 1;
            }
        }
        for baseline in first_new..=window {
            let bucket = self.take_free(lists, baseline)?;
            lists.active.push_front(bucket);
        }
        lists.baseline = window;
        self.stats.record_slide(retired);
        debug!(
            "window slide {} -> {}: {} buckets retired, {} allocated",
            old, window, retired, fresh
        );
        Ok(retired)
    }

    /// Fails unless `count` buckets can be handed out.
    fn reserve(&self, lists: &Lists, count: usize) -> Result<()> {
        let missing = count.saturating_sub(lists.free.len());
        if missing == 0 {
            return Ok(());
        }
        if let Some(limit) = self.config.max_buckets {
            if lists.arena.len() + missing > limit {
                warn!(
                    "bucket limit {} reached ({} retired buckets awaiting eviction)",
                    limit,
                    lists.active.iter().filter(|bucket| !bucket.is_live()).count()
                );
                self.stats.record_refused();
                return Err(Error::CacheFull { limit });
            }
        }
        Ok(())
    }

    fn take_free(&self, lists: &mut Lists, baseline: i64) -> Result<Arc<Bucket>> {
        if let Some(bucket) = lists.free.pop_front() {
            bucket.rebase(baseline);
            return Ok(bucket);
        }
        if let Some(limit) = self.config.max_buckets {
            if lists.arena.len() >= limit {
                self.stats.record_refused();
                return Err(Error::CacheFull { limit });
            }
        }
        if lists.arena.len() >= self.config.population {
            warn!(
                "free pool exhausted, growing arena to {} buckets",
                lists.arena.len() + 1
            );
        }
        let bucket = self.build_bucket(baseline);
        lists.arena.push(Arc::clone(&bucket));
        Ok(bucket)
    }

    fn build_bucket(&self, baseline: i64) -> Arc<Bucket> {
        Arc::new(Bucket::new(
            self.config.shards,
            self.config.shard_capacity,
            baseline,
            Arc::clone(&self.cpu),
        ))
    }

    /// Retires the live bucket of `window`. Returns `false` if there is none.
    pub fn retire(&self, window: i64) -> Result<bool> {
        let lists = self.write_lists()?;
        match lists.find_live(window) {
            Some(bucket) => {
                bucket.retire();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns every resident bucket, live or retired, to the free pool and
    /// seeds a fresh live bucket for the current baseline.
    pub fn clear(&self) -> Result<()> {
        let mut lists = self.write_lists()?;
        let evicted = lists.active.len();
        let baseline = lists.baseline;
        while let Some(bucket) = lists.active.pop_front() {
            lists.evicted.insert(bucket.baseline());
            bucket.reset(baseline);
            lists.free.push_back(bucket);
        }
        let seed = self.take_free(&mut lists, baseline)?;
        lists.active.push_front(seed);
        self.stats.record_eviction(evicted, 0);
        debug!("cache cleared: {} buckets returned to the free pool", evicted);
        Ok(())
    }

    /// Drains every retired bucket, oldest first, into `cursor` and recycles
    /// it. Completes the cursor and returns the number of offsets emitted.
    pub fn remove_old<C, R>(&self, resolver: &R, cursor: &mut C) -> Result<usize>
    where
        C: Cursor + ?Sized,
        R: EntryResolver + ?Sized,
    {
        let mut detached = {
            let mut lists = self.write_lists()?;
            let (live, retired): (VecDeque<_>, VecDeque<_>) =
                lists.active.drain(..).partition(|bucket| bucket.is_live());
            lists.active = live;
            for bucket in retired.iter() {
                lists.evicted.insert(bucket.baseline());
            }
            Vec::from(retired)
        };
        detached.reverse();

        let mut emitted = 0;
        let mut failure = None;
        for bucket in detached.iter() {
            match bucket.merge(cursor, resolver) {
                Ok(count) => emitted += count,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let evicted = detached.len();
        let mut lists = self.write_lists()?;
        for bucket in detached {
            bucket.reset(0);
            lists.free.push_back(bucket);
        }
        drop(lists);

        if let Some(err) = failure {
            cursor.set_error(err.clone());
            return Err(err);
        }
        self.stats.record_eviction(evicted, emitted);
        if evicted > 0 {
            debug!("evicted {} buckets, {} offsets", evicted, emitted);
        }
        cursor.complete();
        Ok(emitted)
    }

    /// Streams the offsets of `query` from every resident window it covers.
    ///
    /// Windows are visited in the query's direction and each window's shards
    /// are merged by key, so the cursor sees one ordered stream. The cursor
    /// is completed once; if part of the range was evicted, before or during
    /// the scan, the results are partial and the cursor gets [`Error::Busy`]
    /// instead. The list lock is released before the first shard is scanned.
    pub fn search<C: Cursor + ?Sized>(&self, cursor: &mut C, query: &SearchQuery) {
        if let Err(err) = query.validate() {
            cursor.set_error(err);
            return;
        }
        let low = self.window_of(query.lowerbound);
        let high = self.window_of(query.upperbound);
        let (mut covered, mut gap) = match self.covered(low, high) {
            Ok(found) => found,
            Err(err) => {
                cursor.set_error(err);
                return;
            }
        };

        if query.direction == Direction::Forward {
            covered.reverse();
        }
        for handle in covered {
            if let Err(err) = handle.search_ordered(query, |offset| cursor.put(offset)) {
                trace!("search skipped window {}: {}", handle.window(), err);
                gap = true;
            }
        }
        if gap {
            cursor.set_error(Error::Busy);
        } else {
            cursor.complete();
        }
    }

    /// Handles to the resident buckets in `low..=high`, newest first, and
    /// whether an evicted window in that range is missing.
    fn covered(&self, low: i64, high: i64) -> Result<(Vec<BucketHandle>, bool)> {
        let lists = self.read_lists()?;
        // `active` is newest first, which is already backward order.
        let covered: Vec<BucketHandle> = lists
            .active
            .iter()
            .filter(|bucket| (low..=high).contains(&bucket.baseline()))
            .map(|bucket| BucketHandle::new(Arc::clone(bucket)))
            .collect();
        let gap = lists.evicted.within(low, high).any(|(first, last)| {
            let resident = covered
                .iter()
                .filter(|handle| (first..=last).contains(&handle.window()))
                .count() as i64;
            resident < last - first + 1
        });
        Ok((covered, gap))
    }

    /// Handle to the resident bucket of `window`, live or retired.
    pub fn bucket(&self, window: i64) -> Option<BucketHandle> {
        let lists = self.read_lists().ok()?;
        lists
            .active
            .iter()
            .find(|bucket| bucket.baseline() == window)
            .map(|bucket| BucketHandle::new(Arc::clone(bucket)))
    }

    pub fn window_of(&self, timestamp: Timestamp) -> i64 {
        (timestamp >> self.shift) as i64
    }

    pub fn baseline(&self) -> Result<i64> {
        Ok(self.read_lists()?.baseline)
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Windows with a live bucket, newest first.
    pub fn live_windows(&self) -> Result<Vec<i64>> {
        self.windows(true)
    }

    /// Windows retired but not yet evicted, newest first.
    pub fn retired_windows(&self) -> Result<Vec<i64>> {
        self.windows(false)
    }

    fn windows(&self, live: bool) -> Result<Vec<i64>> {
        let lists = self.read_lists()?;
        Ok(lists
            .active
            .iter()
            .filter(|bucket| bucket.is_live() == live)
            .map(|bucket| bucket.baseline())
            .collect())
    }

    pub fn arena_len(&self) -> Result<usize> {
        Ok(self.read_lists()?.arena.len())
    }

    pub fn free_len(&self) -> Result<usize> {
        Ok(self.read_lists()?.free.len())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn read_lists(&self) -> Result<RwLockReadGuard<'_, Lists>> {
        self.lists
            .read()
            .map_err(|_| Error::General("cache lists lock poisoned"))
    }

    fn write_lists(&self) -> Result<RwLockWriteGuard<'_, Lists>> {
        self.lists
            .write()
            .map_err(|_| Error::General("cache lists lock poisoned"))
    }
}
