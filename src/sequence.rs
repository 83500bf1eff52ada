use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use crate::cursor::{Cursor, Direction, EntryKey, SearchQuery, SeriesId, StorageOffset, Timestamp};

/// Where an accepted write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Inserted into the ordered index.
    Indexed,
    /// The index was busy; parked in staging until the next drain.
    Staged,
}

// Duplicate keys are kept apart by insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey {
    key: EntryKey,
    ordinal: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Index {
    map: BTreeMap<SlotKey, StorageOffset>,
    next_ordinal: u64,
}

impl Index {
    fn insert(&mut self, key: EntryKey, offset: StorageOffset) {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.map.insert(SlotKey { key, ordinal }, offset);
    }

    fn drain_from(&mut self, staged: &mut Vec<(Timestamp, SeriesId, StorageOffset)>) {
        for (timestamp, series_id, offset) in staged.drain(..) {
            self.insert(EntryKey::new(timestamp, series_id), offset);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Entries in ascending key order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (EntryKey, StorageOffset)> + '_ {
        self.map.iter().map(|(slot, offset)| (slot.key, *offset))
    }

    fn scan<F>(&self, query: &SearchQuery, mut emit: F)
    where
        F: FnMut(EntryKey, StorageOffset),
    {
        match query.direction {
            Direction::Forward => {
                let start = SlotKey {
                    key: EntryKey::new(query.lowerbound, 0),
                    ordinal: 0,
                };
                for (slot, offset) in self.map.range(start..) {
                    if slot.key.timestamp >= query.upperbound {
                        break;
                    }
                    if slot.key.series_id == query.series_id {
                        emit(slot.key, *offset);
                    }
                }
            }
            Direction::Backward => {
                let end = SlotKey {
                    key: EntryKey::new(query.upperbound, SeriesId::MAX),
                    ordinal: u64::MAX,
                };
                for (slot, offset) in self.map.range(..=end).rev() {
                    if slot.key.timestamp <= query.lowerbound {
                        break;
                    }
                    if slot.key.series_id == query.series_id {
                        emit(slot.key, *offset);
                    }
                }
            }
        }
    }
}

/// Ordered index of one shard: `(timestamp, series id) -> offset`.
///
/// Writers never wait for the index lock. When it is held (usually by a
/// scan) the write goes to a separately locked staging list, which is folded
/// into the index by the next writer or reader that gets the index lock.
#[derive(Debug)]
pub struct Sequence {
    capacity: usize,
    index: Mutex<Index>,
    staging: Mutex<Vec<(Timestamp, SeriesId, StorageOffset)>>,
}

fn try_acquire<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn acquire<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Sequence {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: Mutex::new(Index::default()),
            staging: Mutex::new(Vec::new()),
        }
    }

    /// Adds an entry. Never fails and never waits for a running scan.
    ///
    /// On an uncontended index, staged entries are folded in before the new
    /// entry is inserted.
    pub fn add(
        &self,
        timestamp: Timestamp,
        series_id: SeriesId,
        offset: StorageOffset,
    ) -> Placement {
        if let Some(mut index) = try_acquire(&self.index) {
            if let Some(mut staged) = try_acquire(&self.staging) {
                index.drain_from(&mut staged);
            }
            index.insert(EntryKey::new(timestamp, series_id), offset);
            Placement::Indexed
        } else {
            acquire(&self.staging).push((timestamp, series_id, offset));
            Placement::Staged
        }
    }

    /// Streams the offsets matching `query` into `cursor`, then completes it.
    ///
    /// Holds the index lock for the whole scan; concurrent writers go to
    /// staging meanwhile.
    pub fn search<C: Cursor + ?Sized>(&self, cursor: &mut C, query: &SearchQuery) {
        if let Err(err) = query.validate() {
            cursor.set_error(err);
            return;
        }
        self.scan(query, |_, offset| cursor.put(offset));
        cursor.complete();
    }

    pub(crate) fn scan<F>(&self, query: &SearchQuery, emit: F)
    where
        F: FnMut(EntryKey, StorageOffset),
    {
        self.lock_index().scan(query, emit);
    }

    /// Locks the index with staging folded in.
    ///
    /// Writers only ever try-lock the index while holding nothing, so waiting
    /// on staging here cannot deadlock.
    pub(crate) fn lock_index(&self) -> MutexGuard<'_, Index> {
        let mut index = acquire(&self.index);
        let mut staged = acquire(&self.staging);
        index.drain_from(&mut staged);
        index
    }

    /// Number of entries in the index, staging excluded.
    pub fn size(&self) -> usize {
        acquire(&self.index).len()
    }

    pub fn staged_len(&self) -> usize {
        acquire(&self.staging).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of all entries in key order, staging included.
    pub fn entries(&self) -> Vec<(EntryKey, StorageOffset)> {
        self.lock_index().iter().collect()
    }

    /// Empties the index and staging.
    pub fn clear(&self) {
        let mut index = acquire(&self.index);
        let mut staged = acquire(&self.staging);
        staged.clear();
        *index = Index::default();
    }
}
