//! Keys, queries and the sinks results are streamed into.

use crate::{Error, Result};

/// Time units since an epoch chosen by the caller.
pub type Timestamp = u64;
/// Series identifier.
pub type SeriesId = u64;
/// Opaque handle into storage owned by the page layer.
pub type StorageOffset = u64;

/// Ordering key of a cached entry: timestamp first, then series id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub timestamp: Timestamp,
    pub series_id: SeriesId,
}

impl EntryKey {
    pub fn new(timestamp: Timestamp, series_id: SeriesId) -> Self {
        Self {
            timestamp,
            series_id,
        }
    }
}

/// Translates a storage offset back into the key of the entry it points to.
///
/// Used by [`Bucket::merge`](crate::Bucket::merge) to order offsets coming from
/// different shards. Must be cheap and free of side effects.
pub trait EntryResolver {
    fn resolve(&self, offset: StorageOffset) -> EntryKey;
}

impl<F> EntryResolver for F
where
    F: Fn(StorageOffset) -> EntryKey,
{
    fn resolve(&self, offset: StorageOffset) -> EntryKey {
        self(offset)
    }
}

/// Receives offsets in emission order.
pub trait Cursor {
    fn put(&mut self, offset: StorageOffset);
    fn complete(&mut self);
    fn set_error(&mut self, error: Error);
}

/// A cursor that collects everything in memory.
#[derive(Debug, Default, Clone)]
pub struct VecCursor {
    pub offsets: Vec<StorageOffset>,
    pub completions: usize,
    pub error: Option<Error>,
}

impl VecCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets received so far, or the first reported error.
    pub fn into_result(self) -> Result<Vec<StorageOffset>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.offsets),
        }
    }
}

impl Cursor for VecCursor {
    fn put(&mut self, offset: StorageOffset) {
        self.offsets.push(offset);
    }

    fn complete(&mut self) {
        self.completions += 1;
    }

    fn set_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Range query over a single series.
///
/// Forward scans cover `[lowerbound, upperbound)`, backward scans cover
/// `(lowerbound, upperbound]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchQuery {
    pub lowerbound: Timestamp,
    pub upperbound: Timestamp,
    pub series_id: SeriesId,
    pub direction: Direction,
}

impl SearchQuery {
    pub fn forward(series_id: SeriesId, lowerbound: Timestamp, upperbound: Timestamp) -> Self {
        Self {
            lowerbound,
            upperbound,
            series_id,
            direction: Direction::Forward,
        }
    }

    pub fn backward(series_id: SeriesId, lowerbound: Timestamp, upperbound: Timestamp) -> Self {
        Self {
            lowerbound,
            upperbound,
            series_id,
            direction: Direction::Backward,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upperbound < self.lowerbound {
            return Err(Error::BadArgument("upperbound is below lowerbound"));
        }
        Ok(())
    }

    /// Whether a timestamp falls inside the scanned range.
    pub fn covers(&self, timestamp: Timestamp) -> bool {
        match self.direction {
            Direction::Forward => timestamp >= self.lowerbound && timestamp < self.upperbound,
            Direction::Backward => timestamp > self.lowerbound && timestamp <= self.upperbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_order_by_timestamp_then_series() {
        assert!(EntryKey::new(1, 9) < EntryKey::new(2, 0));
        assert!(EntryKey::new(2, 0) < EntryKey::new(2, 1));
    }

    #[test]
    fn test_query_bounds() {
        let forward = SearchQuery::forward(1, 10, 20);
        assert!(forward.covers(10));
        assert!(!forward.covers(20));
        let backward = SearchQuery::backward(1, 10, 20);
        assert!(!backward.covers(10));
        assert!(backward.covers(20));
        assert!(SearchQuery::forward(1, 20, 10).validate().is_err());
        assert!(SearchQuery::forward(1, 10, 10).validate().is_ok());
    }

    #[test]
    fn test_vec_cursor_keeps_first_error() {
        let mut cursor = VecCursor::new();
        cursor.put(7);
        cursor.set_error(Error::Busy);
        cursor.set_error(Error::General("later"));
        assert_eq!(cursor.offsets, vec![7]);
        assert_eq!(cursor.into_result(), Err(Error::Busy));
    }
}
