//! Sharded in-memory write-back cache for a time-series storage engine.
//!
//! Ingested `(timestamp, series id, offset)` triples are buffered per time
//! window in a [`Bucket`], whose per-CPU [`Sequence`] shards keep them in key
//! order. The [`Cache`] maps timestamps to windows, slides the window set
//! forward as time advances and hands retired windows to a flusher as one
//! ordered run of offsets.

pub mod bucket;
pub mod cache;
pub mod config;
pub mod cpu;
pub mod cursor;
pub mod error;
pub mod sequence;
pub mod stats;

pub use bucket::{Bucket, BucketHandle};
pub use cache::Cache;
pub use config::{CacheConfig, MAX_WINDOWS_LIMIT, MIN_TTL};
pub use cpu::{CpuSource, FixedCpu, SchedCpu, ThreadSlot};
pub use cursor::{
    Cursor, Direction, EntryKey, EntryResolver, SearchQuery, SeriesId, StorageOffset, Timestamp,
    VecCursor,
};
pub use error::{Error, Result};
pub use sequence::{Placement, Sequence};
pub use stats::{CacheStats, StatsSnapshot};
