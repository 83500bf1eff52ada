use thiserror::Error;

/// Status vocabulary shared by the write, search and flush paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed query range.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
    /// The write targets a window that is no longer (or never was) writable.
    #[error("overflow: window {window} is not writable (baseline {baseline})")]
    Overflow { window: i64, baseline: i64 },
    /// Merge attempted on a bucket that still accepts writes, or a search
    /// covered windows that were already evicted.
    #[error("busy")]
    Busy,
    /// Internal invariant violation.
    #[error("general failure: {0}")]
    General(&'static str),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// A bucket handle outlived its window; the bucket now serves another.
    #[error("recycled: bucket of window {window} was evicted")]
    Recycled { window: i64 },
    /// The bucket arena reached its configured cap.
    #[error("cache full: bucket limit {limit} reached")]
    CacheFull { limit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
