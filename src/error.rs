use std::time::Duration;
use thiserror::Error;

/// Opaque failure produced by a caller-supplied loader.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// A reader-writer lock acquisition exceeded its bound. Surfaced to the
    /// caller; the cache does not attempt local recovery.
    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    /// A negative bag generation was requested from the ring. Programmer error.
    #[error("bag generation {0} is negative")]
    BagNumberInvalid(i64),

    /// The generation counter passed its ceiling. The maintenance path clears
    /// the cache long before this is reachable, so seeing it means the counter
    /// escaped maintenance entirely.
    #[error("bag generation {0} exceeds the maximum")]
    BagNumberOverflow(i64),

    /// An operation addressed an index name that was never registered.
    #[error("no index named `{0}` is registered")]
    UnknownIndex(String),

    /// The loader failed; nothing was inserted into the cache.
    #[error("loader failed")]
    Loader(#[source] BoxError),
}
