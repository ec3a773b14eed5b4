//! Error types for the cluster transform pipeline

use packfs_store::StoreError;

/// All errors a cluster operation can surface.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Scratch buffer or page allocation failed; recoverable by unwinding
    /// the current cluster's reservation
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    /// Space reservation denied; recoverable, no partial state created
    #[error("quota exceeded: {requested} blocks requested, {available} available")]
    QuotaExceeded {
        /// Blocks the reservation asked for
        requested: u64,
        /// Blocks still available
        available: u64,
    },
    /// Magic-marker mismatch, bad pad byte, or decompressed length mismatch
    /// on inflate — surfaced as a hard read error, never best-effort decoded
    #[error("data corruption: {0}")]
    DataCorruption(String),
    /// The disk item store failed for a reason other than "not found"
    #[error("tree search failed")]
    TreeSearch(#[source] StoreError),
    /// Internal signal: a long cut must yield and resume; never visible to
    /// external callers
    #[error("operation yielded, retry")]
    Retry,
    /// Object cluster parameters rejected at open time
    #[error("invalid cluster parameters: {0}")]
    InvalidParams(String),
}

impl From<StoreError> for ClusterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded {
                requested,
                available,
            } => ClusterError::QuotaExceeded {
                requested,
                available,
            },
            other => ClusterError::TreeSearch(other),
        }
    }
}
