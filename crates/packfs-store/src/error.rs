//! Error types for the packfs-store collaborators

/// All errors the store-side collaborators can report
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The search structure reported a failure unrelated to "not found"
    #[error("item search failed: {0}")]
    SearchFailed(String),
    /// A cached position is no longer valid (structural change since it was taken)
    #[error("stale item position (seal mismatch)")]
    StalePosition,
    /// An item larger than the per-node capacity was handed to the store
    #[error("item of {len} bytes exceeds the {max} byte node capacity")]
    ItemTooLarge {
        /// Length of the offending item
        len: usize,
        /// Node capacity of the store
        max: usize,
    },
    /// Block quota exhausted
    #[error("block quota exceeded: {requested} blocks requested, {available} available")]
    QuotaExceeded {
        /// Blocks the caller asked for
        requested: u64,
        /// Blocks still available in the reservoir
        available: u64,
    },
    /// A page could not be captured into the transaction atom
    #[error("page capture refused: {0}")]
    CaptureRefused(String),
}
