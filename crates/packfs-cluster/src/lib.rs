#![warn(missing_docs)]

//! packfs cluster transform pipeline: compressed/encrypted file clusters
//!
//! Write path: pages → deflate (compress → magic → align → encrypt) → disk cluster items
//! Read path:  disk cluster items → inflate (decrypt → unpad → verify magic → decompress) → pages
//!
//! The unit of transformation is the logical cluster, a fixed power-of-two
//! slice of an object's plaintext stream. `ClusterPipeline` orchestrates
//! whole read/write/truncate calls over the collaborators in
//! `packfs-store`: the keyed item store, the page cache, the transaction
//! atom, and the block quota reservoir.

pub mod cipher;
pub mod cluster;
pub mod codec;
pub mod compress;
pub mod error;
pub mod locator;
pub mod reserve;
pub mod write_path;

pub use cipher::{align, CipherContext, CipherId, KeyFingerprint, FINGERPRINT_LEN};
pub use cluster::{
    ClusterConfig, ClusterHandle, ClusterParams, ClusterStatus, TransformBuffer, WriteWindow,
    MAX_CLUSTER_SHIFT, MIN_CLUSTER_SHIFT,
};
pub use codec::{deflate, inflate, scatter, CLUSTER_MAGIC, MAGIC_LEN};
pub use compress::{Compressor, MIN_COMPRESS_LEN};
pub use error::ClusterError;
pub use locator::{ClusterLocator, DiskClusterState, LocatorStats};
pub use reserve::{
    blocks_for, capture_cluster, release_on_error, reserve_cluster, settle_cluster, BLOCK_SIZE,
    TREE_SPLIT_RESERVE,
};
pub use write_path::{
    ClusterPipeline, DirtyThrottle, NullThrottle, PipelineStats, WriteFailure,
};
