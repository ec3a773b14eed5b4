//! Cluster locator: maps a logical cluster to its disk items and back.
//!
//! A disk cluster is the transformed blob of one logical cluster. The item
//! store caps item size at `max_item_len`, so the blob is split into chunks
//! and each chunk keyed by its ordinal: chunk `j` of cluster `i` lives at
//! key `(object_id, i * cluster_size + j)`. Ordinals stay below the next
//! cluster's base offset (the orchestrator validates the store's item
//! capacity at open), so adjacent clusters cannot collide even when the
//! cipher pad pushes a blob past `cluster_size`. A chain ends at the first
//! chunk shorter than `max_item_len`, or at the first absent key.
//!
//! The locator keeps one seal-carrying position as a search hint. A valid
//! hint short-circuits the lookup for repeated passes over the same
//! cluster; any structural store change invalidates it and the locator
//! falls back to a full search.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use packfs_store::{DiskKey, ItemLookup, ItemPosition, ItemStore, SearchMode};

use crate::cluster::{ClusterHandle, ClusterParams};
use crate::error::ClusterError;

/// Presence of a disk cluster in the item store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskClusterState {
    /// The disk cluster exists and holds `len` transformed bytes
    Found {
        /// Total blob length across all chunks
        len: usize,
    },
    /// No disk representation (hole or never written)
    Absent,
}

/// Counters for locator activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocatorStats {
    /// Disk clusters read
    pub reads: u64,
    /// Disk clusters stored
    pub writes: u64,
    /// Lookups answered by a still-valid hint
    pub hint_hits: u64,
    /// Lookups where the hint was stale or pointed elsewhere
    pub hint_misses: u64,
    /// Individual chunks read
    pub chunks_read: u64,
    /// Individual chunks written
    pub chunks_written: u64,
    /// Stale chunk trims after a blob shrank
    pub trims: u64,
}

/// Locates, assembles, and stores disk clusters.
#[derive(Debug, Default)]
pub struct ClusterLocator {
    hint: Option<ItemPosition>,
    stats: LocatorStats,
}

impl ClusterLocator {
    /// Creates a locator with no hint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Activity counters.
    pub fn stats(&self) -> &LocatorStats {
        &self.stats
    }

    /// Drops the cached hint.
    pub fn invalidate_hint(&mut self) {
        self.hint = None;
    }

    fn base_offset(handle: &ClusterHandle, params: &ClusterParams) -> u64 {
        handle.cluster_offset(params)
    }

    /// Consults the hint for the first chunk of the cluster at `base`.
    /// Returns the hinted position only if it still validates.
    fn take_valid_hint<S: ItemStore>(
        &mut self,
        store: &S,
        object_id: u64,
        base: u64,
    ) -> Option<ItemPosition> {
        let hint = self.hint?;
        if hint.key == DiskKey::new(object_id, base) && store.validate(&hint) {
            self.stats.hint_hits += 1;
            Some(hint)
        } else {
            self.stats.hint_misses += 1;
            self.hint = None;
            None
        }
    }

    /// Reads the disk cluster for `handle` into `handle.buf`, assembling the
    /// chunk chain in ordinal order. On `Found`, `handle.len` holds the blob
    /// length; on `Absent`, the buffer is left empty.
    pub fn read_disk_cluster<S: ItemStore>(
        &mut self,
        store: &mut S,
        object_id: u64,
        handle: &mut ClusterHandle,
        params: &ClusterParams,
    ) -> Result<DiskClusterState, ClusterError> {
        let base = Self::base_offset(handle, params);
        let max_blob = params.cluster_size() + params.cipher().block_size();

        handle.buf.ensure_capacity(max_blob)?;
        let mut blob = handle.buf.take();
        blob.clear();

        let mut chunk = 0u64;
        loop {
            let key = DiskKey::new(object_id, base + chunk);
            let lookup = store.find(key, SearchMode::Read)?;
            let bytes = match lookup {
                ItemLookup::Found { position, bytes } => {
                    if chunk == 0 {
                        self.hint = Some(position);
                    }
                    bytes
                }
                ItemLookup::NotFound => {
                    if chunk == 0 {
                        handle.buf.give_back(blob);
                        handle.len = 0;
                        return Ok(DiskClusterState::Absent);
                    }
                    break;
                }
            };
            let last = bytes.len() < store.max_item_len();
            blob.extend_from_slice(&bytes);
            self.stats.chunks_read += 1;
            if blob.len() > max_blob {
                return Err(ClusterError::DataCorruption(format!(
                    "disk cluster {} chain exceeds {max_blob} bytes",
                    handle.index
                )));
            }
            chunk += 1;
            if last {
                break;
            }
        }

        handle.len = blob.len();
        handle.buf.give_back(blob);
        self.stats.reads += 1;
        trace!(
            object_id,
            cluster = handle.index,
            len = handle.len,
            chunks = chunk,
            "disk cluster read"
        );
        Ok(DiskClusterState::Found { len: handle.len })
    }

    /// Stores `handle.buf[..handle.len]` as the disk cluster of `handle`,
    /// replacing chunks in place where they exist, inserting where they do
    /// not, and trimming stale chunks left over from a longer blob.
    pub fn store_disk_cluster<S: ItemStore>(
        &mut self,
        store: &mut S,
        object_id: u64,
        handle: &mut ClusterHandle,
        params: &ClusterParams,
    ) -> Result<(), ClusterError> {
        let base = Self::base_offset(handle, params);
        let blob = handle.buf.take();
        debug_assert!(handle.len <= blob.len());

        let max = store.max_item_len();
        debug_assert!(
            handle.len.div_ceil(max) < params.cluster_size(),
            "chunk ordinals for cluster {} would reach the next cluster",
            handle.index
        );
        let mut written = 0u64;
        for piece in blob[..handle.len].chunks(max) {
            let key = DiskKey::new(object_id, base + written);
            let hinted = if written == 0 {
                self.take_valid_hint(store, object_id, base)
            } else {
                None
            };
            let position = match hinted {
                Some(position) => store.replace(position, piece.to_vec())?,
                None => match store.find(key, SearchMode::Write)? {
                    ItemLookup::Found { position, .. } => {
                        store.replace(position, piece.to_vec())?
                    }
                    ItemLookup::NotFound => store.insert(key, piece.to_vec())?,
                },
            };
            if written == 0 {
                self.hint = Some(position);
            }
            written += 1;
            self.stats.chunks_written += 1;
        }

        // A shorter blob must not leave chunks of the previous, longer one
        // behind; ordinals stay below the next cluster's base.
        let trimmed = store.remove_range(
            object_id,
            base + written,
            base + params.cluster_size() as u64,
        )?;
        if trimmed > 0 {
            self.stats.trims += 1;
            // remove_range bumped the seal; the position taken above is gone.
            self.hint = None;
        }

        handle.buf.give_back(blob);
        self.stats.writes += 1;
        debug!(
            object_id,
            cluster = handle.index,
            len = handle.len,
            chunks = written,
            trimmed,
            "disk cluster stored"
        );
        Ok(())
    }

    /// Removes the disk cluster at `index` entirely. Returns the bytes
    /// freed from the store.
    pub fn remove_disk_cluster<S: ItemStore>(
        &mut self,
        store: &mut S,
        object_id: u64,
        index: u64,
        params: &ClusterParams,
    ) -> Result<usize, ClusterError> {
        let base = index << params.shift();
        let removed =
            store.remove_range(object_id, base, base + params.cluster_size() as u64)?;
        if removed > 0 {
            self.hint = None;
        }
        Ok(removed)
    }

    /// Total blob length of the disk cluster at `index`, without assembling
    /// it, or `None` when absent.
    pub fn disk_cluster_len<S: ItemStore>(
        &mut self,
        store: &mut S,
        object_id: u64,
        index: u64,
        params: &ClusterParams,
    ) -> Result<Option<usize>, ClusterError> {
        let base = index << params.shift();
        let mut total = 0usize;
        let mut chunk = 0u64;
        loop {
            let key = DiskKey::new(object_id, base + chunk);
            match store.find(key, SearchMode::Read)? {
                ItemLookup::Found { bytes, .. } => {
                    let last = bytes.len() < store.max_item_len();
                    total += bytes.len();
                    chunk += 1;
                    if last {
                        break;
                    }
                }
                ItemLookup::NotFound => {
                    if chunk == 0 {
                        return Ok(None);
                    }
                    break;
                }
            }
        }
        Ok(Some(total))
    }
}
