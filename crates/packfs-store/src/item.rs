//! Keyed disk item store: the ordered item tree the cluster locator searches.
//!
//! Items are keyed by `(object id, byte offset)` and hold the transformed
//! bytes of one slice of a disk cluster. A single store node can only hold
//! `max_item_len` bytes per item, so one disk cluster may be split across
//! several adjacent items; assembling the split is the locator's job, the
//! store only answers keyed lookups.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// Default per-item byte capacity of `MemItemStore` (node-capacity analogue).
pub const DEFAULT_MAX_ITEM_LEN: usize = 1024;

/// Key of one disk item: the owning object and the byte offset of the
/// item's first byte within the object's transformed stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DiskKey {
    /// Owning object id
    pub object_id: u64,
    /// Byte offset of the item's first byte
    pub offset: u64,
}

impl DiskKey {
    /// Builds a key for `(object_id, offset)`.
    pub fn new(object_id: u64, offset: u64) -> Self {
        Self { object_id, offset }
    }
}

/// Whether a search runs on behalf of a read or a write.
///
/// Write-mode lookups dirty every item they touch so background flush will
/// revisit the containing nodes even when the traversal itself changed no
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Read-only lookup
    Read,
    /// Lookup ahead of a mutation
    Write,
}

/// A seal-carrying coordinate into the store.
///
/// `seal` snapshots the store's structural version at the time the position
/// was taken; any later insert or removal invalidates it. Replacing an
/// item's bytes in place does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPosition {
    /// Key of the item this position points at
    pub key: DiskKey,
    /// Item length at the time the position was taken
    pub len: usize,
    seal: u64,
}

/// Outcome of a keyed lookup.
#[derive(Debug, Clone)]
pub enum ItemLookup {
    /// The item exists; position and a copy of its bytes
    Found {
        /// Coordinate usable for later `replace`/`mark_dirty` calls
        position: ItemPosition,
        /// The item's bytes
        bytes: Vec<u8>,
    },
    /// No item at this key
    NotFound,
}

/// Counters for store activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemStoreStats {
    /// Keyed lookups performed
    pub searches: u64,
    /// Items inserted
    pub inserts: u64,
    /// Items replaced in place
    pub replaces: u64,
    /// Items removed
    pub removals: u64,
    /// Explicit dirty marks
    pub dirty_marks: u64,
}

/// The disk item store interface the cluster locator consumes.
pub trait ItemStore {
    /// Keyed lookup. `NotFound` is a normal outcome, not an error.
    fn find(&mut self, key: DiskKey, mode: SearchMode) -> Result<ItemLookup, StoreError>;

    /// Inserts a new item. Fails if an item already sits at `key` or the
    /// bytes exceed the node capacity.
    fn insert(&mut self, key: DiskKey, bytes: Vec<u8>) -> Result<ItemPosition, StoreError>;

    /// Replaces the bytes of an existing item in place. The position must
    /// still validate.
    fn replace(
        &mut self,
        position: ItemPosition,
        bytes: Vec<u8>,
    ) -> Result<ItemPosition, StoreError>;

    /// Marks the item at `position` dirty for the background flusher.
    fn mark_dirty(&mut self, position: ItemPosition) -> Result<(), StoreError>;

    /// Removes every item of `object_id` whose key offset lies in
    /// `[from, to)`. Returns the total bytes removed.
    fn remove_range(&mut self, object_id: u64, from: u64, to: u64) -> Result<usize, StoreError>;

    /// Whether a previously taken position is still valid.
    fn validate(&self, position: &ItemPosition) -> bool;

    /// Per-item byte capacity of this store's nodes.
    fn max_item_len(&self) -> usize;
}

#[derive(Debug, Clone)]
struct ItemSlot {
    bytes: Vec<u8>,
    dirty: bool,
}

/// In-memory, `BTreeMap`-backed item store.
#[derive(Debug)]
pub struct MemItemStore {
    items: BTreeMap<DiskKey, ItemSlot>,
    max_item_len: usize,
    seal: u64,
    stats: ItemStoreStats,
}

impl Default for MemItemStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEM_LEN)
    }
}

impl MemItemStore {
    /// Creates an empty store whose items hold at most `max_item_len` bytes.
    pub fn new(max_item_len: usize) -> Self {
        assert!(max_item_len > 0, "node capacity must be non-zero");
        Self {
            items: BTreeMap::new(),
            max_item_len,
            seal: 0,
            stats: ItemStoreStats::default(),
        }
    }

    /// Number of live items.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Keys and lengths of every live item, in key order.
    pub fn items(&self) -> impl Iterator<Item = (DiskKey, usize)> + '_ {
        self.items.iter().map(|(k, slot)| (*k, slot.bytes.len()))
    }

    /// Total bytes stored for `object_id` in `[from, to)`.
    pub fn bytes_in_range(&self, object_id: u64, from: u64, to: u64) -> usize {
        self.items
            .range(DiskKey::new(object_id, from)..DiskKey::new(object_id, to))
            .map(|(_, slot)| slot.bytes.len())
            .sum()
    }

    /// Keys of every dirty item, clearing the dirty flags (the background
    /// flusher's pickup point).
    pub fn take_dirty(&mut self) -> Vec<DiskKey> {
        let mut dirty = Vec::new();
        for (key, slot) in self.items.iter_mut() {
            if slot.dirty {
                slot.dirty = false;
                dirty.push(*key);
            }
        }
        dirty
    }

    /// Activity counters.
    pub fn stats(&self) -> &ItemStoreStats {
        &self.stats
    }

    fn position(&self, key: DiskKey, len: usize) -> ItemPosition {
        ItemPosition {
            key,
            len,
            seal: self.seal,
        }
    }
}

impl ItemStore for MemItemStore {
    fn find(&mut self, key: DiskKey, mode: SearchMode) -> Result<ItemLookup, StoreError> {
        self.stats.searches += 1;
        match self.items.get_mut(&key) {
            Some(slot) => {
                if mode == SearchMode::Write {
                    slot.dirty = true;
                }
                let bytes = slot.bytes.clone();
                Ok(ItemLookup::Found {
                    position: self.position(key, bytes.len()),
                    bytes,
                })
            }
            None => Ok(ItemLookup::NotFound),
        }
    }

    fn insert(&mut self, key: DiskKey, bytes: Vec<u8>) -> Result<ItemPosition, StoreError> {
        if bytes.len() > self.max_item_len {
            return Err(StoreError::ItemTooLarge {
                len: bytes.len(),
                max: self.max_item_len,
            });
        }
        if self.items.contains_key(&key) {
            return Err(StoreError::SearchFailed(format!(
                "duplicate insert at object {} offset {}",
                key.object_id, key.offset
            )));
        }
        let len = bytes.len();
        self.items.insert(key, ItemSlot { bytes, dirty: true });
        // Structural change: every outstanding position goes stale.
        self.seal += 1;
        self.stats.inserts += 1;
        debug!(object_id = key.object_id, offset = key.offset, len, "item inserted");
        Ok(self.position(key, len))
    }

    fn replace(
        &mut self,
        position: ItemPosition,
        bytes: Vec<u8>,
    ) -> Result<ItemPosition, StoreError> {
        if !self.validate(&position) {
            return Err(StoreError::StalePosition);
        }
        if bytes.len() > self.max_item_len {
            return Err(StoreError::ItemTooLarge {
                len: bytes.len(),
                max: self.max_item_len,
            });
        }
        let slot = self
            .items
            .get_mut(&position.key)
            .ok_or(StoreError::StalePosition)?;
        let len = bytes.len();
        slot.bytes = bytes;
        slot.dirty = true;
        self.stats.replaces += 1;
        Ok(self.position(position.key, len))
    }

    fn mark_dirty(&mut self, position: ItemPosition) -> Result<(), StoreError> {
        if !self.validate(&position) {
            return Err(StoreError::StalePosition);
        }
        let slot = self
            .items
            .get_mut(&position.key)
            .ok_or(StoreError::StalePosition)?;
        slot.dirty = true;
        self.stats.dirty_marks += 1;
        Ok(())
    }

    fn remove_range(&mut self, object_id: u64, from: u64, to: u64) -> Result<usize, StoreError> {
        if from >= to {
            return Ok(0);
        }
        let doomed: Vec<DiskKey> = self
            .items
            .range(DiskKey::new(object_id, from)..DiskKey::new(object_id, to))
            .map(|(k, _)| *k)
            .collect();
        let mut removed = 0usize;
        for key in &doomed {
            if let Some(slot) = self.items.remove(key) {
                removed += slot.bytes.len();
                self.stats.removals += 1;
            }
        }
        if !doomed.is_empty() {
            self.seal += 1;
            debug!(object_id, from, to, removed, "items removed");
        }
        Ok(removed)
    }

    fn validate(&self, position: &ItemPosition) -> bool {
        position.seal == self.seal && self.items.contains_key(&position.key)
    }

    fn max_item_len(&self) -> usize {
        self.max_item_len
    }
}
