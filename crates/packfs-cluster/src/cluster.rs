//! Cluster geometry, per-object parameters, and the per-operation handle.
//!
//! A logical cluster is a fixed, power-of-two sized chunk of an object's
//! plaintext stream — the unit of compression and encryption. One
//! `ClusterHandle` lives for exactly one cluster pass: created when the
//! orchestrator enters the cluster, dropped when it leaves.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use packfs_store::{Page, PageCache, PAGE_SIZE};

use crate::cipher::{CipherContext, CipherId};
use crate::codec::MAGIC_LEN;
use crate::compress::Compressor;
use crate::error::ClusterError;

/// Smallest supported cluster shift (one page).
pub const MIN_CLUSTER_SHIFT: u8 = 12;
/// Largest supported cluster shift (64 KiB clusters).
pub const MAX_CLUSTER_SHIFT: u8 = 16;

/// Serializable description of an object's cluster parameters, as kept in
/// the object's persistent metadata. Key material is attached separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster size is `1 << shift`
    pub shift: u8,
    /// Compression algorithm
    pub compressor: Compressor,
    /// Cipher algorithm
    pub cipher: CipherId,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shift: MIN_CLUSTER_SHIFT,
            compressor: Compressor::default(),
            cipher: CipherId::default(),
        }
    }
}

/// Resolved per-object cluster parameters: geometry plus the transform
/// plugins, fixed for the object's lifetime.
#[derive(Debug)]
pub struct ClusterParams {
    shift: u8,
    compressor: Compressor,
    cipher: CipherContext,
}

impl ClusterParams {
    /// Validates and resolves parameters. A ciphered object must carry key
    /// material here; there is no later attach point on the data path.
    pub fn new(
        shift: u8,
        compressor: Compressor,
        cipher: CipherContext,
    ) -> Result<Self, ClusterError> {
        if !(MIN_CLUSTER_SHIFT..=MAX_CLUSTER_SHIFT).contains(&shift) {
            return Err(ClusterError::InvalidParams(format!(
                "cluster shift {shift} outside {MIN_CLUSTER_SHIFT}..={MAX_CLUSTER_SHIFT}"
            )));
        }
        Ok(Self {
            shift,
            compressor,
            cipher,
        })
    }

    /// Resolves a serialized config, attaching `raw_key` when ciphered.
    pub fn from_config(config: &ClusterConfig, raw_key: Option<&[u8]>) -> Result<Self, ClusterError> {
        let cipher = match (config.cipher, raw_key) {
            (CipherId::None, _) => CipherContext::null(),
            (id, Some(key)) => CipherContext::new(id, key)?,
            (id, None) => {
                return Err(ClusterError::InvalidParams(format!(
                    "{id:?} object opened without key material"
                )))
            }
        };
        Self::new(config.shift, config.compressor, cipher)
    }

    /// Cluster size in bytes.
    pub fn cluster_size(&self) -> usize {
        1usize << self.shift
    }

    /// Cluster shift.
    pub fn shift(&self) -> u8 {
        self.shift
    }

    /// Pages per cluster.
    pub fn pages_per_cluster(&self) -> usize {
        self.cluster_size() / PAGE_SIZE
    }

    /// The object's compressor.
    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    /// The object's cipher context.
    pub fn cipher(&self) -> &CipherContext {
        &self.cipher
    }

    /// Worst-case transformed size of `len` plaintext bytes: input plus
    /// compressor overhead bound, magic marker, and one cipher block of pad.
    pub fn worst_case_len(&self, len: usize) -> usize {
        len + self.compressor.max_overhead(len) + MAGIC_LEN + self.cipher.block_size()
    }
}

/// Relation of a logical cluster to the object's current content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// The cluster holds real bytes
    Data,
    /// Sparse region being zero-filled
    Hole,
    /// Entirely past end-of-file, no disk representation
    Fake,
}

/// The byte sub-range of one cluster touched by the current pass.
///
/// The modified region is `[off, off + delta + count)`: `delta` leading
/// zero-fill bytes (the gap between old end-of-file and the write start
/// inside this cluster), then `count` user bytes. Invariant:
/// `off + delta + count <= cluster_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteWindow {
    /// Start of the modified region within the cluster
    pub off: usize,
    /// Leading zero-fill bytes
    pub delta: usize,
    /// User bytes written in this pass
    pub count: usize,
}

impl WriteWindow {
    /// End of the modified region within the cluster.
    pub fn end(&self) -> usize {
        self.off + self.delta + self.count
    }

    /// Whether the window rewrites all of `content_len` existing bytes.
    pub fn covers(&self, content_len: usize) -> bool {
        self.off == 0 && self.end() >= content_len
    }
}

/// Owned scratch buffer for cluster transforms.
///
/// Capacity grows through `try_reserve` so an allocation failure surfaces
/// as `OutOfMemory` instead of aborting, and the backing vector can be
/// taken out and given back around in-place transforms.
#[derive(Debug, Default)]
pub struct TransformBuffer {
    buf: Vec<u8>,
}

impl TransformBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures at least `cap` bytes of capacity.
    pub fn ensure_capacity(&mut self, cap: usize) -> Result<(), ClusterError> {
        if self.buf.capacity() < cap {
            let additional = cap - self.buf.len();
            self.buf
                .try_reserve(additional)
                .map_err(|e| ClusterError::OutOfMemory(e.to_string()))?;
        }
        Ok(())
    }

    /// Valid bytes currently held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The held bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable access to the backing vector.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Takes the backing vector out, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Gives a vector back as the new backing storage.
    pub fn give_back(&mut self, buf: Vec<u8>) {
        self.buf = buf;
    }

    /// Drops the held bytes, keeping capacity.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Per-operation state of one cluster pass.
#[derive(Debug)]
pub struct ClusterHandle {
    /// Logical cluster index within the object
    pub index: u64,
    /// Byte sub-range being modified (write paths)
    pub window: WriteWindow,
    /// Relation of the cluster to current content
    pub status: ClusterStatus,
    /// Transform scratch: disk bytes after deflate, plaintext after inflate
    pub buf: TransformBuffer,
    /// Valid bytes in `buf`
    pub len: usize,
    /// Valid plaintext bytes in the page set
    pub content_len: usize,
    /// Pages of the page cluster, ascending index, shared with the cache
    pub pages: Vec<Arc<Page>>,
    /// Worst-case blocks charged by the current reservation
    pub reserved_blocks: u64,
}

impl ClusterHandle {
    /// Creates a handle for one pass over cluster `index`.
    pub fn new(index: u64, window: WriteWindow, status: ClusterStatus) -> Self {
        Self {
            index,
            window,
            status,
            buf: TransformBuffer::new(),
            len: 0,
            content_len: 0,
            pages: Vec::new(),
            reserved_blocks: 0,
        }
    }

    /// Plaintext byte offset of the cluster within the object.
    pub fn cluster_offset(&self, params: &ClusterParams) -> u64 {
        self.index << params.shift()
    }

    /// Grabs the pages covering `content_len` plaintext bytes, in ascending
    /// index order (the page lock-ordering discipline).
    pub fn grab_pages(&mut self, cache: &PageCache, object_id: u64, params: &ClusterParams) {
        debug_assert!(self.content_len <= params.cluster_size());
        let nr_pages = self.content_len.div_ceil(PAGE_SIZE);
        let first = self.index * params.pages_per_cluster() as u64;
        self.pages.clear();
        for i in 0..nr_pages as u64 {
            self.pages.push(cache.grab(object_id, first + i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ClusterParams {
        ClusterParams::new(12, Compressor::Lz4, CipherContext::null()).unwrap()
    }

    #[test]
    fn shift_bounds_enforced() {
        assert!(ClusterParams::new(11, Compressor::None, CipherContext::null()).is_err());
        assert!(ClusterParams::new(17, Compressor::None, CipherContext::null()).is_err());
        assert!(ClusterParams::new(16, Compressor::None, CipherContext::null()).is_ok());
    }

    #[test]
    fn geometry_follows_shift() {
        let p = ClusterParams::new(14, Compressor::None, CipherContext::null()).unwrap();
        assert_eq!(p.cluster_size(), 16384);
        assert_eq!(p.pages_per_cluster(), 4);
    }

    #[test]
    fn ciphered_config_without_key_rejected() {
        let config = ClusterConfig {
            cipher: CipherId::Aes256,
            ..Default::default()
        };
        let err = ClusterParams::from_config(&config, None).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidParams(_)));
        assert!(ClusterParams::from_config(&config, Some(&[0x42; 32])).is_ok());
    }

    #[test]
    fn worst_case_covers_all_overheads() {
        let config = ClusterConfig {
            cipher: CipherId::Aes256,
            ..Default::default()
        };
        let p = ClusterParams::from_config(&config, Some(&[1u8; 32])).unwrap();
        let worst = p.worst_case_len(4096);
        assert!(worst >= 4096 + MAGIC_LEN + 16);
    }

    #[test]
    fn window_covers_checks_full_rewrite() {
        let w = WriteWindow {
            off: 0,
            delta: 0,
            count: 4096,
        };
        assert!(w.covers(4096));
        assert!(w.covers(100));
        let partial = WriteWindow {
            off: 10,
            delta: 0,
            count: 4086,
        };
        assert!(!partial.covers(4096));
    }

    #[test]
    fn grab_pages_covers_content() {
        let cache = PageCache::new();
        let p = params();
        let mut h = ClusterHandle::new(2, WriteWindow::default(), ClusterStatus::Data);
        h.content_len = 4096;
        h.grab_pages(&cache, 7, &p);
        assert_eq!(h.pages.len(), 1);
        assert_eq!(h.pages[0].index(), 2);

        h.content_len = 1;
        h.grab_pages(&cache, 7, &p);
        assert_eq!(h.pages.len(), 1);

        h.content_len = 0;
        h.grab_pages(&cache, 7, &p);
        assert!(h.pages.is_empty());
    }

    #[test]
    fn transform_buffer_take_and_give_back() {
        let mut b = TransformBuffer::new();
        b.ensure_capacity(128).unwrap();
        b.as_mut_vec().extend_from_slice(b"payload");
        let v = b.take();
        assert!(b.is_empty());
        assert_eq!(v, b"payload");
        b.give_back(v);
        assert_eq!(b.as_slice(), b"payload");
    }
}
