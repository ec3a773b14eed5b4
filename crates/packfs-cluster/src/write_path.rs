//! Write/read flow orchestrator: drives user calls across clusters.
//!
//! A write is sliced into cluster passes processed in strictly ascending
//! offset order. Each pass reserves worst-case space, reads the existing
//! cluster back when the write does not cover it, applies the user bytes
//! to the page set, captures the pages into the transaction atom, deflates,
//! persists, and settles the reservation down to what the blob really
//! needs. A failing pass unwinds its own reservation and the call reports
//! the bytes committed by the passes before it.
//!
//! Writing past end-of-file first materializes the gap: every whole
//! cluster of the gap becomes a zero-filled hole cluster through the same
//! pass machinery, while a sub-cluster remainder folds into the leading
//! zero-fill (`delta`) of the first data pass.
//!
//! One pipeline serializes all calls on its objects, standing in for the
//! per-object exclusive write lock of the surrounding filesystem.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info};

use packfs_store::{BlockReservoir, ItemStore, Page, PageCache, TxnAtom, PAGE_SIZE};

use crate::cluster::{
    ClusterConfig, ClusterHandle, ClusterParams, ClusterStatus, WriteWindow,
};
use crate::codec::{deflate, inflate, scatter};
use crate::error::ClusterError;
use crate::locator::{ClusterLocator, DiskClusterState};
use crate::reserve::{
    blocks_for, capture_cluster, release_on_error, reserve_cluster, settle_cluster,
};

/// Clusters cut per truncate batch before yielding to the throttle.
const CUT_BATCH: u64 = 64;

/// Back-pressure hook invoked after each persisted cluster, the pipeline's
/// single suspension point. The surrounding system plugs its dirty-page
/// throttling in here.
pub trait DirtyThrottle {
    /// Called once per persisted cluster; may block the calling thread.
    fn throttle(&mut self);
}

/// No-op throttle for contexts without dirty-page pressure.
#[derive(Debug, Default)]
pub struct NullThrottle;

impl DirtyThrottle for NullThrottle {
    fn throttle(&mut self) {}
}

/// A write that stopped partway: `committed` user bytes from prior,
/// fully-persisted clusters, never partial credit for the failing one.
#[derive(Debug, thiserror::Error)]
#[error("write stopped after {committed} committed bytes")]
pub struct WriteFailure {
    /// User bytes persisted by the passes before the failure
    pub committed: usize,
    /// What stopped the failing pass
    #[source]
    pub source: ClusterError,
}

/// Counters for pipeline activity.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PipelineStats {
    /// Cluster passes persisted (data, hole, and boundary rewrites)
    pub clusters_written: u64,
    /// Disk clusters inflated on the read path
    pub clusters_read: u64,
    /// Hole clusters materialized
    pub hole_clusters: u64,
    /// Write passes that had to inflate the existing cluster first
    pub reads_before_write: u64,
    /// User bytes committed by writes
    pub bytes_written: u64,
    /// Bytes returned by reads
    pub bytes_read: u64,
    /// Whole clusters removed by truncate
    pub clusters_cut: u64,
}

/// Per-object state the pipeline keeps while the object is open.
#[derive(Debug)]
struct ObjectState {
    params: ClusterParams,
    size: u64,
    mtime: SystemTime,
}

/// The cluster transform pipeline over one item store and one reservoir.
#[derive(Debug)]
pub struct ClusterPipeline<S: ItemStore, T: DirtyThrottle = NullThrottle> {
    store: S,
    cache: PageCache,
    reservoir: BlockReservoir,
    locator: ClusterLocator,
    atom: TxnAtom,
    throttle: T,
    objects: HashMap<u64, ObjectState>,
    stats: PipelineStats,
}

impl<S: ItemStore, T: DirtyThrottle> ClusterPipeline<S, T> {
    /// Builds a pipeline over `store`, budgeted by `reservoir`.
    pub fn new(store: S, reservoir: BlockReservoir, throttle: T) -> Self {
        Self {
            store,
            cache: PageCache::new(),
            reservoir,
            locator: ClusterLocator::new(),
            atom: TxnAtom::new(),
            throttle,
            objects: HashMap::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Opens an object with its persistent cluster config, attaching raw
    /// key material for ciphered objects. Parameters are fixed until close.
    pub fn open_object(
        &mut self,
        object_id: u64,
        config: &ClusterConfig,
        raw_key: Option<&[u8]>,
    ) -> Result<(), ClusterError> {
        if self.objects.contains_key(&object_id) {
            return Err(ClusterError::InvalidParams(format!(
                "object {object_id} is already open"
            )));
        }
        let params = ClusterParams::from_config(config, raw_key)?;
        // Chunk ordinals of a disk cluster live in [0, cluster_size); the
        // store's per-item capacity must keep the worst-case blob's chunk
        // count below that, or adjacent clusters could collide.
        let worst_blob = params.cluster_size() + params.cipher().block_size();
        if worst_blob.div_ceil(self.store.max_item_len()) >= params.cluster_size() {
            return Err(ClusterError::InvalidParams(format!(
                "item capacity {} too small for cluster size {}",
                self.store.max_item_len(),
                params.cluster_size(),
            )));
        }
        info!(object_id, shift = params.shift(), "object opened");
        self.objects.insert(
            object_id,
            ObjectState {
                params,
                size: 0,
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Current byte size of an open object.
    pub fn object_size(&self, object_id: u64) -> Option<u64> {
        self.objects.get(&object_id).map(|s| s.size)
    }

    /// Last modification time of an open object.
    pub fn object_mtime(&self, object_id: u64) -> Option<SystemTime> {
        self.objects.get(&object_id).map(|s| s.mtime)
    }

    /// Writes `data` at `offset`, returning the bytes committed. On failure
    /// the error carries the bytes persisted by prior clusters.
    pub fn write(
        &mut self,
        object_id: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, WriteFailure> {
        let mut state = match self.objects.remove(&object_id) {
            Some(state) => state,
            None => {
                return Err(WriteFailure {
                    committed: 0,
                    source: not_open(object_id),
                })
            }
        };
        let result = self.write_exclusive(object_id, &mut state, offset, data);
        self.objects.insert(object_id, state);
        result
    }

    fn write_exclusive(
        &mut self,
        object_id: u64,
        state: &mut ObjectState,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, WriteFailure> {
        if data.is_empty() {
            return Ok(0);
        }
        let cs = state.params.cluster_size() as u64;
        let mut committed = 0usize;

        // Materialize the gap between old end-of-file and the write start
        // while it still reaches past a cluster boundary; a sub-cluster
        // remainder folds into the first data pass below.
        while state.size < offset && state.size / cs < offset / cs {
            let index = state.size / cs;
            let base = index * cs;
            let old_content = (state.size - base) as usize;
            let window = WriteWindow {
                off: old_content,
                delta: cs as usize - old_content,
                count: 0,
            };
            let status = if old_content > 0 {
                ClusterStatus::Data
            } else {
                ClusterStatus::Hole
            };
            let mut handle = ClusterHandle::new(index, window, status);
            let mut ctx = self.pass_ctx();
            if let Err(source) = ctx.run_cluster_pass(
                &state.params,
                object_id,
                &mut handle,
                old_content,
                window.end(),
                &[],
            ) {
                return Err(WriteFailure { committed, source });
            }
            self.stats.hole_clusters += 1;
            self.stats.clusters_written += 1;
            state.size = base + cs;
            state.mtime = SystemTime::now();
            self.throttle.throttle();
        }

        let mut consumed = 0usize;
        while consumed < data.len() {
            let pos = offset + consumed as u64;
            let index = pos / cs;
            let base = index * cs;
            let user_off = (pos - base) as usize;
            let take = (cs as usize - user_off).min(data.len() - consumed);
            let old_content = state.size.saturating_sub(base).min(cs) as usize;
            // The window starts at the old in-cluster end-of-file when the
            // write lands beyond it; the gap becomes leading zero fill.
            let (off, delta) = if old_content >= user_off {
                (user_off, 0)
            } else {
                (old_content, user_off - old_content)
            };
            let window = WriteWindow {
                off,
                delta,
                count: take,
            };
            let status = if old_content > 0 {
                ClusterStatus::Data
            } else {
                ClusterStatus::Fake
            };
            let mut handle = ClusterHandle::new(index, window, status);
            let mut ctx = self.pass_ctx();
            if let Err(source) = ctx.run_cluster_pass(
                &state.params,
                object_id,
                &mut handle,
                old_content,
                old_content.max(window.end()),
                &data[consumed..consumed + take],
            ) {
                return Err(WriteFailure { committed, source });
            }
            self.stats.clusters_written += 1;
            self.stats.bytes_written += take as u64;
            committed += take;
            consumed += take;
            state.size = state.size.max(base + window.end() as u64);
            state.mtime = SystemTime::now();
            self.throttle.throttle();
        }
        debug!(object_id, offset, committed, size = state.size, "write done");
        Ok(committed)
    }

    /// Reads up to `buf.len()` bytes at `offset`. Short reads happen only
    /// at end-of-file.
    pub fn read(
        &mut self,
        object_id: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ClusterError> {
        let state = self
            .objects
            .remove(&object_id)
            .ok_or_else(|| not_open(object_id))?;
        let result = self.read_exclusive(object_id, &state, offset, buf);
        self.objects.insert(object_id, state);
        result
    }

    fn read_exclusive(
        &mut self,
        object_id: u64,
        state: &ObjectState,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ClusterError> {
        if offset >= state.size || buf.is_empty() {
            return Ok(0);
        }
        let cs = state.params.cluster_size() as u64;
        let len = buf.len().min((state.size - offset) as usize);
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let index = pos / cs;
            let base = index * cs;
            let in_off = (pos - base) as usize;
            let content = (state.size - base).min(cs) as usize;
            let take = (content - in_off).min(len - done);
            let mut ctx = self.pass_ctx();
            ctx.read_cluster_bytes(
                &state.params,
                object_id,
                index,
                content,
                in_off,
                &mut buf[done..done + take],
            )?;
            done += take;
        }
        self.stats.bytes_read += done as u64;
        Ok(done)
    }

    /// Resizes the object. Growing zero-extends through hole clusters;
    /// shrinking cuts whole clusters past the new end, then rewrites the
    /// boundary cluster with its shortened content.
    pub fn truncate(&mut self, object_id: u64, new_size: u64) -> Result<(), ClusterError> {
        let mut state = self
            .objects
            .remove(&object_id)
            .ok_or_else(|| not_open(object_id))?;
        let result = self.truncate_exclusive(object_id, &mut state, new_size);
        self.objects.insert(object_id, state);
        result
    }

    fn truncate_exclusive(
        &mut self,
        object_id: u64,
        state: &mut ObjectState,
        new_size: u64,
    ) -> Result<(), ClusterError> {
        let cs = state.params.cluster_size() as u64;
        if new_size == state.size {
            return Ok(());
        }
        if new_size > state.size {
            while state.size < new_size {
                let index = state.size / cs;
                let base = index * cs;
                let old_content = (state.size - base) as usize;
                let end = (new_size - base).min(cs) as usize;
                let window = WriteWindow {
                    off: old_content,
                    delta: end - old_content,
                    count: 0,
                };
                let status = if old_content > 0 {
                    ClusterStatus::Data
                } else {
                    ClusterStatus::Hole
                };
                let mut handle = ClusterHandle::new(index, window, status);
                let mut ctx = self.pass_ctx();
                ctx.run_cluster_pass(&state.params, object_id, &mut handle, old_content, end, &[])?;
                self.stats.hole_clusters += 1;
                self.stats.clusters_written += 1;
                state.size = base + end as u64;
                state.mtime = SystemTime::now();
                self.throttle.throttle();
            }
            return Ok(());
        }

        // Shrink. Cut whole clusters past the new end, tail first; a long
        // cut yields between batches and resumes.
        let first_doomed = new_size.div_ceil(cs);
        let last = (state.size - 1) / cs;
        if first_doomed <= last {
            let mut cursor = last;
            loop {
                let mut ctx = self.pass_ctx();
                match ctx.cut_clusters(&state.params, object_id, first_doomed, &mut cursor) {
                    Ok(()) => break,
                    Err(ClusterError::Retry) => {
                        self.throttle.throttle();
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let boundary_content = (new_size % cs) as usize;
        if boundary_content > 0 {
            let index = new_size / cs;
            let old_content = (state.size - index * cs).min(cs) as usize;
            if old_content > boundary_content {
                let mut handle =
                    ClusterHandle::new(index, WriteWindow::default(), ClusterStatus::Data);
                let mut ctx = self.pass_ctx();
                ctx.run_cluster_pass(
                    &state.params,
                    object_id,
                    &mut handle,
                    old_content,
                    boundary_content,
                    &[],
                )?;
                self.stats.clusters_written += 1;
            }
            let ppc = state.params.pages_per_cluster() as u64;
            let first_dead = index * ppc + boundary_content.div_ceil(PAGE_SIZE) as u64;
            self.cache.evict_range(object_id, first_dead, (index + 1) * ppc);
        }

        state.size = new_size;
        state.mtime = SystemTime::now();
        debug!(object_id, new_size, "truncated");
        Ok(())
    }

    /// Commits the transaction atom, releasing every captured page back to
    /// clean state. Returns the number of pages committed.
    pub fn commit(&mut self) -> usize {
        self.atom.commit()
    }

    /// Drops every cached page of `object_id`; later reads refetch from the
    /// store. Pages held by the atom stay alive until commit.
    pub fn drop_object_pages(&mut self, object_id: u64) -> usize {
        self.cache.evict_range(object_id, 0, u64::MAX).len()
    }

    /// Activity counters.
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// The space budget.
    pub fn reservoir(&self) -> &BlockReservoir {
        &self.reservoir
    }

    /// The underlying item store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn pass_ctx(&mut self) -> PassCtx<'_, S> {
        PassCtx {
            store: &mut self.store,
            cache: &self.cache,
            reservoir: &mut self.reservoir,
            locator: &mut self.locator,
            atom: &mut self.atom,
            stats: &mut self.stats,
        }
    }
}

fn not_open(object_id: u64) -> ClusterError {
    ClusterError::InvalidParams(format!("object {object_id} is not open"))
}

/// Disjoint borrows of the pipeline's working parts for one cluster pass,
/// leaving the object table free for the caller.
struct PassCtx<'a, S: ItemStore> {
    store: &'a mut S,
    cache: &'a PageCache,
    reservoir: &'a mut BlockReservoir,
    locator: &'a mut ClusterLocator,
    atom: &'a mut TxnAtom,
    stats: &'a mut PipelineStats,
}

impl<S: ItemStore> PassCtx<'_, S> {
    /// One full cluster pass: reserve, read-before-write if needed, apply
    /// the window, capture, deflate, persist, settle. `old_content` is the
    /// cluster's plaintext length before the pass, `new_content` after;
    /// `src` holds the window's user bytes.
    fn run_cluster_pass(
        &mut self,
        params: &ClusterParams,
        object_id: u64,
        handle: &mut ClusterHandle,
        old_content: usize,
        new_content: usize,
        src: &[u8],
    ) -> Result<(), ClusterError> {
        debug_assert_eq!(handle.window.count, src.len());
        debug_assert!(handle.window.end() <= params.cluster_size());
        handle.content_len = new_content;
        handle.grab_pages(self.cache, object_id, params);
        reserve_cluster(self.reservoir, handle, params)?;
        if let Err(err) = self.pass_body(params, object_id, handle, old_content, src) {
            release_on_error(self.reservoir, handle);
            // Pages may hold the failed pass's bytes; force the next reader
            // back to the store.
            for page in &handle.pages {
                page.update_txn(|t| t.uptodate = false);
            }
            return Err(err);
        }
        Ok(())
    }

    fn pass_body(
        &mut self,
        params: &ClusterParams,
        object_id: u64,
        handle: &mut ClusterHandle,
        old_content: usize,
        src: &[u8],
    ) -> Result<(), ClusterError> {
        debug_assert_eq!(handle.status == ClusterStatus::Data, old_content > 0);
        let cached = !handle.pages.is_empty()
            && handle.pages.iter().all(|p| p.txn_state().uptodate);
        if handle.status == ClusterStatus::Data && !handle.window.covers(old_content) && !cached {
            // Partial overwrite of a cluster not in cache: the transform
            // couples all bytes of the cluster, so the untouched ones must
            // be read back before the next deflate.
            match self.locator.read_disk_cluster(self.store, object_id, handle, params)? {
                DiskClusterState::Found { .. } => {
                    inflate(handle, params, old_content)?;
                    scatter(handle);
                }
                DiskClusterState::Absent => {
                    for page in &handle.pages {
                        page.write().fill(0);
                        page.update_txn(|t| t.uptodate = true);
                    }
                }
            }
            self.stats.reads_before_write += 1;
        }

        let w = handle.window;
        zero_pages(&handle.pages, w.off, w.delta);
        fill_pages(&handle.pages, w.off + w.delta, src);
        let capacity = handle.pages.len() * PAGE_SIZE;
        zero_pages(&handle.pages, handle.content_len, capacity - handle.content_len);
        for page in &handle.pages {
            page.update_txn(|t| t.uptodate = true);
        }

        capture_cluster(self.atom, handle)?;

        let old_blob = self
            .locator
            .disk_cluster_len(self.store, object_id, handle.index, params)?
            .unwrap_or(0);
        deflate(handle, params)?;
        self.locator
            .store_disk_cluster(self.store, object_id, handle, params)?;
        settle_cluster(self.reservoir, handle, old_blob);
        Ok(())
    }

    /// Fills `dst` with cluster bytes starting at in-cluster offset `at`,
    /// inflating from the store when the page set is not up to date.
    fn read_cluster_bytes(
        &mut self,
        params: &ClusterParams,
        object_id: u64,
        index: u64,
        content: usize,
        at: usize,
        dst: &mut [u8],
    ) -> Result<(), ClusterError> {
        let mut handle = ClusterHandle::new(index, WriteWindow::default(), ClusterStatus::Data);
        handle.content_len = content;
        handle.grab_pages(self.cache, object_id, params);
        let cached = !handle.pages.is_empty()
            && handle.pages.iter().all(|p| p.txn_state().uptodate);
        if !cached {
            match self.locator.read_disk_cluster(self.store, object_id, &mut handle, params)? {
                DiskClusterState::Found { .. } => {
                    inflate(&mut handle, params, content)?;
                    scatter(&handle);
                }
                DiskClusterState::Absent => {
                    for page in &handle.pages {
                        page.write().fill(0);
                        page.update_txn(|t| t.uptodate = true);
                    }
                }
            }
            self.stats.clusters_read += 1;
        }
        copy_from_pages(&handle.pages, at, dst);
        Ok(())
    }

    /// Cuts clusters `[floor, *cursor]` tail first, freeing their quota
    /// blocks and evicting their pages. Yields with `Retry` after a batch.
    fn cut_clusters(
        &mut self,
        params: &ClusterParams,
        object_id: u64,
        floor: u64,
        cursor: &mut u64,
    ) -> Result<(), ClusterError> {
        let ppc = params.pages_per_cluster() as u64;
        let mut cut = 0u64;
        loop {
            let index = *cursor;
            if let Some(blob_len) =
                self.locator
                    .disk_cluster_len(self.store, object_id, index, params)?
            {
                self.locator
                    .remove_disk_cluster(self.store, object_id, index, params)?;
                self.reservoir.free_blocks(blocks_for(blob_len));
                self.stats.clusters_cut += 1;
            }
            self.cache.evict_range(object_id, index * ppc, (index + 1) * ppc);
            cut += 1;
            if index == floor {
                return Ok(());
            }
            *cursor = index - 1;
            if cut >= CUT_BATCH {
                return Err(ClusterError::Retry);
            }
        }
    }
}

fn fill_pages(pages: &[Arc<Page>], mut at: usize, src: &[u8]) {
    let mut done = 0usize;
    while done < src.len() {
        let page = at / PAGE_SIZE;
        let off = at % PAGE_SIZE;
        let take = (PAGE_SIZE - off).min(src.len() - done);
        pages[page].write()[off..off + take].copy_from_slice(&src[done..done + take]);
        done += take;
        at += take;
    }
}

fn zero_pages(pages: &[Arc<Page>], mut at: usize, mut len: usize) {
    while len > 0 {
        let page = at / PAGE_SIZE;
        let off = at % PAGE_SIZE;
        let take = (PAGE_SIZE - off).min(len);
        pages[page].write()[off..off + take].fill(0);
        len -= take;
        at += take;
    }
}

fn copy_from_pages(pages: &[Arc<Page>], mut at: usize, dst: &mut [u8]) {
    let mut done = 0usize;
    while done < dst.len() {
        let page = at / PAGE_SIZE;
        let off = at % PAGE_SIZE;
        let take = (PAGE_SIZE - off).min(dst.len() - done);
        dst[done..done + take].copy_from_slice(&pages[page].read()[off..off + take]);
        done += take;
        at += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packfs_store::MemItemStore;
    use rand::{Rng, SeedableRng};

    use crate::cipher::CipherId;
    use crate::compress::Compressor;

    fn pipeline(reservoir: BlockReservoir) -> ClusterPipeline<MemItemStore, NullThrottle> {
        ClusterPipeline::new(MemItemStore::new(1024), reservoir, NullThrottle)
    }

    fn open_default(p: &mut ClusterPipeline<MemItemStore, NullThrottle>, id: u64) {
        p.open_object(id, &ClusterConfig::default(), None).unwrap();
    }

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn open_rejects_undersized_item_capacity() {
        // A one-byte item cap would need a chunk per blob byte, letting
        // chunk ordinals spill into the next cluster's key range.
        let mut p = ClusterPipeline::new(
            MemItemStore::new(1),
            BlockReservoir::unbounded(),
            NullThrottle,
        );
        let err = p.open_object(1, &ClusterConfig::default(), None).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidParams(_)), "got {err:?}");
    }

    #[test]
    fn small_write_read_roundtrip() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        let data = b"hello cluster pipeline".to_vec();
        assert_eq!(p.write(1, 0, &data).unwrap(), data.len());
        assert_eq!(p.object_size(1), Some(data.len() as u64));

        let mut buf = vec![0u8; 64];
        let n = p.read(1, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], &data[..]);
    }

    #[test]
    fn multi_cluster_write_spans_three_clusters() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        let data = random_bytes(10000, 1);
        assert_eq!(p.write(1, 0, &data).unwrap(), 10000);
        assert_eq!(p.stats().clusters_written, 3);
        assert_eq!(p.object_size(1), Some(10000));

        let mut buf = vec![0u8; 10000];
        assert_eq!(p.read(1, 0, &mut buf).unwrap(), 10000);
        assert_eq!(buf, data);
    }

    #[test]
    fn one_byte_rewrite_reads_cluster_back_first() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        let mut data = random_bytes(10000, 2);
        p.write(1, 0, &data).unwrap();
        p.commit();
        p.drop_object_pages(1);

        p.write(1, 10, &[0x7F]).unwrap();
        assert_eq!(p.stats().reads_before_write, 1);

        data[10] = 0x7F;
        p.commit();
        p.drop_object_pages(1);
        let mut buf = vec![0u8; 10000];
        p.read(1, 0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn sparse_write_materializes_hole_clusters() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        // Gap [0, 9000): clusters 0 and 1 are whole holes; the 808-byte
        // remainder folds into the data pass's delta.
        p.write(1, 9000, b"tail").unwrap();
        assert_eq!(p.stats().hole_clusters, 2);
        assert_eq!(p.object_size(1), Some(9004));

        let mut buf = vec![0xFFu8; 9004];
        assert_eq!(p.read(1, 0, &mut buf).unwrap(), 9004);
        assert!(buf[..9000].iter().all(|&b| b == 0));
        assert_eq!(&buf[9000..], b"tail");
    }

    #[test]
    fn quota_failure_reports_committed_bytes() {
        // Three blocks: enough to reserve and settle one incompressible
        // cluster (worst case 2 + 1 split), not enough for a second pass.
        let mut p = pipeline(BlockReservoir::new(3));
        open_default(&mut p, 1);
        let data = random_bytes(8192, 3);
        let err = p.write(1, 0, &data).unwrap_err();
        assert_eq!(err.committed, 4096);
        assert!(matches!(err.source, ClusterError::QuotaExceeded { .. }));
        // The failed pass left nothing charged: only cluster 0's blob.
        assert_eq!(p.reservoir().used_blocks(), 1);
        assert_eq!(p.object_size(1), Some(4096));
    }

    #[test]
    fn rewrite_settles_quota_to_live_blobs() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        p.write(1, 0, &random_bytes(4096, 4)).unwrap();
        assert_eq!(p.reservoir().used_blocks(), 1);
        // Highly compressible rewrite shrinks the blob; still one block.
        p.write(1, 0, &vec![0u8; 4096]).unwrap();
        assert_eq!(p.reservoir().used_blocks(), 1);
    }

    #[test]
    fn truncate_to_zero_frees_everything() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        p.write(1, 0, &random_bytes(12288, 5)).unwrap();
        p.commit();
        assert!(p.reservoir().used_blocks() > 0);

        p.truncate(1, 0).unwrap();
        assert_eq!(p.object_size(1), Some(0));
        assert_eq!(p.reservoir().used_blocks(), 0);
        assert_eq!(p.stats().clusters_cut, 3);
        assert_eq!(p.store_mut().item_count(), 0);

        let mut buf = [0u8; 16];
        assert_eq!(p.read(1, 0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn truncate_shrinks_the_boundary_cluster() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        let data = random_bytes(5000, 6);
        p.write(1, 0, &data).unwrap();
        p.commit();
        p.truncate(1, 100).unwrap();
        assert_eq!(p.object_size(1), Some(100));

        p.commit();
        p.drop_object_pages(1);
        let mut buf = vec![0u8; 200];
        let n = p.read(1, 0, &mut buf).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..100], &data[..100]);
    }

    #[test]
    fn truncate_up_zero_extends() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        p.write(1, 0, b"abc").unwrap();
        p.truncate(1, 8192).unwrap();
        assert_eq!(p.object_size(1), Some(8192));

        let mut buf = vec![0xAAu8; 8192];
        assert_eq!(p.read(1, 0, &mut buf).unwrap(), 8192);
        assert_eq!(&buf[..3], b"abc");
        assert!(buf[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read_past_eof_is_short() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        p.write(1, 0, b"0123456789").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(p.read(1, 6, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
        assert_eq!(p.read(1, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn unknown_object_is_invalid_params() {
        let mut p = pipeline(BlockReservoir::unbounded());
        let err = p.write(9, 0, b"x").unwrap_err();
        assert!(matches!(err.source, ClusterError::InvalidParams(_)));
        let mut buf = [0u8; 1];
        assert!(matches!(
            p.read(9, 0, &mut buf),
            Err(ClusterError::InvalidParams(_))
        ));
    }

    #[test]
    fn open_twice_rejected() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        assert!(matches!(
            p.open_object(1, &ClusterConfig::default(), None),
            Err(ClusterError::InvalidParams(_))
        ));
    }

    #[test]
    fn ciphered_object_roundtrips_after_cache_drop() {
        let mut p = pipeline(BlockReservoir::unbounded());
        let config = ClusterConfig {
            compressor: Compressor::Lz4,
            cipher: CipherId::Aes256,
            ..Default::default()
        };
        p.open_object(1, &config, Some(&[0x11; 32])).unwrap();
        let data = random_bytes(6000, 7);
        p.write(1, 0, &data).unwrap();
        p.commit();
        p.drop_object_pages(1);

        let mut buf = vec![0u8; 6000];
        assert_eq!(p.read(1, 0, &mut buf).unwrap(), 6000);
        assert_eq!(buf, data);
    }

    #[test]
    fn mtime_advances_on_write() {
        let mut p = pipeline(BlockReservoir::unbounded());
        open_default(&mut p, 1);
        let before = p.object_mtime(1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        p.write(1, 0, b"tick").unwrap();
        assert!(p.object_mtime(1).unwrap() > before);
    }
}
