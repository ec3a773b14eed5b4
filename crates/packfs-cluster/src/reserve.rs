//! Worst-case space reservation for cluster writes.
//!
//! A cluster write charges the reservoir for the largest blob the transform
//! could possibly produce, plus headroom for a tree split, before any disk
//! structure is touched. After the transform the reservation is settled down
//! to what the blob actually needs, and the blocks of the blob it replaced
//! go back to the budget. The reservoir invariant this maintains: used
//! blocks equal the sum of `blocks_for(blob len)` over all live disk
//! clusters.
//!
//! Reservation is idempotent per pass. The per-page `reserved` flag plus
//! the handle's charged count let a restarted pass over the same cluster
//! skip the second charge.

use tracing::trace;

use packfs_store::{BlockReservoir, TxnAtom, PAGE_SIZE};

use crate::cluster::{ClusterHandle, ClusterParams};
use crate::error::ClusterError;

/// Size of one reservable disk block.
pub const BLOCK_SIZE: usize = PAGE_SIZE;

/// Extra blocks charged per cluster pass to cover an item-tree node split.
pub const TREE_SPLIT_RESERVE: u64 = 1;

/// Blocks needed to hold `len` bytes.
pub fn blocks_for(len: usize) -> u64 {
    len.div_ceil(BLOCK_SIZE) as u64
}

/// Charges the worst-case block count for the cluster pass. A no-op when
/// this pass already holds a reservation.
pub fn reserve_cluster(
    reservoir: &mut BlockReservoir,
    handle: &mut ClusterHandle,
    params: &ClusterParams,
) -> Result<(), ClusterError> {
    if handle.reserved_blocks > 0
        && handle.pages.iter().all(|p| p.txn_state().reserved)
    {
        trace!(cluster = handle.index, "reservation already held");
        return Ok(());
    }
    let worst = blocks_for(params.worst_case_len(handle.content_len)) + TREE_SPLIT_RESERVE;
    reservoir.alloc_blocks(worst)?;
    for page in &handle.pages {
        page.update_txn(|t| t.reserved = true);
    }
    handle.reserved_blocks = worst;
    trace!(cluster = handle.index, blocks = worst, "worst case reserved");
    Ok(())
}

/// Settles the pass's reservation against the finished blob: keeps
/// `blocks_for(handle.len)` charged, returns the rest, and frees the blocks
/// of the `old_blob_len`-byte blob this write replaced.
pub fn settle_cluster(
    reservoir: &mut BlockReservoir,
    handle: &mut ClusterHandle,
    old_blob_len: usize,
) {
    let actual = blocks_for(handle.len);
    debug_assert!(actual <= handle.reserved_blocks, "blob outgrew its reservation");
    let surplus = handle.reserved_blocks.saturating_sub(actual);
    let give_back = surplus + blocks_for(old_blob_len);
    if give_back > 0 {
        reservoir.free_blocks(give_back);
    }
    for page in &handle.pages {
        page.update_txn(|t| t.reserved = false);
    }
    trace!(
        cluster = handle.index,
        kept = actual,
        freed = give_back,
        "reservation settled"
    );
    handle.reserved_blocks = 0;
}

/// Unwinds the whole reservation after a failed pass; nothing stays charged.
pub fn release_on_error(reservoir: &mut BlockReservoir, handle: &mut ClusterHandle) {
    if handle.reserved_blocks > 0 {
        reservoir.free_blocks(handle.reserved_blocks);
        handle.reserved_blocks = 0;
    }
    for page in &handle.pages {
        page.update_txn(|t| t.reserved = false);
    }
}

/// Enlists the cluster's page set in the atom, all pages or none. A refusal
/// means another atom owns part of the cluster; the pass must back off and
/// run again.
pub fn capture_cluster(atom: &mut TxnAtom, handle: &ClusterHandle) -> Result<(), ClusterError> {
    atom.capture_all(&handle.pages)
        .map_err(|_| ClusterError::Retry)
}
