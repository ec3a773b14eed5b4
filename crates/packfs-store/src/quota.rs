//! Block quota reservoir: the pre-charged space budget for cluster writes.
//!
//! Writers charge a worst-case block count before touching on-disk
//! structures and give back whatever the finished cluster did not use, so a
//! write can never half-succeed on space discovered mid-operation.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;

/// Counters for reservoir activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservoirStats {
    /// Successful allocations
    pub allocs: u64,
    /// Frees
    pub frees: u64,
    /// Denied allocations
    pub denials: u64,
    /// Total blocks ever allocated
    pub blocks_allocated: u64,
    /// Total blocks ever freed
    pub blocks_freed: u64,
}

/// A fixed budget of disk blocks.
#[derive(Debug)]
pub struct BlockReservoir {
    total: u64,
    used: u64,
    stats: ReservoirStats,
}

impl BlockReservoir {
    /// Creates a reservoir holding `total` blocks.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            used: 0,
            stats: ReservoirStats::default(),
        }
    }

    /// Creates an effectively unbounded reservoir.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    /// Charges `n` blocks, denying the whole request if fewer are available.
    pub fn alloc_blocks(&mut self, n: u64) -> Result<(), StoreError> {
        let available = self.total - self.used;
        if n > available {
            self.stats.denials += 1;
            warn!(requested = n, available, "block allocation denied");
            return Err(StoreError::QuotaExceeded {
                requested: n,
                available,
            });
        }
        self.used += n;
        self.stats.allocs += 1;
        self.stats.blocks_allocated += n;
        Ok(())
    }

    /// Returns `n` blocks to the budget.
    pub fn free_blocks(&mut self, n: u64) {
        debug_assert!(n <= self.used, "freeing more blocks than are charged");
        self.used = self.used.saturating_sub(n);
        self.stats.frees += 1;
        self.stats.blocks_freed += n;
        debug!(freed = n, used = self.used, "blocks freed");
    }

    /// Blocks currently charged.
    pub fn used_blocks(&self) -> u64 {
        self.used
    }

    /// Blocks still available.
    pub fn available_blocks(&self) -> u64 {
        self.total - self.used
    }

    /// Activity counters.
    pub fn stats(&self) -> &ReservoirStats {
        &self.stats
    }
}
