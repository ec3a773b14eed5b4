#![warn(missing_docs)]

//! packfs store-side collaborators: keyed disk item store, page cache with
//! per-page transaction state, transaction atom, and the block quota
//! reservoir.
//!
//! The cluster pipeline in `packfs-cluster` consumes these through narrow
//! interfaces; everything here is the in-memory realization of those
//! interfaces.

pub mod error;
pub mod item;
pub mod page;
pub mod quota;
pub mod txn;

pub use error::StoreError;
pub use item::{DiskKey, ItemLookup, ItemPosition, ItemStore, ItemStoreStats, MemItemStore, SearchMode};
pub use page::{Page, PageCache, PageCacheStats, PageTxnState, PAGE_SIZE};
pub use quota::{BlockReservoir, ReservoirStats};
pub use txn::{TxnAtom, TxnStats};
