//! Transaction atom: all-or-nothing capture of a cluster's page set.
//!
//! Compression and encryption couple every byte of a cluster into one disk
//! blob, so either every page of the cluster enters the transaction or none
//! does. Capture is therefore two-phase: first verify each page can be
//! taken, then transition them all.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::page::Page;

/// Counters for atom activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnStats {
    /// Pages captured over the atom's lifetime
    pub pages_captured: u64,
    /// Commits performed
    pub commits: u64,
    /// Whole-cluster captures refused
    pub captures_refused: u64,
}

/// The active transaction's page set.
#[derive(Debug, Default)]
pub struct TxnAtom {
    captured: HashMap<(u64, u64), Arc<Page>>,
    stats: TxnStats,
}

impl TxnAtom {
    /// Creates an empty atom.
    pub fn new() -> Self {
        Self::default()
    }

    fn holds(&self, page: &Page) -> bool {
        self.captured
            .contains_key(&(page.object_id(), page.index()))
    }

    /// Captures every page of one cluster, or none of them.
    ///
    /// A page already captured by this atom is fine (re-dirtying is
    /// idempotent); a page captured elsewhere refuses the whole set.
    pub fn capture_all(&mut self, pages: &[Arc<Page>]) -> Result<(), StoreError> {
        for page in pages {
            let state = page.txn_state();
            if state.captured && !self.holds(page) {
                self.stats.captures_refused += 1;
                return Err(StoreError::CaptureRefused(format!(
                    "page {}/{} is owned by another atom",
                    page.object_id(),
                    page.index()
                )));
            }
        }
        for page in pages {
            let newly_taken = page.update_txn(|t| {
                let fresh = !t.captured;
                t.captured = true;
                t.dirty = true;
                fresh
            });
            if newly_taken {
                self.captured
                    .insert((page.object_id(), page.index()), Arc::clone(page));
                self.stats.pages_captured += 1;
            }
        }
        Ok(())
    }

    /// Commits the atom: releases every captured page back to clean state.
    /// Returns the number of pages committed.
    pub fn commit(&mut self) -> usize {
        let count = self.captured.len();
        for page in self.captured.values() {
            page.update_txn(|t| {
                t.captured = false;
                t.dirty = false;
            });
        }
        self.captured.clear();
        self.stats.commits += 1;
        debug!(pages = count, "atom committed");
        count
    }

    /// Pages currently captured.
    pub fn captured_count(&self) -> usize {
        self.captured.len()
    }

    /// Activity counters.
    pub fn stats(&self) -> &TxnStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageCache;

    #[test]
    fn capture_marks_pages_dirty_and_captured() {
        let cache = PageCache::new();
        let pages = vec![cache.grab(1, 0), cache.grab(1, 1)];
        let mut atom = TxnAtom::new();
        atom.capture_all(&pages).unwrap();
        assert_eq!(atom.captured_count(), 2);
        for page in &pages {
            let s = page.txn_state();
            assert!(s.dirty && s.captured);
        }
    }

    #[test]
    fn recapture_by_same_atom_is_idempotent() {
        let cache = PageCache::new();
        let pages = vec![cache.grab(1, 0)];
        let mut atom = TxnAtom::new();
        atom.capture_all(&pages).unwrap();
        atom.capture_all(&pages).unwrap();
        assert_eq!(atom.captured_count(), 1);
        assert_eq!(atom.stats().pages_captured, 1);
    }

    #[test]
    fn capture_refused_when_page_owned_elsewhere() {
        let cache = PageCache::new();
        let contested = cache.grab(1, 1);
        let mut other = TxnAtom::new();
        other.capture_all(std::slice::from_ref(&contested)).unwrap();

        let pages = vec![cache.grab(1, 0), contested];
        let mut atom = TxnAtom::new();
        let err = atom.capture_all(&pages).unwrap_err();
        assert!(matches!(err, StoreError::CaptureRefused(_)));
        // All-or-nothing: the first page stayed untouched.
        assert!(!pages[0].txn_state().captured);
        assert_eq!(atom.captured_count(), 0);
    }

    #[test]
    fn commit_releases_pages() {
        let cache = PageCache::new();
        let pages = vec![cache.grab(1, 0), cache.grab(1, 1)];
        let mut atom = TxnAtom::new();
        atom.capture_all(&pages).unwrap();
        assert_eq!(atom.commit(), 2);
        assert_eq!(atom.captured_count(), 0);
        for page in &pages {
            let s = page.txn_state();
            assert!(!s.dirty && !s.captured);
        }
    }
}
