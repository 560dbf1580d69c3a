//! Registry of live allocations, consulted for leak reporting.
//!
//! The arena registers a record on every successful allocation and
//! unregisters it on release; whatever remains at teardown leaked. The
//! ledger has no lock of its own: it lives inside the arena's critical
//! section and is only touched by arena operations.

use std::collections::BTreeMap;

use crate::arena::AllocationRecord;

/// Ledger view of one live allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub slot_index: usize,
    pub generation: u64,
    pub site_tag: String,
}

/// Live allocations keyed by slot index.
#[derive(Debug, Default)]
pub struct LeakLedger {
    live: BTreeMap<usize, LedgerEntry>,
}

impl LeakLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live allocation. Returns the entry it displaced, which is
    /// always `None` while the one-record-per-slot invariant holds.
    pub fn register(&mut self, record: &AllocationRecord) -> Option<LedgerEntry> {
        self.live.insert(
            record.slot_index,
            LedgerEntry {
                slot_index: record.slot_index,
                generation: record.generation,
                site_tag: record.site_tag.clone(),
            },
        )
    }

    pub fn unregister(&mut self, slot_index: usize) -> Option<LedgerEntry> {
        self.live.remove(&slot_index)
    }

    /// `(slot_index, site_tag)` of every live allocation, by slot index.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(usize, String)> {
        self.live
            .values()
            .map(|entry| (entry.slot_index, entry.site_tag.clone()))
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.live.values()
    }

    #[must_use]
    pub fn get(&self, slot_index: usize) -> Option<&LedgerEntry> {
        self.live.get(&slot_index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
