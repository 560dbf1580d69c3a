//! Stable diagnostic dump format.
//!
//! Each finding is a `{slot_index, site_tag, kind}` record. Field names and
//! kind spellings are part of the external contract: reporters (test
//! harnesses, log sinks) consume them without depending on arena internals.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::ArenaError;

/// Classification of a diagnostic finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// Allocation still registered at report time.
    Leak,
    /// Release of an allocation that was already released.
    DoubleFree,
    /// Access to (or write into) storage after its allocation was released.
    UseAfterFree,
    /// Stale, foreign or out-of-range reference.
    InvalidHandle,
    /// Allocation request with no reusable slot.
    PoolExhausted,
    /// Trailing canary damaged or a raw write ran past the element storage.
    BufferOverflow,
}

impl DiagnosticKind {
    /// All kinds, in report order.
    pub const ALL: [Self; 6] = [
        Self::Leak,
        Self::DoubleFree,
        Self::UseAfterFree,
        Self::InvalidHandle,
        Self::PoolExhausted,
        Self::BufferOverflow,
    ];

    /// Stable spelling used in dumps.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Leak => "Leak",
            Self::DoubleFree => "DoubleFree",
            Self::UseAfterFree => "UseAfterFree",
            Self::InvalidHandle => "InvalidHandle",
            Self::PoolExhausted => "PoolExhausted",
            Self::BufferOverflow => "BufferOverflow",
        }
    }
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding in the dump format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// Slot involved; `None` for arena-wide findings such as exhaustion.
    pub slot_index: Option<usize>,
    /// Caller-supplied allocation site, empty when unknown.
    pub site_tag: String,
    pub kind: DiagnosticKind,
}

impl DiagnosticRecord {
    #[must_use]
    pub fn new(slot_index: Option<usize>, site_tag: impl Into<String>, kind: DiagnosticKind) -> Self {
        Self {
            slot_index,
            site_tag: site_tag.into(),
            kind,
        }
    }

    /// Leak record for a live allocation.
    #[must_use]
    pub fn leak(slot_index: usize, site_tag: impl Into<String>) -> Self {
        Self::new(Some(slot_index), site_tag, DiagnosticKind::Leak)
    }

    /// Convert an error into a record. Non-diagnostic errors yield `None`.
    #[must_use]
    pub fn from_error(err: &ArenaError) -> Option<Self> {
        let kind = err.kind()?;
        Some(Self::new(
            err.slot_index(),
            err.site_tag().unwrap_or_default(),
            kind,
        ))
    }
}

/// A batch of findings attributed to one arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub arena_id: u64,
    pub records: Vec<DiagnosticRecord>,
}

impl DiagnosticReport {
    #[must_use]
    pub fn new(arena_id: u64, records: Vec<DiagnosticRecord>) -> Self {
        Self { arena_id, records }
    }

    /// True when the report holds no findings.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of findings of one kind.
    #[must_use]
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }

    /// Site tags of findings of one kind, in report order.
    #[must_use]
    pub fn site_tags(&self, kind: DiagnosticKind) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.site_tag.as_str())
            .collect()
    }
}

/// Bounded record of findings, oldest evicted first.
#[derive(Debug)]
pub(crate) struct DiagnosticJournal {
    entries: VecDeque<DiagnosticRecord>,
    limit: usize,
    evicted: u64,
}

impl DiagnosticJournal {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            evicted: 0,
        }
    }

    pub(crate) fn push(&mut self, record: DiagnosticRecord) {
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(record);
    }

    pub(crate) fn snapshot(&self) -> Vec<DiagnosticRecord> {
        self.entries.iter().cloned().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<DiagnosticRecord> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn evicted(&self) -> u64 {
        self.evicted
    }
}
