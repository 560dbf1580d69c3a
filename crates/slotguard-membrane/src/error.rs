//! Error taxonomy for arena and handle operations.
//!
//! Every misuse the arena can observe is returned as an [`ArenaError`] value;
//! nothing here aborts the process. Each memory-safety variant maps onto a
//! stable [`DiagnosticKind`] so callers can journal or report it without
//! matching on internal detail.

use thiserror::Error;

use crate::diagnostics::DiagnosticKind;

/// Errors returned by [`BlockArena`](crate::arena::BlockArena) and the handle layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// No free slot and no quarantined slot old enough to recycle.
    #[error("pool exhausted: no reusable slot among {capacity} (site `{site_tag}`)")]
    PoolExhausted { capacity: usize, site_tag: String },

    /// The reference names an allocation that was already released.
    #[error("double free of slot {slot_index} at generation {generation} (site `{site_tag}`)")]
    DoubleFree {
        slot_index: usize,
        generation: u64,
        site_tag: String,
    },

    /// Out-of-range index, or a generation that names no allocation of this slot.
    #[error("invalid handle: slot {slot_index} generation {generation}")]
    InvalidHandle { slot_index: usize, generation: u64 },

    /// Access through a reference whose allocation was released and whose slot
    /// has not been handed out again.
    #[error("use after free of slot {slot_index} at generation {generation} (site `{site_tag}`)")]
    UseAfterFree {
        slot_index: usize,
        generation: u64,
        site_tag: String,
    },

    /// A raw operation targeted a slot whose payload belongs to a strong handle.
    #[error("slot {slot_index} is owned by a strong handle")]
    HandleOwned { slot_index: usize },

    /// Raw access past the end of the slot's element storage.
    #[error("access of {len} bytes at offset {offset} exceeds slot {slot_index} size {slot_size}")]
    OutOfBounds {
        slot_index: usize,
        offset: usize,
        len: usize,
        slot_size: usize,
    },

    /// A payload type does not fit the arena's element layout.
    #[error(
        "layout mismatch: payload needs {size} bytes at align {align}, slot holds {slot_size} at align {slot_align}"
    )]
    LayoutMismatch {
        size: usize,
        align: usize,
        slot_size: usize,
        slot_align: usize,
    },

    /// The arena configuration cannot be realized.
    #[error("invalid arena config: {0}")]
    InvalidConfig(String),
}

impl ArenaError {
    /// Diagnostic classification, or `None` for errors that are not memory-safety findings.
    #[must_use]
    pub fn kind(&self) -> Option<DiagnosticKind> {
        match self {
            Self::PoolExhausted { .. } => Some(DiagnosticKind::PoolExhausted),
            Self::DoubleFree { .. } => Some(DiagnosticKind::DoubleFree),
            Self::InvalidHandle { .. } | Self::HandleOwned { .. } => {
                Some(DiagnosticKind::InvalidHandle)
            }
            Self::UseAfterFree { .. } => Some(DiagnosticKind::UseAfterFree),
            Self::OutOfBounds { .. } => Some(DiagnosticKind::BufferOverflow),
            Self::LayoutMismatch { .. } | Self::InvalidConfig(_) => None,
        }
    }

    /// Slot the error refers to, when there is one.
    #[must_use]
    pub fn slot_index(&self) -> Option<usize> {
        match self {
            Self::DoubleFree { slot_index, .. }
            | Self::InvalidHandle { slot_index, .. }
            | Self::UseAfterFree { slot_index, .. }
            | Self::HandleOwned { slot_index }
            | Self::OutOfBounds { slot_index, .. } => Some(*slot_index),
            Self::PoolExhausted { .. } | Self::LayoutMismatch { .. } | Self::InvalidConfig(_) => {
                None
            }
        }
    }

    /// Allocation site attached to the error, when known.
    #[must_use]
    pub fn site_tag(&self) -> Option<&str> {
        match self {
            Self::PoolExhausted { site_tag, .. }
            | Self::DoubleFree { site_tag, .. }
            | Self::UseAfterFree { site_tag, .. } => Some(site_tag),
            _ => None,
        }
    }

    /// Returns true if retrying later can succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}
