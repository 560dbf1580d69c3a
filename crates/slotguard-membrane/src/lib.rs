//! Instrumented fixed-block arena for slotguard.
//!
//! The arena hands out equal-sized slots from one contiguous region and
//! turns memory misuse into values instead of undefined behavior: double
//! frees, stale references, writes after release and writes past an element
//! are detected, journaled and counted. Whatever is still allocated when the
//! arena is torn down is reported as a leak, attributed to the site tag the
//! caller supplied at allocation time.
//!
//! # Architecture
//!
//! - **Arena** (`arena`): slot table, region, generation-checked references
//! - **Free list** (`free_list`): LIFO stack of reusable slot indices
//! - **Quarantine** (`quarantine`): FIFO delay before released slots are reused
//! - **Leak ledger** (`ledger`): live allocations by slot, for leak reports
//! - **Fingerprints** (`fingerprint`): keyed BLAKE3 trailing canaries
//! - **Handles** (`handle`): `Strong<T>` / `Weak<T>` over arena slots
//! - **Diagnostics** (`diagnostics`): stable `{slot_index, site_tag, kind}` dump format
//! - **Configuration** (`config`): capacity, layout, quarantine and poison settings
//! - **Metrics** (`metrics`): atomic counters for observability

#![deny(unsafe_code)]

pub mod arena;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fingerprint;
pub mod free_list;
pub mod handle;
pub mod ledger;
pub mod metrics;
pub mod quarantine;

pub use arena::{BlockArena, RecordState, SlotInfo, SlotRef, SlotState, new_arena};
pub use config::ArenaConfig;
pub use diagnostics::{DiagnosticKind, DiagnosticRecord, DiagnosticReport};
pub use error::ArenaError;
pub use handle::{Strong, Weak};
pub use metrics::{ArenaMetrics, MetricsSnapshot};
