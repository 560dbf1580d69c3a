//! Verification tooling for slotguard arenas.
//!
//! This crate provides:
//! - Structured logging: a JSONL log contract with schema validation
//! - Leak audit: arena end-of-life capture into digest-indexed JSON artifacts
//! - Scenarios: canned misuse runs (leak, double free, use-after-free, cycles)

#![forbid(unsafe_code)]

pub mod leak_audit;
pub mod scenarios;
pub mod structured_log;

pub use leak_audit::{AuditArtifact, AuditError, LeakAudit};
pub use scenarios::{Scenario, ScenarioOutcome, ScenarioSuite};
pub use structured_log::{ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome};
