//! Leak and diagnostic audit for block arenas.
//!
//! An audit captures an arena's end-of-life state (live allocations,
//! journaled findings, integrity scan results and counters) into a JSON
//! artifact, logs one structured entry per finding, and records the artifact
//! in an [`ArtifactIndex`] under its SHA-256 digest so later gates can verify
//! it was not edited.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::Digest;
use slotguard_membrane::{BlockArena, DiagnosticKind, DiagnosticRecord, MetricsSnapshot};
use thiserror::Error;

use crate::structured_log::{ArtifactEntry, ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome};

/// Artifact schema version.
pub const AUDIT_SCHEMA_VERSION: u32 = 1;

/// Artifact kind recorded in the index.
pub const AUDIT_ARTIFACT_KIND: &str = "arena_audit";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("artifact '{path}' is not in the index")]
    NotIndexed { path: String },
    #[error("sha256 mismatch for '{path}': expected={expected}, actual={actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

/// Captured end-of-life state of one arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditArtifact {
    pub schema_version: u32,
    pub run_id: String,
    pub arena_id: u64,
    pub capacity: usize,
    pub slot_size: usize,
    pub quarantine_delay: u64,
    /// Allocations still live at capture time.
    pub leaks: Vec<DiagnosticRecord>,
    /// Journaled findings, including this capture's integrity scan.
    pub findings: Vec<DiagnosticRecord>,
    /// Findings the journal dropped for lack of room.
    pub evicted_findings: u64,
    pub metrics: MetricsSnapshot,
}

impl AuditArtifact {
    /// True when nothing leaked and nothing was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty() && self.findings.is_empty() && self.evicted_findings == 0
    }

    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if self.is_clean() {
            Outcome::Pass
        } else {
            Outcome::Fail
        }
    }

    /// Count of leaks plus findings of `kind`.
    #[must_use]
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.leaks
            .iter()
            .chain(&self.findings)
            .filter(|r| r.kind == kind)
            .count()
    }

    /// File name used when the artifact is written to a run directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}-arena-{}.json", self.run_id, self.arena_id)
    }
}

/// Runs audits for one suite/run pair.
#[derive(Debug, Clone)]
pub struct LeakAudit {
    suite: String,
    run_id: String,
}

impl LeakAudit {
    #[must_use]
    pub fn new(suite: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            run_id: run_id.into(),
        }
    }

    #[must_use]
    pub fn suite(&self) -> &str {
        &self.suite
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Scan `arena` and capture its state. Live allocations are left alone.
    #[must_use]
    pub fn capture(&self, arena: &BlockArena) -> AuditArtifact {
        arena.scan_integrity();
        AuditArtifact {
            schema_version: AUDIT_SCHEMA_VERSION,
            run_id: self.run_id.clone(),
            arena_id: arena.id(),
            capacity: arena.capacity(),
            slot_size: arena.slot_size(),
            quarantine_delay: arena.config().quarantine_delay,
            leaks: arena.leak_report().records,
            findings: arena.diagnostics(),
            evicted_findings: arena.evicted_diagnostics(),
            metrics: arena.metrics_snapshot(),
        }
    }

    /// Log one entry per leak and finding, then a summary. Returns entries written.
    pub fn emit(
        &self,
        artifact: &AuditArtifact,
        artifact_refs: &[String],
        emitter: &mut LogEmitter,
    ) -> std::io::Result<usize> {
        let mut written = 0;
        for record in artifact.leaks.iter().chain(&artifact.findings) {
            let trace_id = emitter.next_trace_id();
            let entry = LogEntry::diagnostic(trace_id, artifact.arena_id, record)
                .with_suite(&self.suite)
                .with_outcome(Outcome::Fail)
                .with_artifacts(artifact_refs.to_vec());
            emitter.emit_entry(entry)?;
            written += 1;
        }

        let level = if artifact.is_clean() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let summary = LogEntry::new(emitter.next_trace_id(), level, "audit.summary")
            .with_suite(&self.suite)
            .with_arena(artifact.arena_id)
            .with_outcome(artifact.outcome())
            .with_artifacts(artifact_refs.to_vec())
            .with_details(serde_json::json!({
                "leaks": artifact.leaks.len(),
                "findings": artifact.findings.len(),
                "evicted_findings": artifact.evicted_findings,
                "violations": artifact.metrics.violations(),
                "allocations": artifact.metrics.allocations,
                "deallocations": artifact.metrics.deallocations,
            }));
        emitter.emit_entry(summary)?;
        emitter.flush()?;
        Ok(written + 1)
    }

    /// Write `artifact` into `dir` and index it. Returns the written path.
    pub fn write_artifact(
        &self,
        artifact: &AuditArtifact,
        dir: &Path,
        index: &mut ArtifactIndex,
    ) -> Result<PathBuf, AuditError> {
        let file_name = artifact.file_name();
        let path = dir.join(&file_name);
        let bytes = serde_json::to_vec_pretty(artifact)?;
        std::fs::write(&path, &bytes)?;

        index.push(ArtifactEntry {
            path: file_name,
            kind: AUDIT_ARTIFACT_KIND.to_string(),
            sha256: sha256_hex(&bytes),
            size_bytes: Some(bytes.len() as u64),
            description: Some(format!(
                "arena {} audit: {} leaks, {} findings",
                artifact.arena_id,
                artifact.leaks.len(),
                artifact.findings.len()
            )),
        });
        Ok(path)
    }

    /// Capture, write, index and log in one pass.
    pub fn run(
        &self,
        arena: &BlockArena,
        dir: &Path,
        index: &mut ArtifactIndex,
        emitter: &mut LogEmitter,
    ) -> Result<AuditArtifact, AuditError> {
        let artifact = self.capture(arena);
        self.write_artifact(&artifact, dir, index)?;
        self.emit(&artifact, &[artifact.file_name()], emitter)?;
        Ok(artifact)
    }
}

/// Re-read an indexed artifact from `dir` and check its digest.
pub fn verify_artifact(
    dir: &Path,
    index: &ArtifactIndex,
    path: &str,
) -> Result<AuditArtifact, AuditError> {
    let entry = index.find(path).ok_or_else(|| AuditError::NotIndexed {
        path: path.to_string(),
    })?;
    let bytes = std::fs::read(dir.join(path))?;
    let actual = sha256_hex(&bytes);
    if !actual.eq_ignore_ascii_case(&entry.sha256) {
        return Err(AuditError::DigestMismatch {
            path: path.to_string(),
            expected: entry.sha256.clone(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    sha2::Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
