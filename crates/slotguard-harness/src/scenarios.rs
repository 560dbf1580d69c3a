//! Canonical misuse scenarios.
//!
//! Each scenario builds a fresh arena, performs one classic memory mistake
//! (or the correct counterpart) through the safe API, and checks the arena
//! reported it the way it should. Outcomes are plain data so they can be
//! logged, serialized or asserted on.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use slotguard_membrane::{
    ArenaConfig, ArenaError, BlockArena, DiagnosticKind, DiagnosticRecord, RecordState, Strong,
    Weak,
};

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Leak,
    DoubleFree,
    UseAfterFree,
    InvalidHandle,
    PoolExhausted,
    BufferOverflow,
    QuarantineDelay,
    WeakBackEdge,
    StrongCycle,
}

impl Scenario {
    pub const ALL: [Self; 9] = [
        Self::Leak,
        Self::DoubleFree,
        Self::UseAfterFree,
        Self::InvalidHandle,
        Self::PoolExhausted,
        Self::BufferOverflow,
        Self::QuarantineDelay,
        Self::WeakBackEdge,
        Self::StrongCycle,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Leak => "leak",
            Self::DoubleFree => "double_free",
            Self::UseAfterFree => "use_after_free",
            Self::InvalidHandle => "invalid_handle",
            Self::PoolExhausted => "pool_exhausted",
            Self::BufferOverflow => "buffer_overflow",
            Self::QuarantineDelay => "quarantine_delay",
            Self::WeakBackEdge => "weak_back_edge",
            Self::StrongCycle => "strong_cycle",
        }
    }

    /// Kind the scenario must surface; `None` for scenarios that must stay clean.
    #[must_use]
    pub const fn expected_kind(self) -> Option<DiagnosticKind> {
        match self {
            Self::Leak | Self::StrongCycle => Some(DiagnosticKind::Leak),
            Self::DoubleFree => Some(DiagnosticKind::DoubleFree),
            Self::UseAfterFree => Some(DiagnosticKind::UseAfterFree),
            Self::InvalidHandle => Some(DiagnosticKind::InvalidHandle),
            Self::PoolExhausted => Some(DiagnosticKind::PoolExhausted),
            Self::BufferOverflow => Some(DiagnosticKind::BufferOverflow),
            Self::QuarantineDelay | Self::WeakBackEdge => None,
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub scenario: Scenario,
    pub passed: bool,
    /// Findings and leaks the arena reported.
    pub observed: Vec<DiagnosticRecord>,
    pub message: String,
    /// Wall-clock time the scenario took.
    pub duration_ms: u64,
}

impl ScenarioOutcome {
    fn check(scenario: Scenario, passed: bool, observed: Vec<DiagnosticRecord>, message: String) -> Self {
        Self {
            scenario,
            passed,
            observed,
            message,
            duration_ms: 0,
        }
    }

    fn unexpected(scenario: Scenario, err: &ArenaError) -> Self {
        Self::check(scenario, false, Vec::new(), format!("unexpected error: {err}"))
    }

    /// True when the arena reported `kind` at least once.
    #[must_use]
    pub fn observed_kind(&self, kind: DiagnosticKind) -> bool {
        self.observed.iter().any(|r| r.kind == kind)
    }
}

/// Runs the canned scenarios against fresh arenas.
#[derive(Debug, Clone)]
pub struct ScenarioSuite {
    quarantine_delay: u64,
    poison_byte: u8,
}

impl Default for ScenarioSuite {
    fn default() -> Self {
        let defaults = ArenaConfig::for_type::<u64>(1);
        Self {
            quarantine_delay: defaults.quarantine_delay,
            poison_byte: defaults.poison_byte,
        }
    }
}

impl ScenarioSuite {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Suite whose arenas honor `SLOTGUARD_*` overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let cfg = ArenaConfig::for_type::<u64>(1).with_env_overrides();
        Self {
            quarantine_delay: cfg.quarantine_delay,
            poison_byte: cfg.poison_byte,
        }
    }

    #[must_use]
    pub fn with_quarantine_delay(mut self, delay: u64) -> Self {
        self.quarantine_delay = delay;
        self
    }

    fn config<T>(&self, capacity: usize) -> ArenaConfig {
        ArenaConfig::for_type::<T>(capacity)
            .with_quarantine_delay(self.quarantine_delay)
            .with_poison_byte(self.poison_byte)
    }

    fn arena<T>(&self, capacity: usize) -> Result<BlockArena, ArenaError> {
        BlockArena::new(self.config::<T>(capacity))
    }

    /// Run one scenario.
    #[must_use]
    pub fn run(&self, scenario: Scenario) -> ScenarioOutcome {
        let started = Instant::now();
        let result = match scenario {
            Scenario::Leak => self.leak(),
            Scenario::DoubleFree => self.double_free(),
            Scenario::UseAfterFree => self.use_after_free(),
            Scenario::InvalidHandle => self.invalid_handle(),
            Scenario::PoolExhausted => self.pool_exhausted(),
            Scenario::BufferOverflow => self.buffer_overflow(),
            Scenario::QuarantineDelay => Self::quarantine_delay(),
            Scenario::WeakBackEdge => self.weak_back_edge(),
            Scenario::StrongCycle => self.strong_cycle(),
        };
        let mut outcome = result.unwrap_or_else(|err| ScenarioOutcome::unexpected(scenario, &err));
        outcome.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        outcome
    }

    /// Run every scenario in [`Scenario::ALL`] order.
    #[must_use]
    pub fn run_all(&self) -> Vec<ScenarioOutcome> {
        Scenario::ALL.iter().map(|&s| self.run(s)).collect()
    }

    /// Log one entry per outcome plus a summary. Returns the number of failures.
    pub fn emit(outcomes: &[ScenarioOutcome], emitter: &mut LogEmitter) -> std::io::Result<usize> {
        let mut failures = 0;
        for outcome in outcomes {
            let (level, result) = if outcome.passed {
                (LogLevel::Info, Outcome::Pass)
            } else {
                failures += 1;
                (LogLevel::Error, Outcome::Fail)
            };
            let kinds: Vec<&str> = outcome.observed.iter().map(|r| r.kind.as_str()).collect();
            let mut entry = LogEntry::new(emitter.next_trace_id(), level, "scenario.result")
                .with_outcome(result)
                .with_duration_ms(outcome.duration_ms)
                .with_details(serde_json::json!({
                    "scenario": outcome.scenario.name(),
                    "observed_kinds": kinds,
                    "message": outcome.message,
                }));
            if let Some(kind) = outcome.scenario.expected_kind() {
                entry = entry.with_kind(kind);
            }
            emitter.emit_entry(entry)?;
        }

        let summary = LogEntry::new(emitter.next_trace_id(), LogLevel::Info, "scenario.summary")
            .with_outcome(if failures == 0 { Outcome::Pass } else { Outcome::Fail })
            .with_duration_ms(outcomes.iter().map(|o| o.duration_ms).sum())
            .with_details(serde_json::json!({
                "total": outcomes.len(),
                "failed": failures,
            }));
        emitter.emit_entry(summary)?;
        emitter.flush()?;
        Ok(failures)
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    fn leak(&self) -> Result<ScenarioOutcome, ArenaError> {
        let arena = self.arena::<u64>(4)?;
        arena.allocate("a")?;
        let b = arena.allocate("b")?;
        arena.allocate("c")?;
        arena.deallocate(b)?;

        let leaks = arena.report_leaks();
        let passed = leaks == ["a", "c"];
        Ok(ScenarioOutcome::check(
            Scenario::Leak,
            passed,
            arena.teardown().records,
            format!("live sites: {leaks:?}"),
        ))
    }

    fn double_free(&self) -> Result<ScenarioOutcome, ArenaError> {
        let arena = self.arena::<u64>(2)?;
        let slot = arena.allocate("buffer")?;
        arena.deallocate(slot)?;
        let second = arena.deallocate(slot);
        let passed = matches!(second, Err(ArenaError::DoubleFree { .. }));
        Ok(ScenarioOutcome::check(
            Scenario::DoubleFree,
            passed,
            arena.diagnostics(),
            format!("second release: {second:?}"),
        ))
    }

    fn use_after_free(&self) -> Result<ScenarioOutcome, ArenaError> {
        let arena = self.arena::<[u8; 16]>(2)?;
        let slot = arena.allocate("session")?;
        arena.write_bytes(slot, 0, b"session-token-01")?;
        arena.deallocate(slot)?;
        let read = arena.read_bytes(slot);
        let write = arena.write_bytes(slot, 0, b"x");
        let passed = matches!(read, Err(ArenaError::UseAfterFree { .. }))
            && matches!(write, Err(ArenaError::UseAfterFree { .. }));
        Ok(ScenarioOutcome::check(
            Scenario::UseAfterFree,
            passed,
            arena.diagnostics(),
            format!("read after free: {read:?}"),
        ))
    }

    fn invalid_handle(&self) -> Result<ScenarioOutcome, ArenaError> {
        let arena = self.arena::<u64>(2)?;
        let live = arena.allocate("live")?;
        let out_of_range = arena.deallocate_parts(arena.capacity() + 3, 0);
        let forged = arena.deallocate_parts(live.slot_index(), live.generation() + 1);
        let passed = matches!(out_of_range, Err(ArenaError::InvalidHandle { .. }))
            && matches!(forged, Err(ArenaError::InvalidHandle { .. }))
            && arena.live_count() == 1;
        arena.deallocate(live)?;
        Ok(ScenarioOutcome::check(
            Scenario::InvalidHandle,
            passed,
            arena.diagnostics(),
            format!("out of range: {out_of_range:?}, forged generation: {forged:?}"),
        ))
    }

    fn pool_exhausted(&self) -> Result<ScenarioOutcome, ArenaError> {
        let arena = self.arena::<u64>(2)?;
        let mut available = vec![arena.available_count()];
        let first = arena.allocate("first")?;
        available.push(arena.available_count());
        let second = arena.allocate("second")?;
        available.push(arena.available_count());
        let third = arena.allocate("third");

        let passed = available == [2, 1, 0]
            && matches!(&third, Err(err) if err.is_recoverable());
        arena.deallocate(first)?;
        arena.deallocate(second)?;
        Ok(ScenarioOutcome::check(
            Scenario::PoolExhausted,
            passed,
            arena.diagnostics(),
            format!("available: {available:?}, third request: {third:?}"),
        ))
    }

    fn buffer_overflow(&self) -> Result<ScenarioOutcome, ArenaError> {
        let arena = self.arena::<[u8; 8]>(1)?;
        let slot = arena.allocate("packet")?;
        let overrun = arena.write_bytes(slot, 4, &[0xFF; 8]);
        let passed = matches!(overrun, Err(ArenaError::OutOfBounds { .. }))
            && arena.scan_integrity().is_empty();
        arena.deallocate(slot)?;
        Ok(ScenarioOutcome::check(
            Scenario::BufferOverflow,
            passed,
            arena.diagnostics(),
            format!("overrun: {overrun:?}"),
        ))
    }

    fn quarantine_delay() -> Result<ScenarioOutcome, ArenaError> {
        let arena = BlockArena::new(ArenaConfig::for_type::<u64>(3).with_quarantine_delay(2))?;
        let x = arena.allocate("x")?;
        arena.deallocate(x)?;
        let first = arena.allocate("first")?;
        let second = arena.allocate("second")?;
        let third = arena.allocate("third")?;

        let held = first.slot_index() != x.slot_index() && second.slot_index() != x.slot_index();
        let reused = third.slot_index() == x.slot_index() && third.generation() > x.generation();
        Ok(ScenarioOutcome::check(
            Scenario::QuarantineDelay,
            held && reused,
            arena.diagnostics(),
            format!(
                "released slot {}; reuse order {:?}",
                x.slot_index(),
                [first.slot_index(), second.slot_index(), third.slot_index()]
            ),
        ))
    }

    fn weak_back_edge(&self) -> Result<ScenarioOutcome, ArenaError> {
        let arena = Arc::new(self.arena::<Node>(4)?);
        let (linked, b_slot) = {
            let a = Strong::new(&arena, "a", Node::new("a"))?;
            let b = Strong::new(&arena, "b", Node::new("b"))?;
            *b.prev.borrow_mut() = Some(Strong::downgrade(&a));
            let b_slot = Strong::slot(&b);
            // Only `a` is held from outside; `b` lives through the forward edge.
            *a.next.borrow_mut() = Some(b);
            let back = a
                .next
                .borrow()
                .as_ref()
                .and_then(|b| b.prev.borrow().as_ref().and_then(Weak::upgrade));
            (back.map(|node| node.name) == Some("a"), b_slot)
        };
        let leaks = arena.report_leaks();
        let b_reclaimed = arena.record_state(b_slot) == Some(RecordState::Reclaimed);
        Ok(ScenarioOutcome::check(
            Scenario::WeakBackEdge,
            linked && b_reclaimed && leaks.is_empty(),
            arena.leak_report().records,
            format!("live after dropping a: {leaks:?}"),
        ))
    }

    fn strong_cycle(&self) -> Result<ScenarioOutcome, ArenaError> {
        let arena = Arc::new(self.arena::<Node>(4)?);
        let a_weak = {
            let a = Strong::new(&arena, "a", Node::new("a"))?;
            let b = Strong::new(&arena, "b", Node::new("b"))?;
            *a.next.borrow_mut() = Some(b.clone());
            *b.next.borrow_mut() = Some(a.clone());
            Strong::downgrade(&a)
        };
        let report = arena.leak_report();
        let leaks = arena.report_leaks();

        // Break the cycle so the scenario does not leak past its own arena.
        if let Some(a) = a_weak.upgrade() {
            let b = a.next.borrow_mut().take();
            drop(b);
        }
        let reclaimed = arena.report_leaks().is_empty();
        Ok(ScenarioOutcome::check(
            Scenario::StrongCycle,
            leaks == ["a", "b"] && reclaimed,
            report.records,
            format!("live after drop: {leaks:?}"),
        ))
    }
}

/// Doubly linked node used by the cycle scenarios.
struct Node {
    name: &'static str,
    next: RefCell<Option<Strong<Node>>>,
    prev: RefCell<Option<Weak<Node>>>,
}

impl Node {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            next: RefCell::new(None),
            prev: RefCell::new(None),
        }
    }
}
