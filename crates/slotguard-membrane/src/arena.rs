//! Fixed-capacity block arena with generation-checked slot references.
//!
//! The arena owns one contiguous region cut into equal slots. Callers never
//! see a raw address as their handle: an allocation is named by a
//! [`SlotRef`], the pair `(slot_index, generation)`. Every release bumps the
//! slot's generation, so a reference that outlives its allocation no longer
//! matches and is rejected instead of silently reaching recycled storage.
//!
//! Released slots are poisoned and pass through a quarantine before the
//! free list hands them out again. Each slot also carries a trailing canary
//! so writes past the element are caught on release or by
//! [`BlockArena::scan_integrity`].
//!
//! All mutation happens under one `parking_lot::Mutex`; the arena is the
//! unit of mutual exclusion and no operation waits for a slot to free up.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ArenaConfig;
use crate::diagnostics::{DiagnosticJournal, DiagnosticKind, DiagnosticRecord, DiagnosticReport};
use crate::error::ArenaError;
use crate::fingerprint::{CANARY_SIZE, SlotFingerprint};
use crate::free_list::FreeList;
use crate::ledger::LeakLedger;
use crate::metrics::{ArenaMetrics, MetricsSnapshot};
use crate::quarantine::Quarantine;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Reference to one allocation: a slot index plus the generation it was handed out at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    slot_index: usize,
    generation: u64,
}

impl SlotRef {
    #[must_use]
    pub const fn new(slot_index: usize, generation: u64) -> Self {
        Self {
            slot_index,
            generation,
        }
    }

    #[must_use]
    pub const fn slot_index(&self) -> usize {
        self.slot_index
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    /// Available to the free list.
    Free,
    /// Holds a live allocation.
    Allocated,
    /// Released and waiting out the quarantine delay.
    Quarantined,
}

impl SlotState {
    #[must_use]
    pub const fn is_allocated(self) -> bool {
        matches!(self, Self::Allocated)
    }

    /// True for slots whose last allocation has been released.
    #[must_use]
    pub const fn is_released(self) -> bool {
        matches!(self, Self::Free | Self::Quarantined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    Raw,
    Handle,
}

/// Metadata for a live allocation. Owned by the arena.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    pub slot_index: usize,
    pub generation: u64,
    pub site_tag: String,
    pub strong_count: usize,
    pub weak_count: usize,
    pub(crate) owner: Owner,
}

impl AllocationRecord {
    pub(crate) fn raw(slot_index: usize, generation: u64, site_tag: String) -> Self {
        Self::with_owner(slot_index, generation, site_tag, Owner::Raw)
    }

    fn with_owner(slot_index: usize, generation: u64, site_tag: String, owner: Owner) -> Self {
        Self {
            slot_index,
            generation,
            site_tag,
            strong_count: 1,
            weak_count: 0,
            owner,
        }
    }

    /// True when a strong handle owns the payload.
    #[must_use]
    pub fn is_handle_owned(&self) -> bool {
        self.owner == Owner::Handle
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot_index: usize,
    pub state: SlotState,
    pub generation: u64,
    pub strong_count: usize,
    pub weak_count: usize,
}

/// Where an allocation is in its `Live -> Zombie -> Reclaimed` life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// At least one strong reference.
    Live {
        strong_count: usize,
        weak_count: usize,
    },
    /// Payload destroyed and slot released; weak handles still outstanding.
    Zombie { weak_count: usize },
    /// Nothing refers to the allocation any more.
    Reclaimed,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    generation: u64,
    record: Option<AllocationRecord>,
    /// Site of the most recently released allocation, for after-free reports.
    retired_tag: Option<String>,
    /// Last corruption journaled for this slot, so lasting damage is reported once.
    flagged: Option<(u64, DiagnosticKind)>,
}

impl Slot {
    fn fresh() -> Self {
        Self {
            state: SlotState::Free,
            generation: 0,
            record: None,
            retired_tag: None,
            flagged: None,
        }
    }

    fn retired_tag(&self) -> String {
        self.retired_tag.clone().unwrap_or_default()
    }

    /// True when `slot_generation` names the allocation released last.
    fn just_retired(&self, slot_generation: u64) -> bool {
        self.state.is_released() && self.generation.checked_sub(1) == Some(slot_generation)
    }

    /// Mark `kind` as reported for the current generation. False if it already was.
    fn flag(&mut self, kind: DiagnosticKind) -> bool {
        let key = (self.generation, kind);
        if self.flagged == Some(key) {
            return false;
        }
        self.flagged = Some(key);
        true
    }
}

struct ArenaInner {
    slots: Vec<Slot>,
    free_list: FreeList,
    quarantine: Quarantine,
    ledger: LeakLedger,
    /// Weak counts of released allocations, keyed by `(slot_index, generation)`.
    zombies: HashMap<(usize, u64), usize>,
    journal: DiagnosticJournal,
    /// Allocation requests seen, including refused ones.
    clock: u64,
}

impl ArenaInner {
    fn live_record(&self, slot: SlotRef) -> Option<&AllocationRecord> {
        let entry = self.slots.get(slot.slot_index)?;
        if entry.generation != slot.generation {
            return None;
        }
        entry.record.as_ref()
    }

    fn live_record_mut(&mut self, slot: SlotRef) -> Option<&mut AllocationRecord> {
        let entry = self.slots.get_mut(slot.slot_index)?;
        if entry.generation != slot.generation {
            return None;
        }
        entry.record.as_mut()
    }
}

/// Instrumented fixed-block arena.
pub struct BlockArena {
    id: u64,
    config: ArenaConfig,
    /// Element bytes per slot (excludes the canary).
    slot_size: usize,
    /// Distance between slot bases: element, canary, alignment padding.
    stride: usize,
    region: NonNull<u8>,
    region_layout: Layout,
    inner: Mutex<ArenaInner>,
    metrics: ArenaMetrics,
}

// SAFETY: region bytes are touched only under `inner`, or by the strong handles
// that own a slot's payload, which the arena leaves alone while strong_count > 0.
unsafe impl Send for BlockArena {}
// SAFETY: see `Send`; shared access goes through the mutex.
unsafe impl Sync for BlockArena {}

/// Build a shared arena of `capacity` slots sized for `element_layout`.
pub fn new_arena(capacity: usize, element_layout: Layout) -> Result<Arc<BlockArena>, ArenaError> {
    BlockArena::shared(ArenaConfig::new(capacity, element_layout))
}

impl BlockArena {
    /// Reserve and poison the region described by `config`.
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        config.validate()?;

        let slot_size = config.element_layout.size();
        let align = config.element_layout.align();
        let stride = slot_size
            .checked_add(CANARY_SIZE)
            .and_then(|n| n.checked_next_multiple_of(align))
            .ok_or_else(|| ArenaError::InvalidConfig("slot stride overflows usize".to_string()))?;
        let total = stride.checked_mul(config.capacity).ok_or_else(|| {
            ArenaError::InvalidConfig(format!(
                "{} slots of {stride} bytes overflow usize",
                config.capacity
            ))
        })?;
        let region_layout = Layout::from_size_align(total, align)
            .map_err(|err| ArenaError::InvalidConfig(format!("region layout: {err}")))?;

        // SAFETY: region_layout has non-zero size (stride >= CANARY_SIZE, capacity >= 1).
        let raw = unsafe { std::alloc::alloc(region_layout) };
        let region = NonNull::new(raw).ok_or_else(|| {
            ArenaError::InvalidConfig(format!("cannot reserve {total} bytes for the region"))
        })?;
        // SAFETY: region is valid for `total` bytes.
        unsafe { std::ptr::write_bytes(region.as_ptr(), config.poison_byte, total) };

        let inner = ArenaInner {
            slots: (0..config.capacity).map(|_| Slot::fresh()).collect(),
            free_list: FreeList::full(config.capacity),
            quarantine: Quarantine::new(config.quarantine_delay),
            ledger: LeakLedger::new(),
            zombies: HashMap::new(),
            journal: DiagnosticJournal::new(config.journal_limit),
            clock: 0,
        };

        Ok(Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            config,
            slot_size,
            stride,
            region,
            region_layout,
            inner: Mutex::new(inner),
            metrics: ArenaMetrics::new(),
        })
    }

    /// Arena with default settings for the given capacity and element layout.
    pub fn with_layout(capacity: usize, element_layout: Layout) -> Result<Self, ArenaError> {
        Self::new(ArenaConfig::new(capacity, element_layout))
    }

    /// Arena wrapped for sharing with strong and weak handles.
    pub fn shared(config: ArenaConfig) -> Result<Arc<Self>, ArenaError> {
        Self::new(config).map(Arc::new)
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Hand out a free slot, recycling matured quarantine entries when the
    /// free list is empty.
    ///
    /// Fails fast with `PoolExhausted` when nothing is reusable. The request
    /// still advances the quarantine clock, so retrying eventually recovers
    /// quarantined slots.
    pub fn allocate(&self, site_tag: impl Into<String>) -> Result<SlotRef, ArenaError> {
        let mut guard = self.inner.lock();
        self.allocate_locked(&mut guard, site_tag.into(), Owner::Raw)
    }

    /// Release an allocation.
    ///
    /// Fails with `DoubleFree` when the slot's most recent allocation was
    /// already released, and with `InvalidHandle` for anything else that is
    /// not live: out-of-range indices, forged generations, and generations
    /// the slot has moved past by being handed out again. On success the storage is poisoned,
    /// the generation bumped and the slot quarantined.
    pub fn deallocate(&self, slot: SlotRef) -> Result<(), ArenaError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Err(err) = Self::check_release(inner, slot) {
            return Err(self.reject(inner, err));
        }
        if inner
            .live_record(slot)
            .is_some_and(AllocationRecord::is_handle_owned)
        {
            let err = ArenaError::HandleOwned {
                slot_index: slot.slot_index,
            };
            return Err(self.reject(inner, err));
        }
        self.retire_locked(inner, slot.slot_index);
        Ok(())
    }

    /// [`deallocate`](Self::deallocate) from the raw `(slot_index, generation)` pair.
    pub fn deallocate_parts(&self, slot_index: usize, generation: u64) -> Result<(), ArenaError> {
        self.deallocate(SlotRef::new(slot_index, generation))
    }

    fn allocate_locked(
        &self,
        inner: &mut ArenaInner,
        site_tag: String,
        owner: Owner,
    ) -> Result<SlotRef, ArenaError> {
        let now = inner.clock;
        inner.clock += 1;

        let slot_index = match inner.free_list.pop() {
            Some(index) => index,
            None => {
                self.release_matured(inner, now);
                match inner.free_list.pop() {
                    Some(index) => index,
                    None => {
                        let err = ArenaError::PoolExhausted {
                            capacity: self.config.capacity,
                            site_tag,
                        };
                        return Err(self.reject(inner, err));
                    }
                }
            }
        };

        let slot = &mut inner.slots[slot_index];
        debug_assert_eq!(slot.state, SlotState::Free, "free list held a busy slot");
        slot.state = SlotState::Allocated;
        let generation = slot.generation;
        let record = AllocationRecord::with_owner(slot_index, generation, site_tag, owner);
        let displaced = inner.ledger.register(&record);
        debug_assert!(displaced.is_none(), "two live records for slot {slot_index}");
        inner.slots[slot_index].record = Some(record);

        self.write_canary(slot_index, generation);
        ArenaMetrics::inc(&self.metrics.allocations);
        Ok(SlotRef::new(slot_index, generation))
    }

    fn release_matured(&self, inner: &mut ArenaInner, now: u64) {
        let matured = inner.quarantine.matured(now);
        // Newest first onto the LIFO, so the longest-quarantined slot is reused first.
        for &slot_index in matured.iter().rev() {
            inner.slots[slot_index].state = SlotState::Free;
            inner.free_list.push(slot_index);
            ArenaMetrics::inc(&self.metrics.quarantine_releases);
        }
    }

    /// Retire the live allocation in `slot_index`: unregister, verify the
    /// canary, poison, bump the generation, quarantine.
    fn retire_locked(&self, inner: &mut ArenaInner, slot_index: usize) {
        let generation = inner.slots[slot_index].generation;
        let record = inner.slots[slot_index].record.take();
        inner.ledger.unregister(slot_index);

        let site_tag = record
            .as_ref()
            .map(|r| r.site_tag.clone())
            .unwrap_or_default();
        if !self.canary_intact(slot_index, generation)
            && inner.slots[slot_index].flag(DiagnosticKind::BufferOverflow)
        {
            let finding = DiagnosticRecord::new(
                Some(slot_index),
                site_tag.clone(),
                DiagnosticKind::BufferOverflow,
            );
            self.note(inner, finding);
        }
        if let Some(record) = &record
            && record.weak_count > 0
        {
            inner
                .zombies
                .insert((slot_index, generation), record.weak_count);
        }

        self.poison(slot_index);

        let now = inner.clock;
        let quarantined = !inner.quarantine.is_disabled();
        let slot = &mut inner.slots[slot_index];
        slot.generation += 1;
        slot.retired_tag = Some(site_tag);
        if quarantined {
            slot.state = SlotState::Quarantined;
            inner.quarantine.admit(slot_index, now);
            ArenaMetrics::inc(&self.metrics.quarantine_admissions);
        } else {
            slot.state = SlotState::Free;
            inner.free_list.push(slot_index);
        }
        ArenaMetrics::inc(&self.metrics.deallocations);
    }

    fn check_release(inner: &ArenaInner, slot: SlotRef) -> Result<(), ArenaError> {
        let Some(entry) = inner.slots.get(slot.slot_index) else {
            return Err(invalid(slot));
        };
        match entry.state {
            SlotState::Allocated if slot.generation == entry.generation => Ok(()),
            _ if entry.just_retired(slot.generation) => Err(ArenaError::DoubleFree {
                slot_index: slot.slot_index,
                generation: slot.generation,
                site_tag: entry.retired_tag(),
            }),
            _ => Err(invalid(slot)),
        }
    }

    fn check_access(inner: &ArenaInner, slot: SlotRef) -> Result<(), ArenaError> {
        let Some(entry) = inner.slots.get(slot.slot_index) else {
            return Err(invalid(slot));
        };
        match entry.state {
            SlotState::Allocated if slot.generation == entry.generation => {
                match &entry.record {
                    Some(record) if record.is_handle_owned() => Err(ArenaError::HandleOwned {
                        slot_index: slot.slot_index,
                    }),
                    _ => Ok(()),
                }
            }
            _ if entry.just_retired(slot.generation) => Err(ArenaError::UseAfterFree {
                slot_index: slot.slot_index,
                generation: slot.generation,
                site_tag: entry.retired_tag(),
            }),
            _ => Err(invalid(slot)),
        }
    }

    // -----------------------------------------------------------------------
    // Leak reporting
    // -----------------------------------------------------------------------

    /// Site tags of every allocation still live, by slot index. Read-only.
    #[must_use]
    pub fn report_leaks(&self) -> Vec<String> {
        self.inner
            .lock()
            .ledger
            .snapshot()
            .into_iter()
            .map(|(_, site_tag)| site_tag)
            .collect()
    }

    /// [`report_leaks`](Self::report_leaks) in the diagnostic dump format.
    #[must_use]
    pub fn leak_report(&self) -> DiagnosticReport {
        let records = self
            .inner
            .lock()
            .ledger
            .snapshot()
            .into_iter()
            .map(|(slot_index, site_tag)| DiagnosticRecord::leak(slot_index, site_tag))
            .collect();
        DiagnosticReport::new(self.id, records)
    }

    /// Destroy the arena, returning whatever it still considered live.
    #[must_use]
    pub fn teardown(self) -> DiagnosticReport {
        self.leak_report()
    }

    /// Tear down a shared arena. Hands the arena back while handles still hold it.
    pub fn teardown_shared(arena: Arc<Self>) -> Result<DiagnosticReport, Arc<Self>> {
        Arc::try_unwrap(arena).map(Self::teardown)
    }

    // -----------------------------------------------------------------------
    // Checked raw access
    // -----------------------------------------------------------------------

    /// Copy out a raw allocation's element bytes.
    pub fn read_bytes(&self, slot: SlotRef) -> Result<Vec<u8>, ArenaError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Err(err) = Self::check_access(inner, slot) {
            return Err(self.reject(inner, err));
        }
        let mut out = vec![0u8; self.slot_size];
        // SAFETY: the slot is allocated and raw-owned; slot_size bytes lie inside it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.slot_base(slot.slot_index).as_ptr(),
                out.as_mut_ptr(),
                self.slot_size,
            );
        }
        Ok(out)
    }

    /// Write `bytes` into a raw allocation at `offset`, refusing to run past the element.
    pub fn write_bytes(&self, slot: SlotRef, offset: usize, bytes: &[u8]) -> Result<(), ArenaError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Err(err) = Self::check_access(inner, slot) {
            return Err(self.reject(inner, err));
        }
        let end = offset.checked_add(bytes.len());
        if end.is_none_or(|end| end > self.slot_size) {
            let err = ArenaError::OutOfBounds {
                slot_index: slot.slot_index,
                offset,
                len: bytes.len(),
                slot_size: self.slot_size,
            };
            return Err(self.reject(inner, err));
        }
        // SAFETY: the slot is allocated and raw-owned; offset + len <= slot_size.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.slot_base(slot.slot_index).as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Validated base address of a raw allocation.
    ///
    /// The address stays inside the arena's region for the arena's lifetime,
    /// but its contents belong to the caller only until the allocation is
    /// released. Writes made through it after release are reported by
    /// [`scan_integrity`](Self::scan_integrity).
    pub fn slot_ptr(&self, slot: SlotRef) -> Result<NonNull<u8>, ArenaError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Err(err) = Self::check_access(inner, slot) {
            return Err(self.reject(inner, err));
        }
        Ok(self.slot_base(slot.slot_index))
    }

    /// Verify poison on every released slot and canaries on every live one.
    ///
    /// Disturbed poison means something wrote into storage after it was
    /// released (`UseAfterFree`); a damaged canary means a write ran past an
    /// element (`BufferOverflow`). New findings are journaled and returned.
    /// Damage already reported for the same allocation is not reported again.
    pub fn scan_integrity(&self) -> Vec<DiagnosticRecord> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ArenaMetrics::inc(&self.metrics.integrity_scans);

        let mut findings = Vec::new();
        for (slot_index, slot) in inner.slots.iter_mut().enumerate() {
            let (kind, site_tag) = match slot.state {
                SlotState::Free | SlotState::Quarantined => {
                    if self.poison_intact(slot_index) {
                        continue;
                    }
                    (DiagnosticKind::UseAfterFree, slot.retired_tag())
                }
                SlotState::Allocated => {
                    if self.canary_intact(slot_index, slot.generation) {
                        continue;
                    }
                    let site_tag = slot
                        .record
                        .as_ref()
                        .map(|r| r.site_tag.clone())
                        .unwrap_or_default();
                    (DiagnosticKind::BufferOverflow, site_tag)
                }
            };
            if slot.flag(kind) {
                findings.push(DiagnosticRecord::new(Some(slot_index), site_tag, kind));
            }
        }
        for finding in &findings {
            self.note(inner, finding.clone());
        }
        findings
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Element bytes per slot.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Bytes between consecutive slot bases.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub fn metrics(&self) -> &ArenaMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Live allocations.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().ledger.len()
    }

    /// Slots on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Slots waiting in quarantine.
    #[must_use]
    pub fn quarantined_count(&self) -> usize {
        self.inner.lock().quarantine.len()
    }

    /// Slots the next allocation could use: free plus matured quarantine entries.
    #[must_use]
    pub fn available_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.free_list.len() + inner.quarantine.matured_count(inner.clock)
    }

    /// Allocation requests seen so far, refused ones included.
    #[must_use]
    pub fn clock(&self) -> u64 {
        self.inner.lock().clock
    }

    #[must_use]
    pub fn slot_info(&self, slot_index: usize) -> Option<SlotInfo> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(slot_index)?;
        let (strong_count, weak_count) = slot
            .record
            .as_ref()
            .map_or((0, 0), |r| (r.strong_count, r.weak_count));
        Some(SlotInfo {
            slot_index,
            state: slot.state,
            generation: slot.generation,
            strong_count,
            weak_count,
        })
    }

    /// Lifecycle state of the allocation `slot` names; `None` if it never existed.
    #[must_use]
    pub fn record_state(&self, slot: SlotRef) -> Option<RecordState> {
        let inner = self.inner.lock();
        let entry = inner.slots.get(slot.slot_index)?;
        if slot.generation > entry.generation {
            return None;
        }
        if slot.generation == entry.generation {
            return entry.record.as_ref().map(|r| RecordState::Live {
                strong_count: r.strong_count,
                weak_count: r.weak_count,
            });
        }
        Some(
            match inner.zombies.get(&(slot.slot_index, slot.generation)) {
                Some(&weak_count) => RecordState::Zombie { weak_count },
                None => RecordState::Reclaimed,
            },
        )
    }

    /// Journaled findings, oldest first.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<DiagnosticRecord> {
        self.inner.lock().journal.snapshot()
    }

    /// Take and clear the journal.
    pub fn drain_diagnostics(&self) -> Vec<DiagnosticRecord> {
        self.inner.lock().journal.drain()
    }

    /// Findings dropped because the journal was full.
    #[must_use]
    pub fn evicted_diagnostics(&self) -> u64 {
        self.inner.lock().journal.evicted()
    }

    // -----------------------------------------------------------------------
    // Handle support
    // -----------------------------------------------------------------------

    fn check_payload_layout(&self, payload: Layout) -> Result<(), ArenaError> {
        let slot_align = self.config.element_layout.align();
        if payload.size() > self.slot_size || payload.align() > slot_align {
            return Err(ArenaError::LayoutMismatch {
                size: payload.size(),
                align: payload.align(),
                slot_size: self.slot_size,
                slot_align,
            });
        }
        Ok(())
    }

    /// Allocate a slot whose payload a strong handle will own.
    pub(crate) fn allocate_managed(
        &self,
        site_tag: String,
        payload: Layout,
    ) -> Result<(SlotRef, NonNull<u8>), ArenaError> {
        self.check_payload_layout(payload)?;
        let mut guard = self.inner.lock();
        let slot = self.allocate_locked(&mut guard, site_tag, Owner::Handle)?;
        Ok((slot, self.slot_base(slot.slot_index)))
    }

    /// Turn a live raw allocation into a handle-managed one.
    pub(crate) fn adopt(&self, slot: SlotRef, payload: Layout) -> Result<NonNull<u8>, ArenaError> {
        self.check_payload_layout(payload)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Err(err) = Self::check_access(inner, slot) {
            return Err(self.reject(inner, err));
        }
        if let Some(record) = inner.live_record_mut(slot) {
            record.owner = Owner::Handle;
        }
        Ok(self.slot_base(slot.slot_index))
    }

    pub(crate) fn retain_strong(&self, slot: SlotRef) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.live_record_mut(slot) {
            record.strong_count += 1;
        }
    }

    /// Drop one strong reference. At zero, move the payload out and retire
    /// the slot in the same critical section; the caller drops the returned
    /// value after the lock is released so its destructor may touch the arena.
    ///
    /// # Safety
    ///
    /// `slot` must be a handle-managed allocation holding an initialized `T`,
    /// and the caller must give up one strong reference it owns.
    pub(crate) unsafe fn release_strong<T>(&self, slot: SlotRef) -> Option<T> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let record = inner.live_record_mut(slot)?;
        debug_assert!(record.strong_count > 0, "strong count underflow");
        record.strong_count -= 1;
        if record.strong_count > 0 {
            return None;
        }
        // SAFETY: the count reached zero, so no handle can reach the payload any
        // more, and the caller guarantees the slot holds an initialized `T`.
        let value = unsafe { std::ptr::read(self.slot_base(slot.slot_index).cast::<T>().as_ptr()) };
        self.retire_locked(inner, slot.slot_index);
        Some(value)
    }

    pub(crate) fn retain_weak(&self, slot: SlotRef) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(record) = inner.live_record_mut(slot) {
            record.weak_count += 1;
        } else if let Some(count) = inner.zombies.get_mut(&(slot.slot_index, slot.generation)) {
            *count += 1;
        }
    }

    pub(crate) fn release_weak(&self, slot: SlotRef) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(record) = inner.live_record_mut(slot) {
            record.weak_count = record.weak_count.saturating_sub(1);
            return;
        }
        let key = (slot.slot_index, slot.generation);
        if let Some(count) = inner.zombies.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                inner.zombies.remove(&key);
            }
        }
    }

    /// Add a strong reference if the allocation is still live.
    pub(crate) fn try_upgrade(&self, slot: SlotRef) -> bool {
        let mut inner = self.inner.lock();
        match inner.live_record_mut(slot) {
            Some(record) if record.strong_count > 0 => {
                record.strong_count += 1;
                ArenaMetrics::inc(&self.metrics.upgrades);
                true
            }
            _ => {
                ArenaMetrics::inc(&self.metrics.failed_upgrades);
                false
            }
        }
    }

    /// `(strong_count, weak_count)` of the allocation `slot` names.
    pub(crate) fn handle_counts(&self, slot: SlotRef) -> (usize, usize) {
        let inner = self.inner.lock();
        if let Some(record) = inner.live_record(slot) {
            return (record.strong_count, record.weak_count);
        }
        let weak = inner
            .zombies
            .get(&(slot.slot_index, slot.generation))
            .copied()
            .unwrap_or(0);
        (0, weak)
    }

    // -----------------------------------------------------------------------
    // Region helpers
    // -----------------------------------------------------------------------

    pub(crate) fn slot_base(&self, slot_index: usize) -> NonNull<u8> {
        debug_assert!(slot_index < self.config.capacity);
        // SAFETY: slot_index < capacity, so the offset stays inside the region.
        unsafe { self.region.add(slot_index * self.stride) }
    }

    fn write_canary(&self, slot_index: usize, generation: u64) {
        let canary = SlotFingerprint::compute(self.id, slot_index, generation)
            .canary()
            .to_bytes();
        // SAFETY: [slot_size, slot_size + CANARY_SIZE) lies within the slot's stride.
        unsafe {
            std::ptr::copy_nonoverlapping(
                canary.as_ptr(),
                self.slot_base(slot_index).as_ptr().add(self.slot_size),
                CANARY_SIZE,
            );
        }
    }

    fn canary_intact(&self, slot_index: usize, generation: u64) -> bool {
        let mut actual = [0u8; CANARY_SIZE];
        // SAFETY: the canary bytes lie within the slot's stride.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.slot_base(slot_index).as_ptr().add(self.slot_size),
                actual.as_mut_ptr(),
                CANARY_SIZE,
            );
        }
        SlotFingerprint::compute(self.id, slot_index, generation)
            .canary()
            .verify(&actual)
    }

    fn poison(&self, slot_index: usize) {
        // SAFETY: the whole stride belongs to this slot and no payload lives there any more.
        unsafe {
            std::ptr::write_bytes(
                self.slot_base(slot_index).as_ptr(),
                self.config.poison_byte,
                self.stride,
            );
        }
    }

    fn poison_intact(&self, slot_index: usize) -> bool {
        // SAFETY: the stride lies within the region; released slots hold no payload.
        let bytes =
            unsafe { std::slice::from_raw_parts(self.slot_base(slot_index).as_ptr(), self.stride) };
        bytes.iter().all(|&b| b == self.config.poison_byte)
    }

    // -----------------------------------------------------------------------
    // Journaling
    // -----------------------------------------------------------------------

    fn counter_for(&self, kind: DiagnosticKind) -> Option<&AtomicU64> {
        match kind {
            DiagnosticKind::Leak => None,
            DiagnosticKind::DoubleFree => Some(&self.metrics.double_frees),
            DiagnosticKind::UseAfterFree => Some(&self.metrics.use_after_frees),
            DiagnosticKind::InvalidHandle => Some(&self.metrics.invalid_handles),
            DiagnosticKind::PoolExhausted => Some(&self.metrics.exhaustions),
            DiagnosticKind::BufferOverflow => Some(&self.metrics.buffer_overflows),
        }
    }

    fn note(&self, inner: &mut ArenaInner, finding: DiagnosticRecord) {
        if let Some(counter) = self.counter_for(finding.kind) {
            ArenaMetrics::inc(counter);
        }
        inner.journal.push(finding);
    }

    /// Count and journal `err`, then hand it back for returning.
    fn reject(&self, inner: &mut ArenaInner, err: ArenaError) -> ArenaError {
        if let Some(finding) = DiagnosticRecord::from_error(&err) {
            self.note(inner, finding);
        }
        err
    }
}

impl Drop for BlockArena {
    fn drop(&mut self) {
        // SAFETY: region was allocated in `new` with region_layout and is released only here.
        unsafe { std::alloc::dealloc(self.region.as_ptr(), self.region_layout) };
    }
}

impl std::fmt::Debug for BlockArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockArena")
            .field("id", &self.id)
            .field("capacity", &self.config.capacity)
            .field("slot_size", &self.slot_size)
            .field("stride", &self.stride)
            .field("quarantine_delay", &self.config.quarantine_delay)
            .finish_non_exhaustive()
    }
}

fn invalid(slot: SlotRef) -> ArenaError {
    ArenaError::InvalidHandle {
        slot_index: slot.slot_index,
        generation: slot.generation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(capacity: usize, delay: u64) -> BlockArena {
        BlockArena::new(ArenaConfig::for_type::<[u8; 32]>(capacity).with_quarantine_delay(delay))
            .expect("arena")
    }

    #[test]
    fn allocate_and_free_cycle() {
        let arena = arena(4, 2);
        let slot = arena.allocate("cycle").expect("allocation should succeed");
        assert_eq!(arena.live_count(), 1);

        arena.write_bytes(slot, 0, &[0xAB; 32]).expect("write");
        assert_eq!(arena.read_bytes(slot).expect("read"), vec![0xAB; 32]);

        arena.deallocate(slot).expect("free");
        assert_eq!(arena.live_count(), 0);
        assert_eq!(arena.quarantined_count(), 1);
        let info = arena.slot_info(slot.slot_index()).expect("slot");
        assert_eq!(info.state, SlotState::Quarantined);
        assert_eq!(info.generation, slot.generation() + 1);
    }

    #[test]
    fn stride_covers_element_and_canary() {
        let arena = BlockArena::with_layout(2, Layout::from_size_align(10, 8).unwrap()).unwrap();
        assert_eq!(arena.slot_size(), 10);
        assert_eq!(arena.stride(), 24);
    }

    #[test]
    fn capacity_is_fixed() {
        let arena = arena(3, 0);
        for i in 0..3 {
            arena.allocate(format!("slot-{i}")).expect("within capacity");
        }
        let err = arena.allocate("overflow").unwrap_err();
        assert_eq!(
            err,
            ArenaError::PoolExhausted {
                capacity: 3,
                site_tag: "overflow".into()
            }
        );
        assert_eq!(arena.metrics_snapshot().exhaustions, 1);
    }

    #[test]
    fn double_free_detected() {
        let arena = arena(2, 2);
        let slot = arena.allocate("df").unwrap();
        assert_eq!(arena.deallocate(slot), Ok(()));
        let err = arena.deallocate(slot).unwrap_err();
        assert!(matches!(err, ArenaError::DoubleFree { slot_index: 0, generation: 0, ref site_tag } if site_tag == "df"));
        assert_eq!(arena.metrics_snapshot().double_frees, 1);
    }

    #[test]
    fn double_free_of_free_slot_detected() {
        let arena = arena(1, 0);
        let slot = arena.allocate("x").unwrap();
        arena.deallocate(slot).unwrap();
        assert_eq!(arena.slot_info(0).unwrap().state, SlotState::Free);
        assert!(matches!(
            arena.deallocate(slot),
            Err(ArenaError::DoubleFree { .. })
        ));
        assert_eq!(arena.free_count(), 1);
    }

    #[test]
    fn out_of_range_and_forged_references_are_invalid() {
        let arena = arena(2, 2);
        assert!(matches!(
            arena.deallocate_parts(99, 0),
            Err(ArenaError::InvalidHandle { slot_index: 99, .. })
        ));
        // Slot 1 was never allocated at generation 0.
        assert!(matches!(
            arena.deallocate(SlotRef::new(1, 0)),
            Err(ArenaError::InvalidHandle { .. })
        ));
        let slot = arena.allocate("live").unwrap();
        assert!(matches!(
            arena.deallocate(SlotRef::new(slot.slot_index(), slot.generation() + 5)),
            Err(ArenaError::InvalidHandle { .. })
        ));
        assert_eq!(arena.metrics_snapshot().invalid_handles, 3);
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn stale_reference_to_reused_slot_is_invalid() {
        let arena = arena(1, 0);
        let old = arena.allocate("old").unwrap();
        arena.deallocate(old).unwrap();
        let new = arena.allocate("new").unwrap();
        assert_eq!(new.slot_index(), old.slot_index());
        assert_ne!(new.generation(), old.generation());

        assert!(matches!(
            arena.read_bytes(old),
            Err(ArenaError::InvalidHandle { .. })
        ));
        assert!(matches!(
            arena.deallocate(old),
            Err(ArenaError::InvalidHandle { .. })
        ));
        assert_eq!(arena.report_leaks(), vec!["new".to_string()]);
    }

    #[test]
    fn release_from_an_older_allocation_is_invalid_not_double_free() {
        let arena = arena(1, 0);
        let first = arena.allocate("first").unwrap();
        arena.deallocate(first).unwrap();
        let second = arena.allocate("second").unwrap();
        arena.deallocate(second).unwrap();

        // `first` names an allocation the slot has moved past; blaming it on
        // "second" would point at the wrong site.
        assert_eq!(
            arena.deallocate(first),
            Err(ArenaError::InvalidHandle {
                slot_index: 0,
                generation: 0
            })
        );
        assert!(matches!(
            arena.read_bytes(first),
            Err(ArenaError::InvalidHandle { .. })
        ));
        assert_eq!(
            arena.deallocate(second),
            Err(ArenaError::DoubleFree {
                slot_index: 0,
                generation: 1,
                site_tag: "second".into()
            })
        );
        let kinds: Vec<_> = arena.diagnostics().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                DiagnosticKind::InvalidHandle,
                DiagnosticKind::InvalidHandle,
                DiagnosticKind::DoubleFree
            ]
        );
    }

    #[test]
    fn generation_bumps_once_per_release() {
        let arena = arena(1, 0);
        for k in 1..=5u64 {
            let slot = arena.allocate("gen").unwrap();
            arena.deallocate(slot).unwrap();
            assert_eq!(arena.slot_info(0).unwrap().generation, k);
        }
    }

    #[test]
    fn released_storage_is_poisoned() {
        let arena = BlockArena::new(
            ArenaConfig::for_type::<[u8; 16]>(1)
                .with_quarantine_delay(4)
                .with_poison_byte(0x5A),
        )
        .unwrap();
        let slot = arena.allocate("p").unwrap();
        arena.write_bytes(slot, 0, &[1; 16]).unwrap();
        let ptr = arena.slot_ptr(slot).unwrap();
        arena.deallocate(slot).unwrap();

        // SAFETY: the region outlives this read; nothing else touches the slot.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), arena.stride()) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        assert!(arena.scan_integrity().is_empty());
    }

    #[test]
    fn access_through_released_reference_is_use_after_free() {
        let arena = arena(2, 3);
        let slot = arena.allocate("session").unwrap();
        arena.deallocate(slot).unwrap();

        let err = arena.read_bytes(slot).unwrap_err();
        assert_eq!(
            err,
            ArenaError::UseAfterFree {
                slot_index: slot.slot_index(),
                generation: slot.generation(),
                site_tag: "session".into()
            }
        );
        assert!(matches!(
            arena.write_bytes(slot, 0, &[0]),
            Err(ArenaError::UseAfterFree { .. })
        ));
        assert_eq!(arena.metrics_snapshot().use_after_frees, 2);
    }

    #[test]
    fn write_after_free_through_retained_pointer_is_found_by_scan() {
        let arena = arena(2, 3);
        let slot = arena.allocate("dangling").unwrap();
        let ptr = arena.slot_ptr(slot).unwrap();
        arena.deallocate(slot).unwrap();

        // SAFETY: the address is inside the arena's live region.
        unsafe { ptr.as_ptr().add(3).write(0x41) };

        let findings = arena.scan_integrity();
        assert_eq!(
            findings,
            vec![DiagnosticRecord::new(
                Some(slot.slot_index()),
                "dangling",
                DiagnosticKind::UseAfterFree
            )]
        );
        assert_eq!(arena.diagnostics(), findings);
    }

    #[test]
    fn overflow_into_canary_detected_on_release() {
        let arena = arena(2, 2);
        let slot = arena.allocate("overrun").unwrap();
        let ptr = arena.slot_ptr(slot).unwrap();
        // SAFETY: the canary byte lies inside the slot's stride.
        unsafe {
            let canary = ptr.as_ptr().add(arena.slot_size());
            canary.write(!canary.read());
        }

        assert_eq!(
            arena.scan_integrity(),
            vec![DiagnosticRecord::new(
                Some(slot.slot_index()),
                "overrun",
                DiagnosticKind::BufferOverflow
            )]
        );
        // The release still succeeds and does not report the same overrun twice.
        assert_eq!(arena.deallocate(slot), Ok(()));
        let journal = arena.diagnostics();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].kind, DiagnosticKind::BufferOverflow);
        assert_eq!(arena.metrics_snapshot().buffer_overflows, 1);
    }

    #[test]
    fn overflow_found_only_on_release_is_journaled() {
        let arena = arena(1, 2);
        let slot = arena.allocate("late").unwrap();
        let ptr = arena.slot_ptr(slot).unwrap();
        // SAFETY: the canary byte lies inside the slot's stride.
        unsafe {
            let canary = ptr.as_ptr().add(arena.slot_size());
            canary.write(!canary.read());
        }
        assert_eq!(arena.deallocate(slot), Ok(()));
        assert_eq!(
            arena.diagnostics(),
            vec![DiagnosticRecord::new(Some(0), "late", DiagnosticKind::BufferOverflow)]
        );
    }

    #[test]
    fn repeated_scans_report_lasting_damage_once() {
        let arena = arena(2, 3);
        let slot = arena.allocate("dangling").unwrap();
        let ptr = arena.slot_ptr(slot).unwrap();
        arena.deallocate(slot).unwrap();
        // SAFETY: the address is inside the arena's live region.
        unsafe { ptr.as_ptr().write(0x41) };

        assert_eq!(arena.scan_integrity().len(), 1);
        assert!(arena.scan_integrity().is_empty());
        assert!(arena.scan_integrity().is_empty());
        assert_eq!(arena.diagnostics().len(), 1);
        let snapshot = arena.metrics_snapshot();
        assert_eq!(snapshot.use_after_frees, 1);
        assert_eq!(snapshot.integrity_scans, 3);
    }

    #[test]
    fn damage_to_a_later_allocation_is_reported_again() {
        let arena = arena(1, 0);
        let first = arena.allocate("first").unwrap();
        let ptr = arena.slot_ptr(first).unwrap();
        arena.deallocate(first).unwrap();
        // SAFETY: the address is inside the arena's live region.
        unsafe { ptr.as_ptr().write(0x41) };
        assert_eq!(arena.scan_integrity().len(), 1);

        let second = arena.allocate("second").unwrap();
        arena.deallocate(second).unwrap();
        // SAFETY: as above.
        unsafe { ptr.as_ptr().write(0x42) };
        assert_eq!(
            arena.scan_integrity(),
            vec![DiagnosticRecord::new(Some(0), "second", DiagnosticKind::UseAfterFree)]
        );
        assert_eq!(arena.metrics_snapshot().use_after_frees, 2);
    }

    #[test]
    fn out_of_bounds_write_refused() {
        let arena = arena(1, 0);
        let slot = arena.allocate("oob").unwrap();
        let err = arena.write_bytes(slot, 30, &[0; 4]).unwrap_err();
        assert_eq!(
            err,
            ArenaError::OutOfBounds {
                slot_index: 0,
                offset: 30,
                len: 4,
                slot_size: 32
            }
        );
        assert!(arena.write_bytes(slot, usize::MAX, &[0]).is_err());
        assert!(arena.write_bytes(slot, 28, &[7; 4]).is_ok());
        assert!(arena.scan_integrity().is_empty());
    }

    #[test]
    fn zero_delay_reuses_immediately() {
        let arena = arena(4, 0);
        let slot = arena.allocate("a").unwrap();
        arena.deallocate(slot).unwrap();
        assert_eq!(arena.quarantined_count(), 0);
        let again = arena.allocate("b").unwrap();
        assert_eq!(again.slot_index(), slot.slot_index());
        assert_eq!(again.generation(), slot.generation() + 1);
    }

    #[test]
    fn quarantine_delays_reuse() {
        let arena = arena(3, 2);
        let x = arena.allocate("x").unwrap();
        arena.deallocate(x).unwrap();

        let first = arena.allocate("first").unwrap();
        let second = arena.allocate("second").unwrap();
        assert_ne!(first.slot_index(), x.slot_index());
        assert_ne!(second.slot_index(), x.slot_index());

        let third = arena.allocate("third").unwrap();
        assert_eq!(third.slot_index(), x.slot_index());
        assert_eq!(arena.metrics_snapshot().quarantine_releases, 1);
    }

    #[test]
    fn refused_requests_age_the_quarantine() {
        let arena = arena(1, 2);
        let slot = arena.allocate("only").unwrap();
        arena.deallocate(slot).unwrap();
        assert_eq!(arena.available_count(), 0);

        assert!(arena.allocate("retry").is_err());
        assert!(arena.allocate("retry").is_err());
        assert_eq!(arena.available_count(), 1);
        let recovered = arena.allocate("retry").expect("quarantine matured");
        assert_eq!(recovered.slot_index(), 0);
        assert_eq!(arena.clock(), 4);
    }

    #[test]
    fn leaks_reported_by_site() {
        let arena = arena(4, 2);
        let _a = arena.allocate("a").unwrap();
        let b = arena.allocate("b").unwrap();
        let _c = arena.allocate("c").unwrap();
        arena.deallocate(b).unwrap();

        assert_eq!(arena.report_leaks(), vec!["a".to_string(), "c".to_string()]);
        // Reporting does not mutate.
        assert_eq!(arena.report_leaks().len(), 2);
        let report = arena.teardown();
        assert_eq!(report.site_tags(DiagnosticKind::Leak), vec!["a", "c"]);
    }

    #[test]
    fn errors_are_journaled_in_order() {
        let arena = arena(1, 0);
        let slot = arena.allocate("j").unwrap();
        let _ = arena.allocate("full");
        arena.deallocate(slot).unwrap();
        let _ = arena.deallocate(slot);

        let kinds: Vec<_> = arena.diagnostics().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![DiagnosticKind::PoolExhausted, DiagnosticKind::DoubleFree]);
        assert_eq!(arena.drain_diagnostics().len(), 2);
        assert!(arena.diagnostics().is_empty());
    }

    #[test]
    fn record_state_tracks_raw_allocations() {
        let arena = arena(1, 0);
        let slot = arena.allocate("r").unwrap();
        assert_eq!(
            arena.record_state(slot),
            Some(RecordState::Live {
                strong_count: 1,
                weak_count: 0
            })
        );
        arena.deallocate(slot).unwrap();
        assert_eq!(arena.record_state(slot), Some(RecordState::Reclaimed));
        assert_eq!(arena.record_state(SlotRef::new(0, 9)), None);
        assert_eq!(arena.record_state(SlotRef::new(4, 0)), None);
    }

    #[test]
    fn teardown_shared_waits_for_last_owner() {
        let arena = BlockArena::shared(ArenaConfig::for_type::<u64>(2)).unwrap();
        let extra = Arc::clone(&arena);
        let arena = BlockArena::teardown_shared(arena).expect_err("still shared");
        drop(extra);
        let report = BlockArena::teardown_shared(arena).expect("sole owner");
        assert!(report.is_clean());
    }

    #[test]
    fn invalid_config_rejected() {
        assert!(matches!(
            BlockArena::with_layout(0, Layout::new::<u8>()),
            Err(ArenaError::InvalidConfig(_))
        ));
    }
}
