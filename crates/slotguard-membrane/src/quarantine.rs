//! Quarantine queue for released slots.
//!
//! A released slot waits here before it can be handed out again, so a stale
//! reference keeps pointing at poisoned, unowned storage for a while instead
//! of at someone else's live data. Age is measured on the arena's allocation
//! clock (allocation requests seen), never wall-clock time, which keeps
//! behavior deterministic and reproducible in tests.
//!
//! Entries leave in FIFO order. A delay of 0 disables the quarantine.

use std::collections::VecDeque;

/// A slot waiting out its delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantineEntry {
    pub slot_index: usize,
    /// Allocation clock value when the slot was admitted.
    pub admitted_at: u64,
}

impl QuarantineEntry {
    /// Whether at least `delay` allocation requests have elapsed since admission.
    #[must_use]
    pub const fn is_mature(&self, now: u64, delay: u64) -> bool {
        now.saturating_sub(self.admitted_at) >= delay
    }
}

#[derive(Debug)]
pub struct Quarantine {
    queue: VecDeque<QuarantineEntry>,
    delay: u64,
}

impl Quarantine {
    #[must_use]
    pub fn new(delay: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            delay,
        }
    }

    #[must_use]
    pub const fn delay(&self) -> u64 {
        self.delay
    }

    /// True when released slots go straight back to the free list.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.delay == 0
    }

    /// Record `slot_index` as released at clock value `now`.
    pub fn admit(&mut self, slot_index: usize, now: u64) {
        debug_assert!(
            !self.contains(slot_index),
            "slot {slot_index} admitted to quarantine twice"
        );
        self.queue.push_back(QuarantineEntry {
            slot_index,
            admitted_at: now,
        });
    }

    /// Remove and return, oldest first, every slot whose delay has elapsed.
    ///
    /// Admission order is monotonic in time, so the scan stops at the first
    /// entry that is still too young.
    pub fn matured(&mut self, now: u64) -> Vec<usize> {
        let mut released = Vec::new();
        while let Some(entry) = self.queue.front() {
            if !entry.is_mature(now, self.delay) {
                break;
            }
            released.push(entry.slot_index);
            self.queue.pop_front();
        }
        released
    }

    /// Number of entries `matured(now)` would release, without releasing them.
    #[must_use]
    pub fn matured_count(&self, now: u64) -> usize {
        self.queue
            .iter()
            .take_while(|entry| entry.is_mature(now, self.delay))
            .count()
    }

    #[must_use]
    pub fn contains(&self, slot_index: usize) -> bool {
        self.queue.iter().any(|entry| entry.slot_index == slot_index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuarantineEntry> {
        self.queue.iter()
    }
}
