//! LIFO stack of slot indices available for allocation.

/// Free slot indices; the most recently pushed index is handed out first.
#[derive(Debug, Default)]
pub struct FreeList {
    indices: Vec<usize>,
}

impl FreeList {
    /// Free list holding every index of a fresh arena. Index 0 pops first.
    #[must_use]
    pub fn full(capacity: usize) -> Self {
        Self {
            indices: (0..capacity).rev().collect(),
        }
    }

    pub fn push(&mut self, slot_index: usize) {
        debug_assert!(
            !self.indices.contains(&slot_index),
            "slot {slot_index} pushed onto the free list twice"
        );
        self.indices.push(slot_index);
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.indices.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[must_use]
    pub fn contains(&self, slot_index: usize) -> bool {
        self.indices.contains(&slot_index)
    }
}
