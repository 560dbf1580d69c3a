//! Strong and weak handles over arena slots.
//!
//! A [`Strong<T>`] owns a `T` stored in one slot of a shared [`BlockArena`].
//! Clones share the payload; when the last strong handle goes away the
//! payload is dropped and the slot is released through the arena's normal
//! path (canary check, poison, generation bump, quarantine).
//!
//! A [`Weak<T>`] observes without owning. It upgrades only while the
//! allocation it was created from is live; once the slot is released or
//! reused, the generation no longer matches and `upgrade` returns `None`.
//!
//! Counts live in the arena's allocation record, under the arena lock, so
//! handles may be cloned and dropped from any thread.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::arena::{BlockArena, SlotRef};
use crate::error::ArenaError;

/// Owning handle to a `T` stored in an arena slot.
pub struct Strong<T> {
    arena: Arc<BlockArena>,
    slot: SlotRef,
    ptr: NonNull<T>,
    _owns: PhantomData<T>,
}

// SAFETY: the payload is shared between clones the way `Arc<T>` shares it;
// count updates are serialized by the arena lock.
unsafe impl<T: Send + Sync> Send for Strong<T> {}
// SAFETY: see `Send`.
unsafe impl<T: Send + Sync> Sync for Strong<T> {}

impl<T> Strong<T> {
    /// Move `value` into a fresh slot of `arena`.
    ///
    /// Fails with `LayoutMismatch` when `T` does not fit the arena's element
    /// layout and with `PoolExhausted` when no slot is available; `value` is
    /// dropped in both cases.
    pub fn new(
        arena: &Arc<BlockArena>,
        site_tag: impl Into<String>,
        value: T,
    ) -> Result<Self, ArenaError> {
        let (slot, base) = arena.allocate_managed(site_tag.into(), Layout::new::<T>())?;
        let ptr = base.cast::<T>();
        // SAFETY: the slot was just allocated for this handle, and its base is
        // sized and aligned for `T` (checked by `allocate_managed`).
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            arena: Arc::clone(arena),
            slot,
            ptr,
            _owns: PhantomData,
        })
    }

    /// Move `value` into an existing raw allocation and take ownership of it.
    ///
    /// Afterwards raw operations on `slot` fail with `HandleOwned`.
    pub fn adopt(arena: &Arc<BlockArena>, slot: SlotRef, value: T) -> Result<Self, ArenaError> {
        let base = arena.adopt(slot, Layout::new::<T>())?;
        let ptr = base.cast::<T>();
        // SAFETY: the raw allocation is live and now handle-owned, and its base
        // is sized and aligned for `T` (checked by `adopt`).
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            arena: Arc::clone(arena),
            slot,
            ptr,
            _owns: PhantomData,
        })
    }

    /// Create a weak handle to this allocation.
    #[must_use]
    pub fn downgrade(this: &Self) -> Weak<T> {
        this.arena.retain_weak(this.slot);
        Weak {
            arena: Arc::clone(&this.arena),
            slot: this.slot,
            ptr: this.ptr,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn strong_count(this: &Self) -> usize {
        this.arena.handle_counts(this.slot).0
    }

    #[must_use]
    pub fn weak_count(this: &Self) -> usize {
        this.arena.handle_counts(this.slot).1
    }

    /// True when both handles refer to the same allocation.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.arena, &other.arena) && this.slot == other.slot
    }

    #[must_use]
    pub fn slot(this: &Self) -> SlotRef {
        this.slot
    }

    #[must_use]
    pub fn arena(this: &Self) -> &Arc<BlockArena> {
        &this.arena
    }
}

impl<T> Deref for Strong<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the payload stays initialized while any strong handle exists.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Clone for Strong<T> {
    fn clone(&self) -> Self {
        self.arena.retain_strong(self.slot);
        Self {
            arena: Arc::clone(&self.arena),
            slot: self.slot,
            ptr: self.ptr,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for Strong<T> {
    fn drop(&mut self) {
        // SAFETY: this handle owns one strong reference to a slot holding a `T`.
        let payload = unsafe { self.arena.release_strong::<T>(self.slot) };
        // The arena lock is released here, so the payload's destructor may drop
        // handles into the same arena.
        drop(payload);
    }
}

impl<T: fmt::Debug> fmt::Debug for Strong<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Non-owning handle; see [`Strong::downgrade`].
pub struct Weak<T> {
    arena: Arc<BlockArena>,
    slot: SlotRef,
    ptr: NonNull<T>,
    _marker: PhantomData<*const T>,
}

// SAFETY: a weak handle only touches counts under the arena lock; upgrading
// yields a `Strong<T>`, which carries the same bounds.
unsafe impl<T: Send + Sync> Send for Weak<T> {}
// SAFETY: see `Send`.
unsafe impl<T: Send + Sync> Sync for Weak<T> {}

impl<T> Weak<T> {
    /// Strong handle to the allocation if it is still live.
    #[must_use]
    pub fn upgrade(&self) -> Option<Strong<T>> {
        if !self.arena.try_upgrade(self.slot) {
            return None;
        }
        Some(Strong {
            arena: Arc::clone(&self.arena),
            slot: self.slot,
            ptr: self.ptr,
            _owns: PhantomData,
        })
    }

    /// Strong references to the allocation; 0 once it is released.
    #[must_use]
    pub fn strong_count(&self) -> usize {
        self.arena.handle_counts(self.slot).0
    }

    #[must_use]
    pub fn weak_count(&self) -> usize {
        self.arena.handle_counts(self.slot).1
    }

    /// True once the payload has been dropped.
    #[must_use]
    pub fn is_dangling(&self) -> bool {
        self.strong_count() == 0
    }

    #[must_use]
    pub fn slot(&self) -> SlotRef {
        self.slot
    }
}

impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        self.arena.retain_weak(self.slot);
        Self {
            arena: Arc::clone(&self.arena),
            slot: self.slot,
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Weak<T> {
    fn drop(&mut self) {
        self.arena.release_weak(self.slot);
    }
}

impl<T> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weak").field("slot", &self.slot).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::arena::{RecordState, SlotState};
    use crate::config::ArenaConfig;
    use crate::diagnostics::DiagnosticKind;

    fn shared<T>(capacity: usize) -> Arc<BlockArena> {
        BlockArena::shared(ArenaConfig::for_type::<T>(capacity).with_quarantine_delay(2)).unwrap()
    }

    struct DropCounter {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn strong_derefs_to_payload() {
        let arena = shared::<(u32, u32)>(2);
        let pair = Strong::new(&arena, "pair", (3, 4)).unwrap();
        assert_eq!(pair.0 + pair.1, 7);
        assert_eq!(Strong::strong_count(&pair), 1);
        assert_eq!(arena.report_leaks(), vec!["pair".to_string()]);
    }

    #[test]
    fn last_strong_drop_releases_slot_once() {
        let arena = shared::<DropCounter>(2);
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Strong::new(&arena, "counted", DropCounter { drops: Arc::clone(&drops) }).unwrap();
        let b = a.clone();
        assert!(Strong::ptr_eq(&a, &b));
        assert_eq!(Strong::strong_count(&a), 2);

        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(arena.live_count(), 1);

        let slot = Strong::slot(&b);
        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(arena.live_count(), 0);
        let info = arena.slot_info(slot.slot_index()).unwrap();
        assert_eq!(info.state, SlotState::Quarantined);
        assert_eq!(info.generation, slot.generation() + 1);
        assert!(arena.scan_integrity().is_empty());
    }

    #[test]
    fn weak_outlives_payload_as_zombie() {
        let arena = shared::<String>(2);
        let strong = Strong::new(&arena, "name", "alpha".to_string()).unwrap();
        let weak = Strong::downgrade(&strong);
        let slot = weak.slot();
        assert_eq!(Strong::weak_count(&strong), 1);
        assert_eq!(weak.upgrade().as_deref().map(String::as_str), Some("alpha"));

        drop(strong);
        assert!(weak.is_dangling());
        assert!(weak.upgrade().is_none());
        assert_eq!(arena.record_state(slot), Some(RecordState::Zombie { weak_count: 1 }));

        let second = weak.clone();
        assert_eq!(second.weak_count(), 2);
        drop(weak);
        drop(second);
        assert_eq!(arena.record_state(slot), Some(RecordState::Reclaimed));
        assert_eq!(arena.metrics_snapshot().failed_upgrades, 1);
    }

    #[test]
    fn weak_does_not_upgrade_into_reused_slot() {
        let arena = BlockArena::shared(ArenaConfig::for_type::<u64>(1).with_quarantine_delay(0))
            .unwrap();
        let first = Strong::new(&arena, "first", 1u64).unwrap();
        let weak = Strong::downgrade(&first);
        drop(first);

        let second = Strong::new(&arena, "second", 2u64).unwrap();
        assert_eq!(Strong::slot(&second).slot_index(), weak.slot().slot_index());
        assert!(weak.upgrade().is_none());
        assert_eq!(*second, 2);
    }

    #[test]
    fn raw_operations_refuse_handle_owned_slots() {
        let arena = shared::<u64>(2);
        let strong = Strong::new(&arena, "owned", 9u64).unwrap();
        let slot = Strong::slot(&strong);

        assert_eq!(
            arena.deallocate(slot),
            Err(ArenaError::HandleOwned {
                slot_index: slot.slot_index()
            })
        );
        assert!(matches!(
            arena.read_bytes(slot),
            Err(ArenaError::HandleOwned { .. })
        ));
        assert_eq!(*strong, 9);
        assert_eq!(
            arena.diagnostics().first().map(|r| r.kind),
            Some(DiagnosticKind::InvalidHandle)
        );
    }

    #[test]
    fn payload_must_fit_slot_layout() {
        let arena = shared::<u8>(2);
        let err = Strong::new(&arena, "big", 0u64).unwrap_err();
        assert!(matches!(err, ArenaError::LayoutMismatch { size: 8, .. }));
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn adopt_takes_over_raw_allocation() {
        let arena = shared::<u32>(2);
        let slot = arena.allocate("raw").unwrap();
        let strong = Strong::adopt(&arena, slot, 77u32).unwrap();
        assert_eq!(*strong, 77);
        assert!(matches!(
            Strong::adopt(&arena, slot, 1u32),
            Err(ArenaError::HandleOwned { .. })
        ));
        drop(strong);
        assert_eq!(arena.live_count(), 0);
        assert!(matches!(
            arena.deallocate(slot),
            Err(ArenaError::DoubleFree { .. })
        ));
    }

    #[test]
    fn exhaustion_surfaces_from_new() {
        let arena = shared::<u16>(1);
        let _held = Strong::new(&arena, "held", 1u16).unwrap();
        assert!(matches!(
            Strong::new(&arena, "more", 2u16),
            Err(ArenaError::PoolExhausted { .. })
        ));
    }

    struct Chain {
        next: Option<Strong<Chain>>,
    }

    #[test]
    fn payload_destructor_may_release_into_same_arena() {
        let arena = shared::<Chain>(3);
        let tail = Strong::new(&arena, "tail", Chain { next: None }).unwrap();
        let mid = Strong::new(&arena, "mid", Chain { next: Some(tail) }).unwrap();
        let head = Strong::new(&arena, "head", Chain { next: Some(mid) }).unwrap();
        assert!(head.next.as_ref().is_some_and(|m| m.next.is_some()));
        assert_eq!(arena.live_count(), 3);

        drop(head);
        assert_eq!(arena.live_count(), 0);
        assert!(arena.report_leaks().is_empty());
    }

    #[test]
    fn handles_cross_threads() {
        let arena = shared::<u64>(1);
        let root = Strong::new(&arena, "shared", 5u64).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let local = root.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let copy = local.clone();
                        assert_eq!(*copy, 5);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(Strong::strong_count(&root), 1);
        assert_eq!(arena.metrics_snapshot().violations(), 0);
    }
}
