use slotguard_membrane::{ArenaConfig, ArenaError, BlockArena, DiagnosticKind, SlotRef, SlotState};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[test]
fn deterministic_arena_sequences_hold_core_invariants() {
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 2_000;
    const CAPACITY: usize = 16;
    const DELAY: u64 = 3;

    for seed in SEEDS {
        let arena = BlockArena::new(
            ArenaConfig::for_type::<[u64; 4]>(CAPACITY).with_quarantine_delay(DELAY),
        )
        .expect("arena");
        let mut rng = XorShift64::new(seed);

        // Model: live allocations by slot, released references, release clock per slot.
        let mut live: HashMap<usize, (SlotRef, String)> = HashMap::new();
        let mut retired: Vec<(SlotRef, String)> = Vec::new();
        let mut released_at: HashMap<usize, u64> = HashMap::new();
        let mut last_generation: HashMap<usize, u64> = HashMap::new();

        for step in 0..STEPS {
            let op = rng.gen_range_usize(0, 99);
            match op {
                // allocate (biased)
                0..=44 => {
                    let now = arena.clock();
                    let tag = format!("seed{seed}-step{step}");
                    match arena.allocate(tag.clone()) {
                        Ok(slot) => {
                            let idx = slot.slot_index();
                            assert!(
                                !live.contains_key(&idx),
                                "seed={seed} step={step}: slot {idx} handed out twice"
                            );
                            if let Some(&freed) = released_at.get(&idx) {
                                assert!(
                                    now - freed >= DELAY,
                                    "seed={seed} step={step}: slot {idx} reused {} requests after release",
                                    now - freed
                                );
                            }
                            if let Some(&previous) = last_generation.get(&idx) {
                                assert!(
                                    slot.generation() > previous,
                                    "seed={seed} step={step}: generation did not advance"
                                );
                            }
                            last_generation.insert(idx, slot.generation());
                            live.insert(idx, (slot, tag));
                        }
                        Err(ArenaError::PoolExhausted { capacity, site_tag }) => {
                            assert_eq!(capacity, CAPACITY);
                            assert_eq!(site_tag, tag);
                            assert_eq!(
                                arena.free_count(),
                                0,
                                "seed={seed} step={step}: exhausted with free slots"
                            );
                        }
                        Err(other) => panic!("seed={seed} step={step}: unexpected {other:?}"),
                    }
                }
                // release a live allocation
                45..=74 => {
                    if live.is_empty() {
                        continue;
                    }
                    let mut keys: Vec<usize> = live.keys().copied().collect();
                    keys.sort_unstable();
                    let idx = keys[rng.gen_range_usize(0, keys.len() - 1)];
                    let (slot, tag) = live.remove(&idx).expect("model entry");
                    assert_eq!(
                        arena.deallocate(slot),
                        Ok(()),
                        "seed={seed} step={step}: live release must succeed"
                    );
                    released_at.insert(idx, arena.clock());
                    retired.push((slot, tag));
                }
                // misuse a released reference
                75..=89 => {
                    if retired.is_empty() {
                        continue;
                    }
                    let (slot, tag) = retired[rng.gen_range_usize(0, retired.len() - 1)].clone();
                    let info = arena.slot_info(slot.slot_index()).expect("slot in range");
                    let double = arena.deallocate(slot).unwrap_err();
                    let read = arena.read_bytes(slot).unwrap_err();
                    let released_last =
                        info.state != SlotState::Allocated && info.generation == slot.generation() + 1;
                    if released_last {
                        assert_eq!(
                            double.site_tag(),
                            Some(tag.as_str()),
                            "seed={seed} step={step}: second release must blame its own site"
                        );
                        assert!(
                            matches!(double, ArenaError::DoubleFree { .. }),
                            "seed={seed} step={step}: second release must be DoubleFree (got {double:?})"
                        );
                        assert!(matches!(read, ArenaError::UseAfterFree { .. }));
                    } else {
                        assert!(
                            matches!(double, ArenaError::InvalidHandle { .. }),
                            "seed={seed} step={step}: release of an allocation the slot moved past must be InvalidHandle (got {double:?})"
                        );
                        assert!(matches!(read, ArenaError::InvalidHandle { .. }));
                    }
                }
                // forged references
                90..=94 => {
                    let bogus = SlotRef::new(CAPACITY + rng.gen_range_usize(0, 8), 0);
                    assert!(matches!(
                        arena.deallocate(bogus),
                        Err(ArenaError::InvalidHandle { .. })
                    ));
                }
                // integrity scan
                _ => {
                    assert!(
                        arena.scan_integrity().is_empty(),
                        "seed={seed} step={step}: clean run must scan clean"
                    );
                }
            }

            assert_eq!(arena.live_count(), live.len(), "seed={seed} step={step}");
            assert_eq!(
                arena.live_count() + arena.free_count() + arena.quarantined_count(),
                CAPACITY,
                "seed={seed} step={step}: every slot is in exactly one state"
            );
        }

        let mut expected: Vec<(usize, String)> =
            live.values().map(|(s, tag)| (s.slot_index(), tag.clone())).collect();
        expected.sort_unstable();
        let expected_tags: Vec<String> = expected.into_iter().map(|(_, tag)| tag).collect();
        assert_eq!(arena.report_leaks(), expected_tags, "seed={seed}");

        let snapshot = arena.metrics_snapshot();
        assert_eq!(snapshot.buffer_overflows, 0, "seed={seed}");
        let report = arena.teardown();
        assert_eq!(report.count(DiagnosticKind::Leak), live.len(), "seed={seed}");
    }
}

#[test]
fn quarantine_holds_slot_for_delay_requests() {
    let arena = BlockArena::new(ArenaConfig::for_type::<u64>(3).with_quarantine_delay(2))
        .expect("arena");
    let x = arena.allocate("x").unwrap();
    arena.deallocate(x).unwrap();

    let first = arena.allocate("first").unwrap();
    let second = arena.allocate("second").unwrap();
    assert_ne!(first.slot_index(), x.slot_index());
    assert_ne!(second.slot_index(), x.slot_index());
    assert_eq!(arena.allocate("third").unwrap().slot_index(), x.slot_index());
}

#[test]
fn leak_report_names_unreleased_sites_in_slot_order() {
    let arena = BlockArena::new(ArenaConfig::for_type::<u32>(8)).expect("arena");
    let a = arena.allocate("a").unwrap();
    let b = arena.allocate("b").unwrap();
    let c = arena.allocate("c").unwrap();
    arena.deallocate(b).unwrap();
    assert_eq!(arena.report_leaks(), vec!["a", "c"]);

    arena.deallocate(a).unwrap();
    arena.deallocate(c).unwrap();
    assert!(arena.report_leaks().is_empty());
    assert!(arena.teardown().is_clean());
}

#[test]
fn exhaustion_at_capacity_is_an_error_not_a_panic() {
    let arena = BlockArena::new(ArenaConfig::for_type::<u8>(2).with_quarantine_delay(0))
        .expect("arena");
    let a = arena.allocate("a").unwrap();
    let _b = arena.allocate("b").unwrap();
    let err = arena.allocate("c").unwrap_err();
    assert!(err.is_recoverable());

    arena.deallocate(a).unwrap();
    assert!(arena.allocate("c").is_ok());
    assert_eq!(arena.metrics_snapshot().exhaustions, 1);
}

#[test]
fn concurrent_allocate_and_release_keeps_counts_consistent() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 500;

    let arena = BlockArena::shared(ArenaConfig::for_type::<u64>(8).with_quarantine_delay(2))
        .expect("arena");
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let arena = std::sync::Arc::clone(&arena);
            std::thread::spawn(move || {
                let mut held = 0usize;
                for round in 0..ROUNDS {
                    match arena.allocate(format!("t{t}-r{round}")) {
                        Ok(slot) => {
                            arena.write_bytes(slot, 0, &(round as u64).to_le_bytes()).unwrap();
                            assert_eq!(
                                arena.read_bytes(slot).unwrap(),
                                (round as u64).to_le_bytes().to_vec()
                            );
                            arena.deallocate(slot).unwrap();
                            held += 1;
                        }
                        Err(err) => assert!(err.is_recoverable(), "{err}"),
                    }
                }
                held
            })
        })
        .collect();

    let completed: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    let snapshot = arena.metrics_snapshot();
    assert_eq!(snapshot.allocations as usize, completed);
    assert_eq!(snapshot.deallocations as usize, completed);
    assert_eq!(snapshot.violations(), 0);
    assert_eq!(arena.live_count(), 0);
    assert!(arena.scan_integrity().is_empty());
}
