//! Recovery Invariant Tests
//!
//! - Sections are atomic: a crash at any step leaves all or none of the
//!   section's stores
//! - Recovery never keeps an unreachable block
//! - Recovery is idempotent: recovering a recovered image changes nothing
//! - A file-backed pool survives close and reopen

use nvbench_core::Error;
use nvbench_pmem::{
    BlockHandle, BlockState, Heap, KlassId, KlassInfo, KlassRegistry, PmemConfig, Refs, BLOB,
};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

const PAIR: KlassId = KlassId(16);

fn trace_pair(payload: &[u8]) -> Refs {
    payload
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

fn klasses() -> KlassRegistry {
    KlassRegistry::new()
        .with(PAIR, KlassInfo::node("pair", trace_pair))
        .unwrap()
}

fn config() -> PmemConfig {
    PmemConfig::for_testing()
}

/// Root -> pair(a, b), both blobs holding one word
struct Fixture {
    heap: Arc<Heap>,
    pair: BlockHandle,
}

fn value_block(heap: &Heap, value: u64) -> BlockHandle {
    let h = heap.allocate(BLOB, 8).unwrap();
    heap.write_word(h, 0, value).unwrap();
    heap.flush_block(h).unwrap();
    heap.validate(h).unwrap();
    h
}

fn fixture() -> Fixture {
    let (heap, _) = Heap::open(config(), klasses()).unwrap();
    let a = value_block(&heap, 1);
    let b = value_block(&heap, 2);
    let pair = heap.allocate(PAIR, 16).unwrap();
    heap.write_word(pair, 0, a.offset()).unwrap();
    heap.write_word(pair, 1, b.offset()).unwrap();
    heap.flush_block(pair).unwrap();
    heap.validate(pair).unwrap();
    heap.fence().unwrap();
    heap.set_root(0, Some(pair)).unwrap();
    Fixture { heap, pair }
}

fn values(heap: &Heap, pair: BlockHandle) -> (u64, u64) {
    let a = BlockHandle::from_offset(heap.read_word(pair, 0).unwrap());
    let b = BlockHandle::from_offset(heap.read_word(pair, 1).unwrap());
    (heap.read_word(a, 0).unwrap(), heap.read_word(b, 0).unwrap())
}

/// Replace both values of the pair inside one section
fn swap_both(f: &Fixture) -> nvbench_core::Result<()> {
    let heap = &f.heap;
    let mut s = heap.begin_section()?;
    let old_a = BlockHandle::from_offset(heap.read_word(f.pair, 0)?);
    let old_b = BlockHandle::from_offset(heap.read_word(f.pair, 1)?);
    let a = s.allocate(BLOB, 8)?;
    s.write_word(a, 0, 10)?;
    let b = s.allocate(BLOB, 8)?;
    s.write_word(b, 0, 20)?;
    s.write_word(f.pair, 0, a.offset())?;
    s.write_word(f.pair, 1, b.offset())?;
    s.invalidate_on_commit(old_a);
    s.invalidate_on_commit(old_b);
    s.commit()
}

fn recorded_points() -> Vec<&'static str> {
    let f = fixture();
    f.heap.faults().start_recording();
    swap_both(&f).unwrap();
    f.heap.faults().stop_recording()
}

// ============================================================================
// Section atomicity
// ============================================================================

#[test]
fn test_section_points_recorded() {
    let points = recorded_points();
    assert_eq!(
        points,
        vec![
            "section.after_begin",
            "section.before_commit",
            "section.after_commit_flush",
            "section.after_commit_point",
        ]
    );
}

#[test]
fn test_section_crash_at_every_point_is_atomic() {
    for point in recorded_points() {
        let f = fixture();
        f.heap.faults().arm(point);
        let err = swap_both(&f).unwrap_err();
        assert!(matches!(err, Error::SimulatedCrash(p) if p == point));

        let (heap, report) = Heap::from_image(config(), f.heap.crash_image(), klasses()).unwrap();
        assert_eq!(report.dangling, 0, "crash at {}", point);
        let got = values(&heap, f.pair);
        let committed = point == "section.after_commit_point";
        let expected = if committed { (10, 20) } else { (1, 2) };
        assert_eq!(got, expected, "crash at {}", point);
        // Exactly the pair and its two values are live
        assert_eq!(report.live_blocks, 3, "crash at {}", point);
    }
}

#[test]
fn test_fence_failure_aborts_section() {
    let f = fixture();
    let mut s = f.heap.begin_section().unwrap();
    let a = s.allocate(BLOB, 8).unwrap();
    s.write_word(f.pair, 0, a.offset()).unwrap();
    f.heap.faults().fail_fences(true);
    assert!(matches!(s.commit(), Err(Error::Durability(_))));
    f.heap.faults().fail_fences(false);
    assert_eq!(values(&f.heap, f.pair), (1, 2));
}

// ============================================================================
// Reachability
// ============================================================================

#[test]
fn test_recovery_is_idempotent() {
    let f = fixture();
    f.heap.faults().arm("section.after_commit_flush");
    let _ = swap_both(&f);
    let (once, first) = Heap::from_image(config(), f.heap.crash_image(), klasses()).unwrap();
    assert!(!first.is_clean());
    let (twice, second) = Heap::from_image(config(), once.crash_image(), klasses()).unwrap();
    assert!(second.is_clean());
    assert_eq!(values(&twice, f.pair), (1, 2));
}

#[test]
fn test_unreachable_never_survives() {
    let f = fixture();
    let stray: Vec<_> = (0..10).map(|i| value_block(&f.heap, i)).collect();
    f.heap.fence().unwrap();
    let (heap, report) = Heap::from_image(config(), f.heap.crash_image(), klasses()).unwrap();
    assert_eq!(report.reclaimed, stray.len());
    for h in stray {
        assert_eq!(heap.header(h).unwrap().state, BlockState::Free);
    }
}

// ============================================================================
// File persistence
// ============================================================================

#[test]
fn test_file_backed_heap_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = config().with_path(dir.path().join("heap.pool"));
    let pair;
    {
        let (heap, _) = Heap::open(config.clone(), klasses()).unwrap();
        let a = value_block(&heap, 7);
        let b = value_block(&heap, 8);
        pair = heap.allocate(PAIR, 16).unwrap();
        heap.write_word(pair, 0, a.offset()).unwrap();
        heap.write_word(pair, 1, b.offset()).unwrap();
        heap.flush_block(pair).unwrap();
        heap.validate(pair).unwrap();
        heap.fence().unwrap();
        heap.set_root(0, Some(pair)).unwrap();
        heap.close().unwrap();
    }
    let (heap, report) = Heap::open(config, klasses()).unwrap();
    assert!(report.is_clean());
    assert_eq!(values(&heap, pair), (7, 8));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Blocks validated and linked survive; everything else is reclaimed
    #[test]
    fn prop_linked_blocks_survive(linked in proptest::collection::vec(any::<bool>(), 1..24)) {
        let (heap, _) = Heap::open(config(), klasses()).unwrap();
        let mut expected = Vec::new();
        let mut prev: Option<BlockHandle> = None;
        for (i, keep) in linked.iter().enumerate() {
            let v = value_block(&heap, i as u64);
            if *keep {
                // Chain of pairs: (value, previous pair)
                let pair = heap.allocate(PAIR, 16).unwrap();
                heap.write_word(pair, 0, v.offset()).unwrap();
                heap.write_word(pair, 1, prev.map(|p| p.offset()).unwrap_or(0)).unwrap();
                heap.flush_block(pair).unwrap();
                heap.validate(pair).unwrap();
                prev = Some(pair);
                expected.push(i as u64);
            }
        }
        heap.fence().unwrap();
        heap.set_root(0, prev).unwrap();

        let (heap2, report) = Heap::from_image(config(), heap.crash_image(), klasses()).unwrap();
        prop_assert_eq!(report.live_blocks, expected.len() * 2);
        prop_assert_eq!(report.reclaimed, linked.len() - expected.len());

        let mut seen = Vec::new();
        let mut cursor = heap2.root(0).unwrap();
        while let Some(pair) = cursor {
            let v = BlockHandle::from_offset(heap2.read_word(pair, 0).unwrap());
            seen.push(heap2.read_word(v, 0).unwrap());
            let next = heap2.read_word(pair, 1).unwrap();
            cursor = (next != 0).then(|| BlockHandle::from_offset(next));
        }
        seen.reverse();
        prop_assert_eq!(seen, expected);
    }
}
