//! Crash Consistency Tests
//!
//! Every strong-path mutation is run once with recording on, then re-run
//! with a crash armed at each recorded step. The frozen media image is
//! recovered and the row under test must be entirely in its pre-state or
//! entirely in its post-state:
//!
//! - Before the link (or replacement) fence: pre-state
//! - From the link fence on: post-state
//! - Recovery never finds a reachable invalidated block
//! - A second recovery of the recovered image is clean

use nvbench_core::Error;
use nvbench_pmem::{BlockState, Heap, PmemConfig, RecoveryReport};
use nvbench_storage::layout::registry;
use nvbench_storage::protocol::{insert, remove, update};
use nvbench_storage::{DurableMap, MapConfig, Row};
use std::collections::HashMap;
use std::sync::Arc;

type Fields = HashMap<String, String>;

fn fields(pairs: &[(&str, &str)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn open() -> DurableMap {
    let (heap, _) = Heap::open(PmemConfig::for_testing(), registry().unwrap()).unwrap();
    let map = DurableMap::open(heap, 0, MapConfig::for_testing()).unwrap();
    map.put(
        b"user1",
        Row::from_strings([("name", "alice"), ("age", "30")]),
    )
    .unwrap();
    map
}

fn restart(image: Vec<u8>) -> (Arc<Heap>, RecoveryReport, DurableMap) {
    let (heap, report) =
        Heap::from_image(PmemConfig::for_testing(), image, registry().unwrap()).unwrap();
    let map = DurableMap::open(Arc::clone(&heap), 0, MapConfig::for_testing()).unwrap();
    (heap, report, map)
}

fn read(map: &DurableMap, key: &str) -> Option<Fields> {
    match map.get(key.as_bytes()) {
        Ok(row) => Some(row.to_string_map().unwrap()),
        Err(e) if e.is_not_found() => None,
        Err(e) => panic!("read of {} failed: {}", key, e),
    }
}

fn record<F>(op: F) -> Vec<&'static str>
where
    F: Fn(&DurableMap) -> nvbench_core::Result<()>,
{
    let map = open();
    map.heap().faults().start_recording();
    op(&map).unwrap();
    map.heap().faults().stop_recording()
}

/// Crash `op` at every step it passes through and check the recovered state
fn sweep<F>(
    op: F,
    key: &str,
    before: Option<Fields>,
    after: Option<Fields>,
    durable_from: &str,
) -> Vec<&'static str>
where
    F: Fn(&DurableMap) -> nvbench_core::Result<()>,
{
    let points = record(&op);
    let switch = points
        .iter()
        .position(|p| *p == durable_from)
        .unwrap_or_else(|| panic!("{} not reached, saw {:?}", durable_from, points));

    for (i, &point) in points.iter().enumerate() {
        let map = open();
        map.heap().faults().arm(point);
        let err = op(&map).unwrap_err();
        assert!(
            matches!(err, Error::SimulatedCrash(p) if p == point),
            "unexpected error at {}: {}",
            point,
            err
        );
        assert!(map.is_poisoned());

        let (heap, report, recovered) = restart(map.heap().crash_image());
        assert_eq!(report.dangling, 0, "dangling blocks after crash at {}", point);
        let expected = if i < switch { &before } else { &after };
        assert_eq!(&read(&recovered, key), expected, "crash at {}", point);
        if key != "user1" {
            assert_eq!(
                read(&recovered, "user1"),
                Some(fields(&[("name", "alice"), ("age", "30")])),
                "bystander row after crash at {}",
                point
            );
        }
        if let Ok(row) = recovered.get(key.as_bytes()) {
            for h in row.durable_handles() {
                assert_eq!(heap.header(h).unwrap().state, BlockState::Validated);
            }
        }

        let (_, again, _) = restart(heap.crash_image());
        assert!(again.is_clean(), "second recovery after crash at {}", point);
    }
    points
}

#[test]
fn test_insert_new_key_at_every_step() {
    let points = sweep(
        |m| {
            m.put(b"user2", Row::from_strings([("name", "bob"), ("age", "41")]))
                .map(|_| ())
        },
        "user2",
        None,
        Some(fields(&[("name", "bob"), ("age", "41")])),
        insert::AFTER_LINK_FENCE,
    );
    assert_eq!(
        points,
        vec![
            insert::AFTER_POPULATE,
            insert::AFTER_FLUSH,
            insert::AFTER_LINK,
            insert::AFTER_LINK_FENCE,
            insert::AFTER_VALIDATE,
        ]
    );
}

#[test]
fn test_replace_existing_row_at_every_step() {
    let points = sweep(
        |m| {
            m.put(b"user1", Row::from_strings([("name", "carol")]))
                .map(|_| ())
        },
        "user1",
        Some(fields(&[("name", "alice"), ("age", "30")])),
        Some(fields(&[("name", "carol")])),
        insert::AFTER_LINK_FENCE,
    );
    assert_eq!(points.last(), Some(&insert::AFTER_RETIRE));
}

#[test]
fn test_update_field_at_every_step() {
    let points = sweep(
        |m| m.update(b"user1", Row::from_strings([("age", "31")])),
        "user1",
        Some(fields(&[("name", "alice"), ("age", "30")])),
        Some(fields(&[("name", "alice"), ("age", "31")])),
        update::AFTER_REPLACE_FENCE,
    );
    assert_eq!(
        points,
        vec![
            update::AFTER_PREFENCE,
            update::AFTER_REPLACE,
            update::AFTER_REPLACE_FENCE,
            update::AFTER_INVALIDATE,
        ]
    );
}

#[test]
fn test_update_with_relocation_at_every_step() {
    // The fixture row fills a container of the test capacity (2 slots)
    let points = sweep(
        |m| m.update(b"user1", Row::from_strings([("city", "oslo")])),
        "user1",
        Some(fields(&[("name", "alice"), ("age", "30")])),
        Some(fields(&[("name", "alice"), ("age", "30"), ("city", "oslo")])),
        update::GROW_AFTER_LINK_FENCE,
    );
    assert!(points.contains(&update::GROW_AFTER_VALIDATE));
    assert_eq!(points.last(), Some(&update::AFTER_INVALIDATE));
}

#[test]
fn test_update_with_append_in_place_at_every_step() {
    let (heap, _) = Heap::open(PmemConfig::for_testing(), registry().unwrap()).unwrap();
    let map = DurableMap::open(heap, 0, MapConfig::for_testing().with_row_capacity(4)).unwrap();
    map.put(b"k", Row::from_strings([("a", "1")])).unwrap();
    map.heap().faults().start_recording();
    map.update(b"k", Row::from_strings([("b", "2")])).unwrap();
    let points = map.heap().faults().stop_recording();

    for &point in &points {
        let (heap, _) = Heap::open(PmemConfig::for_testing(), registry().unwrap()).unwrap();
        let config = MapConfig::for_testing().with_row_capacity(4);
        let map = DurableMap::open(heap, 0, config.clone()).unwrap();
        map.put(b"k", Row::from_strings([("a", "1")])).unwrap();
        map.heap().faults().arm(point);
        assert!(map.update(b"k", Row::from_strings([("b", "2")])).is_err());

        let (heap, report) = Heap::from_image(
            PmemConfig::for_testing(),
            map.heap().crash_image(),
            registry().unwrap(),
        )
        .unwrap();
        assert_eq!(report.dangling, 0);
        let recovered = DurableMap::open(heap, 0, config).unwrap();
        let row = recovered.get(b"k").unwrap().to_string_map().unwrap();
        let committed = point == update::AFTER_REPLACE_FENCE || point == update::AFTER_INVALIDATE;
        if committed {
            assert_eq!(row, fields(&[("a", "1"), ("b", "2")]), "crash at {}", point);
        } else {
            assert_eq!(row, fields(&[("a", "1")]), "crash at {}", point);
        }
    }
}

#[test]
fn test_remove_at_every_step() {
    let points = sweep(
        |m| m.remove(b"user1").map(|_| ()),
        "user1",
        Some(fields(&[("name", "alice"), ("age", "30")])),
        None,
        remove::AFTER_UNLINK_FENCE,
    );
    assert_eq!(
        points,
        vec![
            remove::AFTER_UNLINK,
            remove::AFTER_UNLINK_FENCE,
            remove::AFTER_INVALIDATE,
        ]
    );
}

#[test]
fn test_recovered_map_accepts_new_mutations() {
    let map = open();
    map.heap().faults().arm(update::AFTER_REPLACE);
    assert!(map
        .update(b"user1", Row::from_strings([("age", "31")]))
        .is_err());
    let (_, _, recovered) = restart(map.heap().crash_image());
    assert!(!recovered.is_poisoned());
    recovered
        .update(b"user1", Row::from_strings([("age", "32")]))
        .unwrap();
    assert_eq!(read(&recovered, "user1").unwrap()["age"], "32");
}
