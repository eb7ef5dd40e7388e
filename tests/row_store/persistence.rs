//! Rows surviving close, reopen and crashes

use crate::common::*;
use nvbench::{
    BackendKind, DriverConfig, FailureAtomicStore, RecoverableStore, Row, RowStore, Status,
    UpdatePath,
};
use nvbench_pmem::Heap;
use nvbench_storage::layout::registry;
use nvbench_storage::protocol::update;

const TABLE: &str = "usertable";

#[test]
fn rows_survive_last_client_leaving() {
    for kind in PERSISTENT_BACKENDS {
        let backend = TestBackend::new(kind);
        {
            let client = backend.connect();
            for i in 0..20 {
                let key = format!("user{}", i);
                client.insert(TABLE, &key, Row::from_strings([("f", key.as_str())]));
            }
            client.update(TABLE, "user3", Row::from_strings([("g", "extra")]));
            client.delete(TABLE, "user7");
        }
        assert!(!backend.shared.is_open());

        let client = backend.connect();
        assert_eq!(client.len(), 19, "{}", kind);
        assert_eq!(
            read_text(&client, TABLE, "user3"),
            Some(fields(&[("f", "user3"), ("g", "extra")])),
            "{}",
            kind
        );
        assert!(read_text(&client, TABLE, "user7").is_none(), "{}", kind);
    }
}

#[test]
fn weak_updates_survive_reopen() {
    let config =
        DriverConfig::for_testing(BackendKind::FailureAtomic).with_update_path(UpdatePath::Weak);
    let backend = TestBackend::with_config(config);
    {
        let client = backend.connect();
        client.insert(TABLE, "k", Row::from_strings([("a", "1"), ("b", "2")]));
        for i in 0..10 {
            let v = i.to_string();
            assert_eq!(
                client.update(TABLE, "k", Row::from_strings([("a", v.as_str())])),
                Status::Ok
            );
        }
        client.update(TABLE, "k", Row::from_strings([("c", "3")]));
    }
    let client = backend.connect();
    assert_eq!(
        read_text(&client, TABLE, "k"),
        Some(fields(&[("a", "9"), ("b", "2"), ("c", "3")]))
    );
}

#[test]
fn recoverable_store_restarts_from_crash_image() {
    init_tracing();
    let config = DriverConfig::for_testing(BackendKind::Recoverable);
    let store = RecoverableStore::open(&config).unwrap();
    store.insert(TABLE, "user1", Row::from_strings([("name", "alice"), ("age", "30")]));

    let heap = store.map().heap();
    heap.faults().arm(update::AFTER_REPLACE);
    assert_eq!(
        store.update(TABLE, "user1", Row::from_strings([("age", "31")])),
        Status::Error
    );
    assert!(store.map().is_poisoned());
    assert_eq!(
        store.insert(TABLE, "user2", Row::from_strings([("name", "bob")])),
        Status::Error
    );

    let (heap, report) =
        Heap::from_image(config.pmem_config(), heap.crash_image(), registry().unwrap()).unwrap();
    assert_eq!(report.dangling, 0);
    let restarted =
        RecoverableStore::with_heap(heap, report, 0, config.map_config()).unwrap();
    let row = restarted
        .read(TABLE, "user1", None)
        .unwrap()
        .to_string_map()
        .unwrap();
    assert_eq!(row, fields(&[("name", "alice"), ("age", "30")]));
    assert!(restarted.read(TABLE, "user2", None).is_err());
    assert_eq!(
        restarted.update(TABLE, "user1", Row::from_strings([("age", "31")])),
        Status::Ok
    );
}

#[test]
fn failure_atomic_store_crash_inside_commit_is_all_or_nothing() {
    init_tracing();
    let config =
        DriverConfig::for_testing(BackendKind::FailureAtomic).with_update_path(UpdatePath::Weak);
    for (point, committed) in [
        ("section.before_commit", false),
        ("section.after_commit_flush", false),
        ("section.after_commit_point", true),
    ] {
        let store = FailureAtomicStore::open(&config).unwrap();
        store.insert(TABLE, "k", Row::from_strings([("a", "1"), ("b", "2")]));
        store.map().heap().faults().arm(point);
        assert_eq!(
            store.update(TABLE, "k", Row::from_strings([("a", "9"), ("c", "3")])),
            Status::Error,
            "{}",
            point
        );
        assert!(store.map().is_poisoned(), "{}", point);

        let (heap, report) = Heap::from_image(
            config.pmem_config(),
            store.map().heap().crash_image(),
            registry().unwrap(),
        )
        .unwrap();
        assert_eq!(report.dangling, 0, "{}", point);
        let restarted = FailureAtomicStore::with_heap(
            heap,
            report,
            0,
            config.map_config(),
            UpdatePath::Weak,
        )
        .unwrap();
        let row = restarted
            .read(TABLE, "k", None)
            .unwrap()
            .to_string_map()
            .unwrap();
        let expected = if committed {
            fields(&[("a", "9"), ("b", "2"), ("c", "3")])
        } else {
            fields(&[("a", "1"), ("b", "2")])
        };
        assert_eq!(row, expected, "crash at {}", point);
    }
}
