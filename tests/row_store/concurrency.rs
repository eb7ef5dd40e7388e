//! Worker threads sharing one backend through clients

use crate::common::*;
use nvbench::{BackendKind, Discipline, DriverConfig, Error, Row, SharedBackend, Status, UpdatePath};
use std::sync::{Arc, Barrier};
use std::thread;

const TABLE: &str = "usertable";
const WORKERS: usize = 6;
const ROUNDS: usize = 25;

fn field_updates_converge(config: DriverConfig) {
    let label = format!("{} {:?} {}", config.backend, config.update_path, config.discipline);
    let backend = TestBackend::with_config(config);
    let client = backend.connect();
    let initial: Vec<(String, String)> = (0..WORKERS)
        .map(|w| (format!("field{}", w), "init".to_string()))
        .collect();
    assert_eq!(client.insert(TABLE, "hot", Row::from_strings(initial)), Status::Ok);

    let barrier = Arc::new(Barrier::new(WORKERS));
    let workers: Vec<_> = (0..WORKERS)
        .map(|w| {
            let client = client.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for r in 0..ROUNDS {
                    let status = client.update(
                        TABLE,
                        "hot",
                        Row::from_strings([(format!("field{}", w), format!("w{}r{}", w, r))]),
                    );
                    assert_eq!(status, Status::Ok);
                    let own = format!("own{}-{}", w, r);
                    assert_eq!(
                        client.insert(TABLE, &own, Row::from_strings([("f", own.as_str())])),
                        Status::Ok
                    );
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let row = read_text(&client, TABLE, "hot").unwrap();
    for w in 0..WORKERS {
        assert_eq!(
            row[&format!("field{}", w)],
            format!("w{}r{}", w, ROUNDS - 1),
            "{}: lost update",
            label
        );
    }
    assert_eq!(client.len(), 1 + WORKERS * ROUNDS, "{}", label);
}

#[test]
fn field_updates_converge_on_volatile() {
    field_updates_converge(DriverConfig::for_testing(BackendKind::Volatile));
}

#[test]
fn field_updates_converge_under_row_lock() {
    field_updates_converge(DriverConfig::for_testing(BackendKind::Recoverable));
}

#[test]
fn field_updates_converge_under_compute() {
    field_updates_converge(
        DriverConfig::for_testing(BackendKind::Recoverable).with_discipline(Discipline::Compute),
    );
}

#[test]
fn field_updates_converge_in_sections() {
    field_updates_converge(
        DriverConfig::for_testing(BackendKind::FailureAtomic).with_update_path(UpdatePath::Weak),
    );
}

#[test]
fn field_updates_converge_with_sections_and_strong_updates() {
    field_updates_converge(
        DriverConfig::for_testing(BackendKind::FailureAtomic).with_update_path(UpdatePath::Strong),
    );
}

#[test]
fn failure_atomic_backend_refuses_compute() {
    for path in [UpdatePath::Strong, UpdatePath::Weak] {
        let config = DriverConfig::for_testing(BackendKind::FailureAtomic)
            .with_update_path(path)
            .with_discipline(Discipline::Compute);
        assert!(matches!(
            SharedBackend::new(config),
            Err(Error::InvalidConfig(_))
        ));
    }
}

#[test]
fn clients_on_many_threads_share_one_open() {
    let backend = TestBackend::new(BackendKind::Recoverable);
    let first = backend.connect();
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let client = first.clone();
            thread::spawn(move || {
                let key = format!("t{}", t);
                client.insert(TABLE, &key, Row::from_strings([("f", "v")]))
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), Status::Ok);
    }
    assert_eq!(backend.shared.clients(), 1);
    assert_eq!(first.len(), 4);
}
