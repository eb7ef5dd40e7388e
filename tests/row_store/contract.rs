//! Row-store contract, checked against every backend

use crate::common::*;
use nvbench::{GeneratedSequence, Row, Status};

const TABLE: &str = "usertable";

#[test]
fn user1_scenario_on_every_backend() {
    for kind in ALL_BACKENDS {
        let backend = TestBackend::new(kind);
        let client = backend.connect();

        let status = client.insert(
            TABLE,
            "user1",
            Row::from_strings([("name", "alice"), ("age", "30")]),
        );
        assert_eq!(status, Status::Ok, "{}", kind);
        assert_eq!(
            read_text(&client, TABLE, "user1"),
            Some(fields(&[("name", "alice"), ("age", "30")])),
            "{}",
            kind
        );

        let status = client.update(TABLE, "user1", Row::from_strings([("age", "31")]));
        assert_eq!(status, Status::Ok, "{}", kind);
        assert_eq!(
            read_text(&client, TABLE, "user1"),
            Some(fields(&[("name", "alice"), ("age", "31")])),
            "{}",
            kind
        );

        assert_eq!(client.delete(TABLE, "user1"), Status::Ok, "{}", kind);
        let err = client.read(TABLE, "user1", None).unwrap_err();
        assert!(err.is_not_found(), "{}: {}", kind, err);
    }
}

#[test]
fn absent_rows_fold_into_error_status() {
    for kind in ALL_BACKENDS {
        let backend = TestBackend::new(kind);
        let client = backend.connect();
        assert_eq!(
            client.update(TABLE, "ghost", Row::from_strings([("a", "1")])),
            Status::Error,
            "{}",
            kind
        );
        assert_eq!(client.delete(TABLE, "ghost"), Status::Error, "{}", kind);
        assert!(client.is_empty(), "{}", kind);
    }
}

#[test]
fn read_projects_requested_fields() {
    for kind in ALL_BACKENDS {
        let backend = TestBackend::new(kind);
        let client = backend.connect();
        client.insert(
            TABLE,
            "k",
            Row::from_strings([("field0", "a"), ("field1", "b"), ("field2", "c")]),
        );
        let row = client
            .read(TABLE, "k", Some(&["field0", "field2"]))
            .unwrap()
            .to_string_map()
            .unwrap();
        assert_eq!(row, fields(&[("field0", "a"), ("field2", "c")]), "{}", kind);
    }
}

#[test]
fn scan_reports_ok_without_rows() {
    for kind in ALL_BACKENDS {
        let backend = TestBackend::new(kind);
        let client = backend.connect();
        client.insert(TABLE, "k", Row::from_strings([("a", "1")]));
        assert_eq!(client.scan(TABLE, "k", 10, None), Status::Ok, "{}", kind);
        assert_eq!(client.len(), 1, "{}", kind);
    }
}

#[test]
fn generated_values_are_stored_as_drained() {
    for kind in ALL_BACKENDS {
        let backend = TestBackend::new(kind);
        let client = backend.connect();
        let mut row = Row::new();
        for i in 0..4u64 {
            let mut value = GeneratedSequence::new(100, i);
            row.insert(format!("field{}", i), nvbench::ByteSequence::to_array(&mut value).unwrap());
        }
        assert_eq!(client.insert(TABLE, "gen", row), Status::Ok, "{}", kind);
        let stored = read_text(&client, TABLE, "gen").unwrap();
        assert_eq!(stored.len(), 4);
        assert!(stored.values().all(|v| v.len() == 100), "{}", kind);
    }
}

#[test]
fn tables_are_separate_namespaces() {
    for kind in ALL_BACKENDS {
        let backend = TestBackend::new(kind);
        let client = backend.connect();
        client.insert("t1", "k", Row::from_strings([("a", "1")]));
        client.insert("t2", "k", Row::from_strings([("a", "2")]));
        assert_eq!(read_text(&client, "t1", "k").unwrap()["a"], "1", "{}", kind);
        assert_eq!(read_text(&client, "t2", "k").unwrap()["a"], "2", "{}", kind);
        assert_eq!(client.delete("t1", "k"), Status::Ok);
        assert!(read_text(&client, "t2", "k").is_some(), "{}", kind);
    }
}

#[test]
fn rows_read_back_can_be_stored_again() {
    for kind in ALL_BACKENDS {
        let backend = TestBackend::new(kind);
        let client = backend.connect();
        client.insert(TABLE, "src", Row::from_strings([("a", "1"), ("b", "2")]));
        let row = client.read(TABLE, "src", None).unwrap();
        assert_eq!(client.insert(TABLE, "dst", row), Status::Ok, "{}", kind);
        assert_eq!(client.delete(TABLE, "src"), Status::Ok, "{}", kind);
        assert_eq!(
            read_text(&client, TABLE, "dst"),
            Some(fields(&[("a", "1"), ("b", "2")])),
            "{}",
            kind
        );
    }
}
