//! Row-store contract the benchmark harness drives
//!
//! Every backend answers the same five operations. Reads return the row (or
//! an error); mutations report only a [`Status`]. Absence is an ordinary
//! `Status::Error`, and fatal errors are logged before they are folded.
//!
//! Rows are keyed by table and key together. The table is an opaque
//! namespace: backends keep one flat key space and never enumerate tables.

use nvbench_core::{Result, Status};
use nvbench_storage::Row;
use tracing::warn;

/// Byte separating the table from the key in a stored key
pub const KEY_SEPARATOR: u8 = 0x1F;

/// Stored key of `key` in `table`
pub fn composite_key(table: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(table.len() + 1 + key.len());
    out.extend_from_slice(table.as_bytes());
    out.push(KEY_SEPARATOR);
    out.extend_from_slice(key.as_bytes());
    out
}

/// Split a stored key back into table and key
pub fn split_key(stored: &[u8]) -> Option<(&[u8], &[u8])> {
    let at = stored.iter().position(|&b| b == KEY_SEPARATOR)?;
    Some((&stored[..at], &stored[at + 1..]))
}

/// Key-value row store
///
/// Implementations are shared by every worker thread of a run.
pub trait RowStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Read a row, keeping only `fields` when given
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`](nvbench_core::Error::NotFound) if no row is
    /// stored under `key`.
    fn read(&self, table: &str, key: &str, fields: Option<&[&str]>) -> Result<Row>;

    /// Set the given fields of an existing row
    fn update(&self, table: &str, key: &str, values: Row) -> Status;

    /// Store a row, replacing any row under `key`
    fn insert(&self, table: &str, key: &str, values: Row) -> Status;

    /// Remove a row and retire its values
    fn delete(&self, table: &str, key: &str) -> Status;

    /// Range scan
    ///
    /// Not supported by any backend: reports success without producing
    /// rows. Callers must not rely on scan results.
    fn scan(
        &self,
        table: &str,
        start_key: &str,
        count: usize,
        fields: Option<&[&str]>,
    ) -> Status {
        warn!(
            backend = self.name(),
            table,
            start_key,
            count,
            fields = ?fields,
            "scan is not supported; returning Ok without rows"
        );
        Status::Ok
    }

    /// Number of rows across every table
    fn len(&self) -> usize;

    /// True if no row is stored
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free superseded persistent blocks, returning how many were freed
    ///
    /// Call only at a quiescent point: no read may be in flight.
    fn reclaim(&self) -> Result<usize> {
        Ok(0)
    }

    /// Make everything stored so far survive the process
    ///
    /// Called once, when the last client lets go.
    fn close(&self) -> Result<()>;
}

/// Projection shared by the backends' `read`
pub(crate) fn project(row: Row, fields: Option<&[&str]>) -> Row {
    match fields {
        Some(names) => row.project(names),
        None => row,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key_layout() {
        assert_eq!(composite_key("usertable", "user1"), b"usertable\x1fuser1");
        assert_eq!(composite_key("", "k"), b"\x1fk");
    }

    #[test]
    fn test_split_key() {
        let stored = composite_key("t", "a\x1fb");
        let (table, key) = split_key(&stored).unwrap();
        assert_eq!(table, b"t");
        assert_eq!(key, b"a\x1fb");
        assert!(split_key(b"plain").is_none());
    }

    #[test]
    fn test_tables_do_not_collide() {
        assert_ne!(composite_key("a", "bc"), composite_key("ab", "c"));
    }

    #[test]
    fn test_project() {
        let row = Row::from_strings([("a", "1"), ("b", "2"), ("c", "3")]);
        assert_eq!(project(row.clone(), None).len(), 3);
        let kept = project(row, Some(&["a", "c", "missing"]));
        assert_eq!(kept.len(), 2);
        assert!(kept.contains(b"a"));
        assert!(!kept.contains(b"b"));
    }
}
