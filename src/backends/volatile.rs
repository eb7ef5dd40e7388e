//! In-memory backend
//!
//! Rows live in a sharded `DashMap`; nothing survives the process. Values
//! are moved into process memory on the way in, so a row read back never
//! aliases caller-owned or persistent storage.

use crate::store::{composite_key, project, RowStore};
use dashmap::DashMap;
use nvbench_core::{Error, Result, Status};
use nvbench_storage::Row;
use tracing::debug;

/// Rows in process memory
#[derive(Debug, Default)]
pub struct VolatileStore {
    rows: DashMap<Box<[u8]>, Row>,
}

impl VolatileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store under an already composed key
    pub(crate) fn put_raw(&self, key: Box<[u8]>, row: Row) {
        self.rows.insert(key, row);
    }

    /// Visit every stored row
    pub(crate) fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &Row) -> Result<()>,
    {
        for entry in self.rows.iter() {
            f(entry.key(), entry.value())?;
        }
        Ok(())
    }

    fn try_update(&self, key: &[u8], values: Row) -> Result<()> {
        let values = values.into_volatile()?;
        match self.rows.get_mut(key) {
            Some(mut row) => {
                row.extend(values);
                Ok(())
            }
            None => Err(Error::not_found(String::from_utf8_lossy(key))),
        }
    }

    fn try_insert(&self, key: Vec<u8>, values: Row) -> Result<()> {
        let values = values.into_volatile()?;
        self.rows.insert(key.into_boxed_slice(), values);
        Ok(())
    }
}

impl RowStore for VolatileStore {
    fn name(&self) -> &'static str {
        "volatile"
    }

    fn read(&self, table: &str, key: &str, fields: Option<&[&str]>) -> Result<Row> {
        let stored = composite_key(table, key);
        let row = self
            .rows
            .get(stored.as_slice())
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::not_found(format!("{}/{}", table, key)))?;
        Ok(project(row, fields))
    }

    fn update(&self, table: &str, key: &str, values: Row) -> Status {
        let result = self.try_update(&composite_key(table, key), values);
        debug!(table, key, ok = result.is_ok(), "volatile update");
        Status::from_result(&result)
    }

    fn insert(&self, table: &str, key: &str, values: Row) -> Status {
        Status::from_result(&self.try_insert(composite_key(table, key), values))
    }

    fn delete(&self, table: &str, key: &str) -> Status {
        let stored = composite_key(table, key);
        let result = self
            .rows
            .remove(stored.as_slice())
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("{}/{}", table, key)));
        Status::from_result(&result)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
