//! Failure-atomic backend
//!
//! Rows live in a [`DurableMap`] as with the recoverable backend, but each
//! insert and delete runs inside its own failure-atomic section: stores are
//! undo-logged instead of flushed one by one, and the section's commit is
//! the single durability point. Updates take the weak path inside a section
//! when the driver asks for it, and the strong protocol otherwise.

use crate::config::{DriverConfig, UpdatePath};
use crate::store::{composite_key, project, RowStore};
use nvbench_core::{Error, Result, Status};
use nvbench_pmem::{FailureAtomicSection, Heap, RecoveryReport};
use nvbench_storage::layout::registry;
use nvbench_storage::{Discipline, DurableMap, MapConfig, Row};
use std::sync::Arc;
use tracing::{error, info};

/// Durable rows, one failure-atomic section per operation
#[derive(Debug)]
pub struct FailureAtomicStore {
    map: DurableMap,
    update_path: UpdatePath,
    report: RecoveryReport,
}

impl FailureAtomicStore {
    /// Open (recovering if needed) the pool and map of `config`
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let (heap, report) = Heap::open(config.pmem_config(), registry()?)?;
        Self::with_heap(
            heap,
            report,
            config.map.root_slot,
            config.map_config(),
            config.update_path,
        )
    }

    /// Open the map at `root_slot` of an open heap
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] unless `config` uses the row-lock
    /// discipline: sections hold row locks that compute writers skip.
    pub fn with_heap(
        heap: Arc<Heap>,
        report: RecoveryReport,
        root_slot: usize,
        config: MapConfig,
        update_path: UpdatePath,
    ) -> Result<Self> {
        if config.discipline != Discipline::RowLock {
            return Err(Error::invalid_config(format!(
                "failure-atomic store needs the row-lock discipline, not {}",
                config.discipline
            )));
        }
        let map = DurableMap::open(heap, root_slot, config)?;
        info!(rows = map.len(), ?update_path, "failure-atomic store opened");
        Ok(FailureAtomicStore {
            map,
            update_path,
            report,
        })
    }

    /// The underlying map
    pub fn map(&self) -> &DurableMap {
        &self.map
    }

    /// What recovery did when the pool was opened
    pub fn recovery(&self) -> &RecoveryReport {
        &self.report
    }

    /// Run `op` in a fresh section and commit it
    ///
    /// An error from `op` drops the section, rolling back every store it
    /// made. A fatal failure anywhere, including begin and commit, poisons
    /// the map.
    fn in_section<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&DurableMap, &mut FailureAtomicSection<'_>) -> Result<T>,
    {
        let result = (|| -> Result<T> {
            let mut section = self.map.heap().begin_section()?;
            let out = op(&self.map, &mut section)?;
            section.commit()?;
            Ok(out)
        })();
        if let Err(e) = &result {
            if e.is_fatal() {
                self.map.poison();
            }
        }
        result
    }
}

impl RowStore for FailureAtomicStore {
    fn name(&self) -> &'static str {
        "failure-atomic"
    }

    fn read(&self, table: &str, key: &str, fields: Option<&[&str]>) -> Result<Row> {
        let row = self.map.get(&composite_key(table, key))?;
        Ok(project(row, fields))
    }

    fn update(&self, table: &str, key: &str, values: Row) -> Status {
        let key = composite_key(table, key);
        let result = match self.update_path {
            UpdatePath::Weak => {
                self.in_section(|map, section| map.update_within(section, &key, values))
            }
            UpdatePath::Strong => self.map.update(&key, values),
        };
        Status::from_result(&result)
    }

    fn insert(&self, table: &str, key: &str, values: Row) -> Status {
        let key = composite_key(table, key);
        let result = self.in_section(|map, section| map.insert_within(section, &key, values));
        Status::from_result(&result)
    }

    fn delete(&self, table: &str, key: &str) -> Status {
        let key = composite_key(table, key);
        let result = self.in_section(|map, section| {
            let row = map.remove_within(section, &key)?;
            for h in row.durable_handles() {
                section.invalidate_on_commit(h);
            }
            Ok(())
        });
        Status::from_result(&result)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn reclaim(&self) -> Result<usize> {
        self.map.reclaim()
    }

    fn close(&self) -> Result<()> {
        if self.map.is_poisoned() {
            error!("closing a poisoned map; the pool image may need recovery");
        }
        self.map.heap().close()
    }
}
