//! Recoverable backend
//!
//! Rows live in a [`DurableMap`] and every mutation follows the strong
//! update protocol: flush and fence at each step, so a crash at any point
//! recovers to the row before or after the operation. Field names are
//! interned; values are unique blocks.
//!
//! Deleting a row is a two-part obligation: the map unlinks it, then this
//! backend invalidates the row's values and fences.

use crate::config::DriverConfig;
use crate::store::{composite_key, project, RowStore};
use nvbench_core::{Result, Status};
use nvbench_pmem::{Heap, RecoveryReport};
use nvbench_storage::layout::registry;
use nvbench_storage::{DurableMap, MapConfig, Row};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Durable rows, strong protocol
#[derive(Debug)]
pub struct RecoverableStore {
    map: DurableMap,
    report: RecoveryReport,
}

impl RecoverableStore {
    /// Open (recovering if needed) the pool and map of `config`
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let (heap, report) = Heap::open(config.pmem_config(), registry()?)?;
        Self::with_heap(heap, report, config.map.root_slot, config.map_config())
    }

    /// Open the map at `root_slot` of an open heap
    pub fn with_heap(
        heap: Arc<Heap>,
        report: RecoveryReport,
        root_slot: usize,
        config: MapConfig,
    ) -> Result<Self> {
        let map = DurableMap::open(heap, root_slot, config)?;
        info!(rows = map.len(), discipline = %map.config().discipline, "recoverable store opened");
        Ok(RecoverableStore { map, report })
    }

    /// The underlying map
    pub fn map(&self) -> &DurableMap {
        &self.map
    }

    /// What recovery did when the pool was opened
    pub fn recovery(&self) -> &RecoveryReport {
        &self.report
    }

    fn try_delete(&self, key: &[u8]) -> Result<usize> {
        let row = self.map.remove(key)?;
        let retired = (|| -> Result<usize> {
            let n = row.invalidate_values()?;
            self.map.heap().fence()?;
            Ok(n)
        })();
        if let Err(e) = &retired {
            if e.is_fatal() {
                self.map.poison();
            }
        }
        retired
    }
}

impl RowStore for RecoverableStore {
    fn name(&self) -> &'static str {
        "recoverable"
    }

    fn read(&self, table: &str, key: &str, fields: Option<&[&str]>) -> Result<Row> {
        let row = self.map.get(&composite_key(table, key))?;
        Ok(project(row, fields))
    }

    fn update(&self, table: &str, key: &str, values: Row) -> Status {
        Status::from_result(&self.map.update(&composite_key(table, key), values))
    }

    fn insert(&self, table: &str, key: &str, values: Row) -> Status {
        Status::from_result(&self.map.put(&composite_key(table, key), values))
    }

    fn delete(&self, table: &str, key: &str) -> Status {
        let result = self.try_delete(&composite_key(table, key));
        if let Ok(n) = &result {
            debug!(table, key, retired = n, "row deleted");
        }
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
