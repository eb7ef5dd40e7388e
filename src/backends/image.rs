//! Image backend
//!
//! A volatile store whose whole content is written into the persistent
//! pool as one bincode blob when the backend closes, and read back when it
//! opens. Between open and close nothing is durable; a crash loses every
//! mutation since the last close.
//!
//! The blob is published like any other durable object: written, flushed
//! and fenced before the root slot is switched to it, and the previous
//! blob is invalidated only after the switch is durable.

use super::volatile::VolatileStore;
use crate::config::DriverConfig;
use crate::store::RowStore;
use nvbench_core::{Error, Result, Status};
use nvbench_pmem::{BlockState, Heap, RecoveryReport, BLOB};
use nvbench_storage::layout::registry;
use nvbench_storage::{Field, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
struct ImageRow {
    key: Vec<u8>,
    fields: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Volatile rows saved as one image into the pool
#[derive(Debug)]
pub struct ImageStore {
    rows: VolatileStore,
    heap: Arc<Heap>,
    root_slot: usize,
    report: RecoveryReport,
}

impl ImageStore {
    /// Open the pool of `config` and load the image at its root slot
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let (heap, report) = Heap::open(config.pmem_config(), registry()?)?;
        Self::with_heap(heap, report, config.map.root_slot)
    }

    /// Load the image at `root_slot` of an open heap
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if the root points at something other than a
    /// validated blob; [`Error::Serialization`] if the blob does not decode.
    pub fn with_heap(heap: Arc<Heap>, report: RecoveryReport, root_slot: usize) -> Result<Self> {
        let rows = VolatileStore::new();
        if let Some(blob) = heap.root(root_slot)? {
            let header = heap.header(blob)?;
            if header.klass != BLOB || header.state != BlockState::Validated {
                return Err(Error::corruption(format!(
                    "root slot {} holds a {:?} block of klass {}, not an image",
                    root_slot, header.state, header.klass.0
                )));
            }
            let image: Vec<ImageRow> = bincode::deserialize(&heap.read_payload(blob)?)
                .map_err(|e| Error::Serialization(format!("image decode: {}", e)))?;
            for r in image {
                let row: Row = r
                    .fields
                    .into_iter()
                    .map(|(name, value)| (name.into(), Field::from(value)))
                    .collect();
                rows.put_raw(r.key.into_boxed_slice(), row);
            }
            info!(root_slot, rows = rows.len(), "image loaded");
        }
        Ok(ImageStore {
            rows,
            heap,
            root_slot,
            report,
        })
    }

    /// What recovery did when the pool was opened
    pub fn recovery(&self) -> &RecoveryReport {
        &self.report
    }

    /// Heap holding the image
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Write the current rows as a new image and link it at the root slot
    ///
    /// Returns the size of the image in bytes.
    pub fn save(&self) -> Result<usize> {
        let mut image = Vec::with_capacity(self.rows.len());
        self.rows.for_each(|key, row| {
            let fields = row
                .iter()
                .map(|(name, value)| Ok((name.remaining().to_vec(), value.bytes()?)))
                .collect::<Result<Vec<_>>>()?;
            image.push(ImageRow {
                key: key.to_vec(),
                fields,
            });
            Ok(())
        })?;
        let bytes = bincode::serialize(&image)
            .map_err(|e| Error::Serialization(format!("image encode: {}", e)))?;

        let blob = self.heap.allocate(BLOB, bytes.len() as u64)?;
        let written = (|| -> Result<()> {
            self.heap.write_at(blob, 0, &bytes)?;
            self.heap.flush_block(blob)?;
            self.heap.fence()
        })();
        if let Err(e) = written {
            self.heap.destroy(blob)?;
            return Err(e);
        }
        let previous = self.heap.root(self.root_slot)?;
        self.heap.set_root(self.root_slot, Some(blob))?;
        self.heap.validate(blob)?;
        self.heap.fence()?;
        if let Some(old) = previous {
            self.heap.invalidate(old)?;
            self.heap.fence()?;
        }
        debug!(rows = image.len(), bytes = bytes.len(), "image saved");
        Ok(bytes.len())
    }
}

impl RowStore for ImageStore {
    fn name(&self) -> &'static str {
        "image"
    }

    fn read(&self, table: &str, key: &str, fields: Option<&[&str]>) -> Result<Row> {
        self.rows.read(table, key, fields)
    }

    fn update(&self, table: &str, key: &str, values: Row) -> Status {
        self.rows.update(table, key, values)
    }

    fn insert(&self, table: &str, key: &str, values: Row) -> Status {
        self.rows.insert(table, key, values)
    }

    fn delete(&self, table: &str, key: &str) -> Status {
        self.rows.delete(table, key)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn reclaim(&self) -> Result<usize> {
        self.heap.reclaim()
    }

    fn close(&self) -> Result<()> {
        self.save()?;
        self.heap.close()?;
        info!(root_slot = self.root_slot, rows = self.rows.len(), "image store closed");
        Ok(())
    }
}
