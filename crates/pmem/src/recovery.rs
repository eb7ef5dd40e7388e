//! Heap recovery after restart
//!
//! Runs once when a heap is opened from an existing image, before any
//! caller can touch it:
//!
//! 1. roll back every failure-atomic section whose undo-log slot is set
//! 2. scan the block headers from the heap start
//! 3. trace reachability from the durable roots through klass trace
//!    functions
//! 4. validate reachable blocks that were never validated (their contents
//!    were durable before they were linked, so the link is the commit)
//! 5. free every unreachable block, including invalidated ones still in
//!    limbo and aborted allocations
//! 6. rebuild the free list and the intern table
//!
//! A reachable block that is invalidated or free is "dangling": the
//! protocols on top of the heap never leave one behind, so each is logged,
//! counted, and revalidated to keep the data it holds.

use crate::heap::{AllocState, Heap};
use crate::klass::UNDO_LOG;
use crate::layout::{
    log_slot_offset, BlockHandle, BlockHeader, BlockState, BLOCK_HEADER, HEAP_START,
    MAX_LOG_SLOTS, ROOT_SLOTS,
};
use crate::section::decode_undo_log;
use nvbench_core::{Error, Result};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// What recovery found and repaired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted failure-atomic sections undone
    pub rolled_back_sections: usize,
    /// Reachable unvalidated blocks promoted to validated
    pub rolled_forward: usize,
    /// Unreachable blocks returned to the free list
    pub reclaimed: usize,
    /// Reachable blocks that were invalidated or free
    pub dangling: usize,
    /// Reachable blocks after recovery
    pub live_blocks: usize,
}

impl RecoveryReport {
    /// True if recovery changed nothing
    pub fn is_clean(&self) -> bool {
        self.rolled_back_sections == 0
            && self.rolled_forward == 0
            && self.reclaimed == 0
            && self.dangling == 0
    }
}

impl Heap {
    pub(crate) fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            rolled_back_sections: self.roll_back_sections()?,
            ..RecoveryReport::default()
        };

        let (blocks, top) = self.scan_blocks()?;
        let reachable = self.trace_roots(&blocks)?;

        let mut alloc = AllocState {
            top,
            free: BTreeMap::new(),
            limbo: Vec::new(),
        };
        for (&off, header) in &blocks {
            let h = BlockHandle::from_offset(off);
            let mut header = *header;
            if reachable.contains(&off) {
                match header.state {
                    BlockState::Validated => {}
                    BlockState::Unvalidated => {
                        header.state = BlockState::Validated;
                        self.store_header(h, &header)?;
                        report.rolled_forward += 1;
                    }
                    state @ (BlockState::Invalidated | BlockState::Free) => {
                        warn!(offset = off, ?state, "reachable block was released; keeping it");
                        header.state = BlockState::Validated;
                        self.store_header(h, &header)?;
                        report.dangling += 1;
                    }
                }
                report.live_blocks += 1;
                if self.klasses.is_interned(header.klass) {
                    let bytes = self.pool.read(h.payload(), header.len)?;
                    self.interned
                        .entry((header.klass, bytes.into_boxed_slice()))
                        .or_insert(h);
                }
            } else {
                if header.state != BlockState::Free {
                    header.state = BlockState::Free;
                    self.store_header(h, &header)?;
                    report.reclaimed += 1;
                }
                alloc.push_free(h, header.capacity);
            }
        }
        self.fence()?;
        *self.alloc.lock() = alloc;

        info!(
            sections = report.rolled_back_sections,
            rolled_forward = report.rolled_forward,
            reclaimed = report.reclaimed,
            dangling = report.dangling,
            live = report.live_blocks,
            "heap recovered"
        );
        Ok(report)
    }

    fn roll_back_sections(&self) -> Result<usize> {
        let mut rolled_back = 0;
        for slot in 0..MAX_LOG_SLOTS {
            let slot_off = log_slot_offset(slot);
            let raw = self.pool.read_u64(slot_off)?;
            if raw == 0 {
                continue;
            }
            let log = BlockHandle::from_offset(raw);
            let header = self.header(log)?;
            if header.klass != UNDO_LOG {
                return Err(Error::corruption(format!(
                    "undo-log slot {} points at a block of klass {}",
                    slot, header.klass.0
                )));
            }
            let entries = decode_undo_log(&self.read_payload(log)?)?;
            for entry in entries.iter().rev() {
                self.pool.write(entry.off, &entry.bytes)?;
                self.pool.flush(entry.off, entry.bytes.len() as u64)?;
            }
            self.fence()?;
            self.pool.write_u64(slot_off, 0)?;
            self.pool.persist(slot_off, 8)?;
            warn!(slot, entries = entries.len(), "rolled back interrupted section");
            rolled_back += 1;
        }
        Ok(rolled_back)
    }

    fn scan_blocks(&self) -> Result<(BTreeMap<u64, BlockHeader>, u64)> {
        let size = self.pool.size();
        let mut blocks = BTreeMap::new();
        let mut off = HEAP_START;
        while off + BLOCK_HEADER <= size {
            let mut raw = [0u8; BLOCK_HEADER as usize];
            self.pool.read_into(off, &mut raw)?;
            let Some(header) = BlockHeader::decode(off, &raw)? else {
                break;
            };
            let end = off
                .checked_add(header.extent())
                .filter(|end| *end <= size)
                .ok_or_else(|| Error::corruption(format!("block at {} overruns pool", off)))?;
            if header.len > header.capacity {
                return Err(Error::corruption(format!(
                    "block at {} longer than its capacity",
                    off
                )));
            }
            blocks.insert(off, header);
            off = end;
        }
        Ok((blocks, off))
    }

    fn trace_roots(&self, blocks: &BTreeMap<u64, BlockHeader>) -> Result<FxHashSet<u64>> {
        let mut reachable = FxHashSet::default();
        let mut stack = Vec::new();
        for slot in 0..ROOT_SLOTS {
            if let Some(h) = self.root(slot)? {
                stack.push(h.offset());
            }
        }
        while let Some(off) = stack.pop() {
            if !reachable.insert(off) {
                continue;
            }
            let header = blocks.get(&off).ok_or_else(|| {
                Error::corruption(format!("pointer to {} does not name a block", off))
            })?;
            let payload = self.pool.read(off + BLOCK_HEADER, header.len)?;
            for child in self.klasses.trace(header.klass, &payload)? {
                if !reachable.contains(&child) {
                    stack.push(child);
                }
            }
        }
        Ok(reachable)
    }
}
