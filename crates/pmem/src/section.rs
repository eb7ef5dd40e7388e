//! Failure-atomic sections
//!
//! A [`FailureAtomicSection`] makes a group of stores to persistent memory
//! all-or-nothing across crashes. Stores to pre-existing data are preceded
//! by a durable undo record of the bytes they overwrite; stores into blocks
//! allocated by the section itself need no record, because those blocks are
//! unreachable until the section commits.
//!
//! # Undo log format
//!
//! One `UNDO_LOG` block per section, published in an undo-log slot of the
//! pool header while the section is open:
//!
//! ```text
//! [count: u64] { [offset: u64] [len: u64] [old bytes, zero-padded to 8] } * count
//! ```
//!
//! An entry is made durable before the count covering it, and the count
//! before the store it protects.
//!
//! # Commit
//!
//! 1. flush every stored range and every fresh block, fence
//! 2. clear the undo-log slot, fence (the commit point)
//! 3. validate fresh blocks, fence
//! 4. invalidate blocks handed to [`FailureAtomicSection::invalidate_on_commit`], fence
//! 5. free the undo log and the slot, release held locks
//!
//! Recovery rolls back every section whose slot is still set.
//!
//! # Abort
//!
//! Dropping a section that has not reached its commit point restores every
//! logged range, invalidates the fresh blocks (they are reclaimed with the
//! rest of limbo, since a racing reader may have seen them) and then
//! releases held locks.
//!
//! Volatile state that must follow the outcome (an in-memory index, say)
//! is updated through [`FailureAtomicSection::on_commit`] and
//! [`FailureAtomicSection::on_abort`]; hooks run before held locks are
//! released.

use crate::heap::Heap;
use crate::klass::UNDO_LOG;
use crate::layout::{le_u64, log_slot_offset, BlockHandle, KlassId};
use nvbench_core::{Error, Result};
use std::any::Any;
use tracing::{trace, warn};

/// One logged range: where it was and what it held
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoEntry {
    pub(crate) off: u64,
    pub(crate) bytes: Vec<u8>,
}

const ENTRY_HEADER: u64 = 16;

#[inline]
fn padded(len: u64) -> u64 {
    (len + 7) & !7
}

fn encode_entry(off: u64, old: &[u8]) -> Vec<u8> {
    let len = old.len() as u64;
    let mut out = Vec::with_capacity((ENTRY_HEADER + padded(len)) as usize);
    out.extend_from_slice(&off.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(old);
    out.resize((ENTRY_HEADER + padded(len)) as usize, 0);
    out
}

/// Parse an undo-log payload
pub(crate) fn decode_undo_log(payload: &[u8]) -> Result<Vec<UndoEntry>> {
    if payload.len() < 8 {
        return Err(Error::corruption("undo log shorter than its count"));
    }
    let count = le_u64(payload);
    let mut entries = Vec::new();
    let mut pos = 8u64;
    for _ in 0..count {
        let header_end = pos + ENTRY_HEADER;
        if header_end > payload.len() as u64 {
            return Err(Error::corruption("undo entry header past end of log"));
        }
        let off = le_u64(&payload[pos as usize..]);
        let len = le_u64(&payload[pos as usize + 8..]);
        let end = header_end
            .checked_add(len)
            .filter(|end| *end <= payload.len() as u64)
            .ok_or_else(|| Error::corruption("undo entry bytes past end of log"))?;
        entries.push(UndoEntry {
            off,
            bytes: payload[header_end as usize..end as usize].to_vec(),
        });
        pos = header_end + padded(len);
    }
    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Committed,
    Finished,
}

/// Group of persistent stores that survives a crash entirely or not at all
pub struct FailureAtomicSection<'h> {
    heap: &'h Heap,
    slot: usize,
    log: BlockHandle,
    log_used: u64,
    undo: Vec<UndoEntry>,
    touched: Vec<(u64, u64)>,
    fresh: Vec<(BlockHandle, u64)>,
    deferred: Vec<BlockHandle>,
    guards: Vec<Box<dyn Any>>,
    on_commit: Vec<Box<dyn FnOnce()>>,
    on_abort: Vec<Box<dyn FnOnce()>>,
    phase: Phase,
}

impl Heap {
    /// Open a failure-atomic section
    ///
    /// Blocks while every undo-log slot is in use.
    pub fn begin_section(&self) -> Result<FailureAtomicSection<'_>> {
        let slot = self.acquire_log_slot();
        let capacity = self.pool().config().undo_log_capacity;
        let log = match self.allocate(UNDO_LOG, capacity) {
            Ok(h) => h,
            Err(e) => {
                self.release_log_slot(slot);
                return Err(e);
            }
        };
        let published = (|| -> Result<()> {
            self.write_word(log, 0, 0)?;
            self.flush_at(log, 0, 8)?;
            self.pool().write_u64(log_slot_offset(slot), log.offset())?;
            self.pool().flush(log_slot_offset(slot), 8)?;
            self.fence()
        })();
        if let Err(e) = published {
            let _ = self.destroy(log);
            self.release_log_slot(slot);
            return Err(e);
        }
        let section = FailureAtomicSection {
            heap: self,
            slot,
            log,
            log_used: 0,
            undo: Vec::new(),
            touched: Vec::new(),
            fresh: Vec::new(),
            deferred: Vec::new(),
            guards: Vec::new(),
            on_commit: Vec::new(),
            on_abort: Vec::new(),
            phase: Phase::Open,
        };
        self.crash_point("section.after_begin")?;
        trace!(slot, log = log.offset(), "section begun");
        Ok(section)
    }
}

impl<'h> FailureAtomicSection<'h> {
    /// Heap this section writes to
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    fn in_fresh(&self, off: u64, len: u64) -> bool {
        self.fresh.iter().any(|(h, extent)| {
            off >= h.offset() && off + len <= h.offset() + extent
        })
    }

    fn log_old(&mut self, off: u64, len: u64) -> Result<()> {
        let entry_len = ENTRY_HEADER + padded(len);
        let limit = self.heap.pool().config().undo_log_capacity - 8;
        let requested = self.log_used + entry_len;
        if requested > limit {
            return Err(Error::Capacity { requested, limit });
        }
        let old = self.heap.pool().read(off, len)?;
        let at = 8 + self.log_used;
        self.heap.write_at(self.log, at, &encode_entry(off, &old))?;
        self.heap.flush_at(self.log, at, entry_len)?;
        self.heap.fence()?;
        self.heap.write_word(self.log, 0, self.undo.len() as u64 + 1)?;
        self.heap.flush_at(self.log, 0, 8)?;
        self.heap.fence()?;
        self.log_used += entry_len;
        self.undo.push(UndoEntry { off, bytes: old });
        Ok(())
    }

    /// Store bytes at a pool offset
    ///
    /// The old contents are logged first unless the range lies inside a
    /// block allocated by this section. Nothing is flushed until commit.
    ///
    /// # Errors
    ///
    /// [`Error::Capacity`] when the undo log is full.
    pub fn write(&mut self, off: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        if !self.in_fresh(off, len) {
            self.log_old(off, len)?;
        }
        self.heap.pool().write(off, bytes)?;
        self.touched.push((off, len));
        Ok(())
    }

    /// Store one little-endian word
    pub fn write_u64(&mut self, off: u64, value: u64) -> Result<()> {
        self.write(off, &value.to_le_bytes())
    }

    /// Store into a block payload
    pub fn write_at(&mut self, h: BlockHandle, off: u64, bytes: &[u8]) -> Result<()> {
        let header = self.heap.header(h)?;
        if off + bytes.len() as u64 > header.capacity {
            return Err(Error::corruption(format!(
                "section store beyond capacity of block {}",
                h.offset()
            )));
        }
        self.write(h.payload() + off, bytes)
    }

    /// Store payload word `index` of a block
    pub fn write_word(&mut self, h: BlockHandle, index: u64, value: u64) -> Result<()> {
        self.write_at(h, index * 8, &value.to_le_bytes())
    }

    /// Allocate a block that becomes validated when the section commits and
    /// is freed if it aborts
    pub fn allocate(&mut self, klass: KlassId, len: u64) -> Result<BlockHandle> {
        let h = self.heap.allocate(klass, len)?;
        let extent = self.heap.header(h)?.extent();
        self.fresh.push((h, extent));
        Ok(h)
    }

    /// Take ownership of a block allocated outside the section, so that it
    /// is validated on commit and freed on abort
    pub fn adopt(&mut self, h: BlockHandle) -> Result<()> {
        let extent = self.heap.header(h)?.extent();
        self.fresh.push((h, extent));
        Ok(())
    }

    /// Invalidate `h` once the section has committed
    pub fn invalidate_on_commit(&mut self, h: BlockHandle) {
        self.deferred.push(h);
    }

    /// Keep a lock guard (or anything else) alive until commit or abort
    pub fn hold<G: Any>(&mut self, guard: G) {
        self.guards.push(Box::new(guard));
    }

    /// Run `hook` once the section has committed
    pub fn on_commit(&mut self, hook: impl FnOnce() + 'static) {
        self.on_commit.push(Box::new(hook));
    }

    /// Run `hook` if the section is rolled back
    pub fn on_abort(&mut self, hook: impl FnOnce() + 'static) {
        self.on_abort.push(Box::new(hook));
    }

    /// Number of undo records written so far
    pub fn logged(&self) -> usize {
        self.undo.len()
    }

    /// Make every store of the section durable, atomically
    pub fn commit(mut self) -> Result<()> {
        let heap = self.heap;
        heap.crash_point("section.before_commit")?;
        for &(off, len) in &self.touched {
            heap.pool().flush(off, len)?;
        }
        for &(h, extent) in &self.fresh {
            heap.pool().flush(h.offset(), extent)?;
        }
        heap.fence()?;
        heap.crash_point("section.after_commit_flush")?;

        heap.pool().write_u64(log_slot_offset(self.slot), 0)?;
        heap.pool().flush(log_slot_offset(self.slot), 8)?;
        heap.fence()?;
        self.phase = Phase::Committed;

        // Stores are durable from here on: hooks run even if cleanup fails
        let cleanup = self.complete_commit();
        for hook in self.on_commit.drain(..) {
            hook();
        }
        self.on_abort.clear();
        let freed = self.finish();
        cleanup.and(freed)
    }

    fn complete_commit(&self) -> Result<()> {
        let heap = self.heap;
        heap.crash_point("section.after_commit_point")?;
        for &(h, _) in &self.fresh {
            heap.validate(h)?;
        }
        heap.fence()?;
        for &h in &self.deferred {
            heap.invalidate(h)?;
        }
        heap.fence()?;
        trace!(
            slot = self.slot,
            logged = self.undo.len(),
            fresh = self.fresh.len(),
            invalidated = self.deferred.len(),
            "section committed"
        );
        Ok(())
    }

    /// Discard every store of the section
    pub fn abort(self) {}

    fn roll_back(&mut self) -> Result<()> {
        let heap = self.heap;
        for entry in self.undo.iter().rev() {
            heap.pool().write(entry.off, &entry.bytes)?;
            heap.pool().flush(entry.off, entry.bytes.len() as u64)?;
        }
        heap.fence()?;
        heap.pool().write_u64(log_slot_offset(self.slot), 0)?;
        heap.pool().flush(log_slot_offset(self.slot), 8)?;
        heap.fence()?;
        for &(h, _) in &self.fresh {
            heap.invalidate(h)?;
        }
        heap.fence()?;
        trace!(slot = self.slot, restored = self.undo.len(), "section rolled back");
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.phase = Phase::Finished;
        let freed = self.heap.destroy(self.log);
        self.heap.release_log_slot(self.slot);
        freed
    }
}

impl Drop for FailureAtomicSection<'_> {
    fn drop(&mut self) {
        if self.phase == Phase::Open {
            if let Err(e) = self.roll_back() {
                warn!(slot = self.slot, error = %e, "section rollback incomplete; recovery will finish it");
            }
            for hook in self.on_abort.drain(..) {
                hook();
            }
        }
        if self.phase != Phase::Finished {
            if let Err(e) = self.finish() {
                warn!(slot = self.slot, error = %e, "failed to free undo log");
            }
        }
        // Guards drop after the rollback is in place
        self.guards.clear();
    }
}

impl std::fmt::Debug for FailureAtomicSection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureAtomicSection")
            .field("slot", &self.slot)
            .field("logged", &self.undo.len())
            .field("fresh", &self.fresh.len())
            .field("phase", &self.phase)
            .finish()
    }
}
