//! Persistent block heap
//!
//! [`Heap`] carves the pool into typed blocks and owns their lifecycle:
//!
//! ```text
//! allocate ──> Unvalidated ──validate──> Validated ──invalidate──> Invalidated
//!                  │                                                   │
//!                  └──────destroy──────> Free <──────reclaim───────────┘
//! ```
//!
//! Allocation persists the new header before returning, so a block that a
//! caller can see is always found by recovery. Everything else is the
//! caller's to flush and fence.
//!
//! # Deferred reclamation
//!
//! `invalidate` only marks a block. Its bytes stay readable, and its space
//! is not reused, until [`Heap::reclaim`] runs at a point where no reader
//! can still hold the handle. Lock-free readers rely on this.
//!
//! # Locking
//!
//! Header transitions, the free list and the limbo list are guarded by one
//! allocator mutex. The intern table is a `DashMap`; a miss allocates while
//! holding the table's shard lock (shard lock, then allocator lock, never
//! the reverse).

use crate::config::PmemConfig;
use crate::fault::FaultInjector;
use crate::klass::KlassRegistry;
use crate::layout::{
    capacity_for, root_offset, BlockHandle, BlockHeader, BlockState, KlassId, BLOCK_ALIGN,
    BLOCK_HEADER, HEAP_START, MAX_BLOCK_CAPACITY, ROOT_SLOTS,
};
use crate::pool::{Pool, PoolStats};
use crate::recovery::RecoveryReport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nvbench_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct AllocState {
    /// First byte past the last block
    pub(crate) top: u64,
    /// Free blocks by capacity
    pub(crate) free: BTreeMap<u64, Vec<u64>>,
    /// Invalidated blocks awaiting `reclaim`
    pub(crate) limbo: Vec<BlockHandle>,
}

impl AllocState {
    fn new() -> Self {
        AllocState {
            top: HEAP_START,
            free: BTreeMap::new(),
            limbo: Vec::new(),
        }
    }

    pub(crate) fn push_free(&mut self, h: BlockHandle, capacity: u64) {
        self.free.entry(capacity).or_default().push(h.offset());
    }

    /// Smallest free block of at least `cap` bytes and at most twice that
    fn take_free(&mut self, cap: u64) -> Option<(u64, u64)> {
        let capacity = *self.free.range(cap..=cap.saturating_mul(2)).next()?.0;
        let offsets = self.free.get_mut(&capacity)?;
        let off = offsets.pop()?;
        if offsets.is_empty() {
            self.free.remove(&capacity);
        }
        Some((off, capacity))
    }
}

#[derive(Default)]
struct Counters {
    allocations: AtomicU64,
    validations: AtomicU64,
    invalidations: AtomicU64,
    destroyed: AtomicU64,
    reclaimed: AtomicU64,
}

/// Heap counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Blocks handed out by `allocate`
    pub allocations: u64,
    /// Unvalidated blocks marked validated
    pub validations: u64,
    /// Blocks marked invalidated
    pub invalidations: u64,
    /// Blocks freed by `destroy`
    pub destroyed: u64,
    /// Invalidated blocks freed by `reclaim`
    pub reclaimed: u64,
    /// Bytes between the heap start and the end of the last block
    pub used_bytes: u64,
    /// Pool counters
    pub pool: PoolStats,
}

/// Typed block heap over a [`Pool`]
pub struct Heap {
    pub(crate) pool: Pool,
    pub(crate) klasses: KlassRegistry,
    pub(crate) alloc: Mutex<AllocState>,
    pub(crate) interned: DashMap<(KlassId, Box<[u8]>), BlockHandle>,
    slots: Mutex<Vec<bool>>,
    slot_freed: Condvar,
    counters: Counters,
}

impl Heap {
    /// Open the heap described by `config`, recovering it if it was loaded
    /// from an existing image
    pub fn open(config: PmemConfig, klasses: KlassRegistry) -> Result<(Arc<Heap>, RecoveryReport)> {
        Self::attach(Pool::open(config)?, klasses)
    }

    /// Restart from a media image (typically [`Heap::crash_image`])
    pub fn from_image(
        config: PmemConfig,
        image: Vec<u8>,
        klasses: KlassRegistry,
    ) -> Result<(Arc<Heap>, RecoveryReport)> {
        Self::attach(Pool::from_image(config, image)?, klasses)
    }

    fn attach(pool: Pool, klasses: KlassRegistry) -> Result<(Arc<Heap>, RecoveryReport)> {
        let slots = pool.config().log_slots;
        let heap = Heap {
            pool,
            klasses,
            alloc: Mutex::new(AllocState::new()),
            interned: DashMap::new(),
            slots: Mutex::new(vec![false; slots]),
            slot_freed: Condvar::new(),
            counters: Counters::default(),
        };
        let report = if heap.pool.is_fresh() {
            RecoveryReport::default()
        } else {
            heap.recover()?
        };
        info!(
            size = heap.pool.size(),
            fresh = heap.pool.is_fresh(),
            ?report,
            "heap opened"
        );
        Ok((Arc::new(heap), report))
    }

    /// Klass table this heap was opened with
    pub fn klasses(&self) -> &KlassRegistry {
        &self.klasses
    }

    /// Underlying pool
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Fault injector of the underlying pool
    pub fn faults(&self) -> &FaultInjector {
        self.pool.faults()
    }

    /// Announce a named protocol step to the fault injector
    #[inline]
    pub fn crash_point(&self, point: &'static str) -> Result<()> {
        self.pool.faults().check(point)
    }

    /// Media image as a crash right now would leave it
    pub fn crash_image(&self) -> Vec<u8> {
        self.pool.media_image()
    }

    // ========================================================================
    // Block lifecycle
    // ========================================================================

    /// Read and decode a block header
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if `h` does not point at a block header.
    pub fn header(&self, h: BlockHandle) -> Result<BlockHeader> {
        let off = h.offset();
        if off < HEAP_START || off % BLOCK_ALIGN != 0 {
            return Err(Error::corruption(format!("invalid block handle {}", off)));
        }
        let mut raw = [0u8; BLOCK_HEADER as usize];
        self.pool.read_into(off, &mut raw)?;
        BlockHeader::decode(off, &raw)?
            .ok_or_else(|| Error::corruption(format!("no block at offset {}", off)))
    }

    pub(crate) fn store_header(&self, h: BlockHandle, header: &BlockHeader) -> Result<()> {
        self.pool.write(h.offset(), &header.encode())?;
        self.pool.flush(h.offset(), BLOCK_HEADER)
    }

    /// Allocate an unvalidated block with room for `len` payload bytes
    ///
    /// The header is durable when this returns. A reused block's payload
    /// reads as zeros.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when neither the free list nor the unused
    /// tail can hold the block; [`Error::InvalidConfig`] for an
    /// unregistered klass; [`Error::Capacity`] for a payload larger than
    /// [`MAX_BLOCK_CAPACITY`].
    pub fn allocate(&self, klass: KlassId, len: u64) -> Result<BlockHandle> {
        if !self.klasses.contains(klass) {
            return Err(Error::invalid_config(format!(
                "allocation with unregistered klass {}",
                klass.0
            )));
        }
        if len > MAX_BLOCK_CAPACITY {
            return Err(Error::Capacity {
                requested: len,
                limit: MAX_BLOCK_CAPACITY,
            });
        }
        let cap = capacity_for(len);
        let mut alloc = self.alloc.lock();
        let (off, capacity, reused) = match alloc.take_free(cap) {
            Some((off, capacity)) => (off, capacity, true),
            None => {
                let needed = BLOCK_HEADER + cap;
                let available = self.pool.size() - alloc.top;
                if needed > available {
                    debug!(needed, available, "heap exhausted");
                    return Err(Error::OutOfMemory {
                        requested: needed,
                        available,
                    });
                }
                let off = alloc.top;
                alloc.top += needed;
                (off, cap, false)
            }
        };
        let h = BlockHandle::from_offset(off);
        let header = BlockHeader {
            state: BlockState::Unvalidated,
            klass,
            capacity,
            len,
        };
        let published = (|| -> Result<()> {
            if reused {
                self.pool.zero(h.payload(), capacity)?;
            }
            self.pool.write(off, &header.encode())?;
            let flushed = if reused { header.extent() } else { BLOCK_HEADER };
            self.pool.persist(off, flushed)
        })();
        if let Err(e) = published {
            if reused {
                alloc.push_free(h, capacity);
            } else if alloc.top == off + BLOCK_HEADER + capacity {
                alloc.top = off;
            }
            return Err(e);
        }
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(h)
    }

    /// Mark a block validated and flush its header (no fence)
    ///
    /// Validating a validated block is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] for an invalidated or free block.
    pub fn validate(&self, h: BlockHandle) -> Result<()> {
        let _alloc = self.alloc.lock();
        let mut header = self.header(h)?;
        match header.state {
            BlockState::Validated => Ok(()),
            BlockState::Unvalidated => {
                header.state = BlockState::Validated;
                self.store_header(h, &header)?;
                self.counters.validations.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            state => Err(Error::corruption(format!(
                "validate of {:?} block at {}",
                state,
                h.offset()
            ))),
        }
    }

    /// Mark a block invalidated and flush its header (no fence)
    ///
    /// Returns `false`, changing nothing, if the block is already
    /// invalidated or free, or if its klass is interned.
    pub fn invalidate(&self, h: BlockHandle) -> Result<bool> {
        let mut alloc = self.alloc.lock();
        let mut header = self.header(h)?;
        if self.klasses.is_interned(header.klass) {
            return Ok(false);
        }
        match header.state {
            BlockState::Invalidated | BlockState::Free => Ok(false),
            BlockState::Unvalidated | BlockState::Validated => {
                header.state = BlockState::Invalidated;
                self.store_header(h, &header)?;
                alloc.limbo.push(h);
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
        }
    }

    /// Free a block immediately
    ///
    /// For blocks nothing else can reference, such as the allocations of an
    /// aborted operation. Invalidated blocks are left for `reclaim`.
    pub fn destroy(&self, h: BlockHandle) -> Result<()> {
        let mut alloc = self.alloc.lock();
        let mut header = self.header(h)?;
        match header.state {
            BlockState::Free | BlockState::Invalidated => Ok(()),
            BlockState::Unvalidated | BlockState::Validated => {
                header.state = BlockState::Free;
                self.store_header(h, &header)?;
                alloc.push_free(h, header.capacity);
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Free every invalidated block
    ///
    /// Call only when no reader can still hold a handle to an invalidated
    /// block. Returns the number of blocks freed.
    pub fn reclaim(&self) -> Result<usize> {
        let mut alloc = self.alloc.lock();
        let limbo = std::mem::take(&mut alloc.limbo);
        for &h in &limbo {
            let mut header = self.header(h)?;
            header.state = BlockState::Free;
            self.store_header(h, &header)?;
            alloc.push_free(h, header.capacity);
        }
        if !limbo.is_empty() {
            self.pool.fence()?;
        }
        self.counters
            .reclaimed
            .fetch_add(limbo.len() as u64, Ordering::Relaxed);
        debug!(count = limbo.len(), "reclaimed invalidated blocks");
        Ok(limbo.len())
    }

    /// Number of invalidated blocks awaiting `reclaim`
    pub fn limbo_len(&self) -> usize {
        self.alloc.lock().limbo.len()
    }

    // ========================================================================
    // Payload access
    // ========================================================================

    fn check_payload(&self, h: BlockHandle, off: u64, len: u64) -> Result<BlockHeader> {
        let header = self.header(h)?;
        match off.checked_add(len) {
            Some(end) if end <= header.capacity => Ok(header),
            _ => Err(Error::corruption(format!(
                "payload access [{}, +{}) beyond capacity {} of block {}",
                off,
                len,
                header.capacity,
                h.offset()
            ))),
        }
    }

    /// Payload length recorded in the header
    pub fn payload_len(&self, h: BlockHandle) -> Result<u64> {
        Ok(self.header(h)?.len)
    }

    /// Copy of the first `len` payload bytes, `len` taken from the header
    pub fn read_payload(&self, h: BlockHandle) -> Result<Vec<u8>> {
        let header = self.header(h)?;
        self.pool.read(h.payload(), header.len)
    }

    /// Copy `buf.len()` payload bytes starting at `off`
    pub fn read_at(&self, h: BlockHandle, off: u64, buf: &mut [u8]) -> Result<()> {
        self.check_payload(h, off, buf.len() as u64)?;
        self.pool.read_into(h.payload() + off, buf)
    }

    /// Store payload bytes at `off` (cache only)
    pub fn write_at(&self, h: BlockHandle, off: u64, bytes: &[u8]) -> Result<()> {
        self.check_payload(h, off, bytes.len() as u64)?;
        self.pool.write(h.payload() + off, bytes)
    }

    /// Load payload word `index`
    pub fn read_word(&self, h: BlockHandle, index: u64) -> Result<u64> {
        let mut word = [0u8; 8];
        self.read_at(h, index * 8, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    /// Store payload word `index` (cache only)
    pub fn write_word(&self, h: BlockHandle, index: u64, value: u64) -> Result<()> {
        self.write_at(h, index * 8, &value.to_le_bytes())
    }

    /// Update the payload length in the header (cache only)
    pub fn set_len(&self, h: BlockHandle, len: u64) -> Result<()> {
        self.check_payload(h, 0, len)?;
        self.pool.write_u64(h.offset() + 8, len)
    }

    /// Flush header and whole payload of a block
    pub fn flush_block(&self, h: BlockHandle) -> Result<()> {
        let header = self.header(h)?;
        self.pool.flush(h.offset(), header.extent())
    }

    /// Flush a payload range
    pub fn flush_at(&self, h: BlockHandle, off: u64, len: u64) -> Result<()> {
        self.check_payload(h, off, len)?;
        self.pool.flush(h.payload() + off, len)
    }

    /// Make every flushed line durable
    pub fn fence(&self) -> Result<()> {
        self.pool.fence()
    }

    // ========================================================================
    // Roots
    // ========================================================================

    fn check_root(slot: usize) -> Result<()> {
        if slot >= ROOT_SLOTS {
            return Err(Error::invalid_config(format!(
                "root slot {} out of range (max {})",
                slot,
                ROOT_SLOTS - 1
            )));
        }
        Ok(())
    }

    /// Durable root pointer `slot`
    pub fn root(&self, slot: usize) -> Result<Option<BlockHandle>> {
        Self::check_root(slot)?;
        let raw = self.pool.read_u64(root_offset(slot))?;
        Ok((raw != 0).then(|| BlockHandle::from_offset(raw)))
    }

    /// Replace root pointer `slot` and make the change durable
    pub fn set_root(&self, slot: usize, target: Option<BlockHandle>) -> Result<()> {
        Self::check_root(slot)?;
        let raw = target.map(BlockHandle::offset).unwrap_or(0);
        self.pool.write_u64(root_offset(slot), raw)?;
        self.pool.persist(root_offset(slot), 8)
    }

    // ========================================================================
    // Interning
    // ========================================================================

    /// Validated, durable block of klass `klass` holding exactly `bytes`,
    /// shared by every caller asking for the same content
    pub fn intern(&self, klass: KlassId, bytes: &[u8]) -> Result<BlockHandle> {
        if !self.klasses.is_interned(klass) {
            return Err(Error::invalid_config(format!(
                "klass {} is not interned",
                klass.0
            )));
        }
        match self.interned.entry((klass, Box::from(bytes))) {
            Entry::Occupied(e) => Ok(*e.get()),
            Entry::Vacant(v) => {
                let h = self.allocate(klass, bytes.len() as u64)?;
                let published = (|| -> Result<()> {
                    self.write_at(h, 0, bytes)?;
                    self.flush_block(h)?;
                    self.validate(h)?;
                    self.fence()
                })();
                if let Err(e) = published {
                    self.destroy(h)?;
                    return Err(e);
                }
                v.insert(h);
                Ok(h)
            }
        }
    }

    /// Number of interned blocks
    pub fn interned_len(&self) -> usize {
        self.interned.len()
    }

    // ========================================================================
    // Undo-log slots
    // ========================================================================

    /// Claim a free undo-log slot, waiting for one if all are busy
    pub(crate) fn acquire_log_slot(&self) -> usize {
        let mut busy = self.slots.lock();
        loop {
            if let Some(slot) = busy.iter().position(|b| !*b) {
                busy[slot] = true;
                return slot;
            }
            self.slot_freed.wait(&mut busy);
        }
    }

    pub(crate) fn release_log_slot(&self, slot: usize) {
        if let Some(busy) = self.slots.lock().get_mut(slot) {
            *busy = false;
        }
        self.slot_freed.notify_one();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reclaim invalidated blocks and write the media image to the backing
    /// file, if any
    pub fn close(&self) -> Result<()> {
        self.reclaim()?;
        self.pool.sync_to_file()?;
        info!(stats = ?self.stats(), "heap closed");
        Ok(())
    }

    /// Counters since open
    pub fn stats(&self) -> HeapStats {
        let used_bytes = self.alloc.lock().top - HEAP_START;
        HeapStats {
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            validations: self.counters.validations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
            used_bytes,
            pool: self.pool.stats(),
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("pool", &self.pool)
            .field("interned", &self.interned.len())
            .finish()
    }
}
