//! The update protocol
//!
//! Every ordering constraint between flushes, fences, pointer stores and
//! invalidations lives here. Map operations describe *what* to store;
//! [`UpdateProtocol`] decides *when* it becomes durable.
//!
//! ```text
//! insert:  build ─ flush ─ FENCE ─ link ─ FENCE ─ validate ─ FENCE ─ [retire]
//! update:  FENCE ─ replace ─ FENCE ─ invalidate old ─ FENCE
//! remove:  unlink ─ FENCE ─ invalidate ─ FENCE
//! ```
//!
//! Each step announces a named crash point, so tests can stop an operation
//! between any two adjacent steps and check what recovery sees.
//!
//! # Failure
//!
//! A failed fence surfaces as [`Error::Durability`] and the protocol stops
//! where it is: nothing after the failed step is stored.
//!
//! [`Error::Durability`]: nvbench_core::Error::Durability

use nvbench_core::Result;
use nvbench_pmem::{BlockHandle, Heap};
use tracing::trace;

/// Crash points of the insert sequence
pub mod insert {
    /// Blocks written, nothing flushed
    pub const AFTER_POPULATE: &str = "insert.after_populate";
    /// Blocks flushed, not fenced
    pub const AFTER_FLUSH: &str = "insert.after_flush";
    /// Link stored and flushed, not fenced
    pub const AFTER_LINK: &str = "insert.after_link";
    /// Link durable, blocks still unvalidated
    pub const AFTER_LINK_FENCE: &str = "insert.after_link_fence";
    /// Blocks validated and durable
    pub const AFTER_VALIDATE: &str = "insert.after_validate";
    /// Superseded row invalidated
    pub const AFTER_RETIRE: &str = "insert.after_retire";
}

/// Crash points of the update sequence
pub mod update {
    /// New values durable, nothing replaced
    pub const AFTER_PREFENCE: &str = "update.after_prefence";
    /// Value references replaced and flushed, not fenced
    pub const AFTER_REPLACE: &str = "update.after_replace";
    /// Replacement durable, old values still valid
    pub const AFTER_REPLACE_FENCE: &str = "update.after_replace_fence";
    /// Relocated row container flushed, not fenced
    pub const GROW_AFTER_FLUSH: &str = "update.grow_after_flush";
    /// Relocated row linked, not fenced
    pub const GROW_AFTER_LINK: &str = "update.grow_after_link";
    /// Relocated row link durable
    pub const GROW_AFTER_LINK_FENCE: &str = "update.grow_after_link_fence";
    /// Relocated row validated
    pub const GROW_AFTER_VALIDATE: &str = "update.grow_after_validate";
    /// Old values invalidated
    pub const AFTER_INVALIDATE: &str = "update.after_invalidate";
}

/// Crash points of the remove sequence
pub mod remove {
    /// Chain pointer bypasses the entry, not fenced
    pub const AFTER_UNLINK: &str = "remove.after_unlink";
    /// Unlink durable, entry still valid
    pub const AFTER_UNLINK_FENCE: &str = "remove.after_unlink_fence";
    /// Entry, key and row container invalidated
    pub const AFTER_INVALIDATE: &str = "remove.after_invalidate";
}

/// Crash point names of one publish sequence
#[derive(Debug, Clone, Copy)]
pub struct PublishPoints {
    /// Flushed, not fenced
    pub after_flush: &'static str,
    /// Linked, not fenced
    pub after_link: &'static str,
    /// Link durable
    pub after_link_fence: &'static str,
    /// Validated and durable
    pub after_validate: &'static str,
}

/// Points of a row insert
pub const INSERT: PublishPoints = PublishPoints {
    after_flush: insert::AFTER_FLUSH,
    after_link: insert::AFTER_LINK,
    after_link_fence: insert::AFTER_LINK_FENCE,
    after_validate: insert::AFTER_VALIDATE,
};

/// Points of a row container relocation
pub const GROW: PublishPoints = PublishPoints {
    after_flush: update::GROW_AFTER_FLUSH,
    after_link: update::GROW_AFTER_LINK,
    after_link_fence: update::GROW_AFTER_LINK_FENCE,
    after_validate: update::GROW_AFTER_VALIDATE,
};

/// Ordered durability steps over one heap
#[derive(Clone, Copy)]
pub struct UpdateProtocol<'h> {
    heap: &'h Heap,
}

impl<'h> UpdateProtocol<'h> {
    /// Protocol over `heap`
    pub fn new(heap: &'h Heap) -> Self {
        UpdateProtocol { heap }
    }

    /// Make freshly built blocks reachable
    ///
    /// Flushes `blocks`, fences, runs `link` (which must store and flush the
    /// one pointer that makes them reachable), fences, validates `blocks`
    /// and fences again. A crash before the link fence leaves the blocks
    /// unreachable; a crash after it leaves them reachable and rolled
    /// forward by recovery.
    pub fn publish<F>(&self, blocks: &[BlockHandle], points: &PublishPoints, link: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let heap = self.heap;
        for &b in blocks {
            heap.flush_block(b)?;
        }
        heap.crash_point(points.after_flush)?;
        heap.fence()?;
        trace!(blocks = blocks.len(), "publish: blocks durable");

        link()?;
        heap.crash_point(points.after_link)?;
        heap.fence()?;
        heap.crash_point(points.after_link_fence)?;
        trace!("publish: link durable");

        for &b in blocks {
            heap.validate(b)?;
        }
        heap.fence()?;
        heap.crash_point(points.after_validate)?;
        trace!("publish: validated");
        Ok(())
    }

    /// Fence before swapping in values built earlier
    pub fn prefence(&self) -> Result<()> {
        self.heap.fence()?;
        self.heap.crash_point(update::AFTER_PREFENCE)
    }

    /// Replace value references
    ///
    /// `store` writes and flushes each reference word. The replacement is
    /// durable when this returns.
    pub fn replace<F>(&self, store: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        store()?;
        self.heap.crash_point(update::AFTER_REPLACE)?;
        self.heap.fence()?;
        self.heap.crash_point(update::AFTER_REPLACE_FENCE)?;
        trace!("replace: references durable");
        Ok(())
    }

    /// Bypass an entry in its chain
    ///
    /// `store` writes and flushes the predecessor pointer. The unlink is
    /// durable when this returns.
    pub fn unlink<F>(&self, store: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        store()?;
        self.heap.crash_point(remove::AFTER_UNLINK)?;
        self.heap.fence()?;
        self.heap.crash_point(remove::AFTER_UNLINK_FENCE)?;
        trace!("unlink: durable");
        Ok(())
    }

    /// Invalidate superseded blocks and fence
    ///
    /// Call only once nothing durable references `old`. Blocks that are
    /// already invalidated, and interned blocks, are skipped. Returns how
    /// many blocks changed state.
    pub fn retire(&self, old: &[BlockHandle], point: &'static str) -> Result<usize> {
        let mut retired = 0;
        for &h in old {
            if self.heap.invalidate(h)? {
                retired += 1;
            }
        }
        self.heap.fence()?;
        self.heap.crash_point(point)?;
        trace!(retired, "retire: old blocks invalidated");
        Ok(retired)
    }
}
