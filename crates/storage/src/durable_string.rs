//! Persistent-memory-backed byte sequences
//!
//! A [`DurableString`] names a block in a [`Heap`] and carries its own read
//! cursor. The block outlives the process if it is reachable from a durable
//! root when the process stops; nothing about a `DurableString` itself is
//! persisted beyond its bytes.
//!
//! # Interning
//!
//! One type covers both allocation strategies:
//!
//! - [`Interning::Unique`]: a private block per value. Freshly built values
//!   are *unvalidated* and not yet flushed; the owner flushes, fences and
//!   validates them, usually through the update protocol.
//! - [`Interning::Cached`]: a shared block per distinct content, obtained
//!   from the heap's intern table already validated and durable. Cached
//!   values are never invalidated or destroyed by their users.

use crate::layout::{CACHED_STRING, STRING};
use nvbench_core::sequence::{checked_len, ByteSequence};
use nvbench_core::{Error, Result};
use nvbench_pmem::{BlockHandle, BlockState, Heap, KlassId};
use std::fmt;
use std::sync::Arc;

/// Allocation strategy of a durable string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interning {
    /// One block per value
    Unique,
    /// One shared, interned block per distinct content
    Cached,
}

impl Interning {
    /// Block klass used by this strategy
    pub fn klass(self) -> KlassId {
        match self {
            Interning::Unique => STRING,
            Interning::Cached => CACHED_STRING,
        }
    }
}

const CHUNK: usize = 4096;

/// Byte sequence stored in a persistent heap block
#[derive(Clone)]
pub struct DurableString {
    heap: Arc<Heap>,
    block: BlockHandle,
    len: u64,
    off: u64,
    interning: Interning,
}

impl DurableString {
    /// Store `bytes` in the heap
    ///
    /// A `Unique` result is unvalidated and unflushed; a `Cached` result is
    /// already validated and durable.
    pub fn new(heap: &Arc<Heap>, bytes: &[u8], interning: Interning) -> Result<Self> {
        let len = bytes.len() as u64;
        let block = match interning {
            Interning::Unique => {
                let block = heap.allocate(STRING, len)?;
                if let Err(e) = heap.write_at(block, 0, bytes) {
                    heap.destroy(block)?;
                    return Err(e);
                }
                block
            }
            Interning::Cached => heap.intern(CACHED_STRING, bytes)?,
        };
        Ok(DurableString {
            heap: Arc::clone(heap),
            block,
            len,
            off: 0,
            interning,
        })
    }

    /// Drain `seq` into a new durable string
    ///
    /// `Unique` strings are streamed chunk by chunk without materializing
    /// the whole remainder.
    pub fn from_sequence<S>(heap: &Arc<Heap>, seq: &mut S, interning: Interning) -> Result<Self>
    where
        S: ByteSequence + ?Sized,
    {
        if interning == Interning::Cached {
            let bytes = seq.to_array()?;
            return Self::new(heap, &bytes, interning);
        }
        let len = seq.bytes_left();
        checked_len(len)?;
        let block = heap.allocate(STRING, len)?;
        let streamed = (|| -> Result<()> {
            let mut buf = vec![0u8; CHUNK.min(len as usize)];
            let mut at = 0u64;
            while at < len {
                let want = ((len - at) as usize).min(buf.len());
                let n = seq.next_buf(&mut buf[..want]);
                if n == 0 {
                    return Err(Error::Exhausted);
                }
                heap.write_at(block, at, &buf[..n])?;
                at += n as u64;
            }
            Ok(())
        })();
        if let Err(e) = streamed {
            heap.destroy(block)?;
            return Err(e);
        }
        Ok(DurableString {
            heap: Arc::clone(heap),
            block,
            len,
            off: 0,
            interning,
        })
    }

    /// Reattach to an existing string block, e.g. one found through a row
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if `block` is not a string block.
    pub fn attach(heap: &Arc<Heap>, block: BlockHandle) -> Result<Self> {
        let header = heap.header(block)?;
        let interning = match header.klass {
            STRING => Interning::Unique,
            CACHED_STRING => Interning::Cached,
            other => {
                return Err(Error::corruption(format!(
                    "block {} has klass {}, not a string",
                    block.offset(),
                    other.0
                )))
            }
        };
        Ok(DurableString {
            heap: Arc::clone(heap),
            block,
            len: header.len,
            off: 0,
            interning,
        })
    }

    /// Block holding the bytes
    #[inline]
    pub fn handle(&self) -> BlockHandle {
        self.block
    }

    /// Heap holding the block
    #[inline]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Allocation strategy
    #[inline]
    pub fn interning(&self) -> Interning {
        self.interning
    }

    /// Total length in bytes
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if the string holds no bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if nothing has been consumed yet
    #[inline]
    pub fn is_undrained(&self) -> bool {
        self.off == 0
    }

    /// True if converting this value to `interning` on `heap` can hand it
    /// back unchanged
    pub fn reusable_on(&self, heap: &Arc<Heap>, interning: Interning) -> bool {
        self.off == 0 && self.interning == interning && Arc::ptr_eq(&self.heap, heap)
    }

    /// Lifecycle state of the block
    pub fn state(&self) -> Result<BlockState> {
        Ok(self.heap.header(self.block)?.state)
    }

    /// Copy of the remaining bytes, without consuming them
    pub fn remaining_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; checked_len(self.len - self.off)?];
        self.heap.read_at(self.block, self.off, &mut out)?;
        Ok(out)
    }

    /// Lossy text of the remainder, without consuming it
    pub fn to_lossy_string(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.remaining_bytes()?).into_owned())
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Schedule the block for write-back (no fence)
    pub fn flush(&self) -> Result<()> {
        self.heap.flush_block(self.block)
    }

    /// Mark the block validated (no fence)
    pub fn validate(&self) -> Result<()> {
        self.heap.validate(self.block)
    }

    /// Flush, fence, validate, fence: the value is crash-safe on return
    pub fn persist(&self) -> Result<()> {
        self.flush()?;
        self.heap.fence()?;
        self.validate()?;
        self.heap.fence()
    }

    /// Mark the block reclaimable (no fence)
    ///
    /// Returns `false` if it was already invalidated, and always for
    /// `Cached` strings, whose blocks are shared.
    pub fn invalidate(&self) -> Result<bool> {
        match self.interning {
            Interning::Unique => self.heap.invalidate(self.block),
            Interning::Cached => Ok(false),
        }
    }

    /// Free a value that was never published
    pub fn destroy(self) -> Result<()> {
        match self.interning {
            Interning::Unique => self.heap.destroy(self.block),
            Interning::Cached => Ok(()),
        }
    }
}

impl ByteSequence for DurableString {
    #[inline]
    fn has_next(&self) -> bool {
        self.off < self.len
    }

    fn next_byte(&mut self) -> Result<u8> {
        if self.off >= self.len {
            return Err(Error::Exhausted);
        }
        let mut b = [0u8; 1];
        self.heap.read_at(self.block, self.off, &mut b)?;
        self.off += 1;
        Ok(b[0])
    }

    #[inline]
    fn bytes_left(&self) -> u64 {
        self.len - self.off
    }

    fn next_buf(&mut self, buf: &mut [u8]) -> usize {
        let n = (self.bytes_left() as usize).min(buf.len());
        match self.heap.read_at(self.block, self.off, &mut buf[..n]) {
            Ok(()) => {
                self.off += n as u64;
                n
            }
            Err(_) => 0,
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.off = 0;
        Ok(())
    }

    fn to_array(&mut self) -> Result<Vec<u8>> {
        let out = self.remaining_bytes()?;
        self.off = self.len;
        Ok(out)
    }
}

impl fmt::Debug for DurableString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableString")
            .field("block", &self.block.offset())
            .field("len", &self.len)
            .field("off", &self.off)
            .field("interning", &self.interning)
            .finish()
    }
}
