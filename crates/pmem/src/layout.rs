//! On-media layout of the pool
//!
//! ```text
//! 0        8                      136        256              512
//! +--------+----------------------+----------+----------------+-------------
//! | magic  | root slots (16 x 8)  | reserved | log slots (32) | blocks ...
//! +--------+----------------------+----------+----------------+-------------
//! ```
//!
//! Every block starts with a 16-byte header:
//!
//! ```text
//! word 0: state (8 bits) | klass (16 bits) | tag (8 bits) | capacity (32 bits)
//! word 1: payload length in bytes
//! ```
//!
//! Blocks are laid out back to back from [`HEAP_START`]; a zero header word
//! marks the end of the allocated region. All multi-byte values are
//! little-endian, and every pointer slot is 8-byte aligned so that a single
//! 8-byte store replaces it atomically.

use nvbench_core::{Error, Result};

/// Simulated cache line size
pub const CACHE_LINE: u64 = 64;

/// Pool magic ("NVBPOOL1")
pub const POOL_MAGIC: u64 = u64::from_le_bytes(*b"NVBPOOL1");

/// Offset of the magic word
pub const MAGIC_OFFSET: u64 = 0;

/// Number of durable root pointers
pub const ROOT_SLOTS: usize = 16;

/// Offset of the first root pointer
pub const ROOTS_OFFSET: u64 = 8;

/// Maximum number of concurrently active undo logs
pub const MAX_LOG_SLOTS: usize = 32;

/// Offset of the first undo-log slot
pub const LOG_SLOTS_OFFSET: u64 = 256;

/// First block offset
pub const HEAP_START: u64 = 512;

/// Block header size
pub const BLOCK_HEADER: u64 = 16;

/// Block alignment (header and capacity)
pub const BLOCK_ALIGN: u64 = 16;

/// Largest block capacity the 32-bit header field can hold
pub const MAX_BLOCK_CAPACITY: u64 = (1 << 32) - BLOCK_ALIGN;

const HEADER_TAG: u64 = 0xB1;

/// Lifecycle state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// On a free list
    Free,
    /// Allocated; contents not yet guaranteed crash-safe
    Unvalidated,
    /// Live and crash-safe
    Validated,
    /// Logically freed, waiting for reclamation
    Invalidated,
}

impl BlockState {
    fn to_bits(self) -> u64 {
        match self {
            BlockState::Free => 1,
            BlockState::Unvalidated => 2,
            BlockState::Validated => 3,
            BlockState::Invalidated => 4,
        }
    }

    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            1 => Some(BlockState::Free),
            2 => Some(BlockState::Unvalidated),
            3 => Some(BlockState::Validated),
            4 => Some(BlockState::Invalidated),
            _ => None,
        }
    }
}

/// Type tag of a block, resolved through the klass registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KlassId(pub u16);

/// Offset of a block header inside the pool
///
/// Handles are stable across restarts; they are what persistent pointers
/// hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHandle(u64);

impl BlockHandle {
    /// Wrap a raw offset (no validation)
    #[inline]
    pub const fn from_offset(offset: u64) -> Self {
        BlockHandle(offset)
    }

    /// Raw offset of the header, as stored in persistent pointers
    #[inline]
    pub const fn offset(self) -> u64 {
        self.0
    }

    /// Offset of the first payload byte
    #[inline]
    pub const fn payload(self) -> u64 {
        self.0 + BLOCK_HEADER
    }
}

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Lifecycle state
    pub state: BlockState,
    /// Type tag
    pub klass: KlassId,
    /// Usable payload bytes
    pub capacity: u64,
    /// Payload bytes in use
    pub len: u64,
}

impl BlockHeader {
    /// Total footprint including the header
    #[inline]
    pub fn extent(&self) -> u64 {
        BLOCK_HEADER + self.capacity
    }

    /// Encode the first header word
    pub fn word0(&self) -> u64 {
        self.state.to_bits()
            | (self.klass.0 as u64) << 8
            | HEADER_TAG << 24
            | self.capacity << 32
    }

    /// Encode the full 16-byte header
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.word0().to_le_bytes());
        out[8..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decode a header; `Ok(None)` for the all-zero end marker
    pub fn decode(at: u64, bytes: &[u8; 16]) -> Result<Option<Self>> {
        let word0 = le_u64(&bytes[..8]);
        if word0 == 0 {
            return Ok(None);
        }
        if (word0 >> 24) & 0xFF != HEADER_TAG {
            return Err(Error::corruption(format!(
                "bad block tag at offset {}",
                at
            )));
        }
        let state = BlockState::from_bits(word0 & 0xFF).ok_or_else(|| {
            Error::corruption(format!("bad block state at offset {}", at))
        })?;
        let len = le_u64(&bytes[8..]);
        Ok(Some(BlockHeader {
            state,
            klass: KlassId(((word0 >> 8) & 0xFFFF) as u16),
            capacity: word0 >> 32,
            len,
        }))
    }
}

/// Round a payload length up to a block capacity
#[inline]
pub fn capacity_for(len: u64) -> u64 {
    let len = len.max(BLOCK_ALIGN);
    (len + BLOCK_ALIGN - 1) / BLOCK_ALIGN * BLOCK_ALIGN
}

/// Offset of root slot `slot`
#[inline]
pub fn root_offset(slot: usize) -> u64 {
    ROOTS_OFFSET + 8 * slot as u64
}

/// Offset of undo-log slot `slot`
#[inline]
pub fn log_slot_offset(slot: usize) -> u64 {
    LOG_SLOTS_OFFSET + 8 * slot as u64
}

/// Decode a little-endian word from the first 8 bytes of `bytes`
#[inline]
pub fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

/// Iterate the little-endian words of a payload
pub fn words(payload: &[u8]) -> impl Iterator<Item = u64> + '_ {
    payload.chunks_exact(8).map(le_u64)
}
