//! Persistent block types of the storage layer
//!
//! ```text
//! BUCKETS     [n] [head_0] ... [head_{n-1}]          heads: MAP_ENTRY or 0
//! MAP_ENTRY   [key] [row] [next]                     STRING, ROW, MAP_ENTRY or 0
//! ROW         [count] { [name] [value] } * capacity  CACHED_STRING, STRING
//! STRING      raw bytes
//! CACHED_STRING raw bytes, interned
//! ```
//!
//! Every pointer is a whole 8-byte word so that one store replaces it.

use nvbench_core::Result;
use nvbench_pmem::layout::words;
use nvbench_pmem::{KlassId, KlassInfo, KlassRegistry, Refs};

/// Field values and map keys
pub const STRING: KlassId = KlassId(16);
/// Field names (interned)
pub const CACHED_STRING: KlassId = KlassId(17);
/// Row containers
pub const ROW: KlassId = KlassId(18);
/// Hash-chain entries of a map
pub const MAP_ENTRY: KlassId = KlassId(19);
/// Bucket array of a map
pub const BUCKETS: KlassId = KlassId(20);

/// Entry word holding the key string
pub const ENTRY_KEY: u64 = 0;
/// Entry word holding the row container
pub const ENTRY_ROW: u64 = 1;
/// Entry word holding the next entry in the chain
pub const ENTRY_NEXT: u64 = 2;
/// Payload length of an entry
pub const ENTRY_LEN: u64 = 24;

/// Row word holding the number of used slots
pub const ROW_COUNT: u64 = 0;

/// Word index of the name of row slot `i`
#[inline]
pub const fn row_name_word(i: u64) -> u64 {
    1 + 2 * i
}

/// Word index of the value of row slot `i`
#[inline]
pub const fn row_value_word(i: u64) -> u64 {
    2 + 2 * i
}

/// Payload length of a row container with `capacity` slots
#[inline]
pub const fn row_len(capacity: u64) -> u64 {
    8 + 16 * capacity
}

/// Slot capacity of a row container with payload length `len`
#[inline]
pub const fn row_capacity(len: u64) -> u64 {
    len.saturating_sub(8) / 16
}

/// Word index of bucket `i`'s chain head
#[inline]
pub const fn bucket_word(i: u64) -> u64 {
    1 + i
}

/// Payload length of a bucket array with `n` buckets
#[inline]
pub const fn buckets_len(n: u64) -> u64 {
    8 + 8 * n
}

fn trace_entry(payload: &[u8]) -> Refs {
    words(payload).take(ENTRY_LEN as usize / 8).collect()
}

fn trace_row(payload: &[u8]) -> Refs {
    let mut all = words(payload);
    let count = all.next().unwrap_or(0) as usize;
    all.take(2 * count).collect()
}

fn trace_buckets(payload: &[u8]) -> Refs {
    let mut all = words(payload);
    let n = all.next().unwrap_or(0) as usize;
    all.take(n).collect()
}

/// Register the storage klasses
pub fn register(registry: &mut KlassRegistry) -> Result<()> {
    registry.register(STRING, KlassInfo::leaf("string"))?;
    registry.register(CACHED_STRING, KlassInfo::interned("cached-string"))?;
    registry.register(ROW, KlassInfo::node("row", trace_row))?;
    registry.register(MAP_ENTRY, KlassInfo::node("map-entry", trace_entry))?;
    registry.register(BUCKETS, KlassInfo::node("buckets", trace_buckets))?;
    Ok(())
}

/// Heap registry with the storage klasses
pub fn registry() -> Result<KlassRegistry> {
    let mut registry = KlassRegistry::new();
    register(&mut registry)?;
    Ok(registry)
}
