//! Field values and the conversion matrix
//!
//! A [`Field`] is one field value of a row, in whichever representation it
//! currently lives. [`IntoRepresentation`] converts between
//! representations, consuming the source once:
//!
//! | source \ target      | volatile | durable (unique) | durable (cached) |
//! |----------------------|----------|------------------|------------------|
//! | `VolatileString`     | identity | copy             | intern           |
//! | `DurableString`      | copy     | identity / copy  | identity / intern|
//! | `GeneratedSequence`  | drain    | not implemented  | not implemented  |
//!
//! Identity means the undrained source is handed back unchanged. Durable
//! results built here are unvalidated (unique) or already durable (cached);
//! linking them into a map goes through the update protocol.

use crate::durable_string::{DurableString, Interning};
use nvbench_core::sequence::ByteSequence;
use nvbench_core::{Error, GeneratedSequence, Result, VolatileString};
use nvbench_pmem::Heap;
use std::sync::Arc;

/// Conversions of a byte sequence into another representation
///
/// Representations implement the conversions they can offer; every other
/// conversion fails with [`Error::NotImplemented`].
pub trait IntoRepresentation: ByteSequence + Sized {
    /// Convert into process memory
    fn into_volatile(self) -> Result<VolatileString> {
        Err(Error::NotImplemented("conversion to volatile string"))
    }

    /// Convert into a block of `heap`
    fn into_durable(self, heap: &Arc<Heap>, interning: Interning) -> Result<DurableString> {
        let _ = (heap, interning);
        Err(Error::NotImplemented("conversion to durable string"))
    }
}

impl IntoRepresentation for VolatileString {
    fn into_volatile(mut self) -> Result<VolatileString> {
        if self.is_undrained() {
            return Ok(self);
        }
        Ok(VolatileString::from(self.to_array()?))
    }

    fn into_durable(self, heap: &Arc<Heap>, interning: Interning) -> Result<DurableString> {
        DurableString::new(heap, self.remaining(), interning)
    }
}

impl IntoRepresentation for DurableString {
    fn into_volatile(mut self) -> Result<VolatileString> {
        Ok(VolatileString::from(self.to_array()?))
    }

    fn into_durable(mut self, heap: &Arc<Heap>, interning: Interning) -> Result<DurableString> {
        if self.reusable_on(heap, interning) {
            return Ok(self);
        }
        DurableString::from_sequence(heap, &mut self, interning)
    }
}

impl IntoRepresentation for GeneratedSequence {
    fn into_volatile(mut self) -> Result<VolatileString> {
        Ok(VolatileString::from(self.to_array()?))
    }
}

/// One field value of a row
#[derive(Debug, Clone)]
pub enum Field {
    /// Value in process memory
    Volatile(VolatileString),
    /// Value in a persistent heap
    Durable(DurableString),
}

impl Field {
    /// Copy of the remaining bytes, without consuming them
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match self {
            Field::Volatile(v) => Ok(v.remaining().to_vec()),
            Field::Durable(d) => d.remaining_bytes(),
        }
    }

    /// Lossy text of the remainder, without consuming it
    pub fn to_lossy_string(&self) -> Result<String> {
        match self {
            Field::Volatile(v) => Ok(v.to_lossy_string()),
            Field::Durable(d) => d.to_lossy_string(),
        }
    }

    /// The durable string behind this field, if any
    pub fn as_durable(&self) -> Option<&DurableString> {
        match self {
            Field::Durable(d) => Some(d),
            Field::Volatile(_) => None,
        }
    }

    /// True if the value lives in a persistent heap
    pub fn is_durable(&self) -> bool {
        matches!(self, Field::Durable(_))
    }
}

impl ByteSequence for Field {
    fn has_next(&self) -> bool {
        match self {
            Field::Volatile(v) => v.has_next(),
            Field::Durable(d) => d.has_next(),
        }
    }

    fn next_byte(&mut self) -> Result<u8> {
        match self {
            Field::Volatile(v) => v.next_byte(),
            Field::Durable(d) => d.next_byte(),
        }
    }

    fn bytes_left(&self) -> u64 {
        match self {
            Field::Volatile(v) => v.bytes_left(),
            Field::Durable(d) => d.bytes_left(),
        }
    }

    fn next_buf(&mut self, buf: &mut [u8]) -> usize {
        match self {
            Field::Volatile(v) => v.next_buf(buf),
            Field::Durable(d) => d.next_buf(buf),
        }
    }

    fn reset(&mut self) -> Result<()> {
        match self {
            Field::Volatile(v) => v.reset(),
            Field::Durable(d) => d.reset(),
        }
    }

    fn to_array(&mut self) -> Result<Vec<u8>> {
        match self {
            Field::Volatile(v) => v.to_array(),
            Field::Durable(d) => d.to_array(),
        }
    }

    fn to_text(&mut self) -> Result<Arc<str>> {
        match self {
            Field::Volatile(v) => v.to_text(),
            Field::Durable(d) => d.to_text(),
        }
    }
}

impl IntoRepresentation for Field {
    fn into_volatile(self) -> Result<VolatileString> {
        match self {
            Field::Volatile(v) => v.into_volatile(),
            Field::Durable(d) => d.into_volatile(),
        }
    }

    fn into_durable(self, heap: &Arc<Heap>, interning: Interning) -> Result<DurableString> {
        match self {
            Field::Volatile(v) => v.into_durable(heap, interning),
            Field::Durable(d) => d.into_durable(heap, interning),
        }
    }
}

impl From<VolatileString> for Field {
    fn from(v: VolatileString) -> Self {
        Field::Volatile(v)
    }
}

impl From<DurableString> for Field {
    fn from(d: DurableString) -> Self {
        Field::Durable(d)
    }
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        Field::Volatile(VolatileString::from(s))
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self {
        Field::Volatile(VolatileString::from(s))
    }
}

impl From<Vec<u8>> for Field {
    fn from(b: Vec<u8>) -> Self {
        Field::Volatile(VolatileString::from(b))
    }
}
