//! Heap-backed byte sequences
//!
//! [`VolatileString`] owns an immutable, reference-counted buffer in ordinary
//! process memory. Clones share the buffer and carry their own cursor, so
//! copying one is cheap and never copies bytes. Contents live as long as the
//! process; nothing here is durable.

use crate::error::{Error, Result};
use crate::sequence::{checked_len, decode_text, ByteSequence};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Clone)]
enum Buffer {
    Text(Arc<str>),
    Bytes(Arc<[u8]>),
}

impl Buffer {
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        match self {
            Buffer::Text(s) => s.as_bytes(),
            Buffer::Bytes(b) => b,
        }
    }
}

/// Byte sequence over a shared in-process buffer
///
/// Equality, hashing and ordering look at the remaining (undrained) bytes
/// only, and agree with `[u8]`, so a `VolatileString` can key a map that is
/// probed with plain byte slices.
#[derive(Clone)]
pub struct VolatileString {
    buf: Buffer,
    off: usize,
}

impl VolatileString {
    /// Wrap text without copying it
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        VolatileString {
            buf: Buffer::Text(text.into()),
            off: 0,
        }
    }

    /// Wrap raw bytes (not necessarily UTF-8)
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        VolatileString {
            buf: Buffer::Bytes(bytes.into()),
            off: 0,
        }
    }

    /// Every byte, consumed or not
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    /// Bytes not yet consumed
    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.buf.as_bytes()[self.off..]
    }

    /// Total length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.as_bytes().len()
    }

    /// True if the buffer holds no bytes at all
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if nothing has been consumed yet
    #[inline]
    pub fn is_undrained(&self) -> bool {
        self.off == 0
    }

    /// True if both values share one backing buffer
    pub fn shares_buffer(&self, other: &VolatileString) -> bool {
        match (&self.buf, &other.buf) {
            (Buffer::Text(a), Buffer::Text(b)) => Arc::ptr_eq(a, b),
            (Buffer::Bytes(a), Buffer::Bytes(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Lossy text of the remainder, without consuming it
    pub fn to_lossy_string(&self) -> String {
        String::from_utf8_lossy(self.remaining()).into_owned()
    }
}

impl ByteSequence for VolatileString {
    #[inline]
    fn has_next(&self) -> bool {
        self.off < self.len()
    }

    fn next_byte(&mut self) -> Result<u8> {
        let b = *self.buf.as_bytes().get(self.off).ok_or(Error::Exhausted)?;
        self.off += 1;
        Ok(b)
    }

    #[inline]
    fn bytes_left(&self) -> u64 {
        (self.len() - self.off) as u64
    }

    fn next_buf(&mut self, buf: &mut [u8]) -> usize {
        let rem = self.remaining();
        let n = rem.len().min(buf.len());
        buf[..n].copy_from_slice(&rem[..n]);
        self.off += n;
        n
    }

    fn reset(&mut self) -> Result<()> {
        self.off = 0;
        Ok(())
    }

    fn to_array(&mut self) -> Result<Vec<u8>> {
        checked_len(self.bytes_left())?;
        let out = self.remaining().to_vec();
        self.off = self.len();
        Ok(out)
    }

    /// Hands out the shared text buffer when nothing was consumed
    fn to_text(&mut self) -> Result<Arc<str>> {
        if self.off == 0 {
            if let Buffer::Text(s) = &self.buf {
                let text = Arc::clone(s);
                self.off = self.len();
                return Ok(text);
            }
        }
        let bytes = self.to_array()?;
        Ok(decode_text(bytes))
    }
}

impl PartialEq for VolatileString {
    fn eq(&self, other: &Self) -> bool {
        self.remaining() == other.remaining()
    }
}

impl Eq for VolatileString {}

impl Hash for VolatileString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.remaining().hash(state)
    }
}

impl PartialOrd for VolatileString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VolatileString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.remaining().cmp(other.remaining())
    }
}

impl Borrow<[u8]> for VolatileString {
    fn borrow(&self) -> &[u8] {
        self.remaining()
    }
}

impl fmt::Debug for VolatileString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolatileString({:?})", self.to_lossy_string())
    }
}

impl fmt::Display for VolatileString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_lossy_string())
    }
}

impl From<&str> for VolatileString {
    fn from(s: &str) -> Self {
        VolatileString::new(s)
    }
}

impl From<String> for VolatileString {
    fn from(s: String) -> Self {
        VolatileString::new(s)
    }
}

impl From<Arc<str>> for VolatileString {
    fn from(s: Arc<str>) -> Self {
        VolatileString::new(s)
    }
}

impl From<&[u8]> for VolatileString {
    fn from(b: &[u8]) -> Self {
        VolatileString::from_bytes(b)
    }
}

impl From<Vec<u8>> for VolatileString {
    fn from(b: Vec<u8>) -> Self {
        VolatileString::from_bytes(b)
    }
}

impl Serialize for VolatileString {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.remaining().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VolatileString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(VolatileString::from_bytes(bytes))
    }
}
