//! The byte-sequence contract
//!
//! A [`ByteSequence`] is a single-pass, lazily consumed view over an ordered,
//! finite run of bytes. It is the common currency for field names, field
//! values and keys: generators produce one, backends consume one, and the
//! conversion matrix turns one representation into another.
//!
//! # Single pass
//!
//! Once a byte is yielded it is not yielded again unless the representation
//! supports [`ByteSequence::reset`]. Representations that cannot rewind
//! return [`Error::Unsupported`].
//!
//! # Shared behavior
//!
//! The free functions in this module ([`drain_to_vec`], [`drain_to_text`],
//! [`fill_buf`], [`compare`], [`content_eq`]) hold the fallback logic every
//! representation shares. The trait's default methods call them; a
//! representation overrides a method only when it can do better (typically
//! a bulk copy, or handing out its own buffer when nothing was consumed).
//!
//! # Ownership
//!
//! Draining requires `&mut self`, so two threads can never drain the same
//! instance at once.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// Largest remainder that can be materialized into one buffer
pub const MAX_ARRAY_LEN: u64 = isize::MAX as u64;

/// Single-pass view over a sequence of bytes
pub trait ByteSequence {
    /// True while at least one byte is left
    fn has_next(&self) -> bool {
        self.bytes_left() > 0
    }

    /// Yield the next byte
    ///
    /// # Errors
    ///
    /// [`Error::Exhausted`] if no byte is left.
    fn next_byte(&mut self) -> Result<u8>;

    /// Number of bytes not yet consumed
    fn bytes_left(&self) -> u64;

    /// Drain into `buf`, returning the number of bytes written
    fn next_buf(&mut self, buf: &mut [u8]) -> usize {
        fill_buf(self, buf)
    }

    /// Rewind to the first byte
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] for representations that cannot rewind.
    fn reset(&mut self) -> Result<()> {
        Err(Error::Unsupported("reset"))
    }

    /// Drain the remainder into a newly owned buffer
    ///
    /// # Errors
    ///
    /// [`Error::Capacity`] if the remainder exceeds [`MAX_ARRAY_LEN`].
    fn to_array(&mut self) -> Result<Vec<u8>> {
        drain_to_vec(self)
    }

    /// Drain the remainder and decode it as UTF-8 text
    ///
    /// Malformed sequences decode to U+FFFD. The returned text never aliases
    /// mutable state of the source.
    fn to_text(&mut self) -> Result<Arc<str>> {
        drain_to_text(self)
    }
}

impl<S: ByteSequence + ?Sized> ByteSequence for &mut S {
    fn has_next(&self) -> bool {
        (**self).has_next()
    }

    fn next_byte(&mut self) -> Result<u8> {
        (**self).next_byte()
    }

    fn bytes_left(&self) -> u64 {
        (**self).bytes_left()
    }

    fn next_buf(&mut self, buf: &mut [u8]) -> usize {
        (**self).next_buf(buf)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn to_array(&mut self) -> Result<Vec<u8>> {
        (**self).to_array()
    }

    fn to_text(&mut self) -> Result<Arc<str>> {
        (**self).to_text()
    }
}

impl<S: ByteSequence + ?Sized> ByteSequence for Box<S> {
    fn has_next(&self) -> bool {
        (**self).has_next()
    }

    fn next_byte(&mut self) -> Result<u8> {
        (**self).next_byte()
    }

    fn bytes_left(&self) -> u64 {
        (**self).bytes_left()
    }

    fn next_buf(&mut self, buf: &mut [u8]) -> usize {
        (**self).next_buf(buf)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn to_array(&mut self) -> Result<Vec<u8>> {
        (**self).to_array()
    }

    fn to_text(&mut self) -> Result<Arc<str>> {
        (**self).to_text()
    }
}

// ============================================================================
// Shared default behavior
// ============================================================================

/// Check that `len` bytes fit in one buffer
pub fn checked_len(len: u64) -> Result<usize> {
    if len > MAX_ARRAY_LEN {
        return Err(Error::Capacity {
            requested: len,
            limit: MAX_ARRAY_LEN,
        });
    }
    Ok(len as usize)
}

/// Byte-at-a-time drain into `buf`
pub fn fill_buf<S: ByteSequence + ?Sized>(seq: &mut S, buf: &mut [u8]) -> usize {
    let mut written = 0;
    while written < buf.len() && seq.has_next() {
        match seq.next_byte() {
            Ok(b) => {
                buf[written] = b;
                written += 1;
            }
            Err(_) => break,
        }
    }
    written
}

/// Byte-at-a-time drain of the remainder
pub fn drain_to_vec<S: ByteSequence + ?Sized>(seq: &mut S) -> Result<Vec<u8>> {
    let len = checked_len(seq.bytes_left())?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(seq.next_byte()?);
    }
    Ok(out)
}

/// Drain the remainder and decode it as text
pub fn drain_to_text<S: ByteSequence + ?Sized>(seq: &mut S) -> Result<Arc<str>> {
    let bytes = seq.to_array()?;
    Ok(decode_text(bytes))
}

/// Decode owned bytes, replacing malformed sequences
pub fn decode_text(bytes: Vec<u8>) -> Arc<str> {
    match String::from_utf8(bytes) {
        Ok(s) => Arc::from(s),
        Err(e) => Arc::from(String::from_utf8_lossy(e.as_bytes()).into_owned()),
    }
}

/// Unsigned byte-lexicographic order of the two remainders
///
/// Both sequences are drained. Comparing partially drained sequences
/// compares only what is left; callers should not rely on that.
pub fn compare<A, B>(a: &mut A, b: &mut B) -> Result<Ordering>
where
    A: ByteSequence + ?Sized,
    B: ByteSequence + ?Sized,
{
    let left = a.to_array()?;
    let right = b.to_array()?;
    Ok(left.cmp(&right))
}

/// Equality of the two remainders, draining both
pub fn content_eq<A, B>(a: &mut A, b: &mut B) -> Result<bool>
where
    A: ByteSequence + ?Sized,
    B: ByteSequence + ?Sized,
{
    if a.bytes_left() != b.bytes_left() {
        return Ok(false);
    }
    Ok(compare(a, b)? == Ordering::Equal)
}
