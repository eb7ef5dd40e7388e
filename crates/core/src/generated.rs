//! Generated field values
//!
//! Workload generators hand backends values that do not exist anywhere until
//! they are drained. [`GeneratedSequence`] produces printable pseudo-random
//! bytes from a seed, one at a time, and cannot rewind.

use crate::error::{Error, Result};
use crate::sequence::ByteSequence;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Single-pass sequence of printable pseudo-random bytes
///
/// Two sequences built from the same seed and length yield the same bytes.
/// `reset` is not offered.
#[derive(Debug)]
pub struct GeneratedSequence {
    rng: StdRng,
    len: u64,
    off: u64,
}

impl GeneratedSequence {
    /// Sequence of `len` bytes derived from `seed`
    pub fn new(len: u64, seed: u64) -> Self {
        GeneratedSequence {
            rng: StdRng::seed_from_u64(seed),
            len,
            off: 0,
        }
    }

    /// Declared length, consumed or not
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if the declared length is zero
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ByteSequence for GeneratedSequence {
    fn next_byte(&mut self) -> Result<u8> {
        if self.off >= self.len {
            return Err(Error::Exhausted);
        }
        self.off += 1;
        Ok(self.rng.gen_range(b' '..=b'~'))
    }

    fn bytes_left(&self) -> u64 {
        self.len - self.off
    }
}
