//! Error types for nvbench
//!
//! One error enum covers byte sequences, persistent memory, the durable
//! map and configuration. Fatal variants mean a durable structure may be
//! in a partial state; see [`Error::is_fatal`].
//!
//! # Propagation
//!
//! - Sequence and conversion errors (`Exhausted`, `Unsupported`, `Capacity`,
//!   `NotImplemented`) are programmer errors: fail fast.
//! - `NotFound` is recoverable and is folded into [`Status::Error`] at the
//!   row-store boundary.
//! - `Durability`, `Corruption` and `SimulatedCrash` are fatal to the current
//!   operation. A map that surfaced one must not be mutated again.
//!
//! [`Status::Error`]: crate::status::Status::Error

use std::io;
use thiserror::Error;

/// Result type alias for nvbench operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for nvbench
#[derive(Debug, Error)]
pub enum Error {
    /// A byte sequence was drained past its end
    #[error("Byte sequence exhausted")]
    Exhausted,

    /// Operation not offered by this representation (e.g. `reset` on a
    /// single-pass sequence)
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Materialization exceeds the addressable size
    #[error("Capacity exceeded: requested {requested} bytes, limit {limit}")]
    Capacity {
        /// Requested length in bytes
        requested: u64,
        /// Largest length that can be materialized
        limit: u64,
    },

    /// Conversion path deliberately not implemented
    #[error("Conversion not implemented: {0}")]
    NotImplemented(&'static str),

    /// A flush or fence could not be guaranteed
    #[error("Durability failure: {0}")]
    Durability(String),

    /// Key or row absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// The persistent heap cannot satisfy an allocation
    #[error("Out of persistent memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Requested block size in bytes
        requested: u64,
        /// Bytes left in the heap
        available: u64,
    },

    /// The persistent image is inconsistent
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Fault injection stopped the operation at a named crash point
    #[error("Simulated crash at {0}")]
    SimulatedCrash(&'static str),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error (pool files, config files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a not-found error from anything printable
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Create a durability error
    pub fn durability(reason: impl Into<String>) -> Self {
        Error::Durability(reason.into())
    }

    /// Create a corruption error
    pub fn corruption(reason: impl Into<String>) -> Self {
        Error::Corruption(reason.into())
    }

    /// Create an invalid-config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig(reason.into())
    }

    /// True for errors that leave persistent state in doubt
    ///
    /// Callers must stop issuing mutations against the affected map.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Durability(_) | Error::Corruption(_) | Error::SimulatedCrash(_)
        )
    }

    /// True if this is a `NotFound` error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
