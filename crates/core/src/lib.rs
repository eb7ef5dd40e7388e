//! Core types and traits for nvbench
//!
//! This crate defines the foundational types used throughout the system:
//! - Error: Error taxonomy and `Result` alias
//! - Status: Outcome codes at the row-store boundary
//! - ByteSequence: Single-pass byte view shared by every representation
//! - VolatileString: Heap-backed representation
//! - GeneratedSequence: Seeded, non-rewindable generated values

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod generated;
pub mod sequence;
pub mod status;
pub mod volatile;

pub use error::{Error, Result};
pub use generated::GeneratedSequence;
pub use sequence::{ByteSequence, MAX_ARRAY_LEN};
pub use status::Status;
pub use volatile::VolatileString;
