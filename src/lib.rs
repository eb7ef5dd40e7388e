//! nvbench - benchmark driver layer over volatile and persistent-memory
//! row stores
//!
//! The harness drives one [`RowStore`] contract; the backends behind it
//! differ in where rows live and what survives a crash:
//!
//! - [`VolatileStore`]: process memory only
//! - [`ImageStore`]: process memory, saved into the pool as one image on close
//! - [`RecoverableStore`]: a durable map mutated through the strong update
//!   protocol
//! - [`FailureAtomicStore`]: a durable map mutated inside failure-atomic
//!   sections
//!
//! # Quick Start
//!
//! ```ignore
//! use nvbench::{BackendKind, DriverConfig, Row, SharedBackend};
//!
//! let shared = SharedBackend::new(DriverConfig::new(BackendKind::Recoverable))?;
//! let client = shared.connect()?;
//! client.insert("usertable", "user1", Row::from_strings([("name", "alice")]));
//! let row = client.read("usertable", "user1", None)?;
//! ```
//!
//! Persistent-memory internals live in the member crates: `nvbench-pmem`
//! (pool, heap, recovery, sections) and `nvbench-storage` (durable strings,
//! rows, the durable map and its update protocol).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backends;
pub mod config;
pub mod handle;
pub mod store;

pub use backends::{open_backend, FailureAtomicStore, ImageStore, RecoverableStore, VolatileStore};
pub use config::{BackendKind, DriverConfig, UpdatePath};
pub use handle::{Client, SharedBackend};
pub use store::{composite_key, RowStore};

pub use nvbench_core::{ByteSequence, Error, GeneratedSequence, Result, Status, VolatileString};
pub use nvbench_storage::{Discipline, Field, Row};
