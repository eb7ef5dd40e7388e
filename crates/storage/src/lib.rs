//! Durable rows for nvbench
//!
//! This crate implements the persistent-memory half of the row store:
//! - DurableString: heap-backed byte sequences, unique or interned
//! - Field / IntoRepresentation: field values and the conversion matrix
//! - Row: field name to field value
//! - DurableMap: key to row map rebuilt from a durable root
//! - UpdateProtocol: the flush/fence/link/invalidate ordering every
//!   mutation follows
//!
//! # Concurrency
//!
//! `DurableMap` offers two row-exclusion disciplines:
//! - Row lock: a mutex per row, held for one protocol invocation
//! - Compute: the protocol runs under the index shard's write lock

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod durable_string;
pub mod field;
pub mod layout;
pub mod map;
pub mod protocol;
pub mod row;

pub use config::{Discipline, MapConfig, MapConfigError};
pub use durable_string::{DurableString, Interning};
pub use field::{Field, IntoRepresentation};
pub use map::DurableMap;
pub use protocol::UpdateProtocol;
pub use row::Row;
