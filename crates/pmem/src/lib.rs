//! Simulated persistent memory for nvbench
//!
//! This crate provides the persistent-memory collaborator the durable
//! backends are built on:
//! - Pool: cache and media images with explicit flush and fence
//! - Heap: typed blocks with validate/invalidate/destroy/reclaim, durable
//!   roots and content interning
//! - KlassRegistry: per-heap block types and their trace functions
//! - Recovery: undo-log rollback, reachability tracing, roll-forward
//! - FailureAtomicSection: undo-logged groups of stores
//! - FaultInjector: named crash points and fence failures

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod fault;
pub mod heap;
pub mod klass;
pub mod layout;
pub mod pool;
pub mod recovery;
pub mod section;

pub use config::{PmemConfig, PmemConfigError};
pub use fault::FaultInjector;
pub use heap::{Heap, HeapStats};
pub use klass::{KlassInfo, KlassRegistry, Refs, TraceFn, BLOB, FIRST_USER_KLASS, UNDO_LOG};
pub use layout::{BlockHandle, BlockHeader, BlockState, KlassId, MAX_BLOCK_CAPACITY, ROOT_SLOTS};
pub use pool::{Pool, PoolStats};
pub use recovery::RecoveryReport;
pub use section::FailureAtomicSection;
