//! Pool configuration.
//!
//! This module provides configuration for the simulated persistent-memory pool.

use crate::layout::{HEAP_START, MAX_LOG_SLOTS};
use std::path::PathBuf;

/// Persistent-memory pool configuration parameters.
#[derive(Debug, Clone)]
pub struct PmemConfig {
    /// Pool size in bytes (default: 64MB).
    ///
    /// Both the cache image and the media image are this large.
    pub size: u64,

    /// Backing file (default: none).
    ///
    /// When set, the media image is loaded from this file on open and
    /// written back by `sync_to_file`.
    pub path: Option<PathBuf>,

    /// Number of concurrent failure-atomic sections (default: 16).
    pub log_slots: usize,

    /// Undo-log capacity per failure-atomic section in bytes (default: 64KB).
    pub undo_log_capacity: u64,
}

impl Default for PmemConfig {
    fn default() -> Self {
        PmemConfig {
            size: 64 * 1024 * 1024, // 64MB
            path: None,
            log_slots: 16,
            undo_log_capacity: 64 * 1024, // 64KB
        }
    }
}

impl PmemConfig {
    /// Create a new pool configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pool size (builder pattern).
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Set backing file (builder pattern).
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set number of undo-log slots (builder pattern).
    pub fn with_log_slots(mut self, slots: usize) -> Self {
        self.log_slots = slots;
        self
    }

    /// Set undo-log capacity (builder pattern).
    pub fn with_undo_log_capacity(mut self, bytes: u64) -> Self {
        self.undo_log_capacity = bytes;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), PmemConfigError> {
        if self.size < 64 * 1024 {
            return Err(PmemConfigError::PoolTooSmall);
        }
        if self.size % 64 != 0 {
            return Err(PmemConfigError::PoolNotLineAligned);
        }
        if self.log_slots == 0 || self.log_slots > MAX_LOG_SLOTS {
            return Err(PmemConfigError::LogSlotsOutOfRange);
        }
        if self.undo_log_capacity < 256 || self.undo_log_capacity > self.size - HEAP_START {
            return Err(PmemConfigError::UndoLogCapacityOutOfRange);
        }
        Ok(())
    }

    /// Create a configuration optimized for testing (small pool).
    pub fn for_testing() -> Self {
        PmemConfig {
            size: 4 * 1024 * 1024, // 4MB
            path: None,
            log_slots: 4,
            undo_log_capacity: 16 * 1024, // 16KB
        }
    }
}

/// Pool configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmemConfigError {
    /// Pool is too small (minimum 64KB).
    #[error("Pool size must be at least 64KB")]
    PoolTooSmall,

    /// Pool size is not a whole number of cache lines.
    #[error("Pool size must be a multiple of the cache line size")]
    PoolNotLineAligned,

    /// Log slot count is zero or above the header's capacity.
    #[error("Log slots must be between 1 and {}", MAX_LOG_SLOTS)]
    LogSlotsOutOfRange,

    /// Undo-log capacity is too small or does not fit the pool.
    #[error("Undo log capacity must be at least 256 bytes and fit in the pool")]
    UndoLogCapacityOutOfRange,
}

impl From<PmemConfigError> for nvbench_core::Error {
    fn from(e: PmemConfigError) -> Self {
        nvbench_core::Error::invalid_config(e.to_string())
    }
}
