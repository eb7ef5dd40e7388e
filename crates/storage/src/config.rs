//! Map configuration.

use serde::{Deserialize, Serialize};

/// How a map excludes concurrent mutations of one row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Discipline {
    /// A mutex per row, held for one protocol invocation
    #[default]
    RowLock,
    /// The protocol runs as a closure under the index's write lock for the
    /// key's shard
    Compute,
}

impl std::fmt::Display for Discipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Discipline::RowLock => write!(f, "row-lock"),
            Discipline::Compute => write!(f, "compute"),
        }
    }
}

/// Durable map configuration parameters.
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Buckets of a newly created map (default: 1024).
    ///
    /// A recovered map keeps the bucket count it was created with.
    pub buckets: u64,

    /// Minimum slot capacity of a row container (default: 10).
    pub row_capacity: u64,

    /// Lock stripes guarding bucket chains (default: 64).
    pub lock_stripes: usize,

    /// Row exclusion discipline (default: row lock).
    pub discipline: Discipline,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            buckets: 1024,
            row_capacity: 10,
            lock_stripes: 64,
            discipline: Discipline::RowLock,
        }
    }
}

impl MapConfig {
    /// Create a new map configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bucket count (builder pattern).
    pub fn with_buckets(mut self, buckets: u64) -> Self {
        self.buckets = buckets;
        self
    }

    /// Set minimum row capacity (builder pattern).
    pub fn with_row_capacity(mut self, capacity: u64) -> Self {
        self.row_capacity = capacity;
        self
    }

    /// Set lock stripe count (builder pattern).
    pub fn with_lock_stripes(mut self, stripes: usize) -> Self {
        self.lock_stripes = stripes;
        self
    }

    /// Set row discipline (builder pattern).
    pub fn with_discipline(mut self, discipline: Discipline) -> Self {
        self.discipline = discipline;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), MapConfigError> {
        if self.buckets == 0 {
            return Err(MapConfigError::NoBuckets);
        }
        if self.row_capacity == 0 {
            return Err(MapConfigError::ZeroRowCapacity);
        }
        if self.lock_stripes == 0 {
            return Err(MapConfigError::NoLockStripes);
        }
        Ok(())
    }

    /// Create a configuration for testing (few buckets, tiny rows so that
    /// growth paths run).
    pub fn for_testing() -> Self {
        MapConfig {
            buckets: 8,
            row_capacity: 2,
            lock_stripes: 4,
            discipline: Discipline::RowLock,
        }
    }
}

/// Map configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapConfigError {
    /// Bucket count is zero.
    #[error("Bucket count must be positive")]
    NoBuckets,
    /// Row capacity is zero.
    #[error("Row capacity must be positive")]
    ZeroRowCapacity,
    /// Lock stripe count is zero.
    #[error("Lock stripe count must be positive")]
    NoLockStripes,
}

impl From<MapConfigError> for nvbench_core::Error {
    fn from(e: MapConfigError) -> Self {
        nvbench_core::Error::invalid_config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MapConfig::default();
        assert_eq!(config.buckets, 1024);
        assert_eq!(config.discipline, Discipline::RowLock);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = MapConfig::new()
            .with_buckets(4)
            .with_row_capacity(3)
            .with_lock_stripes(2)
            .with_discipline(Discipline::Compute);
        assert_eq!(config.buckets, 4);
        assert_eq!(config.row_capacity, 3);
        assert_eq!(config.lock_stripes, 2);
        assert_eq!(config.discipline, Discipline::Compute);
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            MapConfig::new().with_buckets(0).validate(),
            Err(MapConfigError::NoBuckets)
        );
        assert_eq!(
            MapConfig::new().with_row_capacity(0).validate(),
            Err(MapConfigError::ZeroRowCapacity)
        );
        assert_eq!(
            MapConfig::new().with_lock_stripes(0).validate(),
            Err(MapConfigError::NoLockStripes)
        );
    }

    #[test]
    fn test_discipline_display() {
        assert_eq!(Discipline::RowLock.to_string(), "row-lock");
        assert_eq!(Discipline::Compute.to_string(), "compute");
    }
}
