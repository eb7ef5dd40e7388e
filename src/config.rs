//! Driver configuration via `nvbench.toml`
//!
//! One TOML document selects the backend, the workload shape the harness
//! reports against, and the persistent-memory pool the durable backends
//! run on. Settings that would silently weaken crash consistency are
//! rejected up front by [`DriverConfig::validate`].

use nvbench_core::{Error, Result};
use nvbench_pmem::PmemConfig;
use nvbench_storage::{Discipline, MapConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Config file name the harness looks for in its working directory.
pub const CONFIG_FILE_NAME: &str = "nvbench.toml";

/// Which row store the driver talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-memory only
    Volatile,
    /// In-memory, saved as one image into the pool on close
    Image,
    /// Durable map driven by the strong update protocol
    Recoverable,
    /// Durable map where every operation runs in a failure-atomic section
    FailureAtomic,
}

impl BackendKind {
    /// True for backends that keep rows in the persistent heap
    pub fn is_durable(self) -> bool {
        !matches!(self, BackendKind::Volatile)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Volatile => write!(f, "volatile"),
            BackendKind::Image => write!(f, "image"),
            BackendKind::Recoverable => write!(f, "recoverable"),
            BackendKind::FailureAtomic => write!(f, "failure-atomic"),
        }
    }
}

/// How field updates reach the durable map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePath {
    /// Flush and fence at every protocol step
    #[default]
    Strong,
    /// Unflushed stores inside a failure-atomic section
    Weak,
}

/// `[pmem]` table: the simulated pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Pool size in bytes
    pub size: u64,
    /// Backing file; without one the pool lives for the process only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Concurrent failure-atomic sections
    pub log_slots: usize,
    /// Undo-log bytes per section
    pub undo_log_capacity: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let pmem = PmemConfig::default();
        PoolSettings {
            size: pmem.size,
            path: pmem.path,
            log_slots: pmem.log_slots,
            undo_log_capacity: pmem.undo_log_capacity,
        }
    }
}

/// `[map]` table: layout of the durable map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapSettings {
    /// Root slot the map (or the image) is linked at
    pub root_slot: usize,
    /// Buckets of a newly created map
    pub buckets: u64,
    /// Minimum slots of a row container
    pub row_capacity: u64,
    /// Bucket lock stripes
    pub lock_stripes: usize,
}

impl Default for MapSettings {
    fn default() -> Self {
        let map = MapConfig::default();
        MapSettings {
            root_slot: 0,
            buckets: map.buckets,
            row_capacity: map.row_capacity,
            lock_stripes: map.lock_stripes,
        }
    }
}

/// Driver configuration loaded from `nvbench.toml`.
///
/// # Example
///
/// ```toml
/// backend = "recoverable"
/// record_count = 1000
/// discipline = "row-lock"
///
/// [pmem]
/// size = 67108864
/// path = "/mnt/pmem/rows.pool"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Backend to open
    pub backend: BackendKind,
    /// Rows loaded by the preload phase
    #[serde(default = "default_record_count")]
    pub record_count: u64,
    /// Worker threads sharing the backend
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// Run the transaction phase
    #[serde(default = "default_true")]
    pub do_transactions: bool,
    /// Run the preload phase
    #[serde(default = "default_true")]
    pub do_preload: bool,
    /// Strong (default) or weak updates
    #[serde(default)]
    pub update_path: UpdatePath,
    /// Row exclusion discipline
    #[serde(default)]
    pub discipline: Discipline,
    /// Pool settings
    #[serde(default)]
    pub pmem: PoolSettings,
    /// Map settings
    #[serde(default)]
    pub map: MapSettings,
}

fn default_record_count() -> u64 {
    1000
}

fn default_thread_count() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            backend: BackendKind::Recoverable,
            record_count: default_record_count(),
            thread_count: default_thread_count(),
            do_transactions: true,
            do_preload: true,
            update_path: UpdatePath::Strong,
            discipline: Discipline::RowLock,
            pmem: PoolSettings::default(),
            map: MapSettings::default(),
        }
    }
}

impl DriverConfig {
    /// Configuration for `backend` with every other setting at its default
    pub fn new(backend: BackendKind) -> Self {
        DriverConfig {
            backend,
            ..Self::default()
        }
    }

    /// Small pool and map, for tests
    pub fn for_testing(backend: BackendKind) -> Self {
        let pmem = PmemConfig::for_testing();
        let map = MapConfig::for_testing();
        DriverConfig {
            backend,
            record_count: 100,
            pmem: PoolSettings {
                size: pmem.size,
                path: None,
                log_slots: pmem.log_slots,
                undo_log_capacity: pmem.undo_log_capacity,
            },
            map: MapSettings {
                root_slot: 0,
                buckets: map.buckets,
                row_capacity: map.row_capacity,
                lock_stripes: map.lock_stripes,
            },
            ..Self::default()
        }
    }

    /// Set the update path (builder pattern).
    pub fn with_update_path(mut self, path: UpdatePath) -> Self {
        self.update_path = path;
        self
    }

    /// Set the discipline (builder pattern).
    pub fn with_discipline(mut self, discipline: Discipline) -> Self {
        self.discipline = discipline;
        self
    }

    /// Set the pool's backing file (builder pattern).
    pub fn with_pool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pmem.path = Some(path.into());
        self
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# nvbench driver configuration
#
# Backend: "volatile", "image", "recoverable" (default) or "failure-atomic"
#   "volatile"       = rows in process memory only
#   "image"          = rows in process memory, saved into the pool on close
#   "recoverable"    = durable map, strong update protocol
#   "failure-atomic" = durable map, one failure-atomic section per operation
backend = "recoverable"

record_count = 1000
thread_count = 1
do_transactions = true
do_preload = true

# Update path: "strong" (default) or "weak"
# "weak" requires backend = "failure-atomic"
update_path = "strong"

# Row exclusion: "row-lock" (default) or "compute"
# "compute" cannot be combined with backend = "failure-atomic"
discipline = "row-lock"

[pmem]
size = 67108864            # 64MB
# path = "rows.pool"       # keep the pool across runs
log_slots = 16
undo_log_capacity = 65536  # 64KB

[map]
root_slot = 0
buckets = 1024
row_capacity = 10
lock_stripes = 64
"#
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if the document does not parse or names an
    /// invalid combination.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DriverConfig = toml::from_str(content)
            .map_err(|e| Error::invalid_config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the file cannot be read, otherwise as
    /// [`DriverConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::InvalidConfig(reason) => {
                Error::invalid_config(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })
    }

    /// Serialize this config to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Reject combinations no backend can honor.
    pub fn validate(&self) -> Result<()> {
        if self.update_path == UpdatePath::Weak && self.backend != BackendKind::FailureAtomic {
            return Err(Error::invalid_config(format!(
                "update_path = \"weak\" needs failure-atomic sections, backend \"{}\" has none",
                self.backend
            )));
        }
        if self.backend == BackendKind::FailureAtomic && self.discipline == Discipline::Compute {
            return Err(Error::invalid_config(
                "discipline = \"compute\" cannot hold its lock across a section",
            ));
        }
        if self.thread_count == 0 {
            return Err(Error::invalid_config("thread_count must be at least 1"));
        }
        if self.backend.is_durable() {
            self.pmem_config()
                .validate()
                .map_err(|e| Error::invalid_config(e.to_string()))?;
            self.map_config().validate()?;
            if self.map.root_slot >= nvbench_pmem::ROOT_SLOTS {
                return Err(Error::invalid_config(format!(
                    "root_slot must be below {}",
                    nvbench_pmem::ROOT_SLOTS
                )));
            }
        }
        Ok(())
    }

    /// Pool configuration of the `[pmem]` table
    pub fn pmem_config(&self) -> PmemConfig {
        let mut config = PmemConfig::new()
            .with_size(self.pmem.size)
            .with_log_slots(self.pmem.log_slots)
            .with_undo_log_capacity(self.pmem.undo_log_capacity);
        if let Some(path) = &self.pmem.path {
            config = config.with_path(path);
        }
        config
    }

    /// Map configuration of the `[map]` table and `discipline`
    pub fn map_config(&self) -> MapConfig {
        MapConfig::new()
            .with_buckets(self.map.buckets)
            .with_row_capacity(self.map.row_capacity)
            .with_lock_stripes(self.map.lock_stripes)
            .with_discipline(self.discipline)
    }
}
