//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]

use nvbench::{BackendKind, Client, DriverConfig, SharedBackend};
use std::collections::HashMap;
use std::sync::Once;
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a fmt subscriber once per test binary
///
/// Filtered by `RUST_LOG`; silent unless asked.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Every backend kind, volatile first
pub const ALL_BACKENDS: [BackendKind; 4] = [
    BackendKind::Volatile,
    BackendKind::Image,
    BackendKind::Recoverable,
    BackendKind::FailureAtomic,
];

/// Backends that keep rows across a close
pub const PERSISTENT_BACKENDS: [BackendKind; 3] = [
    BackendKind::Image,
    BackendKind::Recoverable,
    BackendKind::FailureAtomic,
];

// ============================================================================
// TestBackend - shared backend over a temporary pool file
// ============================================================================

/// Shared backend whose pool lives in a temporary directory
pub struct TestBackend {
    pub shared: SharedBackend,
    pub dir: TempDir,
}

impl TestBackend {
    /// Small pool for `kind`, backed by a file
    pub fn new(kind: BackendKind) -> Self {
        Self::with_config(DriverConfig::for_testing(kind))
    }

    /// `config` with its pool moved into a temporary directory
    pub fn with_config(config: DriverConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let config = config.with_pool_path(dir.path().join("rows.pool"));
        let shared = SharedBackend::new(config).expect("valid config");
        TestBackend { shared, dir }
    }

    /// New client
    pub fn connect(&self) -> Client {
        self.shared.connect().expect("backend opens")
    }
}

/// Plain text copy of a row
pub fn read_text(client: &Client, table: &str, key: &str) -> Option<HashMap<String, String>> {
    client
        .read(table, key, None)
        .ok()
        .map(|row| row.to_string_map().expect("text"))
}

/// Map literal of text fields
pub fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
