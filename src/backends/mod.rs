//! Row-store backends
//!
//! | Backend              | Rows live in     | Survives a crash             |
//! |----------------------|------------------|------------------------------|
//! | [`VolatileStore`]    | process memory   | no                           |
//! | [`ImageStore`]       | process memory   | as of the last close         |
//! | [`RecoverableStore`] | persistent heap  | every completed operation    |
//! | [`FailureAtomicStore`] | persistent heap | every committed section     |

mod failure_atomic;
mod image;
mod recoverable;
mod volatile;

pub use failure_atomic::FailureAtomicStore;
pub use image::ImageStore;
pub use recoverable::RecoverableStore;
pub use volatile::VolatileStore;

use crate::config::{BackendKind, DriverConfig};
use crate::store::RowStore;
use nvbench_core::Result;
use tracing::info;

/// Open the backend `config` names
///
/// # Errors
///
/// [`Error::InvalidConfig`](nvbench_core::Error::InvalidConfig) for a
/// rejected configuration; otherwise whatever opening or recovering the
/// pool reports.
pub fn open_backend(config: &DriverConfig) -> Result<Box<dyn RowStore>> {
    config.validate()?;
    let store: Box<dyn RowStore> = match config.backend {
        BackendKind::Volatile => Box::new(VolatileStore::new()),
        BackendKind::Image => Box::new(ImageStore::open(config)?),
        BackendKind::Recoverable => Box::new(RecoverableStore::open(config)?),
        BackendKind::FailureAtomic => Box::new(FailureAtomicStore::open(config)?),
    };
    info!(backend = store.name(), rows = store.len(), "backend opened");
    Ok(store)
}
