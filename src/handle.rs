//! Backend shared by every worker of a run
//!
//! The first [`SharedBackend::connect`] opens the configured backend; later
//! calls hand out the same instance while any [`Client`] is alive. When the
//! last client is dropped the backend is closed (image written, pool synced
//! to its file). A later `connect` opens it again, recovering from what the
//! close left behind.
//!
//! Client counting, open and close all happen under one lock, so a
//! reconnect never reads a pool file that a close is still writing.

use crate::backends::open_backend;
use crate::config::DriverConfig;
use crate::store::RowStore;
use nvbench_core::Result;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Default)]
struct State {
    store: Option<Arc<dyn RowStore>>,
    clients: usize,
}

/// Lazily opened backend shared by reference counting
pub struct SharedBackend {
    config: DriverConfig,
    state: Arc<Mutex<State>>,
}

impl SharedBackend {
    /// Handle for the backend `config` names; nothing is opened yet
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`](nvbench_core::Error::InvalidConfig) for a
    /// rejected configuration.
    pub fn new(config: DriverConfig) -> Result<Self> {
        config.validate()?;
        Ok(SharedBackend {
            config,
            state: Arc::new(Mutex::new(State::default())),
        })
    }

    /// Configuration the backend is opened with
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Client of the open backend, opening it if no client is alive
    pub fn connect(&self) -> Result<Client> {
        let mut state = self.state.lock();
        let store = match &state.store {
            Some(store) => Arc::clone(store),
            None => {
                let store: Arc<dyn RowStore> = Arc::from(open_backend(&self.config)?);
                state.store = Some(Arc::clone(&store));
                store
            }
        };
        state.clients += 1;
        debug!(clients = state.clients, "client connected");
        Ok(Client {
            store,
            state: Arc::clone(&self.state),
        })
    }

    /// Number of live clients
    pub fn clients(&self) -> usize {
        self.state.lock().clients
    }

    /// True while some client keeps the backend open
    pub fn is_open(&self) -> bool {
        self.state.lock().store.is_some()
    }
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend")
            .field("backend", &self.config.backend)
            .field("clients", &self.clients())
            .finish()
    }
}

/// One worker's handle on the shared backend
///
/// Dereferences to the backend's [`RowStore`].
pub struct Client {
    store: Arc<dyn RowStore>,
    state: Arc<Mutex<State>>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        self.state.lock().clients += 1;
        Client {
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.clients = state.clients.saturating_sub(1);
        if state.clients > 0 {
            return;
        }
        if let Some(store) = state.store.take() {
            match store.close() {
                Ok(()) => info!(backend = store.name(), "backend closed"),
                Err(e) => error!(backend = store.name(), error = %e, "backend close failed"),
            }
        }
    }
}

impl Deref for Client {
    type Target = dyn RowStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("backend", &self.store.name())
            .finish()
    }
}
