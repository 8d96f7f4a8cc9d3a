//! Command handlers for each agent role.
//!
//! A role owns its tunnel endpoint (behind a mutex, so handlers stay correct
//! even if dispatch is ever parallelised), reads and writes persisted state
//! only through [`StateStore`], and binds its operations onto the
//! [`CommandExecutor`].

pub mod client;
pub mod server;

pub use client::ClientHandlers;
pub use server::ServerHandlers;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::error;
use wirewarp_core::{WarpError, WarpResult};

use crate::backend::SharedBackend;
use crate::config::{AgentMode, StateStore};
use crate::executor::CommandExecutor;
use crate::update;

/// Decode a command's params into `T`.
pub(crate) fn parse<T: DeserializeOwned>(params: &Value) -> WarpResult<T> {
    T::deserialize(params).map_err(|e| WarpError::InvalidParams(e.to_string()))
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bind `f` on a shared handler set under `kind`.
fn bind<H>(
    exec: &mut CommandExecutor,
    kind: &str,
    handlers: &Arc<H>,
    f: fn(&H, &Value) -> WarpResult<String>,
) where
    H: Send + Sync + 'static,
{
    let h = Arc::clone(handlers);
    exec.register(kind, move |params| f(&h, params));
}

/// The handler set for this agent's mode.
#[derive(Clone)]
pub enum Role {
    Server(Arc<ServerHandlers>),
    Client(Arc<ClientHandlers>),
}

impl Role {
    pub fn new(mode: AgentMode, store: Arc<StateStore>, backend: SharedBackend) -> Self {
        match mode {
            AgentMode::Server => Role::Server(Arc::new(ServerHandlers::new(store, backend))),
            AgentMode::Client => Role::Client(Arc::new(ClientHandlers::new(store, backend))),
        }
    }

    /// Replay persisted tunnel state. Failures are logged, never fatal.
    pub fn restore(&self) {
        match self {
            Role::Server(h) => h.restore(),
            Role::Client(h) => h.restore(),
        }
    }

    /// [`restore`](Self::restore) on a blocking thread, for async callers.
    pub async fn restore_blocking(&self) {
        let role = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || role.restore()).await {
            error!(error = %e, "startup restore panicked");
        }
    }

    /// [`shutdown`](Self::shutdown) on a blocking thread, for async callers.
    pub async fn shutdown_blocking(&self) {
        let role = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || role.shutdown()).await {
            error!(error = %e, "role shutdown panicked");
        }
    }

    pub fn register(&self, exec: &mut CommandExecutor) {
        match self {
            Role::Server(h) => {
                bind(exec, "wg_init", h, ServerHandlers::wg_init);
                bind(exec, "wg_add_peer", h, ServerHandlers::add_peer);
                bind(exec, "wg_remove_peer", h, ServerHandlers::remove_peer);
                bind(exec, "iptables_add_forward", h, ServerHandlers::add_forward);
                bind(exec, "iptables_remove_forward", h, ServerHandlers::remove_forward);
            }
            Role::Client(h) => {
                bind(exec, "wg_configure", h, ClientHandlers::configure);
                bind(exec, "wg_update_endpoint", h, ClientHandlers::update_endpoint);
                bind(exec, "wg_down", h, ClientHandlers::down);
            }
        }
    }

    pub fn shutdown(&self) {
        match self {
            Role::Server(h) => h.shutdown(),
            Role::Client(h) => h.shutdown(),
        }
    }
}

/// `agent_update`, available in both roles.
pub fn register_update(exec: &mut CommandExecutor, store: Arc<StateStore>) {
    exec.register("agent_update", move |_| {
        let command = store.read(|cfg| cfg.update_command.clone());
        update::run_update(command.as_deref())
    });
}
