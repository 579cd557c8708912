//! Application state for the server.

use std::sync::Arc;

use tapline_proxy::{Forwarder, SystemProxyManager, TransactionStore, TunnelHandler};

use crate::config::ServerConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// In-flight transactions.
    pub store: TransactionStore,
    /// Upstream HTTP relay.
    pub forwarder: Forwarder,
    /// System proxy orchestrator.
    pub system_proxy: Arc<SystemProxyManager>,
    /// Validated configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Creates application state from its components.
    pub fn new(
        config: ServerConfig,
        store: TransactionStore,
        forwarder: Forwarder,
        system_proxy: SystemProxyManager,
    ) -> Self {
        Self {
            store,
            forwarder,
            system_proxy: Arc::new(system_proxy),
            config: Arc::new(config),
        }
    }

    /// Returns a tunnel handler recording into this state's store.
    pub fn tunnel_handler(&self) -> TunnelHandler {
        TunnelHandler::new(self.store.clone())
    }
}
