//! Application state for the API server.

use std::sync::Arc;

use toxide_proxy::ProxyRegistry;

/// Shared application state.
#[derive(Clone, Default)]
pub struct AppState {
    /// Proxies served by the API.
    pub registry: Arc<ProxyRegistry>,
}

impl AppState {
    /// Creates state around an existing registry.
    pub fn new(registry: Arc<ProxyRegistry>) -> Self {
        Self { registry }
    }
}
