//! Toxide Server - REST control API.
//!
//! This crate exposes the proxy registry over HTTP.
//!
//! ## Endpoints
//!
//! - `GET /version` - Server version
//! - `POST /reset` - Enable all proxies and remove all toxics
//! - `GET /proxies` - List proxies (optional `?filter=<regex>`)
//! - `POST /proxies` - Create a proxy
//! - `POST /populate` - Create or replace a set of proxies
//! - `GET /proxies/{name}` - Get a proxy with its toxics
//! - `POST /proxies/{name}` - Update a proxy
//! - `DELETE /proxies/{name}` - Delete a proxy
//! - `GET /proxies/{name}/toxics` - Toxics of both directions
//! - `GET /proxies/{name}/{direction}/toxics` - Toxics of one direction
//! - `POST /proxies/{name}/{direction}/toxics` - Attach a toxic
//! - `GET /proxies/{name}/{direction}/toxics/{toxic}` - Get a toxic
//! - `POST /proxies/{name}/{direction}/toxics/{toxic}` - Update a toxic
//! - `DELETE /proxies/{name}/{direction}/toxics/{toxic}` - Detach a toxic
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use toxide_proxy::ProxyRegistry;
//! use toxide_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(ProxyRegistry::new());
//!     let server = Server::new(ServerConfig::default(), registry).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use toxide_proxy::ProxyRegistry;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default API port.
pub const DEFAULT_PORT: u16 = 8474;

/// Default API host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 8474).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Host and port do not form a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/version", get(handlers::version))
        .route("/reset", post(handlers::reset))
        .route(
            "/proxies",
            get(handlers::list_proxies).post(handlers::create_proxy),
        )
        .route("/populate", post(handlers::populate))
        .route(
            "/proxies/{name}",
            get(handlers::get_proxy)
                .post(handlers::update_proxy)
                .delete(handlers::delete_proxy),
        )
        .route(
            "/proxies/{name}/toxics",
            get(handlers::list_all_toxics).post(handlers::add_toxic),
        )
        .route(
            "/proxies/{name}/toxics/{toxic}",
            get(handlers::get_named_toxic)
                .post(handlers::update_named_toxic)
                .delete(handlers::delete_named_toxic),
        )
        .route(
            "/proxies/{name}/{direction}/toxics",
            get(handlers::list_toxics).post(handlers::create_toxic),
        )
        .route(
            "/proxies/{name}/{direction}/toxics/{toxic}",
            get(handlers::get_toxic)
                .post(handlers::update_toxic)
                .delete(handlers::delete_toxic),
        )
        .layer(cors)
        .with_state(state)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server for the given registry.
    pub fn new(
        config: ServerConfig,
        registry: Arc<ProxyRegistry>,
    ) -> std::result::Result<Self, ServerError> {
        Self::with_state(config, AppState::new(registry))
    }

    /// Creates a server with custom application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| {
                ServerError::InvalidAddress(format!("{}:{}: {}", config.host, config.port, e))
            })?;

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Binds the API socket with SO_REUSEADDR.
    pub fn bind(&self) -> std::result::Result<TcpListener, ServerError> {
        let bind_error = |e| ServerError::BindError(self.addr, e);

        let socket = Socket::new(
            Domain::for_address(self.addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.bind(&self.addr.into()).map_err(bind_error)?;
        socket.listen(128).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;

        let std_listener: std::net::TcpListener = socket.into();
        TcpListener::from_std(std_listener).map_err(bind_error)
    }

    /// Runs the server until the process exits.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` completes.
    pub async fn serve<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        info!("Starting Toxide API server on {}", local);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        info!("API server stopped");
        Ok(())
    }
}
