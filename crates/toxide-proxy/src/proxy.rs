//! A named TCP proxy: listener, toxic chains and live links.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use toxide_core::ToxicChains;

use crate::config::{ProxyConfig, ACCEPT_BACKOFF, DRAIN_TIMEOUT};
use crate::error::{ProxyError, Result};
use crate::link::{Link, LinkInfo, LinkTable};

/// Proxy lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    /// Defined but never started.
    Created,
    /// Accepting connections.
    Listening,
    /// Stopped; toxics are kept.
    Disabled,
    /// Removed from the registry.
    Destroyed,
}

/// A running listener and its cancellation scope.
#[derive(Debug)]
struct Session {
    addr: SocketAddr,
    cancel: CancellationToken,
    accept: JoinHandle<()>,
}

/// A named TCP proxy.
///
/// Each accepted connection becomes a [`Link`] to the upstream. Toxics live in
/// the proxy's [`ToxicChains`] and survive disable/enable cycles.
#[derive(Debug)]
pub struct Proxy {
    name: String,
    config: RwLock<ProxyConfig>,
    state: RwLock<ProxyState>,
    toxics: Arc<ToxicChains>,
    links: Arc<LinkTable>,
    tasks: TaskTracker,
    session: Mutex<Option<Session>>,
}

impl Proxy {
    /// Creates a stopped proxy.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            state: RwLock::new(ProxyState::Created),
            toxics: Arc::new(ToxicChains::new()),
            links: Arc::new(LinkTable::new()),
            tasks: TaskTracker::new(),
            session: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current listen address; the bound address once the proxy has started.
    pub fn listen(&self) -> String {
        self.config.read().listen.clone()
    }

    pub fn upstream(&self) -> String {
        self.config.read().upstream.clone()
    }

    pub fn state(&self) -> ProxyState {
        *self.state.read()
    }

    /// Returns true while the proxy accepts connections.
    pub fn is_enabled(&self) -> bool {
        self.state() == ProxyState::Listening
    }

    /// Current definition, with `enabled` reflecting the live state.
    pub fn config(&self) -> ProxyConfig {
        let mut config = self.config.read().clone();
        config.enabled = self.is_enabled();
        config
    }

    /// The proxy's toxic chains.
    pub fn toxics(&self) -> &ToxicChains {
        &self.toxics
    }

    /// Live links.
    pub fn links(&self) -> Vec<LinkInfo> {
        self.links.snapshot()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Replaces the listen and upstream addresses. Takes effect on next enable.
    pub(crate) fn reconfigure(&self, listen: Option<String>, upstream: Option<String>) {
        let mut config = self.config.write();
        if let Some(listen) = listen {
            config.listen = listen;
        }
        if let Some(upstream) = upstream {
            config.upstream = upstream;
        }
    }

    /// Binds the listen address and starts accepting.
    ///
    /// Returns the bound address. Enabling a listening proxy is a no-op.
    pub async fn enable(&self) -> Result<SocketAddr> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            return Ok(current.addr);
        }
        if self.state() == ProxyState::Destroyed {
            return Err(ProxyError::NotFound(self.name.clone()));
        }

        let (listen, upstream) = {
            let config = self.config.read();
            (config.listen.clone(), config.upstream.clone())
        };

        let addr = resolve(&listen).await?;
        let listener = bind(addr).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ProxyError::ProxyExists(format!("listen address {listen} is in use"))
            } else {
                ProxyError::Bind { addr, source: e }
            }
        })?;
        let bound = listener.local_addr()?;
        self.config.write().listen = bound.to_string();

        let cancel = CancellationToken::new();
        let acceptor = Acceptor {
            name: self.name.clone(),
            upstream: upstream.clone(),
            listener,
            toxics: self.toxics.clone(),
            links: self.links.clone(),
            tasks: self.tasks.clone(),
            cancel: cancel.clone(),
        };
        let accept = tokio::spawn(acceptor.run());

        *session = Some(Session {
            addr: bound,
            cancel,
            accept,
        });
        *self.state.write() = ProxyState::Listening;

        info!(proxy = %self.name, listen = %bound, upstream = %upstream, "Proxy started");
        Ok(bound)
    }

    /// Stops accepting and closes every live link.
    ///
    /// Waits up to the drain timeout for links to release their sockets.
    pub async fn disable(&self) {
        let mut session = self.session.lock().await;
        let Some(current) = session.take() else {
            let mut state = self.state.write();
            if *state == ProxyState::Created {
                *state = ProxyState::Disabled;
            }
            return;
        };

        current.cancel.cancel();
        if let Err(e) = current.accept.await {
            warn!(proxy = %self.name, error = %e, "Accept loop ended abnormally");
        }

        self.tasks.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(proxy = %self.name, links = self.links.len(), "Links did not close in time");
        }
        self.tasks.reopen();

        let mut state = self.state.write();
        if *state != ProxyState::Destroyed {
            *state = ProxyState::Disabled;
        }
        info!(proxy = %self.name, listen = %current.addr, "Proxy stopped");
    }

    /// Stops the proxy for good.
    pub async fn destroy(&self) {
        self.disable().await;
        *self.state.write() = ProxyState::Destroyed;
        self.toxics.clear();
    }
}

struct Acceptor {
    name: String,
    upstream: String,
    listener: TcpListener,
    toxics: Arc<ToxicChains>,
    links: Arc<LinkTable>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Acceptor {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((client, peer)) => self.spawn_link(client, peer),
                Err(e) => {
                    warn!(proxy = %self.name, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!(proxy = %self.name, "Accept loop stopped");
    }

    fn spawn_link(&self, client: TcpStream, peer: SocketAddr) {
        let link = Link::register(&self.links, &self.name, peer, self.cancel.child_token());
        debug!(proxy = %self.name, link = link.id(), client = %peer, "Accepted client");
        self.tasks
            .spawn(link.run(client, self.upstream.clone(), self.toxics.clone()));
    }
}

/// Resolves a listen address, preferring IPv4.
async fn resolve(listen: &str) -> Result<SocketAddr> {
    let invalid = |reason: String| ProxyError::InvalidAddress {
        addr: listen.to_string(),
        reason,
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(listen)
        .await
        .map_err(|e| invalid(e.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| invalid("no addresses found".to_string()))
}

/// Binds a listener with SO_REUSEADDR so a disabled proxy can rebind at once.
fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    let listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(listener)
}
