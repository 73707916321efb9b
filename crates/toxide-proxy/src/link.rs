//! Links: one accepted client connection and its upstream connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use toxide_core::{Direction, ToxicChains};

use crate::config::DIAL_TIMEOUT;
use crate::pump::{Pump, PumpEnd};

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Dialing the upstream.
    Connecting,
    /// Both pumps are running.
    Piping,
    /// One side ended; waiting for the other pump.
    Closing,
    /// Sockets released.
    Closed,
}

/// Point-in-time view of a link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    pub id: u64,
    pub client: SocketAddr,
    pub state: LinkState,
}

#[derive(Debug)]
struct LinkEntry {
    client: SocketAddr,
    state: Arc<RwLock<LinkState>>,
}

/// Live links of one proxy.
#[derive(Debug, Default)]
pub struct LinkTable {
    next_id: AtomicU64,
    links: Mutex<HashMap<u64, LinkEntry>>,
}

impl LinkTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live links.
    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    /// Returns true if no link is live.
    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    /// Lists live links ordered by id.
    pub fn snapshot(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self
            .links
            .lock()
            .iter()
            .map(|(id, entry)| LinkInfo {
                id: *id,
                client: entry.client,
                state: *entry.state.read(),
            })
            .collect();
        links.sort_by_key(|link| link.id);
        links
    }

    fn register(&self, client: SocketAddr) -> (u64, Arc<RwLock<LinkState>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let state = Arc::new(RwLock::new(LinkState::Connecting));
        self.links.lock().insert(
            id,
            LinkEntry {
                client,
                state: state.clone(),
            },
        );
        (id, state)
    }

    fn deregister(&self, id: u64) {
        self.links.lock().remove(&id);
    }
}

/// A client connection being proxied to the upstream.
///
/// The link is registered in its proxy's [`LinkTable`] on creation and removes
/// itself once both pumps have stopped and the sockets are released.
#[derive(Debug)]
pub struct Link {
    id: u64,
    proxy: String,
    client: SocketAddr,
    state: Arc<RwLock<LinkState>>,
    cancel: CancellationToken,
    table: Weak<LinkTable>,
}

impl Link {
    /// Registers a new link for `client`.
    pub fn register(
        table: &Arc<LinkTable>,
        proxy: &str,
        client: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        let (id, state) = table.register(client);
        Self {
            id,
            proxy: proxy.to_string(),
            client,
            state,
            cancel,
            table: Arc::downgrade(table),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    /// Dials the upstream and pipes both directions until the link ends.
    pub async fn run(self, client: TcpStream, upstream: String, toxics: Arc<ToxicChains>) {
        let dialed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(upstream.as_str())) => {
                match result {
                    Ok(Ok(stream)) => Some(stream),
                    Ok(Err(e)) => {
                        warn!(proxy = %self.proxy, upstream = %upstream, error = %e, "Unable to connect to upstream");
                        None
                    }
                    Err(_) => {
                        warn!(proxy = %self.proxy, upstream = %upstream, "Timed out connecting to upstream");
                        None
                    }
                }
            }
        };

        if let Some(upstream_stream) = dialed {
            self.pipe(client, upstream_stream, &toxics).await;
        }

        self.set_state(LinkState::Closed);
        if let Some(table) = self.table.upgrade() {
            table.deregister(self.id);
        }
    }

    async fn pipe(&self, client: TcpStream, upstream: TcpStream, toxics: &ToxicChains) {
        for stream in [&client, &upstream] {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(proxy = %self.proxy, link = self.id, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let up = Pump::new(
            Direction::Upstream,
            client_read,
            upstream_write,
            toxics.get(Direction::Upstream).subscribe(),
            self.cancel.clone(),
        );
        let down = Pump::new(
            Direction::Downstream,
            upstream_read,
            client_write,
            toxics.get(Direction::Downstream).subscribe(),
            self.cancel.clone(),
        );

        self.set_state(LinkState::Piping);
        debug!(proxy = %self.proxy, link = self.id, client = %self.client, "Link piping");

        let mut up_task = tokio::spawn(up.run_to_end());
        let mut down_task = tokio::spawn(down.run_to_end());

        let (first, result) = tokio::select! {
            result = &mut up_task => (Direction::Upstream, result),
            result = &mut down_task => (Direction::Downstream, result),
        };

        self.set_state(LinkState::Closing);
        self.cancel.cancel();

        let (up_result, down_result) = match first {
            Direction::Upstream => (result, down_task.await),
            Direction::Downstream => (up_task.await, result),
        };

        let finished: Vec<(PumpEnd, Pump<_, _>)> = [up_result, down_result]
            .into_iter()
            .filter_map(|result| match result {
                Ok(finished) => Some(finished),
                Err(e) => {
                    warn!(proxy = %self.proxy, link = self.id, error = %e, "Pump task failed");
                    None
                }
            })
            .collect();

        let reset = finished.iter().any(|(end, _)| end.is_reset());
        for (end, pump) in &finished {
            if reset {
                pump.abort_on_drop();
            }
            debug!(
                proxy = %self.proxy,
                link = self.id,
                direction = %pump.direction(),
                bytes = pump.written(),
                end = ?end,
                "Pump stopped"
            );
        }

        if reset {
            debug!(proxy = %self.proxy, link = self.id, "Link reset");
        }
    }
}
