//! Toxide Proxy - fault-injecting TCP proxies.
//!
//! This crate owns the data plane: listeners, client links and the registry
//! that the control API drives. Toxic definitions and their transforms live in
//! `toxide-core`; this crate applies them to live sockets.
//!
//! ## Features
//!
//! - Named proxies with a listen and an upstream address
//! - Enable/disable without losing attached toxics
//! - One link per client, with an independent pump per direction
//! - Toxic changes reach live connections without restarting them
//! - `reset_peer` aborts with RST, `slow_close` and `limit_data` shape the close
//!
//! ## Architecture
//!
//! ```text
//!  client ──▶ listener ──▶ Link ──┬─▶ Pump (upstream)   ── upstream chain ──▶ upstream
//!                                 └─◀ Pump (downstream) ◀─ downstream chain ─┘
//! ```

mod config;
mod error;
mod link;
mod proxy;
mod pump;
mod registry;

pub use config::{
    ProxyConfig, ProxyUpdate, ACCEPT_BACKOFF, DEFAULT_LISTEN, DIAL_TIMEOUT, DRAIN_TIMEOUT,
    MAX_QUEUED_BYTES, READ_BUFFER_SIZE,
};
pub use error::{ProxyError, Result};
pub use link::{Link, LinkInfo, LinkState, LinkTable};
pub use proxy::{Proxy, ProxyState};
pub use pump::{Pump, PumpEnd};
pub use registry::ProxyRegistry;
