//! The set of named proxies.
//!
//! Reads take an `Arc` snapshot of the map and never wait on a mutation.
//! Mutations are serialized by an async mutex because they bind and close
//! sockets, and publish a fresh map when they succeed.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ProxyConfig, ProxyUpdate};
use crate::error::{ProxyError, Result};
use crate::proxy::Proxy;

type ProxyMap = BTreeMap<String, Arc<Proxy>>;

/// Registry of proxies keyed by name.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    proxies: RwLock<Arc<ProxyMap>>,
    mutations: Mutex<()>,
}

impl ProxyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<ProxyMap> {
        self.proxies.read().clone()
    }

    fn publish(&self, change: impl FnOnce(&mut ProxyMap)) {
        let mut proxies = self.proxies.write();
        let mut next = (**proxies).clone();
        change(&mut next);
        *proxies = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Creates a proxy and starts it if the definition is enabled.
    ///
    /// Fails with [`ProxyError::ProxyExists`] if the name or a fixed listen
    /// address is already taken.
    pub async fn create(&self, config: ProxyConfig) -> Result<Arc<Proxy>> {
        let _guard = self.mutations.lock().await;
        self.create_locked(config).await
    }

    async fn create_locked(&self, config: ProxyConfig) -> Result<Arc<Proxy>> {
        config.validate()?;

        let current = self.snapshot();
        if current.contains_key(&config.name) {
            return Err(ProxyError::ProxyExists(config.name));
        }
        if let Some(other) = current
            .values()
            .find(|proxy| config.listen_conflicts(&proxy.listen()))
        {
            return Err(ProxyError::ProxyExists(format!(
                "listen address {} is used by {}",
                config.listen,
                other.name()
            )));
        }

        let enabled = config.enabled;
        let proxy = Arc::new(Proxy::new(config));
        if enabled {
            proxy.enable().await?;
        }

        self.publish(|map| {
            map.insert(proxy.name().to_string(), proxy.clone());
        });
        info!(proxy = %proxy.name(), upstream = %proxy.upstream(), enabled, "Proxy created");
        Ok(proxy)
    }

    /// Looks a proxy up by name.
    pub fn find(&self, name: &str) -> Result<Arc<Proxy>> {
        self.snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(name.to_string()))
    }

    /// All proxies ordered by name.
    pub fn list(&self) -> Vec<Arc<Proxy>> {
        self.snapshot().values().cloned().collect()
    }

    /// Proxies whose name matches `pattern`.
    pub fn grep(&self, pattern: &str) -> Result<Vec<Arc<Proxy>>> {
        let pattern = Regex::new(pattern)?;
        Ok(self
            .snapshot()
            .values()
            .filter(|proxy| pattern.is_match(proxy.name()))
            .cloned()
            .collect())
    }

    /// Stops a proxy and removes it.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.mutations.lock().await;
        self.delete_locked(name).await
    }

    async fn delete_locked(&self, name: &str) -> Result<()> {
        let proxy = self.find(name)?;
        self.publish(|map| {
            map.remove(name);
        });
        proxy.destroy().await;
        info!(proxy = %name, "Proxy deleted");
        Ok(())
    }

    /// Changes a proxy's addresses or enabled flag.
    ///
    /// Changing either address restarts a running proxy. Toxics are kept.
    pub async fn update(&self, name: &str, update: ProxyUpdate) -> Result<Arc<Proxy>> {
        let _guard = self.mutations.lock().await;
        let proxy = self.find(name)?;
        let current = proxy.config();

        let listen = update.listen.filter(|listen| *listen != current.listen);
        let upstream = update
            .upstream
            .filter(|upstream| *upstream != current.upstream);

        if let Some(listen) = &listen {
            if listen.trim().is_empty() {
                return Err(ProxyError::InvalidConfig("empty listen address".to_string()));
            }
            let candidate = ProxyConfig::new(name, listen.clone(), current.upstream.clone());
            if let Some(other) = self
                .snapshot()
                .values()
                .filter(|other| other.name() != name)
                .find(|other| candidate.listen_conflicts(&other.listen()))
            {
                return Err(ProxyError::ProxyExists(format!(
                    "listen address {listen} is used by {}",
                    other.name()
                )));
            }
        }
        if upstream.as_ref().is_some_and(|u| u.trim().is_empty()) {
            return Err(ProxyError::InvalidConfig("empty upstream".to_string()));
        }

        let enabled = update.enabled.unwrap_or(current.enabled);
        let restart = listen.is_some() || upstream.is_some();
        if restart {
            proxy.disable().await;
            proxy.reconfigure(listen, upstream);
        }
        if enabled {
            if let Err(e) = proxy.enable().await {
                if restart {
                    warn!(proxy = %name, error = %e, "Update failed, restoring previous addresses");
                    proxy.reconfigure(Some(current.listen), Some(current.upstream));
                    if current.enabled {
                        if let Err(restore) = proxy.enable().await {
                            warn!(proxy = %name, error = %restore, "Could not restart proxy");
                        }
                    }
                }
                return Err(e);
            }
        } else {
            proxy.disable().await;
        }

        info!(proxy = %name, listen = %proxy.listen(), upstream = %proxy.upstream(), enabled, "Proxy updated");
        Ok(proxy)
    }

    /// Creates or replaces a batch of proxies.
    ///
    /// A proxy with the same name and addresses is kept as is, including its
    /// toxics; one whose addresses differ is recreated. Stops at the first
    /// failure.
    pub async fn populate(&self, configs: Vec<ProxyConfig>) -> Result<Vec<Arc<Proxy>>> {
        let _guard = self.mutations.lock().await;

        for config in &configs {
            config.validate()?;
        }

        let mut proxies = Vec::with_capacity(configs.len());
        for config in configs {
            if let Ok(existing) = self.find(&config.name) {
                let current = existing.config();
                if current.upstream == config.upstream
                    && (current.listen == config.listen || config.listen.ends_with(":0"))
                {
                    if config.enabled {
                        existing.enable().await?;
                    } else {
                        existing.disable().await;
                    }
                    proxies.push(existing);
                    continue;
                }
                self.delete_locked(&config.name).await?;
            }
            proxies.push(self.create_locked(config).await?);
        }
        Ok(proxies)
    }

    /// Enables every proxy and removes all toxics.
    pub async fn reset(&self) {
        let _guard = self.mutations.lock().await;
        for proxy in self.list() {
            proxy.toxics().clear();
            if let Err(e) = proxy.enable().await {
                warn!(proxy = %proxy.name(), error = %e, "Failed to re-enable proxy on reset");
            }
        }
        info!("Proxies reset");
    }

    /// Stops and removes every proxy.
    pub async fn shutdown(&self) {
        let _guard = self.mutations.lock().await;
        let proxies = self.snapshot();
        self.publish(|map| map.clear());
        for proxy in proxies.values() {
            proxy.destroy().await;
        }
        info!(count = proxies.len(), "Proxies shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use toxide_core::{Direction, Toxic};

    fn config(name: &str) -> ProxyConfig {
        ProxyConfig::new(name, "127.0.0.1:0", "127.0.0.1:1")
    }

    // ==================== Create / find ====================

    #[tokio::test]
    async fn create_and_find() {
        let registry = ProxyRegistry::new();
        let proxy = assert_ok!(registry.create(config("redis")).await);

        assert!(proxy.is_enabled());
        assert_eq!(registry.find("redis").unwrap().name(), "redis");
        assert!(matches!(
            registry.find("missing"),
            Err(ProxyError::NotFound(_))
        ));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = ProxyRegistry::new();
        assert_ok!(registry.create(config("redis")).await);

        let result = registry.create(config("redis")).await;
        assert!(matches!(result, Err(ProxyError::ProxyExists(_))));
        assert_eq!(registry.len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_listen_is_rejected() {
        let registry = ProxyRegistry::new();
        let first = assert_ok!(registry.create(config("a")).await);

        let taken = ProxyConfig::new("b", first.listen(), "127.0.0.1:1");
        let result = registry.create(taken).await;
        assert!(matches!(result, Err(ProxyError::ProxyExists(_))));
        assert!(registry.find("b").is_err());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_proxy_does_not_bind() {
        let registry = ProxyRegistry::new();
        let proxy = assert_ok!(registry.create(config("off").with_enabled(false)).await);
        assert!(!proxy.is_enabled());
        assert_eq!(proxy.listen(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let registry = ProxyRegistry::new();
        let result = registry
            .create(ProxyConfig::new("x", "127.0.0.1:0", ""))
            .await;
        assert!(matches!(result, Err(ProxyError::InvalidConfig(_))));
    }

    // ==================== List / grep / delete ====================

    #[tokio::test]
    async fn list_is_sorted_and_grep_filters() {
        let registry = ProxyRegistry::new();
        for name in ["redis_b", "mysql", "redis_a"] {
            assert_ok!(registry.create(config(name).with_enabled(false)).await);
        }

        let names: Vec<String> = registry
            .list()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, ["mysql", "redis_a", "redis_b"]);

        let matched = registry.grep("^redis").unwrap();
        assert_eq!(matched.len(), 2);
        assert!(matches!(
            registry.grep("("),
            Err(ProxyError::Pattern(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_and_reports_missing() {
        let registry = ProxyRegistry::new();
        let proxy = assert_ok!(registry.create(config("gone")).await);

        assert_ok!(registry.delete("gone").await);
        assert!(registry.is_empty());
        assert_eq!(proxy.state(), crate::proxy::ProxyState::Destroyed);
        assert_err!(registry.delete("gone").await);
    }

    // ==================== Update / populate / reset ====================

    #[tokio::test]
    async fn update_toggles_enabled_and_keeps_toxics() {
        let registry = ProxyRegistry::new();
        let proxy = assert_ok!(registry.create(config("p")).await);
        proxy
            .toxics()
            .add(Toxic::latency("lag", 10, 0, Direction::Downstream))
            .unwrap();

        let update = ProxyUpdate {
            enabled: Some(false),
            ..Default::default()
        };
        let proxy = assert_ok!(registry.update("p", update).await);
        assert!(!proxy.is_enabled());

        let update = ProxyUpdate {
            enabled: Some(true),
            ..Default::default()
        };
        let proxy = assert_ok!(registry.update("p", update).await);
        assert!(proxy.is_enabled());
        assert_eq!(proxy.toxics().list().len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn update_upstream_restarts() {
        let registry = ProxyRegistry::new();
        assert_ok!(registry.create(config("p")).await);

        let update = ProxyUpdate {
            upstream: Some("127.0.0.1:2".to_string()),
            ..Default::default()
        };
        let proxy = assert_ok!(registry.update("p", update).await);
        assert_eq!(proxy.upstream(), "127.0.0.1:2");
        assert!(proxy.is_enabled());

        assert!(matches!(
            registry.update("nope", ProxyUpdate::default()).await,
            Err(ProxyError::NotFound(_))
        ));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn update_to_busy_address_restores_previous() {
        let registry = ProxyRegistry::new();
        let proxy = assert_ok!(registry.create(config("p")).await);
        let before = proxy.listen();

        let busy = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let update = ProxyUpdate {
            listen: Some(busy.local_addr().unwrap().to_string()),
            upstream: Some("127.0.0.1:2".to_string()),
            ..Default::default()
        };
        assert_err!(registry.update("p", update).await);

        assert_eq!(proxy.listen(), before);
        assert_eq!(proxy.upstream(), "127.0.0.1:1");
        assert!(proxy.is_enabled());
        assert_ok!(tokio::net::TcpStream::connect(&before).await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn populate_keeps_matching_and_replaces_changed() {
        let registry = ProxyRegistry::new();
        let kept = assert_ok!(registry.create(config("kept")).await);
        kept.toxics()
            .add(Toxic::latency("lag", 10, 0, Direction::Downstream))
            .unwrap();
        assert_ok!(registry.create(config("changed")).await);

        let proxies = assert_ok!(
            registry
                .populate(vec![
                    config("kept"),
                    ProxyConfig::new("changed", "127.0.0.1:0", "127.0.0.1:9"),
                    config("new"),
                ])
                .await
        );

        assert_eq!(proxies.len(), 3);
        assert!(Arc::ptr_eq(&proxies[0], &kept));
        assert_eq!(kept.toxics().list().len(), 1);
        assert_eq!(registry.find("changed").unwrap().upstream(), "127.0.0.1:9");
        assert_eq!(registry.len(), 3);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn reset_enables_and_clears_toxics() {
        let registry = ProxyRegistry::new();
        let proxy = assert_ok!(registry.create(config("p")).await);
        proxy
            .toxics()
            .add(Toxic::timeout("t", 0, Direction::Upstream))
            .unwrap();
        proxy.disable().await;

        registry.reset().await;
        assert!(proxy.is_enabled());
        assert!(proxy.toxics().list().is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let registry = ProxyRegistry::new();
        let a = assert_ok!(registry.create(config("a")).await);
        let b = assert_ok!(registry.create(config("b")).await);

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert_eq!(a.state(), crate::proxy::ProxyState::Destroyed);
        assert_eq!(b.state(), crate::proxy::ProxyState::Destroyed);
    }
}
