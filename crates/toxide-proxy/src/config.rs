//! Proxy configuration and data-plane tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Listen address used when a proxy definition omits one.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:0";

/// Size of the buffer each pump reads into.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Pumps stop reading once this many bytes are waiting to be written.
pub const MAX_QUEUED_BYTES: usize = 256 * 1024;

/// How long a link waits for the upstream connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long disabling a proxy waits for its links to finish.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_enabled() -> bool {
    true
}

/// Proxy definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Unique proxy name.
    pub name: String,
    /// Address to listen on; port 0 picks a free port.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Address to forward connections to.
    pub upstream: String,
    /// Whether the proxy accepts connections.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ProxyConfig {
    /// Creates an enabled proxy definition.
    pub fn new(
        name: impl Into<String>,
        listen: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            upstream: upstream.into(),
            enabled: true,
        }
    }

    /// Sets whether the proxy starts enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Checks that required fields are present.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::InvalidConfig("missing name".to_string()));
        }
        if self.upstream.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(format!(
                "missing upstream for proxy {}",
                self.name
            )));
        }
        if self.listen.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(format!(
                "missing listen address for proxy {}",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns true if both definitions would bind the same fixed address.
    ///
    /// Port 0 never conflicts; the bind itself settles those.
    pub(crate) fn listen_conflicts(&self, other: &str) -> bool {
        self.listen == other && !self.listen.ends_with(":0")
    }
}

/// Partial update of a proxy. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyUpdate {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_defaults() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"name": "redis", "upstream": "localhost:6379"}"#).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert!(config.enabled);
    }

    #[test]
    fn validate_requires_fields() {
        assert!(ProxyConfig::new("", "127.0.0.1:0", "x:1").validate().is_err());
        assert!(ProxyConfig::new("a", "127.0.0.1:0", "").validate().is_err());
        assert!(ProxyConfig::new("a", "", "x:1").validate().is_err());
        assert!(ProxyConfig::new("a", "127.0.0.1:0", "x:1").validate().is_ok());
    }

    #[test]
    fn port_zero_never_conflicts() {
        let config = ProxyConfig::new("a", "127.0.0.1:0", "x:1");
        assert!(!config.listen_conflicts("127.0.0.1:0"));

        let config = ProxyConfig::new("a", "127.0.0.1:5555", "x:1");
        assert!(config.listen_conflicts("127.0.0.1:5555"));
        assert!(!config.listen_conflicts("127.0.0.1:5556"));
    }
}
