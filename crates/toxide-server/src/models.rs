//! API request and response models.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use toxide_core::Toxic;
use toxide_proxy::Proxy;

/// A proxy as returned by the API.
#[derive(Debug, Serialize)]
pub struct ProxyResponse {
    pub name: String,
    /// Resolved listen address once the proxy has been started.
    pub listen: String,
    pub upstream: String,
    pub enabled: bool,
    /// Attached toxics, upstream first. Omitted in listings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toxics: Option<Vec<Toxic>>,
}

impl ProxyResponse {
    /// Summary without toxics.
    pub fn summary(proxy: &Proxy) -> Self {
        let config = proxy.config();
        Self {
            name: config.name,
            listen: config.listen,
            upstream: config.upstream,
            enabled: config.enabled,
            toxics: None,
        }
    }

    /// Full view including toxics.
    pub fn detailed(proxy: &Proxy) -> Self {
        Self {
            toxics: Some(proxy.toxics().list()),
            ..Self::summary(proxy)
        }
    }
}

/// A toxic in a per-direction listing, attributes at the top level.
#[derive(Debug, Serialize)]
pub struct ToxicAttributes {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub toxicity: f32,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl From<&Toxic> for ToxicAttributes {
    fn from(toxic: &Toxic) -> Self {
        let attributes = match toxic.kind.attributes() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: toxic.type_name(),
            toxicity: toxic.toxicity,
            attributes,
        }
    }
}

/// Response body for POST /populate.
#[derive(Debug, Serialize)]
pub struct PopulateResponse {
    pub proxies: Vec<ProxyResponse>,
}

/// Query parameters for GET /proxies.
#[derive(Debug, Default, Deserialize)]
pub struct ProxiesQuery {
    /// Regular expression the proxy name must match.
    pub filter: Option<String>,
}
