// src/lookup.rs

//! Topic discovery: the nsqlookupd HTTP client and the seam between
//! lookup-driven and statically configured producer sets.

use crate::config::NsqdAddress;
use crate::core::NsqError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// One nsqd node as advertised by nsqlookupd.
#[derive(Deserialize, Debug, Clone)]
pub struct Producer {
    pub broadcast_address: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub version: String,
}

impl Producer {
    pub fn address(&self) -> NsqdAddress {
        NsqdAddress::new(self.broadcast_address.clone(), self.tcp_port)
    }
}

/// The JSON body of a `/lookup?topic=...` response.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct LookupResponse {
    #[serde(default)]
    pub producers: Vec<Producer>,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Where a subscriber's producer set comes from. `LookupDiscovery` polls
/// nsqlookupd; `StaticDiscovery` pins the set given at construction.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Resolves the current producer set for a topic. Per-source failures
    /// come back alongside whatever succeeded; discovery never aborts a
    /// poll wholesale.
    async fn discover(&self, topic: &str) -> (Vec<NsqdAddress>, Vec<NsqError>);

    /// Whether results go stale and deserve periodic re-polling.
    fn is_periodic(&self) -> bool {
        true
    }
}

/// A thin HTTP client for the nsqlookupd `/lookup` endpoint.
pub struct LookupClient {
    http: reqwest::Client,
}

impl LookupClient {
    pub fn new() -> Result<Self, NsqError> {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| NsqError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;
        Ok(LookupClient { http })
    }

    /// GETs `{url}/lookup?topic={topic}`, rejecting on transport errors,
    /// non-200 statuses, and unparseable bodies. Every failure carries the
    /// lookup host and surfaces with code `ELOOKUPERROR`.
    pub async fn lookup(&self, base_url: &str, topic: &str) -> Result<LookupResponse, NsqError> {
        let base = normalize_lookup_url(base_url);
        let encoded_topic: String = url::form_urlencoded::byte_serialize(topic.as_bytes()).collect();
        let url = format!("{base}/lookup?topic={encoded_topic}");
        debug!("looking up topic '{topic}' at {base}");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| lookup_error(base_url, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(lookup_error(base_url, format!("HTTP status {status}")));
        }
        response
            .json::<LookupResponse>()
            .await
            .map_err(|e| lookup_error(base_url, format!("unparseable response: {e}")))
    }
}

fn lookup_error(host: &str, message: String) -> NsqError {
    NsqError::Lookup {
        host: host.to_string(),
        message,
    }
}

/// Prefixes `http://` when a lookup URL has no scheme, and strips any
/// trailing slash so path concatenation stays clean.
pub fn normalize_lookup_url(url: &str) -> String {
    let with_scheme = if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{url}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

/// Discovery backed by one or more nsqlookupd instances. Each poll unions
/// the producers from every reachable URL.
pub struct LookupDiscovery {
    client: LookupClient,
    urls: Vec<String>,
}

impl LookupDiscovery {
    pub fn new(urls: Vec<String>) -> Result<Self, NsqError> {
        Ok(LookupDiscovery {
            client: LookupClient::new()?,
            urls,
        })
    }
}

#[async_trait]
impl Discovery for LookupDiscovery {
    async fn discover(&self, topic: &str) -> (Vec<NsqdAddress>, Vec<NsqError>) {
        let mut addresses: Vec<NsqdAddress> = Vec::new();
        let mut errors = Vec::new();

        for url in &self.urls {
            match self.client.lookup(url, topic).await {
                Ok(response) => {
                    for producer in response.producers {
                        let address = producer.address();
                        if !addresses.contains(&address) {
                            addresses.push(address);
                        }
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        (addresses, errors)
    }
}

/// Discovery for direct mode: a fixed producer set, polled once.
pub struct StaticDiscovery {
    addresses: Vec<NsqdAddress>,
}

impl StaticDiscovery {
    pub fn new(addresses: Vec<NsqdAddress>) -> Self {
        StaticDiscovery { addresses }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, _topic: &str) -> (Vec<NsqdAddress>, Vec<NsqError>) {
        (self.addresses.clone(), Vec::new())
    }

    fn is_periodic(&self) -> bool {
        false
    }
}
