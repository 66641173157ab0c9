// src/config.rs

//! Client configuration: defaults, validation, and URI parsing.

use crate::core::NsqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// The default nsqlookupd HTTP port, applied when a lookup URI omits one.
const DEFAULT_LOOKUPD_PORT: u16 = 4161;

/// The address of a single nsqd node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct NsqdAddress {
    pub host: String,
    pub port: u16,
}

impl NsqdAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NsqdAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NsqdAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Options governing a single nsqd connection, shared by publishers and
/// subscribers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionConfig {
    /// An identifier sent in the IDENTIFY body; nsqd shows it in admin
    /// tooling.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Overrides the hostname reported during IDENTIFY. Defaults to the
    /// machine hostname.
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Secret for the AUTH command, sent when the server negotiates
    /// `auth_required`.
    #[serde(default)]
    pub auth_secret: Option<String>,

    /// Requested server-side message timeout. The server may clamp it; the
    /// negotiated value from the IDENTIFY response is authoritative.
    #[serde(default)]
    pub msg_timeout_ms: Option<u64>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Each reconnect waits `attempts x this factor`, capped below.
    #[serde(default = "default_reconnect_delay_factor_ms")]
    pub reconnect_delay_factor_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            client_id: None,
            hostname: None,
            user_agent: default_user_agent(),
            auth_secret: None,
            msg_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            reconnect_delay_factor_ms: default_reconnect_delay_factor_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay_factor(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_factor_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }
}

fn default_user_agent() -> String {
    concat!("nsq-client/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_max_connect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_factor_ms() -> u64 {
    1_000
}
fn default_max_reconnect_delay_ms() -> u64 {
    30_000 // 30 seconds
}

/// Configuration for a [`Publisher`](crate::Publisher).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,

    /// Default topic for publish calls that omit one.
    #[serde(default)]
    pub topic: Option<String>,

    /// When true, the first publish establishes the connection on demand.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl PublisherConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PublisherConfig {
            host: host.into(),
            port,
            topic: None,
            auto_connect: default_true(),
            connection: ConnectionConfig::default(),
        }
    }

    pub fn address(&self) -> NsqdAddress {
        NsqdAddress::new(self.host.clone(), self.port)
    }

    pub fn validate(&self) -> Result<(), NsqError> {
        if self.host.is_empty() {
            return Err(NsqError::InvalidRequest("publisher host is empty".into()));
        }
        if let Some(topic) = &self.topic {
            validate_topic(topic)?;
        }
        Ok(())
    }

    /// Parses a `nsq://host:port/topic?opt=...` URI.
    pub fn from_uri(uri: &str) -> Result<Self, NsqError> {
        let parts = UriParts::parse(uri)?;
        if parts.scheme != "nsq" {
            return Err(NsqError::InvalidUri(format!(
                "expected scheme 'nsq', got '{}'",
                parts.scheme
            )));
        }
        let (host, port) = parts.single_authority()?;

        let mut config = PublisherConfig::new(host, port);
        if !parts.path.is_empty() {
            config.topic = Some(parts.path.clone());
        }
        for (key, value) in parts.query_pairs() {
            match key.as_str() {
                "autoConnect" | "auto_connect" => {
                    config.auto_connect = parse_bool(&key, &value)?;
                }
                _ => apply_connection_option(&mut config.connection, &key, &value)?,
            }
        }
        config.validate()?;
        Ok(config)
    }
}

/// Configuration for a [`Subscriber`](crate::Subscriber).
///
/// Exactly one of `nsqd` (direct mode) or a non-empty `lookup` list
/// (discovery mode) must be provided.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubscriberConfig {
    pub topic: String,
    pub channel: String,

    /// Direct mode: a single nsqd to subscribe to.
    #[serde(default)]
    pub nsqd: Option<NsqdAddress>,

    /// Discovery mode: nsqlookupd base URLs, polled every
    /// `discover_frequency_ms`. Scheme-less entries get `http://` prefixed.
    #[serde(default)]
    pub lookup: Vec<String>,

    /// Upper bound on aggregate inflight messages across all connections.
    #[serde(default = "default_concurrency")]
    pub concurrency: u64,

    #[serde(default = "default_discover_frequency_ms")]
    pub discover_frequency_ms: u64,

    /// How long before each inflight deadline the keepalive helper issues
    /// its TOUCH.
    #[serde(default = "default_keepalive_offset_ms")]
    pub keepalive_offset_ms: u64,

    #[serde(default = "default_true")]
    pub auto_connect: bool,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl SubscriberConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        SubscriberConfig {
            topic: topic.into(),
            channel: channel.into(),
            nsqd: None,
            lookup: Vec::new(),
            concurrency: default_concurrency(),
            discover_frequency_ms: default_discover_frequency_ms(),
            keepalive_offset_ms: default_keepalive_offset_ms(),
            auto_connect: default_true(),
            connection: ConnectionConfig::default(),
        }
    }

    pub fn discover_frequency(&self) -> Duration {
        Duration::from_millis(self.discover_frequency_ms)
    }

    pub fn keepalive_offset(&self) -> Duration {
        Duration::from_millis(self.keepalive_offset_ms)
    }

    pub fn validate(&self) -> Result<(), NsqError> {
        validate_topic(&self.topic)?;
        validate_channel(&self.channel)?;
        match (&self.nsqd, self.lookup.is_empty()) {
            (None, true) => Err(NsqError::InvalidRequest(
                "subscriber needs either an nsqd address or a lookup list".into(),
            )),
            (Some(_), false) => Err(NsqError::InvalidRequest(
                "subscriber takes an nsqd address or a lookup list, not both".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Parses a `nsqlookup://host1:4161,host2:4161/topic?channel=ch` URI
    /// (discovery mode) or a `nsq://host:port/topic?channel=ch` URI (direct
    /// mode).
    pub fn from_uri(uri: &str) -> Result<Self, NsqError> {
        let parts = UriParts::parse(uri)?;
        if parts.path.is_empty() {
            return Err(NsqError::InvalidUri("missing topic path segment".into()));
        }

        let mut config = SubscriberConfig::new(parts.path.clone(), String::new());
        match parts.scheme.as_str() {
            "nsq" => {
                let (host, port) = parts.single_authority()?;
                config.nsqd = Some(NsqdAddress::new(host, port));
            }
            "nsqlookup" => {
                for entry in parts.authority.split(',').filter(|e| !e.is_empty()) {
                    let (host, port) = split_host_port(entry, Some(DEFAULT_LOOKUPD_PORT))?;
                    config.lookup.push(format!("http://{host}:{port}"));
                }
            }
            other => {
                return Err(NsqError::InvalidUri(format!(
                    "expected scheme 'nsq' or 'nsqlookup', got '{other}'"
                )));
            }
        }

        for (key, value) in parts.query_pairs() {
            match key.as_str() {
                "channel" => config.channel = value.clone(),
                "concurrency" => config.concurrency = parse_number(&key, &value)?,
                "discoverFrequency" | "discover_frequency" => {
                    config.discover_frequency_ms = parse_number(&key, &value)?;
                }
                "keepaliveOffset" | "keepalive_offset" => {
                    config.keepalive_offset_ms = parse_number(&key, &value)?;
                }
                "autoConnect" | "auto_connect" => {
                    config.auto_connect = parse_bool(&key, &value)?;
                }
                "ssl" => {
                    // TLS negotiation is out of scope; acknowledge and move on.
                    warn!("ignoring 'ssl' option in subscriber URI: TLS is not supported");
                }
                _ => apply_connection_option(&mut config.connection, &key, &value)?,
            }
        }

        if config.channel.is_empty() {
            return Err(NsqError::InvalidUri(
                "subscriber URI requires a 'channel' option".into(),
            ));
        }
        config.validate()?;
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}
fn default_concurrency() -> u64 {
    1
}
fn default_discover_frequency_ms() -> u64 {
    30_000 // 30 seconds
}
fn default_keepalive_offset_ms() -> u64 {
    5_000
}

/// Applies a query option shared by both URI forms to a connection config.
fn apply_connection_option(
    config: &mut ConnectionConfig,
    key: &str,
    value: &str,
) -> Result<(), NsqError> {
    match key {
        "clientId" | "client_id" => config.client_id = Some(value.to_string()),
        "timeout" => config.connect_timeout_ms = parse_number(key, value)?,
        "msgTimeout" | "msg_timeout" => config.msg_timeout_ms = Some(parse_number(key, value)?),
        "maxConnectAttempts" | "max_connect_attempts" => {
            config.max_connect_attempts = parse_number(key, value)?;
        }
        "reconnectDelayFactor" | "reconnect_delay_factor" => {
            config.reconnect_delay_factor_ms = parse_number(key, value)?;
        }
        "maxReconnectDelay" | "max_reconnect_delay" => {
            config.max_reconnect_delay_ms = parse_number(key, value)?;
        }
        other => {
            return Err(NsqError::InvalidUri(format!("unknown option '{other}'")));
        }
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, NsqError> {
    value
        .parse()
        .map_err(|_| NsqError::InvalidUri(format!("option '{key}' has non-numeric value '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, NsqError> {
    match value {
        "true" | "1" | "" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(NsqError::InvalidUri(format!(
            "option '{key}' has non-boolean value '{other}'"
        ))),
    }
}

/// The pieces of an `nsq://` / `nsqlookup://` URI. The authority may hold a
/// comma-separated host list, which `url::Url` cannot represent, so the
/// split is done by hand and only the query string goes through `url`'s
/// form decoder.
struct UriParts {
    scheme: String,
    authority: String,
    path: String,
    query: String,
}

impl UriParts {
    fn parse(uri: &str) -> Result<Self, NsqError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| NsqError::InvalidUri(format!("'{uri}' has no scheme")))?;

        let (without_query, query) = match rest.split_once('?') {
            Some((head, query)) => (head, query),
            None => (rest, ""),
        };
        let (authority, path) = match without_query.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (without_query, ""),
        };
        if authority.is_empty() {
            return Err(NsqError::InvalidUri(format!("'{uri}' has no host")));
        }

        Ok(UriParts {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            path: path.trim_matches('/').to_string(),
            query: query.to_string(),
        })
    }

    fn single_authority(&self) -> Result<(String, u16), NsqError> {
        if self.authority.contains(',') {
            return Err(NsqError::InvalidUri(
                "multiple hosts are only valid with the 'nsqlookup' scheme".into(),
            ));
        }
        split_host_port(&self.authority, None)
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

fn split_host_port(authority: &str, default_port: Option<u16>) -> Result<(String, u16), NsqError> {
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| NsqError::InvalidUri(format!("invalid port in '{authority}'")))?;
            Ok((host.to_string(), port))
        }
        None => match default_port {
            Some(port) => Ok((authority.to_string(), port)),
            None => Err(NsqError::InvalidUri(format!(
                "'{authority}' is missing a port"
            ))),
        },
    }
}

/// Validates an NSQ topic name: 1-64 characters drawn from
/// `[.a-zA-Z0-9_-]`, with an optional `#ephemeral` suffix.
pub fn validate_topic(name: &str) -> Result<(), NsqError> {
    if valid_name(name) {
        Ok(())
    } else {
        Err(NsqError::InvalidTopic(name.to_string()))
    }
}

/// Validates an NSQ channel name under the same rules as topics.
pub fn validate_channel(name: &str) -> Result<(), NsqError> {
    if valid_name(name) {
        Ok(())
    } else {
        Err(NsqError::InvalidChannel(name.to_string()))
    }
}

fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
