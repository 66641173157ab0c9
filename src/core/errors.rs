// src/core/errors.rs

//! Defines the primary error type for the entire client.

use std::sync::Arc;
use thiserror::Error;

/// Server error codes that reject the pending command but leave the
/// connection open. Every other server error half-closes the socket and
/// lets the reconnect policy take over.
const NON_FATAL_ERROR_CODES: [&str; 3] = ["E_REQ_FAILED", "E_FIN_FAILED", "E_TOUCH_FAILED"];

/// The stable code attached to nsqlookupd failures.
pub const LOOKUP_ERROR_CODE: &str = "ELOOKUPERROR";

/// The main error enum, representing all possible failures within the client.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum NsqError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// Returned by the codec when the buffer does not yet hold a full frame.
    /// Never surfaces to the user; the framed reader waits for more data.
    #[error("Incomplete frame in stream")]
    IncompleteFrame,

    /// A framing violation (bad size prefix, unknown frame type). Fatal to
    /// the socket.
    #[error("Protocol Error: {0}")]
    Protocol(String),

    /// An ERROR frame from nsqd. `code` is the leading token (`E_INVALID`,
    /// `E_FIN_FAILED`, ...).
    #[error("{code} {message}")]
    Server { code: String, message: String },

    #[error("Identify handshake failed: {0}")]
    Identify(String),

    /// A per-URL nsqlookupd failure. Carries the lookup host so the poll
    /// loop can report which member of the lookup list misbehaved.
    #[error("Lookup error from '{host}': {message}")]
    Lookup { host: String, message: String },

    #[error("Invalid topic name '{0}'")]
    InvalidTopic(String),

    #[error("Invalid channel name '{0}'")]
    InvalidChannel(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Cannot delay a multi publish")]
    DelayedMultiPublish,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connect timed out to {0}")]
    ConnectTimeout(String),

    /// Reconnect attempts are exhausted. Emitted once, right before the
    /// connection goes terminal.
    #[error("Maximum reconnect attempts exceeded")]
    MaxReconnectsExceeded,

    /// Any operation submitted after the connection went terminal.
    #[error("The connection has been terminated")]
    Terminated,

    #[error("Close timed out waiting for inflight messages")]
    CloseTimeout,

    #[error("JSON serialization/deserialization error: {0}")]
    Json(String),
}

impl NsqError {
    /// Builds a `Server` error from the body of an ERROR frame. The code is
    /// the first whitespace-delimited token; the remainder is the message.
    pub fn from_error_frame(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let mut parts = text.splitn(2, ' ');
        let code = parts.next().unwrap_or("E_INVALID").to_string();
        let message = parts.next().unwrap_or("").trim().to_string();
        NsqError::Server { code, message }
    }

    /// The stable error code surfaced to users, when one exists.
    pub fn code(&self) -> Option<&str> {
        match self {
            NsqError::Server { code, .. } => Some(code),
            NsqError::Lookup { .. } => Some(LOOKUP_ERROR_CODE),
            _ => None,
        }
    }

    /// The lookup host attached to a lookup failure.
    pub fn host(&self) -> Option<&str> {
        match self {
            NsqError::Lookup { host, .. } => Some(host),
            _ => None,
        }
    }

    /// True for server errors that reject the pending command without
    /// tearing down the connection (`E_REQ_FAILED`, `E_FIN_FAILED`,
    /// `E_TOUCH_FAILED`).
    pub fn is_non_fatal_server_error(&self) -> bool {
        match self {
            NsqError::Server { code, .. } => NON_FATAL_ERROR_CODES.iter().any(|c| c == code),
            _ => false,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for NsqError {
    fn clone(&self) -> Self {
        match self {
            NsqError::Io(e) => NsqError::Io(Arc::clone(e)),
            NsqError::IncompleteFrame => NsqError::IncompleteFrame,
            NsqError::Protocol(s) => NsqError::Protocol(s.clone()),
            NsqError::Server { code, message } => NsqError::Server {
                code: code.clone(),
                message: message.clone(),
            },
            NsqError::Identify(s) => NsqError::Identify(s.clone()),
            NsqError::Lookup { host, message } => NsqError::Lookup {
                host: host.clone(),
                message: message.clone(),
            },
            NsqError::InvalidTopic(s) => NsqError::InvalidTopic(s.clone()),
            NsqError::InvalidChannel(s) => NsqError::InvalidChannel(s.clone()),
            NsqError::InvalidUri(s) => NsqError::InvalidUri(s.clone()),
            NsqError::DelayedMultiPublish => NsqError::DelayedMultiPublish,
            NsqError::InvalidRequest(s) => NsqError::InvalidRequest(s.clone()),
            NsqError::ConnectTimeout(s) => NsqError::ConnectTimeout(s.clone()),
            NsqError::MaxReconnectsExceeded => NsqError::MaxReconnectsExceeded,
            NsqError::Terminated => NsqError::Terminated,
            NsqError::CloseTimeout => NsqError::CloseTimeout,
            NsqError::Json(s) => NsqError::Json(s.clone()),
        }
    }
}

impl PartialEq for NsqError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NsqError::Io(e1), NsqError::Io(e2)) => e1.to_string() == e2.to_string(),
            (NsqError::Protocol(s1), NsqError::Protocol(s2)) => s1 == s2,
            (
                NsqError::Server {
                    code: c1,
                    message: m1,
                },
                NsqError::Server {
                    code: c2,
                    message: m2,
                },
            ) => c1 == c2 && m1 == m2,
            (NsqError::Identify(s1), NsqError::Identify(s2)) => s1 == s2,
            (
                NsqError::Lookup {
                    host: h1,
                    message: m1,
                },
                NsqError::Lookup {
                    host: h2,
                    message: m2,
                },
            ) => h1 == h2 && m1 == m2,
            (NsqError::InvalidTopic(s1), NsqError::InvalidTopic(s2)) => s1 == s2,
            (NsqError::InvalidChannel(s1), NsqError::InvalidChannel(s2)) => s1 == s2,
            (NsqError::InvalidUri(s1), NsqError::InvalidUri(s2)) => s1 == s2,
            (NsqError::InvalidRequest(s1), NsqError::InvalidRequest(s2)) => s1 == s2,
            (NsqError::ConnectTimeout(s1), NsqError::ConnectTimeout(s2)) => s1 == s2,
            (NsqError::Json(s1), NsqError::Json(s2)) => s1 == s2,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for NsqError {
    fn from(e: std::io::Error) -> Self {
        NsqError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for NsqError {
    fn from(e: serde_json::Error) -> Self {
        NsqError::Json(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for NsqError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        NsqError::Protocol(format!("invalid UTF-8 in frame: {e}"))
    }
}
