// src/connection/state.rs

//! The per-connection lifecycle state machine.

use std::fmt;

/// The lifecycle state of a single nsqd connection.
///
/// `Disconnected` -> `Connecting` -> `Identifying` -> `Ready`, with
/// `Pulsing` while the outbound queue drains and `Paused` while a
/// subscribed connection holds a zero ready count. `Closing` covers the
/// graceful drain; `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Pulsing,
    Paused,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// States in which the connection accepts and transmits commands.
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            ConnectionState::Ready | ConnectionState::Pulsing | ConnectionState::Paused
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Identifying => "identifying",
            ConnectionState::Ready => "ready",
            ConnectionState::Pulsing => "pulsing",
            ConnectionState::Paused => "paused",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
