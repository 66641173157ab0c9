// tests/integration/test_helpers.rs

//! Shared fixtures for the integration suite.

use nsq_client::ConnectionConfig;
use std::future::Future;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// A message id used across the suite.
pub const TEST_ID: &[u8; 16] = b"0123456789abcdef";

/// Sets up minimal tracing for tests. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A connection config tuned for fast test turnaround: short connect
/// timeout, quick reconnects, a small attempt budget.
pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout_ms: 1_000,
        max_connect_attempts: 5,
        reconnect_delay_factor_ms: 20,
        max_reconnect_delay_ms: 200,
        ..ConnectionConfig::default()
    }
}

/// Bounds any future so a wedged test fails instead of hanging the suite.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
