//! Shared fixtures for latchkey-client integration tests

#![allow(dead_code)]

pub mod mock_lock_server;

pub use mock_lock_server::MockLockServer;

use latchkey_client::{Client, ClientConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Tight timings so reconnect and timeout paths finish quickly.
pub fn fast_config(hosts: Vec<String>) -> ClientConfig {
    ClientConfig {
        hosts,
        connect_timeout_ms: 1_000,
        handshake_timeout_ms: 1_000,
        reconnect_interval_ms: 100,
        response_grace_ms: 1_000,
        callback_workers: 2,
        ..ClientConfig::default()
    }
}

pub async fn connect(server: &MockLockServer) -> Client {
    init_test_logging();
    Client::connect(fast_config(vec![server.host()]))
        .await
        .expect("Failed to connect to mock server")
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
