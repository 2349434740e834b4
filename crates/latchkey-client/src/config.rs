//! Client configuration

use crate::error::{ClientError, Result};
use latchkey_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection and default lock settings for a [`Client`](crate::Client).
///
/// Every field has a default, so an empty TOML document is a valid config
/// pointing at a local server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `host[:port]` entries; more than one selects replica-set routing
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    /// Database id used by [`Client::default_database`](crate::Client::default_database)
    #[serde(default)]
    pub database: u8,
    /// TCP connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Bound on the Init/InitResult exchange
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    /// Added to a command's own timeout to bound the local wait
    #[serde(default = "default_response_grace")]
    pub response_grace_ms: u64,
    /// Worker threads running async callbacks
    #[serde(default = "default_callback_workers")]
    pub callback_workers: usize,
    /// Lock timeout (seconds) used when a primitive is built without one
    #[serde(default = "default_lock_seconds")]
    pub default_timeout: u16,
    /// Lock expire (seconds) used when a primitive is built without one
    #[serde(default = "default_lock_seconds")]
    pub default_expire: u16,
}

fn default_hosts() -> Vec<String> {
    vec![format!("127.0.0.1:{}", DEFAULT_PORT)]
}
fn default_connect_timeout() -> u64 { 5000 }
fn default_handshake_timeout() -> u64 { 5000 }
fn default_reconnect_interval() -> u64 { 2000 }
fn default_response_grace() -> u64 { 5000 }
fn default_callback_workers() -> usize { num_cpus::get().max(2) }
fn default_lock_seconds() -> u16 { 5 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            database: 0,
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
            response_grace_ms: default_response_grace(),
            callback_workers: default_callback_workers(),
            default_timeout: default_lock_seconds(),
            default_expire: default_lock_seconds(),
        }
    }
}

impl ClientConfig {
    /// Config for a single server at `host`.
    pub fn single(host: impl Into<String>) -> Self {
        Self {
            hosts: vec![host.into()],
            ..Self::default()
        }
    }

    /// Config for a replica set.
    pub fn replset<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ClientError::Config("no hosts configured".to_string()));
        }
        if self.callback_workers == 0 {
            return Err(ClientError::Config(
                "callback_workers must be at least 1".to_string(),
            ));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(ClientError::Config(
                "reconnect_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn response_grace(&self) -> Duration {
        Duration::from_millis(self.response_grace_ms)
    }
}

/// Normalizes a `host[:port]` entry to `host:port`.
///
/// Returns `None` for malformed entries: empty hosts, bad ports, or bare
/// IPv6 addresses without brackets.
pub fn parse_host(entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() || entry.contains(char::is_whitespace) {
        return None;
    }

    let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail {
            "" => DEFAULT_PORT,
            tail => tail.strip_prefix(':')?.parse().ok()?,
        };
        (format!("[{}]", host), port)
    } else {
        match entry.split_once(':') {
            None => (entry.to_string(), DEFAULT_PORT),
            Some((_, port)) if port.contains(':') => return None,
            Some((host, port)) => (host.to_string(), port.parse().ok()?),
        }
    };

    if host.is_empty() || host == "[]" || port == 0 {
        return None;
    }
    Some(format!("{}:{}", host, port))
}
