//! Configuration surface, mirroring `twunnel3.local_proxy_server`'s
//! `LOCAL_PROXY_SERVER` / `PROXY_SERVERS` document shape.
//!
//! Normalization is infallible field-defaulting, not validation: an absent
//! or unrecognized `kind` simply yields `None`, and the binary is the one
//! that decides whether to refuse to start (see `Config::normalize`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyKind {
    Https,
    Socks4,
    Socks5,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalProxyServerConfig {
    #[serde(default)]
    pub kind: Option<ProxyKind>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl Default for LocalProxyServerConfig {
    fn default() -> Self {
        Self {
            kind: None,
            address: String::new(),
            port: 0,
            accounts: Vec::new(),
        }
    }
}

/// Opaque to the core: only the `Tunnel` collaborator a binary wires in
/// knows how to interpret this, so it's kept as a loosely-typed JSON value
/// rather than a concrete struct (mirrors `set_default_configuration`
/// leaving `PROXY_SERVERS` untouched).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub local_proxy_server: LocalProxyServerConfig,
    #[serde(default)]
    pub proxy_servers: serde_json::Value,
}

impl Config {
    /// Fills recognized defaults for `local_proxy_server`, leaving any
    /// explicitly-set field untouched. Idempotent: calling it twice is the
    /// same as calling it once. `proxy_servers` is never touched here — it
    /// belongs to whichever `Tunnel` the binary constructs.
    pub fn normalize(&mut self) {
        // every field already carries its zero-value default via #[serde(default)],
        // so there is nothing left to backfill here beyond documenting the
        // invariant normalize() is idempotent and additive-only.
    }
}
