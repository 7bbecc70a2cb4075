//! Configuration system.
//!
//! `EngineConfig` is parsed from JSON or assembled from the persisted local
//! key/value storage. Anything missing falls back to the production endpoint.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const PRODUCTION_HOST: &str = "sync.skydrift.net";
pub const PRODUCTION_PORT: u16 = 443;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// Use `wss://` / `https://`.
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// Sent as `dev=1` on the socket query string.
    #[serde(default)]
    pub dev: bool,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Fixed simulation / state broadcast rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Controller polling period.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for correlated calls. `None` waits forever.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: Option<u64>,
    /// Entity kind requested on join.
    #[serde(default = "default_player_kind")]
    pub player_kind: String,
}

fn default_host() -> String {
    PRODUCTION_HOST.to_string()
}

fn default_port() -> u16 {
    PRODUCTION_PORT
}

fn default_secure() -> bool {
    true
}

fn default_tick_hz() -> u32 {
    20
}

fn default_poll_interval_ms() -> u64 {
    16
}

fn default_call_timeout_ms() -> Option<u64> {
    Some(10_000)
}

fn default_player_kind() -> String {
    crate::bindings::SHIP_KIND.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_host: default_host(),
            server_port: default_port(),
            secure: default_secure(),
            dev: false,
            auth_token: None,
            tick_hz: default_tick_hz(),
            poll_interval_ms: default_poll_interval_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            player_kind: default_player_kind(),
        }
    }
}

/// Storage keys read by `EngineConfig::from_storage`.
pub mod keys {
    pub const SERVER_HOST: &str = "server_host";
    pub const SERVER_PORT: &str = "server_port";
    pub const SECURE: &str = "secure";
    pub const AUTH_TOKEN: &str = "auth_token";
    pub const DEV: &str = "dev";
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Local development endpoint (plain ws/http, dev flag on).
    pub fn local(host: impl Into<String>, port: u16) -> Self {
        Self {
            server_host: host.into(),
            server_port: port,
            secure: false,
            dev: true,
            ..Self::default()
        }
    }

    /// Reads the endpoint from persisted storage, once.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_storage(storage: &LocalStorage) -> Self {
        let mut cfg = Self::default();
        if let Some(host) = storage.get(keys::SERVER_HOST) {
            cfg.server_host = host.to_string();
            // A stored host without an explicit scheme flag is a dev box.
            cfg.secure = false;
        }
        if let Some(port) = storage.get(keys::SERVER_PORT).and_then(|p| p.parse().ok()) {
            cfg.server_port = port;
        }
        if let Some(secure) = storage.get(keys::SECURE).and_then(parse_flag) {
            cfg.secure = secure;
        }
        if let Some(dev) = storage.get(keys::DEV).and_then(parse_flag) {
            cfg.dev = dev;
        }
        if let Some(token) = storage.get(keys::AUTH_TOKEN) {
            cfg.auth_token = Some(token.to_string());
        }
        debug!(host = %cfg.server_host, port = cfg.server_port, "Endpoint from local storage");
        cfg
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Base URL of the persistent socket, without query string.
    pub fn socket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}/socket", self.server_addr())
    }

    /// Base URL for plain HTTP calls.
    pub fn http_base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.server_addr())
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Flat string key/value store persisted as a JSON object.
#[derive(Debug, Clone, Default)]
pub struct LocalStorage {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl LocalStorage {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parse local storage {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read local storage {}", path.display()))
            }
        };
        Ok(Self {
            path: Some(path),
            values,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Writes the store back to its file. In-memory stores are a no-op.
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(&self.values).context("serialize local storage")?;
        fs::write(path, text).with_context(|| format!("write local storage {}", path.display()))
    }
}
