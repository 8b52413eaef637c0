pub mod admin;
pub mod config;
pub mod error;
pub mod host;
pub mod lease;
pub mod ports;
pub mod process;
pub mod routes;
pub mod store;
pub mod tls;
pub mod topology;
pub mod trust;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Current on-disk schema version of `state.json`.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLease {
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    pub pid: u32,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
}

impl AppLease {
    pub fn http_url(&self, http_port: u16) -> String {
        format!("http://{}{}", self.host, port_suffix(http_port, 80))
    }

    pub fn https_url(&self, https_port: u16) -> String {
        format!("https://{}{}", self.host, port_suffix(https_port, 443))
    }
}

fn port_suffix(port: u16, default: u16) -> String {
    if port == default {
        String::new()
    } else {
        format!(":{port}")
    }
}

/// Who owns the proxy process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaddySource {
    #[serde(alias = "spawned")]
    Managed,
    #[default]
    #[serde(alias = "existing", alias = "")]
    Unmanaged,
}

impl std::fmt::Display for CaddySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaddySource::Managed => f.write_str("managed"),
            CaddySource::Unmanaged => f.write_str("unmanaged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub caddy_source: CaddySource,
    #[serde(default)]
    pub root: bool,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub apps: BTreeMap<String, AppLease>,
}

impl Default for ProxyState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            caddy_source: CaddySource::Unmanaged,
            root: false,
            http_port: default_http_port(),
            https_port: default_https_port(),
            apps: BTreeMap::new(),
        }
    }
}

impl ProxyState {
    pub fn used_ports(&self) -> BTreeSet<u16> {
        self.apps.values().map(|app| app.port).collect()
    }

    /// Drops every app whose owner is reported dead by `alive`, returning the
    /// evicted names.
    pub fn evict_where(&mut self, mut alive: impl FnMut(u32) -> bool) -> Vec<String> {
        let dead: Vec<String> = self
            .apps
            .iter()
            .filter(|(_, app)| !alive(app.pid))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &dead {
            self.apps.remove(name);
        }
        dead
    }

    pub fn evict_dead(&mut self) -> Vec<String> {
        self.evict_where(process::is_alive)
    }

    pub fn set_ports(&mut self, http_port: u16, https_port: u16) {
        self.http_port = http_port;
        self.https_port = https_port;
        self.root = http_port == 80 && https_port == 443;
    }
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Result of a successful lease acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub http_url: String,
    pub https_url: String,
    pub trusted: bool,
}

impl Lease {
    pub fn new(app: &AppLease, http_port: u16, https_port: u16, trusted: bool) -> Self {
        Self {
            name: app.name.clone(),
            host: app.host.clone(),
            port: app.port,
            http_url: app.http_url(http_port),
            https_url: app.https_url(https_port),
            trusted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub caddy_source: CaddySource,
    pub root: bool,
    pub http_port: u16,
    pub https_port: u16,
    pub trusted: bool,
    pub pid: u32,
    pub apps: Vec<AppLease>,
}
