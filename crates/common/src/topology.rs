//! Discovery of the proxy's HTTP and HTTPS servers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::admin::AdminClient;
use crate::{null_as_default, CaddySource, Error, Result};

/// Server names reserved for a proxy started by `portwrap-daemon`.
pub const MANAGED_HTTP_SERVER: &str = "portwrap-http";
pub const MANAGED_HTTPS_SERVER: &str = "portwrap-https";

pub const SERVERS_PATH: &str = "/config/apps/http/servers";

/// The subset of a Caddy HTTP server definition used for classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub listen: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tls_connection_policies: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub routes: Vec<Value>,
}

impl ServerConfig {
    pub fn first_listen_port(&self) -> Option<u16> {
        self.listen.first().and_then(|addr| listen_port(addr))
    }

    fn listens_on(&self, port: u16) -> bool {
        self.listen.iter().any(|addr| listen_port(addr) == Some(port))
    }

    pub fn is_tls(&self) -> bool {
        !self.tls_connection_policies.is_empty() || self.listens_on(443)
    }
}

pub type Servers = BTreeMap<String, ServerConfig>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyOwnership {
    SelfManaged,
    External,
}

impl ProxyOwnership {
    pub fn source(self) -> CaddySource {
        match self {
            ProxyOwnership::SelfManaged => CaddySource::Managed,
            ProxyOwnership::External => CaddySource::Unmanaged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTopology {
    pub http_server: String,
    pub https_server: Option<String>,
    pub http_port: u16,
    pub https_port: u16,
    pub ownership: ProxyOwnership,
}

impl ServerTopology {
    /// Distinct servers that should carry app routes.
    pub fn target_servers(&self) -> Vec<&str> {
        let mut out = vec![self.http_server.as_str()];
        if let Some(https) = self.https_server.as_deref() {
            if https != self.http_server {
                out.push(https);
            }
        }
        out
    }

    pub fn is_root(&self) -> bool {
        self.http_port == 80 && self.https_port == 443
    }
}

/// Extracts the port from a Caddy listen address such as `:8080`,
/// `127.0.0.1:8080`, `[::]:443` or `tcp/:8000-8010`.
pub fn listen_port(addr: &str) -> Option<u16> {
    let addr = addr.split_once('/').map(|(_, rest)| rest).unwrap_or(addr);
    let (_, port) = addr.rsplit_once(':')?;
    let port = port.split('-').next()?;
    port.parse().ok().filter(|p| *p > 0)
}

pub async fn fetch_servers(admin: &AdminClient) -> Result<Servers> {
    let raw: BTreeMap<String, Value> = admin
        .get_json(SERVERS_PATH)
        .await?
        .ok_or_else(|| Error::TopologyUnresolved("proxy has no HTTP servers configured".into()))?;

    let mut servers = Servers::new();
    for (name, value) in raw {
        match serde_json::from_value::<ServerConfig>(value) {
            Ok(server) => {
                servers.insert(name, server);
            }
            Err(e) => debug!(server = %name, error = %e, "skipping unrecognized server entry"),
        }
    }
    if servers.is_empty() {
        return Err(Error::TopologyUnresolved(
            "proxy has no HTTP servers configured".into(),
        ));
    }
    Ok(servers)
}

pub fn resolve(servers: &Servers) -> Result<ServerTopology> {
    if let Some(http) = servers.get(MANAGED_HTTP_SERVER) {
        let http_port = http.first_listen_port().unwrap_or(80);
        let (https_server, https_port) = match servers.get(MANAGED_HTTPS_SERVER) {
            Some(https) => (
                Some(MANAGED_HTTPS_SERVER.to_string()),
                https.first_listen_port().unwrap_or(443),
            ),
            None => (None, http_port),
        };
        return Ok(ServerTopology {
            http_server: MANAGED_HTTP_SERVER.to_string(),
            https_server,
            http_port,
            https_port,
            ownership: ProxyOwnership::SelfManaged,
        });
    }

    let mut http: Option<(&str, u16)> = None;
    let mut https: Option<(&str, u16)> = None;
    for (name, server) in servers {
        let port = server.first_listen_port();
        if server.is_tls() {
            if https.is_none() {
                https = Some((name, port.unwrap_or(443)));
            }
        } else if http.is_none() {
            http = Some((name, port.unwrap_or(80)));
        }
    }

    let (http_server, https_server) = match (http, https) {
        (Some((h, _)), Some((s, _))) => (h, s),
        (Some((h, _)), None) => (h, h),
        (None, Some((s, _))) => (s, s),
        (None, None) => {
            return Err(Error::TopologyUnresolved(
                "no server could be classified as HTTP or HTTPS".into(),
            ))
        }
    };
    Ok(ServerTopology {
        http_server: http_server.to_string(),
        https_server: Some(https_server.to_string()),
        http_port: http.map(|(_, p)| p).unwrap_or(80),
        https_port: https.map(|(_, p)| p).unwrap_or(443),
        ownership: ProxyOwnership::External,
    })
}

/// Fetches and resolves the live topology.
pub async fn inspect(admin: &AdminClient) -> Result<ServerTopology> {
    let servers = fetch_servers(admin).await?;
    resolve(&servers)
}
