//! Owned reverse-proxy routes and their merge into live server config.
//!
//! Routes written by portwrap carry an `@id` starting with
//! [`OWNED_ROUTE_PREFIX`]. Everything else on a server is foreign and is
//! written back untouched, in its original order.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::admin::{AdminClient, WriteOutcome};
use crate::topology::{ServerTopology, Servers, SERVERS_PATH};
use crate::{AppLease, Error, Result};

pub const OWNED_ROUTE_PREFIX: &str = "portwrap:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    pub match_hosts: Vec<String>,
    /// `host:port` dial address of the single upstream.
    pub upstream: String,
}

impl Route {
    /// The route for `app` on `server`. Ids embed the server name because the
    /// proxy requires `@id` values to be unique across its whole config.
    pub fn for_app(server: &str, app: &AppLease) -> Self {
        Self {
            id: format!("{OWNED_ROUTE_PREFIX}{server}:{}", app.name),
            match_hosts: vec![app.host.clone()],
            upstream: format!("127.0.0.1:{}", app.port),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "@id": self.id,
            "match": [{"host": self.match_hosts}],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{"dial": self.upstream}],
            }],
        })
    }
}

pub fn is_owned(route: &Value) -> bool {
    route
        .get("@id")
        .and_then(Value::as_str)
        .is_some_and(|id| id.starts_with(OWNED_ROUTE_PREFIX))
}

/// One route per app, ordered by app name.
pub fn owned_routes(server: &str, apps: &BTreeMap<String, AppLease>) -> Vec<Route> {
    apps.values().map(|app| Route::for_app(server, app)).collect()
}

/// Foreign routes in their original order, followed by `owned`.
pub fn merge(live: &[Value], owned: &[Route]) -> Vec<Value> {
    live.iter()
        .filter(|route| !is_owned(route))
        .cloned()
        .chain(owned.iter().map(Route::to_value))
        .collect()
}

pub fn routes_path(server: &str) -> String {
    format!("{SERVERS_PATH}/{server}/routes")
}

pub async fn write_routes(admin: &AdminClient, server: &str, routes: &[Value]) -> Result<()> {
    let path = routes_path(server);
    match admin.replace_json(&path, routes).await? {
        WriteOutcome::Patched => Ok(()),
        WriteOutcome::Recreated => {
            info!(server, "route list recreated after patch was refused");
            Ok(())
        }
        WriteOutcome::Rejected(body) => Err(Error::RouteWriteRejected {
            server: server.to_string(),
            body,
        }),
    }
}

/// Rewrites the owned routes on every target server of `topology`.
pub async fn reconcile(
    admin: &AdminClient,
    servers: &Servers,
    topology: &ServerTopology,
    apps: &BTreeMap<String, AppLease>,
) -> Result<()> {
    for server in topology.target_servers() {
        let live = servers
            .get(server)
            .map(|s| s.routes.as_slice())
            .unwrap_or_default();
        let owned = owned_routes(server, apps);
        let merged = merge(live, &owned);
        debug!(
            server,
            owned = owned.len(),
            total = merged.len(),
            "writing routes"
        );
        write_routes(admin, server, &merged).await?;
    }
    Ok(())
}
