use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to acquire state lock {}: {source}", path.display())]
    LockAcquisition {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no free ports in range {start}-{end}")]
    PortExhaustion { start: u16, end: u16 },

    #[error("no available proxy ports: {tried} are in use")]
    NoPortsAvailable { tried: String },

    #[error("proxy admin API at {url} is unreachable: {source}")]
    ControlPlaneUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("proxy admin API did not become ready at {url} within {waited_ms}ms")]
    ControlPlaneNotReady { url: String, waited_ms: u128 },

    #[error("{method} {path} returned {status}: {body}")]
    ControlPlane {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("unable to determine proxy server ports: {0}")]
    TopologyUnresolved(String),

    #[error("route update for server {server} failed: {body}")]
    RouteWriteRejected { server: String, body: String },

    #[error("TLS policy update failed: {body}")]
    TlsPolicyWriteRejected { body: String },

    #[error("local CA unavailable: {0}")]
    TrustUnavailable(String),

    #[error(
        "state file {} has schema version {found}; this build understands version {supported}",
        path.display()
    )]
    UnsupportedStateVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("invalid app name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid host {host:?}: {reason}")]
    InvalidHost { host: String, reason: &'static str },

    #[error("invalid value for {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },

    #[error("failed to build admin HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON from {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Adapter for `map_err` that wraps an I/O error with the operation and path.
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Error {
        let context = context.into();
        move |source| Error::Io { context, source }
    }

    pub fn json(context: impl Into<String>) -> impl FnOnce(serde_json::Error) -> Error {
        let context = context.into();
        move |source| Error::Json { context, source }
    }

    /// True for failures that mean nothing is listening on the admin address.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::ControlPlaneUnreachable { .. } | Error::ControlPlaneNotReady { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_context_is_rendered() {
        let err = Error::io("write /tmp/state.json")(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert_eq!(err.to_string(), "write /tmp/state.json: denied");
    }

    #[test]
    fn route_rejection_carries_body() {
        let err = Error::RouteWriteRejected {
            server: "srv0".into(),
            body: "{\"error\":\"bad\"}".into(),
        };
        assert!(err.to_string().contains("srv0"));
        assert!(err.to_string().contains("bad"));
        assert!(!err.is_unreachable());
    }
}
