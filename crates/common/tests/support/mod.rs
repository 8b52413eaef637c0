//! In-process stand-in for the proxy admin API.
//!
//! Implements the slice of Caddy's `/config/` path semantics the lease engine
//! relies on: GET reads, PATCH replaces an existing value, PUT creates a value
//! that must not exist yet, DELETE removes one.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::Utc;
use common::admin::AdminClient;
use common::config::{AdminClientConfig, Config, PortRange};
use common::lease::LeaseManager;
use common::store::StateStore;
use common::{AppLease, ProxyState};
use serde_json::{json, Value};

#[derive(Clone, Default)]
pub struct FakeAdmin {
    config: Arc<Mutex<Value>>,
    reject_patch: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<(Method, String)>>>,
}

impl FakeAdmin {
    pub fn new(config: Value) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            ..Default::default()
        }
    }

    /// A typical external proxy: one plain HTTP server and one TLS server.
    pub fn external() -> Self {
        Self::new(json!({
            "apps": {"http": {"servers": {
                "srv0": {"listen": [":80"], "routes": []},
                "srv1": {"listen": [":443"], "tls_connection_policies": [{}], "routes": []}
            }}}
        }))
    }

    pub fn self_managed() -> Self {
        Self::new(json!({
            "apps": {"http": {"servers": {
                "portwrap-http": {"listen": [":8080"], "routes": []},
                "portwrap-https": {"listen": [":8443"], "tls_connection_policies": [{}], "routes": []}
            }}}
        }))
    }

    pub async fn start(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let app = Router::new().fallback(handle).with_state(self.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub fn reject_patches(&self, reject: bool) {
        self.reject_patch.store(reject, Ordering::SeqCst);
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Value {
        self.config.lock().unwrap().clone()
    }

    pub fn routes(&self, server: &str) -> Vec<Value> {
        self.snapshot()["apps"]["http"]["servers"][server]["routes"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    pub fn owned_route_ids(&self, server: &str) -> Vec<String> {
        self.routes(server)
            .iter()
            .filter_map(|r| r["@id"].as_str())
            .filter(|id| id.starts_with("portwrap:"))
            .map(str::to_string)
            .collect()
    }

    pub fn tls_policies(&self) -> Option<Vec<Value>> {
        self.snapshot()["apps"]["tls"]["automation"]["policies"]
            .as_array()
            .cloned()
    }

    pub fn requests(&self) -> Vec<(Method, String)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn set_value(&self, path: &str, value: Value) {
        let mut root = self.config.lock().unwrap();
        let segs = segments(path);
        put_value(&mut root, &segs, value, true).unwrap();
    }
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn lookup<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    segs.iter().try_fold(root, |node, seg| match node {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_mut<'a>(root: &'a mut Value, segs: &[String]) -> Option<&'a mut Value> {
    segs.iter().try_fold(root, |node, seg| match node {
        Value::Object(map) => map.get_mut(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

fn put_value(root: &mut Value, segs: &[String], value: Value, overwrite: bool) -> Result<(), String> {
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut node = root;
    for seg in parents {
        if node.is_null() {
            *node = json!({});
        }
        node = match node {
            Value::Object(map) => map.entry(seg.clone()).or_insert(Value::Null),
            _ => return Err(format!("{seg}: parent is not an object")),
        };
    }
    if node.is_null() {
        *node = json!({});
    }
    let Value::Object(map) = node else {
        return Err(format!("{last}: parent is not an object"));
    };
    if !overwrite && map.contains_key(last) {
        return Err(format!("[{last}] key already exists"));
    }
    map.insert(last.clone(), value);
    Ok(())
}

fn remove_value(root: &mut Value, segs: &[String]) -> bool {
    let Some((last, parents)) = segs.split_last() else {
        return false;
    };
    match lookup_mut(root, parents) {
        Some(Value::Object(map)) => map.remove(last).is_some(),
        _ => false,
    }
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn error(status: StatusCode, message: &str) -> Response {
    json_response(status, json!({ "error": message }).to_string())
}

/// Caddy reads a missing last key as `null`, and fails with a 400 when an
/// intermediate key is missing.
fn missing_on_get(root: &Value, segs: &[String], path: &str) -> Response {
    let parents = &segs[..segs.len().saturating_sub(1)];
    if let Some(Value::Object(_)) = lookup(root, parents) {
        return json_response(StatusCode::OK, "null".into());
    }
    error(
        StatusCode::BAD_REQUEST,
        &format!("[{path}] invalid traversal path at: config/{}", parents.join("/")),
    )
}

async fn handle(State(fake): State<FakeAdmin>, method: Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().to_string();
    fake.requests
        .lock()
        .unwrap()
        .push((method.clone(), path.clone()));

    if path == "/stop" && method == Method::POST {
        fake.stopped.store(true, Ordering::SeqCst);
        return json_response(StatusCode::OK, String::new());
    }
    if let Some(ca) = path.strip_prefix("/pki/ca/") {
        return error(StatusCode::NOT_FOUND, &format!("no certificate authority {ca}"));
    }
    let Some(config_path) = path.strip_prefix("/config") else {
        return error(StatusCode::NOT_FOUND, "not found");
    };
    let segs = segments(config_path);

    let payload = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(v) => v,
            Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
        }
    };

    let mut root = fake.config.lock().unwrap();
    match method {
        Method::GET => match lookup(&root, &segs) {
            Some(v) => json_response(StatusCode::OK, v.to_string()),
            None => missing_on_get(&root, &segs, &path),
        },
        Method::PATCH => {
            if fake.reject_patch.load(Ordering::SeqCst) {
                return error(StatusCode::CONFLICT, "patch refused");
            }
            match lookup_mut(&mut root, &segs) {
                Some(slot) => {
                    *slot = payload;
                    json_response(StatusCode::OK, String::new())
                }
                None => error(StatusCode::NOT_FOUND, "path not found"),
            }
        }
        Method::PUT => match put_value(&mut root, &segs, payload, false) {
            Ok(()) => json_response(StatusCode::OK, String::new()),
            Err(e) => error(StatusCode::CONFLICT, &e),
        },
        Method::DELETE => {
            if remove_value(&mut root, &segs) {
                json_response(StatusCode::OK, String::new())
            } else {
                error(StatusCode::NOT_FOUND, "path not found")
            }
        }
        _ => error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

/// A test harness: temp state dir, fake admin API and a manager wired to both.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub fake: FakeAdmin,
    pub manager: LeaseManager,
}

pub const TEST_RANGE: PortRange = PortRange {
    start: 11000,
    end: 19999,
};

impl Harness {
    pub async fn new(fake: FakeAdmin) -> Self {
        let base_url = fake.start().await;
        Self::with_base_url(fake, base_url)
    }

    pub fn with_base_url(fake: FakeAdmin, base_url: String) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_state_dir(dir.path().join("state"));
        config.admin = AdminClientConfig {
            base_url,
            timeout: Duration::from_secs(2),
        };
        config.port_range = TEST_RANGE;
        let admin = AdminClient::new(&config.admin).unwrap();
        let manager = LeaseManager::with_admin(config, admin);
        Self { dir, fake, manager }
    }

    pub fn store(&self) -> &StateStore {
        self.manager.store()
    }

    pub fn state(&self) -> ProxyState {
        self.store().load().unwrap()
    }

    pub fn seed(&self, apps: &[(&str, u16, u32)]) {
        let mut state = ProxyState::default();
        for (name, port, pid) in apps {
            state.apps.insert(
                name.to_string(),
                AppLease {
                    name: name.to_string(),
                    host: format!("{name}.localhost"),
                    port: *port,
                    pid: *pid,
                    started_at: Utc::now(),
                },
            );
        }
        self.store().save(&state).unwrap();
    }
}

/// A pid that cannot belong to a running process.
pub const DEAD_PID: u32 = 999_999_999;

pub fn my_pid() -> u32 {
    std::process::id()
}

/// Lowest port in `range` not in `used` that can currently be bound on loopback.
pub fn first_free_port(range: PortRange, used: &BTreeSet<u16>) -> u16 {
    range
        .iter()
        .filter(|p| !used.contains(p))
        .find(|p| StdListener::bind((Ipv4Addr::LOCALHOST, *p)).is_ok())
        .expect("a free port in the test range")
}
