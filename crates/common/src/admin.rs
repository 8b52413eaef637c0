//! HTTP client for the proxy's admin API.

use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::AdminClientConfig;
use crate::{Error, Result};

const READY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const READY_MAX_BACKOFF: Duration = Duration::from_secs(1);
const MISSING_PATH_MESSAGE: &str = "invalid traversal path";

#[derive(Debug)]
pub struct AdminResponse {
    pub status: StatusCode,
    pub body: String,
}

impl AdminResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    fn is_missing_path(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
            || (self.status == StatusCode::BAD_REQUEST
                && self.body.contains(MISSING_PATH_MESSAGE))
    }

    pub fn json<T: DeserializeOwned>(&self, context: &str) -> Result<T> {
        serde_json::from_str(&self.body).map_err(Error::json(context))
    }
}

/// How a replace-in-place write was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Patched,
    /// The patch was refused and the path was deleted and recreated.
    Recreated,
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct AdminClient {
    http: Client,
    base_url: String,
}

impl AdminClient {
    pub fn new(config: &AdminClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Any answer below 500 from `/config/` counts as a live control plane.
    pub async fn healthy(&self) -> bool {
        match self.http.get(self.url("/config/")).send().await {
            Ok(res) => res.status().as_u16() < 500,
            Err(e) => {
                trace!(error = %e, "admin health probe failed");
                false
            }
        }
    }

    /// Polls [`healthy`](Self::healthy) with exponential backoff until it
    /// succeeds or `max_wait` elapses.
    pub async fn wait_ready(&self, max_wait: Duration) -> Result<()> {
        let started = Instant::now();
        let mut delay = READY_INITIAL_BACKOFF;
        loop {
            if self.healthy().await {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                return Err(Error::ControlPlaneNotReady {
                    url: self.base_url.clone(),
                    waited_ms: elapsed.as_millis(),
                });
            }
            tokio::time::sleep(delay.min(max_wait - elapsed)).await;
            delay = (delay * 2).min(READY_MAX_BACKOFF);
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<AdminResponse> {
        let url = self.url(path);
        let mut req = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.header("Content-Type", "application/json").body(body);
        }
        let res = req
            .send()
            .await
            .map_err(|source| Error::ControlPlaneUnreachable {
                url: url.clone(),
                source,
            })?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|source| Error::ControlPlaneUnreachable { url, source })?;
        debug!(%method, path, status = status.as_u16(), "admin request");
        Ok(AdminResponse {
            status,
            body: body.trim().to_string(),
        })
    }

    pub async fn get(&self, path: &str) -> Result<AdminResponse> {
        self.send(Method::GET, path, None).await
    }

    pub async fn delete(&self, path: &str) -> Result<AdminResponse> {
        self.send(Method::DELETE, path, None).await
    }

    pub async fn post(&self, path: &str) -> Result<AdminResponse> {
        self.send(Method::POST, path, None).await
    }

    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
    ) -> Result<AdminResponse> {
        let body = serde_json::to_vec(payload).map_err(Error::json(path))?;
        self.send(method, path, Some(body)).await
    }

    /// GETs a JSON document. `Ok(None)` when the path does not exist: a 404, a
    /// 400 about an unresolvable traversal path (what the proxy answers when
    /// an intermediate key is missing), or a `null` body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let res = self.get(path).await?;
        if res.is_missing_path() {
            return Ok(None);
        }
        if !res.is_success() {
            return Err(Error::ControlPlane {
                method: Method::GET.to_string(),
                path: path.to_string(),
                status: res.status.as_u16(),
                body: res.body,
            });
        }
        if res.body.is_empty() || res.body == "null" {
            return Ok(None);
        }
        res.json(path).map(Some)
    }

    /// Replaces the value at `path`: PATCH first, and when that is refused,
    /// DELETE the path and PUT the value from scratch.
    pub async fn replace_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<WriteOutcome> {
        let patched = self.send_json(Method::PATCH, path, payload).await?;
        if patched.is_success() {
            return Ok(WriteOutcome::Patched);
        }
        debug!(
            path,
            status = patched.status.as_u16(),
            body = %patched.body,
            "patch rejected; recreating"
        );

        if let Err(e) = self.delete(path).await {
            debug!(path, error = %e, "delete before recreate failed");
        }
        match self.send_json(Method::PUT, path, payload).await {
            Ok(res) if res.is_success() => Ok(WriteOutcome::Recreated),
            Ok(res) => Ok(WriteOutcome::Rejected(res.body)),
            Err(_) => Ok(WriteOutcome::Rejected(patched.body)),
        }
    }

    /// Asks the proxy instance to shut down.
    pub async fn stop(&self) -> Result<()> {
        let res = self.post("/stop").await?;
        if !res.is_success() {
            return Err(Error::ControlPlane {
                method: Method::POST.to_string(),
                path: "/stop".to_string(),
                status: res.status.as_u16(),
                body: res.body,
            });
        }
        Ok(())
    }
}
