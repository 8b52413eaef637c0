//! Keeps the internal-issuer automation policy scoped to the hosts in use.

use std::collections::BTreeSet;

use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::admin::{AdminClient, WriteOutcome};
use crate::{AppLease, Error, Result};

pub const INTERNAL_POLICY_ID: &str = "portwrap-internal-policy";

const POLICIES_PATH: &str = "/config/apps/tls/automation/policies";
const TLS_APP_PATH: &str = "/config/apps/tls";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issuer {
    /// The proxy's own local certificate authority.
    Internal,
}

impl Issuer {
    fn module(self) -> &'static str {
        match self {
            Issuer::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    pub id: String,
    pub subjects: Vec<String>,
    pub issuer: Issuer,
}

impl TlsPolicy {
    pub fn internal(subjects: Vec<String>) -> Self {
        Self {
            id: INTERNAL_POLICY_ID.to_string(),
            subjects,
            issuer: Issuer::Internal,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "@id": self.id,
            "subjects": self.subjects,
            "issuers": [{"module": self.issuer.module()}],
        })
    }
}

/// `api.localhost` becomes `*.localhost`; a single label stays as is.
pub fn subject_for_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    match host.find('.') {
        Some(i) if i > 0 && i < host.len() - 1 => format!("*.{}", &host[i + 1..]),
        _ => host,
    }
}

/// Sorted, deduplicated subjects for every app host.
pub fn subjects_for<'a>(apps: impl IntoIterator<Item = &'a AppLease>) -> Vec<String> {
    apps.into_iter()
        .map(|app| subject_for_host(&app.host))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn is_owned(policy: &Value) -> bool {
    policy.get("@id").and_then(Value::as_str) == Some(INTERNAL_POLICY_ID)
}

/// Drops our previous policy and, when there are subjects, puts a fresh one
/// ahead of every other policy.
pub fn merge_policies(existing: &[Value], subjects: &[String]) -> Vec<Value> {
    let ours = (!subjects.is_empty()).then(|| TlsPolicy::internal(subjects.to_vec()).to_value());
    ours.into_iter()
        .chain(existing.iter().filter(|p| !is_owned(p)).cloned())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Live policies already matched.
    Unchanged,
    Updated,
    /// The TLS app did not exist and was created.
    Created,
    /// Nothing to write: no policy list and no subjects.
    Skipped,
}

pub async fn sync<'a>(
    admin: &AdminClient,
    apps: impl IntoIterator<Item = &'a AppLease>,
) -> Result<SyncOutcome> {
    let subjects = subjects_for(apps);
    let existing: Option<Vec<Value>> = admin.get_json(POLICIES_PATH).await?;

    match existing {
        Some(existing) => {
            let merged = merge_policies(&existing, &subjects);
            if merged == existing {
                return Ok(SyncOutcome::Unchanged);
            }
            match admin.replace_json(POLICIES_PATH, &merged).await? {
                WriteOutcome::Patched => {}
                WriteOutcome::Recreated => info!("TLS policies recreated after patch was refused"),
                WriteOutcome::Rejected(body) => return Err(Error::TlsPolicyWriteRejected { body }),
            }
            debug!(subjects = ?subjects, "TLS automation policy updated");
            Ok(SyncOutcome::Updated)
        }
        None if subjects.is_empty() => Ok(SyncOutcome::Skipped),
        None => {
            let policies = merge_policies(&[], &subjects);
            let res = admin
                .send_json(
                    Method::PUT,
                    TLS_APP_PATH,
                    &json!({"automation": {"policies": policies}}),
                )
                .await?;
            if !res.is_success() {
                return Err(Error::TlsPolicyWriteRejected { body: res.body });
            }
            debug!(subjects = ?subjects, "TLS app created");
            Ok(SyncOutcome::Created)
        }
    }
}
